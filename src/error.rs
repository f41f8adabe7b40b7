use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use serde_json::Error as JsonError;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;

use crate::gateway::GatewayError;
use crate::http::HttpError;
use crate::voice::VoiceError;

/// The common result type between most library functions.
///
/// The error type is always the library's [`Error`], so it is left implied.
pub type Result<T> = std::result::Result<T, Error>;

/// A common error enum returned by most of the library's functionality.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An error from the gateway or one of its shards.
    Gateway(GatewayError),
    /// An error from the rate-limited REST dispatcher.
    Http(HttpError),
    /// An error within the voice subsystem.
    Voice(VoiceError),
    /// An error while serializing or deserializing a payload.
    Json(JsonError),
    /// An `std::io` error.
    Io(IoError),
    /// An error from the WebSocket transport.
    Tungstenite(Box<TungsteniteError>),
    /// An error while building a URL.
    Url(String),
    /// Some other error, used where a dedicated variant would be overkill.
    Other(&'static str),
}

impl From<GatewayError> for Error {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl From<VoiceError> for Error {
    fn from(e: VoiceError) -> Self {
        Self::Voice(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Self {
        Self::Json(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Self {
        Self::Tungstenite(Box::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(HttpError::Request(e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway(inner) => fmt::Display::fmt(inner, f),
            Self::Http(inner) => fmt::Display::fmt(inner, f),
            Self::Voice(inner) => fmt::Display::fmt(inner, f),
            Self::Json(inner) => fmt::Display::fmt(inner, f),
            Self::Io(inner) => fmt::Display::fmt(inner, f),
            Self::Tungstenite(inner) => fmt::Display::fmt(inner, f),
            Self::Url(msg) => f.write_str(msg),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Gateway(inner) => Some(inner),
            Self::Http(inner) => Some(inner),
            Self::Voice(inner) => Some(inner),
            Self::Json(inner) => Some(inner),
            Self::Io(inner) => Some(inner),
            Self::Tungstenite(inner) => Some(inner),
            Self::Url(_) | Self::Other(_) => None,
        }
    }
}

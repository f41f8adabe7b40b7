use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use reqwest::header::InvalidHeaderValue;
use reqwest::{Error as ReqwestError, Response, StatusCode};
use url::ParseError as UrlError;

/// What came back with a non-successful status code.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ErrorResponse {
    pub status_code: StatusCode,
    pub url: String,
    pub body: String,
}

impl ErrorResponse {
    /// Consumes a response, reading its body for the error message.
    pub async fn from_response(response: Response) -> Self {
        Self {
            status_code: response.status(),
            url: response.url().to_string(),
            body: response.text().await.unwrap_or_else(|_| "[no body]".to_string()),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// A non-successful status code was received for a request.
    UnsuccessfulRequest(ErrorResponse),
    /// A request was rejected for rate limiting twice in a row; the caller
    /// must back off for at least this long before trying again.
    RateLimited { retry_after: Duration },
    /// A ratelimit header carried something other than a number.
    RatelimitHeaderNotNumeric,
    /// A ratelimit header was not valid UTF-8.
    RatelimitHeaderNotUtf8,
    /// Parsing a URL failed due to invalid input.
    Url(UrlError),
    /// A header value contained invalid input.
    InvalidHeader(InvalidHeaderValue),
    /// Sending a request failed; the inner error says why.
    Request(ReqwestError),
}

impl HttpError {
    /// The status code of the response, if the error carries one.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::UnsuccessfulRequest(res) => Some(res.status_code),
            Self::Request(e) => e.status(),
            _ => None,
        }
    }
}

impl From<ReqwestError> for HttpError {
    fn from(error: ReqwestError) -> Self {
        Self::Request(error)
    }
}

impl From<UrlError> for HttpError {
    fn from(error: UrlError) -> Self {
        Self::Url(error)
    }
}

impl From<InvalidHeaderValue> for HttpError {
    fn from(error: InvalidHeaderValue) -> Self {
        Self::InvalidHeader(error)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsuccessfulRequest(res) => {
                write!(f, "request to {} failed with status {}", res.url, res.status_code)
            },
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after:?}")
            },
            Self::RatelimitHeaderNotNumeric => {
                f.write_str("a ratelimit header did not hold a number")
            },
            Self::RatelimitHeaderNotUtf8 => f.write_str("a ratelimit header was not valid UTF-8"),
            Self::Url(inner) => fmt::Display::fmt(inner, f),
            Self::InvalidHeader(inner) => fmt::Display::fmt(inner, f),
            Self::Request(inner) => fmt::Display::fmt(inner, f),
        }
    }
}

impl StdError for HttpError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Url(inner) => Some(inner),
            Self::InvalidHeader(inner) => Some(inner),
            Self::Request(inner) => Some(inner),
            _ => None,
        }
    }
}

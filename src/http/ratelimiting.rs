//! Pre-emptive ratelimiting for REST requests.
//!
//! Each [`RatelimitingBucket`] tracks how many tickets are [`remaining`]
//! until requests must wait for the known [`reset`] time, and the [`limit`]
//! of requests that can be made within that window, all learned from
//! response headers. When no tickets remain, the task sleeps until the
//! window resets before sending.
//!
//! A global ratelimit blocks all requests regardless of route. Its window is
//! never advertised ahead of time, so it cannot be pre-empted; when hit, the
//! global lock is held across the wait so every in-flight request queues
//! behind it.
//!
//! [`limit`]: Ratelimit::limit
//! [`remaining`]: Ratelimit::remaining
//! [`reset`]: Ratelimit::reset

use std::fmt;
use std::str::{self, FromStr};
use std::time::SystemTime;

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::debug;

pub use super::routing::RatelimitingBucket;
use super::{HttpError, Request};
use crate::error::{Error, Result};

/// Ratelimiter for REST requests.
///
/// A request that still comes back 429 is retried exactly once after waiting
/// out the advertised `retry-after`; a second 429 surfaces as
/// [`HttpError::RateLimited`].
pub struct Ratelimiter {
    client: Client,
    global: Mutex<()>,
    routes: DashMap<RatelimitingBucket, Ratelimit>,
    token: SecretString,
    proxy: Option<String>,
}

impl fmt::Debug for Ratelimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ratelimiter")
            .field("client", &self.client)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl Ratelimiter {
    /// Creates a new ratelimiter with a shared [`reqwest`] client and the
    /// already-prefixed authorization token.
    #[must_use]
    pub fn new(client: Client, token: String) -> Self {
        Self {
            client,
            token: SecretString::new(token),
            global: Mutex::default(),
            routes: DashMap::new(),
            proxy: None,
        }
    }

    /// Routes all requests through `proxy` instead of the real API base. The
    /// proxy receives the same paths and is expected to answer with the same
    /// status codes and headers.
    pub fn set_proxy(&mut self, proxy: String) {
        self.proxy = Some(proxy);
    }

    /// Per-bucket ratelimit state learned so far.
    #[must_use]
    pub fn routes(&self) -> &DashMap<RatelimitingBucket, Ratelimit> {
        &self.routes
    }

    /// Sends the request, waiting out pre-emptive and advertised ratelimit
    /// windows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] when the transport fails, when a ratelimit
    /// header is malformed, or when the request is rejected for rate
    /// limiting twice in a row.
    pub async fn perform(&self, req: Request) -> Result<Response> {
        let mut retried = false;

        loop {
            // Blocks while another task is waiting out the global window.
            drop(self.global.lock().await);

            let ratelimiting_bucket = req.route().ratelimiting_bucket();
            let delay_time = {
                let mut bucket = self.routes.entry(ratelimiting_bucket).or_default();
                bucket.pre_hook(&req)
            };

            if let Some(delay_time) = delay_time {
                sleep(delay_time).await;
            }

            let request = req.clone().build(
                &self.client,
                self.token.expose_secret(),
                self.proxy.as_deref(),
            )?;
            let response = self.client.execute(request.build()?).await.map_err(HttpError::Request)?;

            if ratelimiting_bucket.is_none() {
                return Ok(response);
            }

            if response.headers().get("x-ratelimit-global").is_some() {
                let Some(retry_after) = parse_header::<f64>(response.headers(), "retry-after")?
                else {
                    return Ok(response);
                };
                let retry_after = Duration::from_secs_f64(retry_after);
                if retried {
                    return Err(Error::Http(HttpError::RateLimited { retry_after }));
                }

                debug!("Globally ratelimited for {retry_after:?}");
                let global = self.global.lock().await;
                sleep(retry_after).await;
                drop(global);

                retried = true;
                continue;
            }

            let delay_time = if let Some(mut bucket) = self.routes.get_mut(&ratelimiting_bucket) {
                bucket.post_hook(&response, &req)?
            } else {
                None
            };

            match delay_time {
                Some(retry_after) => {
                    if retried {
                        return Err(Error::Http(HttpError::RateLimited { retry_after }));
                    }
                    sleep(retry_after).await;
                    retried = true;
                },
                None => return Ok(response),
            }
        }
    }
}

/// Ratelimit state for one [`RatelimitingBucket`], learned entirely from
/// response headers.
#[derive(Debug)]
pub struct Ratelimit {
    /// The total number of requests that can be made in a window.
    limit: i64,
    /// The number of requests remaining in the window.
    remaining: i64,
    /// The absolute time when the window resets.
    reset: Option<SystemTime>,
    /// The advertised time until the window resets.
    reset_after: Option<Duration>,
}

impl Ratelimit {
    /// Returns how long to wait before the request may be sent, and consumes
    /// a ticket otherwise.
    fn pre_hook(&mut self, req: &Request) -> Option<Duration> {
        if self.limit == 0 {
            return None;
        }

        let Some(reset) = self.reset else {
            // No response seen yet for this bucket.
            self.remaining = self.limit;
            return None;
        };

        let Ok(delay) = reset.duration_since(SystemTime::now()) else {
            // The window has already reset.
            if self.remaining != 0 {
                self.remaining -= 1;
            }
            return None;
        };

        if self.remaining == 0 {
            debug!(
                "Waiting out {delay:?} on bucket {:?} before sending",
                req.route().ratelimiting_bucket(),
            );
            Some(delay)
        } else {
            self.remaining -= 1;
            None
        }
    }

    /// Updates the bucket from response headers; returns how long to wait
    /// before retrying when the response was a 429.
    fn post_hook(&mut self, response: &Response, req: &Request) -> Result<Option<Duration>> {
        if let Some(limit) = parse_header(response.headers(), "x-ratelimit-limit")? {
            self.limit = limit;
        }

        if let Some(remaining) = parse_header(response.headers(), "x-ratelimit-remaining")? {
            self.remaining = remaining;
        }

        if let Some(reset_after) =
            parse_header::<f64>(response.headers(), "x-ratelimit-reset-after")?
        {
            self.reset = Some(SystemTime::now() + Duration::from_secs_f64(reset_after));
            self.reset_after = Some(Duration::from_secs_f64(reset_after));
        }

        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }

        Ok(match parse_header::<f64>(response.headers(), "retry-after")? {
            Some(retry_after) => {
                debug!(
                    "Ratelimited on route {:?} for {retry_after:?}s",
                    req.route().ratelimiting_bucket(),
                );
                Some(Duration::from_secs_f64(retry_after))
            },
            None => None,
        })
    }

    /// The total number of requests that can be made in a window.
    #[must_use]
    pub const fn limit(&self) -> i64 {
        self.limit
    }

    /// The number of requests remaining in the window.
    #[must_use]
    pub const fn remaining(&self) -> i64 {
        self.remaining
    }

    /// The absolute time when the window resets.
    #[must_use]
    pub const fn reset(&self) -> Option<SystemTime> {
        self.reset
    }

    /// The advertised time until the window resets.
    #[must_use]
    pub const fn reset_after(&self) -> Option<Duration> {
        self.reset_after
    }
}

impl Default for Ratelimit {
    fn default() -> Self {
        Self {
            limit: i64::MAX,
            remaining: i64::MAX,
            reset: None,
            reset_after: None,
        }
    }
}

fn parse_header<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<Option<T>> {
    let Some(value) = headers.get(name) else { return Ok(None) };

    str::from_utf8(value.as_bytes())
        .map_err(|_| Error::from(HttpError::RatelimitHeaderNotUtf8))?
        .parse()
        .map(Some)
        .map_err(|_| Error::from(HttpError::RatelimitHeaderNotNumeric))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::Client;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::{parse_header, Ratelimiter};
    use crate::error::Error;
    use crate::http::{HttpError, LightMethod, Request, Route};

    const THROTTLED: &str = "HTTP/1.1 429 Too Many Requests\r\nretry-after: 0.05\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const OK: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";

    /// Serves each canned response to one connection, in order.
    async fn serve(responses: &'static [&'static str]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();

                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    head.extend_from_slice(&buf[..n]);
                    if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        addr
    }

    fn ratelimiter_against(addr: SocketAddr) -> Ratelimiter {
        let mut ratelimiter = Ratelimiter::new(Client::new(), "Bot t".to_string());
        ratelimiter.set_proxy(format!("http://{addr}"));
        ratelimiter
    }

    #[tokio::test]
    async fn a_second_ratelimit_rejection_surfaces_as_an_error() {
        let addr = serve(&[THROTTLED, THROTTLED]).await;
        let ratelimiter = ratelimiter_against(addr);

        let err = ratelimiter
            .perform(Request::new(Route::Gateway, LightMethod::Get))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(HttpError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn a_ratelimited_request_is_retried_once() {
        let addr = serve(&[THROTTLED, OK]).await;
        let ratelimiter = ratelimiter_against(addr);

        let response = ratelimiter
            .perform(Request::new(Route::Gateway, LightMethod::Get))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    fn ratelimit_headers() -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        map.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        map.insert("x-ratelimit-reset-after", HeaderValue::from_static("12.547"));
        map
    }

    #[test]
    fn well_formed_headers_parse() {
        let headers = ratelimit_headers();

        assert_eq!(parse_header::<i64>(&headers, "x-ratelimit-limit").unwrap(), Some(5));
        assert_eq!(parse_header::<i64>(&headers, "x-ratelimit-remaining").unwrap(), Some(4));

        let reset_after = parse_header::<f64>(&headers, "x-ratelimit-reset-after").unwrap();
        assert!((reset_after.unwrap() - 12.547).abs() < f64::EPSILON);
    }

    #[test]
    fn an_absent_header_is_not_an_error() {
        let parsed = parse_header::<i64>(&ratelimit_headers(), "x-ratelimit-bucket").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn malformed_headers_surface_typed_errors() {
        let mut headers = ratelimit_headers();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("soon"));
        assert!(matches!(
            parse_header::<i64>(&headers, "x-ratelimit-limit").unwrap_err(),
            Error::Http(HttpError::RatelimitHeaderNotNumeric)
        ));

        headers.insert("x-ratelimit-limit", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());
        assert!(matches!(
            parse_header::<i64>(&headers, "x-ratelimit-limit").unwrap_err(),
            Error::Http(HttpError::RatelimitHeaderNotUtf8)
        ));
    }
}

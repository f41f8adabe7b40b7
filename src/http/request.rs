use reqwest::header::{
    HeaderMap as Headers, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT,
};
use reqwest::{Client, Method, RequestBuilder as ReqwestRequestBuilder, Url};

use super::routing::Route;
use super::HttpError;
use crate::constants;
use crate::error::Result;

/// The HTTP verb of a request, without the bodies reqwest's [`Method`] drags
/// along.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LightMethod {
    Delete,
    Get,
    Patch,
    Post,
    Put,
}

impl LightMethod {
    #[must_use]
    pub fn reqwest_method(self) -> Method {
        match self {
            Self::Delete => Method::DELETE,
            Self::Get => Method::GET,
            Self::Patch => Method::PATCH,
            Self::Post => Method::POST,
            Self::Put => Method::PUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Request {
    pub(super) method: LightMethod,
    pub(super) route: Route,
    pub(super) body: Option<Vec<u8>>,
    pub(super) headers: Option<Headers>,
}

impl Request {
    #[must_use]
    pub fn new(route: Route, method: LightMethod) -> Self {
        Self {
            method,
            route,
            body: None,
            headers: None,
        }
    }

    #[must_use]
    pub fn body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers;
        self
    }

    /// Lowers the request into a reqwest builder against `proxy`, or the
    /// real API base when no proxy is configured.
    pub fn build(
        self,
        client: &Client,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<ReqwestRequestBuilder> {
        let Self {
            method,
            route,
            body,
            headers: request_headers,
        } = self;

        let base = proxy.map_or(constants::API_BASE, |proxy| proxy.trim_end_matches('/'));
        let url = Url::parse(&format!("{base}{}", route.path())).map_err(HttpError::Url)?;
        let mut builder = client.request(method.reqwest_method(), url);

        let mut headers = Headers::with_capacity(4);
        headers.insert(USER_AGENT, HeaderValue::from_static(constants::USER_AGENT));
        headers
            .insert(AUTHORIZATION, HeaderValue::from_str(token).map_err(HttpError::InvalidHeader)?);

        // A content-type header without a body provokes a 400.
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let length = body
            .as_ref()
            .map(|b| HeaderValue::try_from(b.len().to_string()))
            .transpose()
            .map_err(HttpError::InvalidHeader)?;
        headers.insert(CONTENT_LENGTH, length.unwrap_or_else(|| HeaderValue::from_static("0")));

        if let Some(request_headers) = request_headers {
            headers.extend(request_headers);
        }

        if let Some(bytes) = body {
            builder = builder.body(bytes);
        }

        Ok(builder.headers(headers))
    }

    #[must_use]
    pub fn method(&self) -> LightMethod {
        self.method
    }

    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }
}

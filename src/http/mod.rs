//! HTTP session abstraction consumed by the authentication procedure
//!
//! The procedure never talks to `reqwest` directly. It goes through the
//! [`HttpSession`] trait, which keeps the cookie jar and follows redirects, so
//! tests can drive the whole state machine against a scripted provider.

pub mod reqwest_session;

use std::borrow::Cow;
use std::collections::HashMap;

use async_trait::async_trait;
use cookie::Cookie;
use serde::de::DeserializeOwned;
use url::Url;

use crate::errors::TransportError;

pub use reqwest_session::ReqwestSession;

/// HTTP methods used by the SSO protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Request payload
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// A single outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    #[must_use]
    pub fn post_form(url: Url, form: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            query: Vec::new(),
            body: RequestBody::Form(form),
        }
    }

    #[must_use]
    pub fn post_json(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    /// Append query parameters
    #[must_use]
    pub fn with_query<K, V, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Look up a query parameter, either appended or already part of the URL
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| {
                self.url
                    .query_pairs()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.into_owned())
            })
    }

    /// Look up a field of a JSON or form body
    #[must_use]
    pub fn body_value(&self, key: &str) -> Option<String> {
        match &self.body {
            RequestBody::Empty => None,
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            RequestBody::Json(value) => value.get(key).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// Response after all HTTP redirects were followed
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after redirects
    pub url: Url,
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decode the body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Cookie-keeping, redirect-following HTTP client
///
/// One instance belongs to exactly one login attempt. Running several logins
/// concurrently requires one session per login so provider markers never mix.
#[async_trait]
pub trait HttpSession: Send + Sync {
    /// Send a request and follow HTTP redirects
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the request cannot be completed.
    /// Non-2xx statuses are not errors at this layer.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Cookies the jar would send to `url`, by name
    fn cookies(&self, url: &Url) -> HashMap<String, String>;
}

/// Parse a `Cookie` request header (`a=1; b=2`) into a name/value map
///
/// Malformed pairs, such as one without a name, are skipped.
#[must_use]
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    Cookie::split_parse(header)
        .filter_map(Result::ok)
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect()
}

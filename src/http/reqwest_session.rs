//! `reqwest`-backed [`HttpSession`] with a private cookie jar

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use super::{parse_cookie_header, HttpMethod, HttpRequest, HttpResponse, HttpSession, RequestBody};
use crate::errors::TransportError;
use crate::settings::HttpSettings;

/// Production HTTP session
///
/// Every instance owns a fresh cookie jar; never share one between logins.
pub struct ReqwestSession {
    client: reqwest::Client,
    jar: Arc<Jar>,
}

impl ReqwestSession {
    /// Build a session from HTTP settings
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be constructed
    /// (for example when the TLS backend fails to initialize)
    pub fn new(settings: &HttpSettings) -> Result<Self, TransportError> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self { client, jar })
    }
}

#[async_trait]
impl HttpSession for ReqwestSession {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            query,
            body,
        } = request;
        debug!("{} {}", method.as_str(), url);

        let mut builder = match method {
            HttpMethod::Get => self.client.get(url.clone()),
            HttpMethod::Post => self.client.post(url.clone()),
        };
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(value) => builder.json(&value),
        };

        let response = builder.send().await.map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Request {
                url: final_url.to_string(),
                source,
            })?
            .to_vec();

        debug!("{} {} -> {} ({} bytes)", method.as_str(), final_url, status, body.len());

        Ok(HttpResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    fn cookies(&self, url: &Url) -> HashMap<String, String> {
        self.jar
            .cookies(url)
            .and_then(|header| header.to_str().map(parse_cookie_header).ok())
            .unwrap_or_default()
    }
}

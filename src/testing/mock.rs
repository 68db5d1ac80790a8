//! Scripted HTTP session for driving the procedure without a network
//!
//! Routes are keyed by method and URL path. Each route holds a queue of
//! replies; the last reply repeats once the queue is drained, so a route with
//! a single reply answers every request the same way.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use url::Url;

use crate::errors::TransportError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpSession};

/// A canned response
#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Where the (simulated) redirect chain ended; the request URL if unset
    pub final_url: Option<Url>,
    /// Cookies stored for the host of the final URL
    pub set_cookies: Vec<(String, String)>,
}

impl StubResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
            final_url: None,
            set_cookies: Vec::new(),
        }
    }

    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string()).with_header("content-type", "application/json")
    }

    #[must_use]
    pub fn html(body: &str) -> Self {
        Self::new(200, body).with_header("content-type", "text/html")
    }

    #[must_use]
    pub fn bytes(body: &[u8]) -> Self {
        Self::new(200, body.to_vec()).with_header("content-type", "image/png")
    }

    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::new(status, Vec::new())
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Pretend HTTP redirects ended at `url`
    ///
    /// # Panics
    ///
    /// Panics if `url` is not a valid absolute URL.
    #[must_use]
    pub fn redirected_to(mut self, url: &str) -> Self {
        self.final_url = Some(Url::parse(url).expect("stub redirect target must be a valid URL"));
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.set_cookies.push((name.to_string(), value.to_string()));
        self
    }
}

/// What a route does when hit
#[derive(Debug, Clone)]
pub enum StubReply {
    Respond(StubResponse),
    /// Fail at the transport layer
    Fail(std::io::ErrorKind),
    /// Never answer, for cancellation tests
    Hang,
}

impl From<StubResponse> for StubReply {
    fn from(response: StubResponse) -> Self {
        StubReply::Respond(response)
    }
}

type RouteKey = (HttpMethod, String);

/// In-memory [`HttpSession`] replaying scripted replies
#[derive(Debug, Default)]
pub struct ScriptedHttpSession {
    routes: Mutex<HashMap<RouteKey, VecDeque<StubReply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    cookies: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl ScriptedHttpSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `method path`
    ///
    /// # Panics
    ///
    /// Panics if the route table lock is poisoned.
    pub fn on(&self, method: HttpMethod, path: &str, reply: impl Into<StubReply>) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Replace all replies of `method path`
    ///
    /// # Panics
    ///
    /// Panics if the route table lock is poisoned.
    pub fn replace<R: Into<StubReply>>(&self, method: HttpMethod, path: &str, replies: Vec<R>) -> &Self {
        self.routes.lock().unwrap().insert(
            (method, path.to_string()),
            replies.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Make `method path` fail at the transport layer
    pub fn fail(&self, method: HttpMethod, path: &str, kind: std::io::ErrorKind) -> &Self {
        self.replace(method, path, vec![StubReply::Fail(kind)])
    }

    /// Make `method path` never answer
    pub fn hang(&self, method: HttpMethod, path: &str) -> &Self {
        self.replace(method, path, vec![StubReply::Hang])
    }

    /// Every request seen so far, in order
    ///
    /// # Panics
    ///
    /// Panics if the request log lock is poisoned.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests seen for `method path`
    #[must_use]
    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.url.path() == path)
            .count()
    }

    /// Most recent request for `method path`
    #[must_use]
    pub fn last_request(&self, method: HttpMethod, path: &str) -> Option<HttpRequest> {
        self.requests()
            .into_iter()
            .rev()
            .find(|r| r.method == method && r.url.path() == path)
    }

    fn next_reply(&self, key: &RouteKey) -> Option<StubReply> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn store_cookies(&self, url: &Url, cookies: &[(String, String)]) {
        if cookies.is_empty() {
            return;
        }
        let host = url.host_str().unwrap_or_default().to_string();
        let mut jar = self.cookies.lock().unwrap();
        let entry = jar.entry(host).or_default();
        for (name, value) in cookies {
            entry.insert(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl HttpSession for ScriptedHttpSession {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let key = (request.method, request.url.path().to_string());

        match self.next_reply(&key) {
            None => Ok(HttpResponse {
                url: request.url,
                status: 404,
                headers: HashMap::new(),
                body: b"no stub for this route".to_vec(),
            }),
            Some(StubReply::Fail(kind)) => Err(TransportError::Io(std::io::Error::new(
                kind,
                format!("scripted failure for {}", request.url.path()),
            ))),
            Some(StubReply::Hang) => std::future::pending().await,
            Some(StubReply::Respond(stub)) => {
                let url = stub.final_url.unwrap_or(request.url);
                self.store_cookies(&url, &stub.set_cookies);
                Ok(HttpResponse {
                    url,
                    status: stub.status,
                    headers: stub.headers,
                    body: stub.body,
                })
            }
        }
    }

    fn cookies(&self, url: &Url) -> HashMap<String, String> {
        let host = url.host_str().unwrap_or_default();
        self.cookies
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

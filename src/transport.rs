use std::time::Duration;

use crate::error::{MonaError, Result};

/// HTTP method used by the client. Every Mona endpoint is a GET or a POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Json(body),
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Form(form),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response. Non-2xx statuses are responses too, not transport errors.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 and 403 both mean the bearer token was not accepted.
    pub fn is_auth_rejection(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Blocking HTTP transport. All network I/O of the client goes through it.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Default transport backed by a `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut req = self
            .agent
            .request(request.method.as_str(), &request.url)
            .set("x-mona-sdk", &format!("rust/{}", env!("CARGO_PKG_VERSION")));
        for (name, value) in &request.headers {
            req = req.set(name, value);
        }

        let result = match &request.body {
            Body::Empty => req.call(),
            Body::Json(value) => {
                let body = serde_json::to_string(value)
                    .map_err(|e| MonaError::transport(format!("JSON marshal failed: {e}")))?;
                req.set("Content-Type", "application/json")
                    .send_string(&body)
            }
            Body::Form(pairs) => {
                let pairs: Vec<(&str, &str)> = pairs
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                req.send_form(&pairs)
            }
        };

        match result {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.into_string().map_err(MonaError::transport)?;
                Ok(HttpResponse::new(status, body))
            }
            Err(ureq::Error::Status(status, resp)) => {
                Ok(HttpResponse::new(status, resp.into_string().unwrap_or_default()))
            }
            Err(ureq::Error::Transport(e)) => Err(MonaError::transport(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted transport for unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&HttpRequest) -> Option<Result<HttpResponse>> + Send + Sync>;

    /// Answers requests from per-url-suffix queues, falling back to a handler.
    #[derive(Default)]
    pub struct FakeTransport {
        routes: Mutex<Vec<(String, VecDeque<Result<HttpResponse>>)>>,
        handler: Option<Handler>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_handler(
            handler: impl Fn(&HttpRequest) -> Option<Result<HttpResponse>> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Some(Box::new(handler)),
                ..Self::default()
            }
        }

        /// Queue a reply for urls ending with `suffix`.
        pub fn push(&self, suffix: &str, reply: Result<HttpResponse>) {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|(s, _)| s == suffix) {
                Some((_, q)) => q.push_back(reply),
                None => routes.push((suffix.to_string(), VecDeque::from([reply]))),
            }
        }

        pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.ends_with(suffix))
                .cloned()
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            {
                let mut routes = self.routes.lock().unwrap();
                if let Some((_, q)) = routes
                    .iter_mut()
                    .find(|(s, q)| request.url.ends_with(s.as_str()) && !q.is_empty())
                {
                    if let Some(reply) = q.pop_front() {
                        return reply;
                    }
                }
            }
            if let Some(handler) = &self.handler {
                if let Some(reply) = handler(request) {
                    return reply;
                }
            }
            Err(MonaError::Transport(format!("no reply scripted for {}", request.url)))
        }
    }
}

//! Scripted transport for tests.
//!
//! Replies are registered per URL (query string ignored) and handed out in
//! order; the last reply for a URL repeats. Unknown URLs answer 404.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{
    ConnectivityKind, HttpTransport, TransportError, WireRequest, WireResponse, redacted_url,
};

#[derive(Debug, Clone)]
enum Reply {
    Respond(WireResponse),
    Fail(ConnectivityKind),
    Delay(Duration, Box<Reply>),
    Hang,
}

#[derive(Debug)]
struct Route {
    url: String,
    replies: VecDeque<Reply>,
}

/// An [`HttpTransport`] that replays canned responses and records requests.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<WireRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `url`.
    pub fn respond(&self, url: &str, response: WireResponse) -> &Self {
        self.push(url, Reply::Respond(response))
    }

    /// Queue a JSON response for `url`.
    pub fn respond_json(&self, url: &str, status: u16, body: serde_json::Value) -> &Self {
        self.respond(url, WireResponse::json(status, &body))
    }

    /// Queue a response that arrives after `delay`.
    pub fn respond_after(&self, url: &str, delay: Duration, response: WireResponse) -> &Self {
        self.push(url, Reply::Delay(delay, Box::new(Reply::Respond(response))))
    }

    /// Queue a connectivity failure for `url`.
    pub fn fail(&self, url: &str, kind: ConnectivityKind) -> &Self {
        self.push(url, Reply::Fail(kind))
    }

    /// Queue a request that never completes.
    pub fn hang(&self, url: &str) -> &Self {
        self.push(url, Reply::Hang)
    }

    /// Every request executed so far, in order.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests sent to `url`.
    pub fn request_count(&self, url: &str) -> usize {
        let url = normalize(url);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| normalize(&redacted_url(&r.url)) == url)
            .count()
    }

    fn push(&self, url: &str, reply: Reply) -> &Self {
        let url = normalize(url);
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.iter_mut().find(|r| r.url == url) {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                url,
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    fn next_reply(&self, request: &WireRequest) -> Reply {
        let url = normalize(&redacted_url(&request.url));
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(route) = routes.iter_mut().find(|r| r.url == url) else {
            return Reply::Respond(WireResponse::new(404, "not found"));
        };
        if route.replies.len() > 1 {
            route.replies.pop_front().unwrap_or(Reply::Hang)
        } else {
            route.replies.front().cloned().unwrap_or(Reply::Hang)
        }
    }
}

fn normalize(url: &str) -> String {
    let url = url.split('?').next().unwrap_or(url);
    url.trim_end_matches('/').to_string()
}

async fn play(reply: Reply) -> Result<WireResponse, TransportError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Respond(response) => return Ok(response),
            Reply::Fail(kind) => return Err(TransportError::new(kind, "scripted failure")),
            Reply::Delay(delay, next) => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            Reply::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let reply = self.next_reply(&request);
        let timeout = request.timeout;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        match timeout {
            Some(limit) => tokio::time::timeout(limit, play(reply))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::new(
                        ConnectivityKind::Timeout,
                        "request timed out",
                    ))
                }),
            None => play(reply).await,
        }
    }
}

//! JSON-over-HTTP client for the coordinator's node fan-out.
//!
//! Transport failures are data here, not errors: the coordinator
//! aggregates them per node (a node that cannot be reached is an
//! `exception`, a node that answers with a non-2xx status is a
//! `failure`), so this client never returns `Err`.

use std::time::Duration;

use http::StatusCode;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use log::{debug, warn};
use serde_json::Value;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one request.
#[derive(Clone, Debug)]
pub enum Fetched {
    /// The node produced an HTTP response; `body` is `None` when it was
    /// not parseable as JSON.
    Response {
        status: StatusCode,
        body: Option<Value>,
    },
    /// Connection failure, timeout, or similar transport problem.
    Transport,
}

impl Fetched {
    /// Parsed body of a successful (2xx) response, `None` otherwise.
    pub fn ok_value(&self) -> Option<&Value> {
        match self {
            Fetched::Response { status, body } if status.is_success() => body.as_ref(),
            _ => None,
        }
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Fetched::Transport)
    }
}

#[derive(Clone)]
pub struct JsonClient {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl JsonClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Issue one request and classify the outcome.
    pub async fn fetch(&self, method: Method, url: &str, body: Option<&Value>) -> Fetched {
        debug!("request {} {}", method, url);

        let mut builder = Request::builder().method(method).uri(url);
        let request = match body {
            Some(value) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                builder.body(Body::from(value.to_string()))
            }
            None => builder.body(Body::empty()),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!("invalid request for {}: {}", url, err);
                return Fetched::Transport;
            }
        };

        let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!("request to {} failed: {}", url, err);
                return Fetched::Transport;
            }
            Err(_) => {
                warn!("request to {} timed out", url);
                return Fetched::Transport;
            }
        };

        let status = response.status();
        let body =
            match tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
                .await
            {
                Ok(Ok(bytes)) => serde_json::from_slice(&bytes).ok(),
                Ok(Err(err)) => {
                    warn!("reading response from {} failed: {}", url, err);
                    return Fetched::Transport;
                }
                Err(_) => {
                    warn!("reading response from {} timed out", url);
                    return Fetched::Transport;
                }
            };

        if !status.is_success() {
            warn!("unexpected response status from {}: {}", url, status);
        }
        Fetched::Response { status, body }
    }

    /// GET returning the parsed body only for a 2xx response.
    pub async fn get_json(&self, url: &str) -> Option<Value> {
        self.fetch(Method::GET, url, None).await.ok_value().cloned()
    }

    /// POST returning the parsed body only for a 2xx response.
    pub async fn post_json(&self, url: &str, body: Option<&Value>) -> Option<Value> {
        self.fetch(Method::POST, url, body)
            .await
            .ok_value()
            .cloned()
    }
}

impl Default for JsonClient {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

//! HTTP server wiring.
//!
//! One hyper service serves both roles: coordinator routes at the root,
//! node routes under `/node`. Which of the two actually exist depends on
//! the configuration sections present.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{format_err, Error};
use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use log::info;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::GlobalConfig;
use crate::coordinator::Coordinator;
use crate::node::Node;

pub struct Service {
    pub coordinator: Option<Arc<Coordinator>>,
    pub node: Option<Arc<Node>>,
    advertised_addr: String,
}

impl Service {
    pub fn build(config: &GlobalConfig) -> Result<Arc<Self>, Error> {
        let advertised_addr = format!("{}:{}", config.http.host, config.http.port);
        let coordinator = match &config.coordinator {
            Some(coordinator_config) => Some(Coordinator::new(
                coordinator_config.clone(),
                config.object_storage.clone(),
            )?),
            None => None,
        };
        let node = config
            .node
            .as_ref()
            .map(|node_config| Node::new(node_config.clone(), config.object_storage.clone()));
        Ok(Arc::new(Self {
            coordinator,
            node,
            advertised_addr,
        }))
    }

    /// Reconstruct the externally visible URL of this request, for
    /// status URLs handed back to the caller.
    fn request_url(&self, req: &Request<Body>) -> String {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(&self.advertised_addr);
        format!("http://{}{}", host, req.uri().path())
    }
}

async fn handle(service: Arc<Service>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let request_url = service.request_url(&req);

    let response = if path == "/node" || path.starts_with("/node/") {
        match &service.node {
            Some(node) => {
                let subpath = path["/node".len()..].to_string();
                crate::node::api::handle(node.clone(), req, subpath, request_url).await
            }
            None => error_response(StatusCode::NOT_FOUND, "node role not enabled"),
        }
    } else {
        match &service.coordinator {
            Some(coordinator) => {
                crate::coordinator::api::handle(coordinator.clone(), req, path, request_url).await
            }
            None => error_response(StatusCode::NOT_FOUND, "coordinator role not enabled"),
        }
    };
    Ok(response)
}

/// Bind and run the server; `ready` fires once the listener is up.
pub async fn serve(
    service: Arc<Service>,
    addr: SocketAddr,
    ready: impl FnOnce(),
) -> Result<(), Error> {
    let make_service = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(service.clone(), req)))
        }
    });

    let server = hyper::Server::try_bind(&addr)
        .map_err(|err| format_err!("unable to bind {}: {}", addr, err))?
        .serve(make_service);
    info!("listening on {}", addr);
    ready();
    server.await?;
    Ok(())
}

pub(crate) fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

pub(crate) fn error_response(status: StatusCode, detail: &str) -> Response<Body> {
    json_response(status, json!({ "detail": detail }))
}

pub(crate) fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    match req.uri().query() {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

/// Parse a JSON request body; the error response mirrors the 422 a
/// validation failure produces.
pub(crate) async fn read_json_body<T: DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, Response<Body>> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Err(error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &format!("unable to read request body: {}", err),
            ))
        }
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!("invalid request body: {}", err),
        )
    })
}

//! Node HTTP surface: lease endpoints plus one start and one result
//! endpoint per operation. All operation starts require the lease to be
//! held by someone.

use std::sync::Arc;

use http::{Method, StatusCode};
use hyper::{Body, Request, Response};
use serde_json::json;

use crate::common::error::LeaseError;
use crate::node::Node;
use crate::server::{error_response, json_response, query_params, read_json_body};

const OP_NAMES: [&str; 4] = ["snapshot", "upload", "download", "clear"];

pub async fn handle(
    node: Arc<Node>,
    req: Request<Body>,
    subpath: String,
    request_url: String,
) -> Response<Body> {
    let segments: Vec<String> = subpath
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect();
    let segments: Vec<&str> = segments.iter().map(|segment| segment.as_str()).collect();

    match (req.method().clone(), segments.as_slice()) {
        (Method::POST, ["lock"]) => lock(&node, &req),
        (Method::POST, ["relock"]) => relock(&node, &req),
        (Method::POST, ["unlock"]) => unlock(&node, &req),
        (Method::POST, [op_name]) if OP_NAMES.contains(op_name) => {
            let op_name = op_name.to_string();
            start_op(&node, &op_name, req, &request_url).await
        }
        (Method::GET, [op_name, op_id]) if OP_NAMES.contains(op_name) => {
            op_result(&node, op_name, op_id)
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn lease_error_response(err: LeaseError, detail: &str) -> Response<Body> {
    match err {
        LeaseError::Conflict => error_response(StatusCode::CONFLICT, detail),
        LeaseError::OwnerMismatch => {
            error_response(StatusCode::FORBIDDEN, "Locked by someone else")
        }
    }
}

fn locker_and_ttl(req: &Request<Body>) -> Result<(String, u64), Response<Body>> {
    let params = query_params(req);
    let locker = params
        .get("locker")
        .cloned()
        .filter(|locker| !locker.is_empty())
        .ok_or_else(|| {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "locker is required")
        })?;
    let ttl = match params.get("ttl") {
        Some(ttl) => ttl.parse().map_err(|_| {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "ttl must be an integer")
        })?,
        None => 0,
    };
    Ok((locker, ttl))
}

fn lock(node: &Arc<Node>, req: &Request<Body>) -> Response<Body> {
    let (locker, ttl) = match locker_and_ttl(req) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    match node.state.lock(&locker, ttl) {
        Ok(()) => json_response(StatusCode::OK, json!({ "locked": true })),
        Err(err) => lease_error_response(err, "Already locked"),
    }
}

fn relock(node: &Arc<Node>, req: &Request<Body>) -> Response<Body> {
    let (locker, ttl) = match locker_and_ttl(req) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    match node.state.relock(&locker, ttl) {
        Ok(()) => json_response(StatusCode::OK, json!({ "locked": true })),
        Err(err) => lease_error_response(err, "Not locked"),
    }
}

fn unlock(node: &Arc<Node>, req: &Request<Body>) -> Response<Body> {
    let (locker, _) = match locker_and_ttl(req) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    match node.state.unlock(&locker) {
        Ok(()) => json_response(StatusCode::OK, json!({ "locked": false })),
        Err(err) => lease_error_response(err, "Already unlocked"),
    }
}

async fn start_op(
    node: &Arc<Node>,
    op_name: &str,
    req: Request<Body>,
    request_url: &str,
) -> Response<Body> {
    if !node.state.is_locked() {
        return error_response(StatusCode::CONFLICT, "Not locked");
    }

    let started = match op_name {
        "snapshot" => match read_json_body(req).await {
            Ok(body) => crate::node::snapshot::start_snapshot_op(node, body, request_url),
            Err(response) => return response,
        },
        "upload" => match read_json_body(req).await {
            Ok(body) => crate::node::snapshot::start_upload_op(node, body, request_url),
            Err(response) => return response,
        },
        "download" => match read_json_body(req).await {
            Ok(body) => crate::node::download::start_download_op(node, body, request_url),
            Err(response) => return response,
        },
        "clear" => match read_json_body(req).await {
            Ok(body) => crate::node::clear::start_clear_op(node, body, request_url),
            Err(response) => return response,
        },
        _ => unreachable!("unrouted op name"),
    };

    match started {
        Ok(start_result) => json_response(
            StatusCode::OK,
            serde_json::to_value(start_result).expect("start result serializes"),
        ),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unable to start {}: {}", op_name, err),
        ),
    }
}

fn op_result(node: &Arc<Node>, op_name: &str, op_id: &str) -> Response<Body> {
    let op_id: u64 = match op_id.parse() {
        Ok(op_id) => op_id,
        Err(_) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "op_id must be an integer")
        }
    };
    match node.op_result(op_name, op_id) {
        Some(result) => json_response(StatusCode::OK, result),
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({
                "code": "operation_id_mismatch",
                "op": op_id,
                "message": "Unknown operation id",
            }),
        ),
    }
}

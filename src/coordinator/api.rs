//! Coordinator HTTP surface.

use std::sync::Arc;

use http::{Method, StatusCode};
use hyper::{Body, Request, Response};
use log::info;
use serde_json::json;

use crate::common::op::{OpStatus, StartResult};
use crate::coordinator::backup::BackupOp;
use crate::coordinator::restore::{RestoreOp, RestoreRequest};
use crate::coordinator::{
    request_lock_call, run_locked_op, Coordinator, LockCall, LockResult, StartOpError,
};
use crate::server::{error_response, json_response, query_params};

const OP_NAMES: [&str; 4] = ["backup", "restore", "lock", "unlock"];

pub async fn handle(
    coordinator: Arc<Coordinator>,
    req: Request<Body>,
    path: String,
    request_url: String,
) -> Response<Body> {
    let segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect();
    let segments: Vec<&str> = segments.iter().map(|segment| segment.as_str()).collect();

    match (req.method().clone(), segments.as_slice()) {
        (Method::POST, ["backup"]) => start_backup(&coordinator, &request_url).await,
        (Method::POST, ["restore"]) => start_restore(&coordinator, req, &request_url).await,
        (Method::POST, ["lock"]) => start_lock(&coordinator, &req, &request_url),
        (Method::POST, ["unlock"]) => start_unlock(&coordinator, &req, &request_url),
        (Method::GET, [op_name, op_id]) if OP_NAMES.contains(op_name) => {
            op_status(&coordinator, op_name, op_id)
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn start_result_response(request_url: &str, op_id: u64) -> Response<Body> {
    let start_result = StartResult {
        op_id,
        status_url: format!("{}/{}", request_url, op_id),
    };
    json_response(
        StatusCode::OK,
        serde_json::to_value(start_result).expect("start result serializes"),
    )
}

fn start_error_response(err: StartOpError) -> Response<Body> {
    match err {
        StartOpError::LockNotAcquired => {
            error_response(StatusCode::CONFLICT, "Unable to lock all nodes")
        }
        StartOpError::Other(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unable to start operation: {}", err),
        ),
    }
}

async fn start_backup(coordinator: &Arc<Coordinator>, request_url: &str) -> Response<Body> {
    let plugin = match coordinator.plugins.get(&coordinator.config.plugin) {
        Ok(plugin) => plugin,
        Err(err) => return start_error_response(StartOpError::Other(err)),
    };
    let locker = coordinator.locker_for_new_op();
    let initial_lock_start = match coordinator.acquire_cluster_lock(&locker).await {
        Ok(initial_lock_start) => initial_lock_start,
        Err(err) => return start_error_response(err),
    };

    let op = coordinator.locked_op_context("backup", locker, initial_lock_start);
    let op_id = op.handle.op_id();
    let backup_op = BackupOp::new(coordinator, op, plugin);
    tokio::spawn(run_locked_op(backup_op));
    start_result_response(request_url, op_id)
}

async fn start_restore(
    coordinator: &Arc<Coordinator>,
    req: Request<Body>,
    request_url: &str,
) -> Response<Body> {
    let request: RestoreRequest = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) if bytes.is_empty() => RestoreRequest::default(),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(err) => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &format!("invalid request body: {}", err),
                )
            }
        },
        Err(err) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &format!("unable to read request body: {}", err),
            )
        }
    };

    let plugin = match coordinator.plugins.get(&coordinator.config.plugin) {
        Ok(plugin) => plugin,
        Err(err) => return start_error_response(StartOpError::Other(err)),
    };
    let locker = coordinator.locker_for_new_op();
    let initial_lock_start = match coordinator.acquire_cluster_lock(&locker).await {
        Ok(initial_lock_start) => initial_lock_start,
        Err(err) => return start_error_response(err),
    };

    let op = coordinator.locked_op_context("restore", locker, initial_lock_start);
    let op_id = op.handle.op_id();
    let restore_op = RestoreOp::new(coordinator, op, plugin, request);
    tokio::spawn(run_locked_op(restore_op));
    start_result_response(request_url, op_id)
}

/// Manual cluster lock with an operator-chosen locker. TTL-bounded; no
/// renewal happens, the nodes drop the lease on their own.
fn start_lock(
    coordinator: &Arc<Coordinator>,
    req: &Request<Body>,
    request_url: &str,
) -> Response<Body> {
    let params = query_params(req);
    let locker = match params.get("locker") {
        Some(locker) if !locker.is_empty() => locker.clone(),
        _ => return error_response(StatusCode::UNPROCESSABLE_ENTITY, "locker is required"),
    };
    let ttl: u64 = match params.get("ttl").map(|ttl| ttl.parse()) {
        Some(Ok(ttl)) => ttl,
        Some(Err(_)) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "ttl must be an integer")
        }
        None => 60,
    };

    let handle = coordinator.state.begin("lock");
    let op_id = handle.op_id();
    let client = coordinator.client.clone();
    let nodes = coordinator.config.nodes.clone();
    tokio::spawn(async move {
        if handle.set_status(OpStatus::Running).is_err() {
            return;
        }
        let result = request_lock_call(&client, &nodes, LockCall::Lock, &locker, ttl).await;
        if result == LockResult::Ok {
            let _ = handle.set_status_from(OpStatus::Done, Some(OpStatus::Running));
        } else {
            info!("cluster lock failed: {:?}", result);
            handle.set_status_fail();
        }
    });
    start_result_response(request_url, op_id)
}

fn start_unlock(
    coordinator: &Arc<Coordinator>,
    req: &Request<Body>,
    request_url: &str,
) -> Response<Body> {
    let params = query_params(req);
    let locker = match params.get("locker") {
        Some(locker) if !locker.is_empty() => locker.clone(),
        _ => return error_response(StatusCode::UNPROCESSABLE_ENTITY, "locker is required"),
    };

    let handle = coordinator.state.begin("unlock");
    let op_id = handle.op_id();
    let client = coordinator.client.clone();
    let nodes = coordinator.config.nodes.clone();
    tokio::spawn(async move {
        if handle.set_status(OpStatus::Running).is_err() {
            return;
        }
        let result = request_lock_call(&client, &nodes, LockCall::Unlock, &locker, 0).await;
        if result == LockResult::Ok {
            let _ = handle.set_status_from(OpStatus::Done, Some(OpStatus::Running));
        } else {
            info!("cluster unlock failed: {:?}", result);
            handle.set_status_fail();
        }
    });
    start_result_response(request_url, op_id)
}

fn op_status(coordinator: &Arc<Coordinator>, op_name: &str, op_id: &str) -> Response<Body> {
    let op_id: u64 = match op_id.parse() {
        Ok(op_id) => op_id,
        Err(_) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "op_id must be an integer")
        }
    };
    match coordinator.op_status(op_name, op_id) {
        Some(status) => json_response(
            StatusCode::OK,
            json!({ "state": serde_json::to_value(status).expect("status serializes") }),
        ),
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

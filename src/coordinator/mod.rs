//! Coordinator role: drives all nodes of the cluster through one backup
//! or restore at a time under a cluster-wide lease.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http::Method;
use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};

use crate::common::asyncstorage::{AsyncHexDigestStorage, AsyncJsonStorage};
use crate::common::cachingstorage::CachingJsonStorage;
use crate::common::ipc::OpResult;
use crate::common::objectstorage::{ObjectStorage, ObjectStorageConfig};
use crate::common::storage::FileStorage;
use crate::common::op::{OpHandle, OpState, OpStatus, StartResult};
use crate::common::utils::{Backoff, CancelToken};
use crate::config::{CoordinatorConfig, CoordinatorNode};
use crate::tools::http::{Fetched, JsonClient};

pub mod api;
pub mod backup;
pub mod plugins;
pub mod restore;

/// Aggregate outcome of a lock/relock/unlock fan-out.
///
/// `Failure` is final: some node gave a well-formed answer that was not
/// the expected one, so this attempt is over. `Exception` only says a
/// node could not be reached and may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResult {
    Ok,
    Failure,
    Exception,
}

#[derive(Clone, Copy, Debug)]
pub enum LockCall {
    Lock,
    Relock,
    Unlock,
}

impl fmt::Display for LockCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LockCall::Lock => "lock",
            LockCall::Relock => "relock",
            LockCall::Unlock => "unlock",
        };
        write!(f, "{}", name)
    }
}

/// Fire one request per node concurrently; results are positionally
/// aligned to `nodes`. Transport errors are data, not raised.
pub async fn request_from_nodes(
    client: &JsonClient,
    nodes: &[CoordinatorNode],
    path: &str,
    method: Method,
    body: Option<&Value>,
) -> Vec<Fetched> {
    let requests = nodes.iter().map(|node| {
        let url = format!("{}/{}", node.url, path);
        let method = method.clone();
        async move { client.fetch(method, &url, body).await }
    });
    let results = futures::future::join_all(requests).await;
    debug!("request_from_nodes {} => {:?}", path, results);
    results
}

/// One lock-protocol call against a set of nodes, aggregated.
pub async fn request_lock_call(
    client: &JsonClient,
    nodes: &[CoordinatorNode],
    call: LockCall,
    locker: &str,
    ttl: u64,
) -> LockResult {
    let path = format!(
        "{}?locker={}&ttl={}",
        call,
        utf8_percent_encode(locker, NON_ALPHANUMERIC),
        ttl
    );
    let results = request_from_nodes(client, nodes, &path, Method::POST, None).await;
    let expected = match call {
        LockCall::Lock | LockCall::Relock => json!({ "locked": true }),
        LockCall::Unlock => json!({ "locked": false }),
    };
    let mut aggregate = LockResult::Ok;
    for (node, result) in nodes.iter().zip(results) {
        match result {
            Fetched::Transport => {
                info!("no usable {} response from {}", call, node.url);
                // failures mean we are done; don't override them
                if aggregate != LockResult::Failure {
                    aggregate = LockResult::Exception;
                }
            }
            Fetched::Response { status, body } => {
                if !status.is_success() {
                    info!("{} of {} failed: status {}", call, node.url, status);
                    aggregate = LockResult::Failure;
                } else if body.as_ref() != Some(&expected) {
                    info!("{} of {} failed: unexpected result {:?}", call, node.url, body);
                    aggregate = LockResult::Failure;
                }
            }
        }
    }
    aggregate
}

/// Shared context of one coordinator operation.
pub struct CoordinatorOp {
    pub nodes: Vec<CoordinatorNode>,
    pub client: JsonClient,
    pub config: CoordinatorConfig,
    pub handle: OpHandle,
    pub cancel: CancelToken,
    /// Unique per attempt, not per host: a retrying coordinator must not
    /// collide with its own prior stuck lease.
    pub locker: String,
    pub ttl: u64,
    /// When the initial lock fan-out happened; baseline of the renewal
    /// deadlines.
    pub initial_lock_start: Instant,
}

impl CoordinatorOp {
    pub async fn request_from_nodes(
        &self,
        path: &str,
        method: Method,
        body: Option<&Value>,
        nodes: Option<&[CoordinatorNode]>,
    ) -> Vec<Fetched> {
        let nodes = nodes.unwrap_or(&self.nodes);
        request_from_nodes(&self.client, nodes, path, method, body).await
    }

    pub async fn request_unlock_from_nodes(&self) -> LockResult {
        request_lock_call(&self.client, &self.nodes, LockCall::Unlock, &self.locker, 0).await
    }

    /// Spawn one renewal task per node. Any lease-lost event on any of
    /// them cancels the whole operation.
    pub fn spawn_relock_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.nodes
            .iter()
            .cloned()
            .map(|node| {
                let op = self.clone();
                tokio::spawn(async move { op.node_relock_loop(node).await })
            })
            .collect()
    }

    async fn node_relock_loop(self: Arc<Self>, node: CoordinatorNode) {
        let ttl = Duration::from_secs(self.ttl);
        let retry_delay = ttl / self.config.relock_retry_divisor.max(1);
        let mut lock_eol = self.initial_lock_start + ttl;
        let mut next_lock = self.initial_lock_start + ttl / 2;
        loop {
            let mut now = Instant::now();
            if now > lock_eol {
                info!("lease on {} expired, canceling operation", node.url);
                self.cancel.cancel();
                return;
            }
            if now < next_lock {
                tokio::time::sleep(next_lock - now).await;
                now = Instant::now();
            }
            let result = request_lock_call(
                &self.client,
                std::slice::from_ref(&node),
                LockCall::Relock,
                &self.locker,
                self.ttl,
            )
            .await;
            match result {
                LockResult::Ok => {
                    lock_eol = now + ttl;
                    next_lock = now + ttl / 2;
                }
                LockResult::Failure => {
                    info!("relock of {} failed, canceling operation", node.url);
                    self.cancel.cancel();
                    return;
                }
                LockResult::Exception => {
                    // transient; this leaves time for a handful of
                    // retries before lock_eol passes
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    /// Poll the status URLs from `start_results` until every node's
    /// progress turns final. Returns results positionally aligned to
    /// `nodes`, or an empty list when the operation should abort.
    pub async fn wait_successful_results<T: OpResult>(
        &self,
        start_results: &[Fetched],
        nodes: &[CoordinatorNode],
    ) -> Vec<T> {
        let mut urls = Vec::new();
        for fetched in start_results {
            if let Some(value) = fetched.ok_value() {
                if let Ok(start) = serde_json::from_value::<StartResult>(value.clone()) {
                    urls.push(start.status_url);
                }
            }
        }
        if urls.len() != nodes.len() {
            info!("only {}/{} nodes started the operation", urls.len(), nodes.len());
            return Vec::new();
        }

        let mut results: Vec<Option<T>> = urls.iter().map(|_| None).collect();
        let mut failures = vec![0u32; urls.len()];
        let mut backoff = Backoff::new(
            Duration::from_secs_f64(self.config.poll_delay_start),
            self.config.poll_delay_multiplier,
            Duration::from_secs_f64(self.config.poll_delay_max),
        );

        loop {
            let pending: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, result)| match result {
                    Some(result) => !result.progress().is_final,
                    None => true,
                })
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }
            backoff.wait().await;
            for i in pending {
                match self.client.get_json(&urls[i]).await {
                    None => {
                        failures[i] += 1;
                        if failures[i] >= self.config.poll_maximum_failures {
                            info!("too many poll failures for {}", urls[i]);
                            return Vec::new();
                        }
                    }
                    Some(value) => {
                        failures[i] = 0;
                        let result: T = match serde_json::from_value(value) {
                            Ok(result) => result,
                            Err(err) => {
                                warn!("undecodable result from {}: {}", urls[i], err);
                                return Vec::new();
                            }
                        };
                        if result.progress().finished_failed() {
                            info!("operation failed on {}", urls[i]);
                            return Vec::new();
                        }
                        results[i] = Some(result);
                    }
                }
            }
        }
        results.into_iter().map(|result| result.unwrap()).collect()
    }
}

/// A coordinator op that runs under the cluster lease.
pub trait LockedOp: Send + 'static {
    fn op(&self) -> Arc<CoordinatorOp>;
    fn attempts(&self) -> u32;
    fn begin_attempt(&mut self, attempt: u32, attempt_start: DateTime<Utc>);
    fn try_run<'a>(&'a mut self) -> BoxFuture<'a, Result<bool, Error>>;
}

async fn run_attempts(locked: &mut impl LockedOp) -> bool {
    let op = locked.op();
    let attempts = locked.attempts();
    for attempt in 1..=attempts {
        if op.handle.check_op_id().is_err() || op.cancel.is_cancelled() {
            return false;
        }
        debug!("attempt {}/{}", attempt, attempts);
        locked.begin_attempt(attempt, Utc::now());
        match locked.try_run().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => warn!("attempt {}/{} errored: {:#}", attempt, attempts, err),
        }
    }
    false
}

/// Run a locked op to completion: renewal tasks around the attempt loop,
/// then - on every exit path - renewal teardown and an unlock fan-out.
pub async fn run_locked_op(mut locked: impl LockedOp) {
    let op = locked.op();
    if op.handle.set_status(OpStatus::Running).is_err() {
        return;
    }

    let relock_tasks = op.spawn_relock_tasks();
    let success = tokio::select! {
        _ = op.cancel.cancelled() => {
            info!("operation cancelled (lease lost)");
            false
        }
        success = run_attempts(&mut locked) => success,
    };

    for task in &relock_tasks {
        task.abort();
    }
    for task in relock_tasks {
        let _ = task.await;
    }

    // best effort: a node we cannot reach will drop its lease by TTL
    op.request_unlock_from_nodes().await;

    if success {
        let _ = op.handle.set_status_from(OpStatus::Done, Some(OpStatus::Running));
    } else {
        op.handle.set_status_fail();
    }
}

/// Coordinator-wide state and dependencies.
pub struct Coordinator {
    pub config: CoordinatorConfig,
    pub state: OpState,
    pub client: JsonClient,
    pub hex_storage: AsyncHexDigestStorage,
    pub json_storage: AsyncJsonStorage,
    pub plugins: plugins::PluginRegistry,
    hostname: String,
    op_instances: AtomicU64,
}

/// Why starting an op was refused.
#[derive(Debug)]
pub enum StartOpError {
    /// The cluster lock could not be acquired (HTTP 409).
    LockNotAcquired,
    Other(Error),
}

impl From<Error> for StartOpError {
    fn from(err: Error) -> Self {
        StartOpError::Other(err)
    }
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        storage_config: ObjectStorageConfig,
    ) -> Result<Arc<Self>, Error> {
        let storage = Arc::new(ObjectStorage::open(&storage_config)?);
        let json_storage = match &config.object_storage_cache {
            Some(cache_directory) => AsyncJsonStorage::new(Arc::new(CachingJsonStorage::new(
                storage.clone(),
                FileStorage::new(cache_directory)?,
            ))),
            None => AsyncJsonStorage::new(storage.clone()),
        };
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Ok(Arc::new(Self {
            config,
            state: OpState::new(),
            client: JsonClient::default(),
            hex_storage: AsyncHexDigestStorage::new(storage),
            json_storage,
            plugins: plugins::PluginRegistry::with_builtins(),
            hostname,
            op_instances: AtomicU64::new(0),
        }))
    }

    /// Locker identity for a new attempt: unique per op instance so a
    /// retrying coordinator never collides with its own stuck lease.
    pub fn locker_for_new_op(&self) -> String {
        let instance = self.op_instances.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.hostname, instance)
    }

    /// Acquire the cluster lock for a new op. On any non-ok aggregate the
    /// partial locks are released again and the op never starts.
    pub async fn acquire_cluster_lock(&self, locker: &str) -> Result<Instant, StartOpError> {
        let initial_lock_start = Instant::now();
        let result = request_lock_call(
            &self.client,
            &self.config.nodes,
            LockCall::Lock,
            locker,
            self.config.default_lock_ttl,
        )
        .await;
        if result != LockResult::Ok {
            info!("initial lock failed: {:?}", result);
            request_lock_call(&self.client, &self.config.nodes, LockCall::Unlock, locker, 0)
                .await;
            return Err(StartOpError::LockNotAcquired);
        }
        Ok(initial_lock_start)
    }

    /// Build the shared op context once the lock is held.
    pub fn locked_op_context(
        &self,
        op_name: &str,
        locker: String,
        initial_lock_start: Instant,
    ) -> Arc<CoordinatorOp> {
        let handle = self.state.begin(op_name);
        Arc::new(CoordinatorOp {
            nodes: self.config.nodes.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            handle,
            cancel: CancelToken::new(),
            locker,
            ttl: self.config.default_lock_ttl,
            initial_lock_start,
        })
    }

    /// State answer for `GET /{op}/{op_id}`.
    pub fn op_status(&self, op_name: &str, op_id: u64) -> Option<OpStatus> {
        if !self.state.matches(op_id, Some(op_name)) {
            return None;
        }
        self.state.info().op_status
    }
}

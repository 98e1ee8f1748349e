//! Node role: owns the local data directory and executes snapshot,
//! upload, download and clear operations under the coordinator's lease.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Error;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::common::error::{ExpiredOperation, LeaseError, StorageError};
use crate::common::objectstorage::{ObjectStorage, ObjectStorageConfig};
use crate::common::op::{OpHandle, OpState, OpStatus, StartResult};
use crate::common::progress::ProgressHandle;
use crate::config::NodeConfig;
use crate::node::snapshotter::Snapshotter;

pub mod api;
pub mod clear;
pub mod download;
pub mod snapshot;
pub mod snapshotter;

#[derive(Default)]
struct Lease {
    locker: Option<String>,
    deadline: Option<Instant>,
}

impl Lease {
    /// Current holder; an expired lease counts as unlocked.
    fn holder(&self) -> Option<&str> {
        match (&self.locker, self.deadline) {
            (Some(locker), Some(deadline)) if Instant::now() < deadline => Some(locker),
            _ => None,
        }
    }
}

/// Node-local mutable state: the lease and the current op slot.
#[derive(Default)]
pub struct NodeState {
    lease: Mutex<Lease>,
    pub ops: OpState,
    current: Mutex<Option<CurrentOp>>,
}

struct CurrentOp {
    op_name: String,
    render: Arc<dyn Fn() -> Value + Send + Sync>,
}

impl NodeState {
    pub fn lock(&self, locker: &str, ttl: u64) -> Result<(), LeaseError> {
        let mut lease = self.lease.lock().unwrap();
        if lease.holder().is_some() {
            return Err(LeaseError::Conflict);
        }
        info!("locked by {} for {}s", locker, ttl);
        lease.locker = Some(locker.to_string());
        lease.deadline = Some(Instant::now() + Duration::from_secs(ttl));
        Ok(())
    }

    pub fn relock(&self, locker: &str, ttl: u64) -> Result<(), LeaseError> {
        let mut lease = self.lease.lock().unwrap();
        match lease.holder() {
            None => return Err(LeaseError::Conflict),
            Some(holder) if holder != locker => return Err(LeaseError::OwnerMismatch),
            Some(_) => {}
        }
        lease.deadline = Some(Instant::now() + Duration::from_secs(ttl));
        Ok(())
    }

    pub fn unlock(&self, locker: &str) -> Result<(), LeaseError> {
        let mut lease = self.lease.lock().unwrap();
        match lease.holder() {
            None => return Err(LeaseError::Conflict),
            Some(holder) if holder != locker => return Err(LeaseError::OwnerMismatch),
            Some(_) => {}
        }
        info!("unlocked by {}", locker);
        lease.locker = None;
        lease.deadline = None;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lease.lock().unwrap().holder().is_some()
    }
}

struct SnapshotterSlot {
    globs: Vec<String>,
    snapshotter: Arc<Mutex<Snapshotter>>,
}

pub struct Node {
    pub config: NodeConfig,
    pub storage_config: ObjectStorageConfig,
    pub state: NodeState,
    hostname: String,
    snapshotter: Mutex<Option<SnapshotterSlot>>,
}

impl Node {
    pub fn new(config: NodeConfig, storage_config: ObjectStorageConfig) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Arc::new(Self {
            config,
            storage_config,
            state: NodeState::default(),
            hostname,
            snapshotter: Mutex::new(None),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The snapshotter survives across operations so that unchanged
    /// files keep their hashes; it is recreated when the globs change.
    pub fn get_or_create_snapshotter(
        &self,
        root_globs: &[String],
    ) -> Result<Arc<Mutex<Snapshotter>>, Error> {
        let mut slot = self.snapshotter.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if existing.globs == root_globs {
                return Ok(existing.snapshotter.clone());
            }
        }
        let snapshotter = Arc::new(Mutex::new(Snapshotter::new(
            self.config.root.clone(),
            self.config.snapshot_root.clone(),
            root_globs,
            None,
            self.config.embed_limit,
        )?));
        *slot = Some(SnapshotterSlot {
            globs: root_globs.to_vec(),
            snapshotter: snapshotter.clone(),
        });
        Ok(snapshotter)
    }

    /// The snapshotter of the most recent snapshot, if any; upload works
    /// on whatever the last snapshot indexed.
    pub fn current_snapshotter(&self) -> Option<Arc<Mutex<Snapshotter>>> {
        self.snapshotter
            .lock()
            .unwrap()
            .as_ref()
            .map(|slot| slot.snapshotter.clone())
    }

    /// Start a node op: claim the op slot, register the live result for
    /// the status endpoint, and run the blocking body off the event loop.
    pub fn start_op<R, F>(
        self: &Arc<Self>,
        op_name: &str,
        request_url: &str,
        result: Arc<Mutex<R>>,
        progress: ProgressHandle,
        fun: F,
    ) -> StartResult
    where
        R: Serialize + Send + 'static,
        F: FnOnce(OpHandle) -> Result<(), Error> + Send + 'static,
    {
        let handle = self.state.ops.begin(op_name);
        let op_id = handle.op_id();
        let status_url = format!("{}/{}", request_url, op_id);

        {
            let result = result.clone();
            let progress = progress.clone();
            let render = Arc::new(move || {
                let mut value =
                    serde_json::to_value(&*result.lock().unwrap()).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "progress".to_string(),
                        serde_json::to_value(progress.get()).unwrap_or(Value::Null),
                    );
                }
                value
            });
            *self.state.current.lock().unwrap() = Some(CurrentOp {
                op_name: op_name.to_string(),
                render,
            });
        }

        let op_name = op_name.to_string();
        let run_handle = handle.clone();
        tokio::spawn(async move {
            if run_handle.set_status(OpStatus::Running).is_err() {
                return;
            }
            let body_handle = run_handle.clone();
            let outcome = tokio::task::spawn_blocking(move || fun(body_handle)).await;
            match outcome {
                Ok(Ok(())) => {
                    let _ = run_handle.set_status_from(OpStatus::Done, Some(OpStatus::Running));
                }
                Ok(Err(err)) => {
                    if err.downcast_ref::<ExpiredOperation>().is_some() {
                        info!("op {} cancelled by a newer operation", op_name);
                    } else {
                        warn!("op {} failed: {:#}", op_name, err);
                    }
                    // whatever happened, the result must stop polling
                    if !progress.get().is_final {
                        progress.add_fail(1);
                        progress.done();
                    }
                    run_handle.set_status_fail();
                }
                Err(err) => {
                    warn!("op {} panicked: {}", op_name, err);
                    if !progress.get().is_final {
                        progress.add_fail(1);
                        progress.done();
                    }
                    run_handle.set_status_fail();
                }
            }
        });

        StartResult { op_id, status_url }
    }

    /// Current result of the op `(op_name, op_id)`, or `None` when the
    /// node no longer remembers that id.
    pub fn op_result(&self, op_name: &str, op_id: u64) -> Option<Value> {
        if !self.state.ops.matches(op_id, Some(op_name)) {
            return None;
        }
        let current = self.state.current.lock().unwrap();
        match current.as_ref() {
            Some(op) if op.op_name == op_name => Some((op.render)()),
            _ => None,
        }
    }
}

thread_local! {
    static WORKER_STORAGE: RefCell<Option<ObjectStorage>> = RefCell::new(None);
}

/// Run `fun` with this worker thread's own storage handle, constructing
/// it lazily on first use. The handle is deliberately not shared between
/// worker threads.
pub fn with_worker_storage<R>(
    config: &ObjectStorageConfig,
    fun: impl FnOnce(&ObjectStorage) -> Result<R, StorageError>,
) -> Result<R, StorageError> {
    WORKER_STORAGE.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(ObjectStorage::open(config)?);
        }
        fun(slot.as_ref().unwrap())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lease_lock_conflict() {
        let state = NodeState::default();
        state.lock("a", 60).unwrap();
        assert_eq!(state.lock("b", 60), Err(LeaseError::Conflict));
        // even the same locker conflicts; lock is not reentrant
        assert_eq!(state.lock("a", 60), Err(LeaseError::Conflict));
        assert!(state.is_locked());
    }

    #[test]
    fn test_lease_relock_and_unlock_check_owner() {
        let state = NodeState::default();
        assert_eq!(state.relock("a", 60), Err(LeaseError::Conflict));
        state.lock("a", 60).unwrap();
        assert_eq!(state.relock("b", 60), Err(LeaseError::OwnerMismatch));
        state.relock("a", 60).unwrap();
        assert_eq!(state.unlock("b"), Err(LeaseError::OwnerMismatch));
        state.unlock("a").unwrap();
        assert_eq!(state.unlock("a"), Err(LeaseError::Conflict));
    }

    #[test]
    fn test_lease_expires_by_ttl() {
        let state = NodeState::default();
        state.lock("a", 0).unwrap();
        // ttl 0 expires immediately
        assert!(!state.is_locked());
        state.lock("b", 60).unwrap();
    }
}

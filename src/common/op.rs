//! Long-running operation state.
//!
//! A process runs at most one operation at a time. Starting a new one
//! bumps the shared op id; anything still running under the old id
//! notices the mismatch at its next check and terminates. The status
//! transition to `done` is a compare-and-set so that a late success can
//! never overwrite a `fail` recorded by an error path.

use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::error::ExpiredOperation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Starting,
    Running,
    Fail,
    Done,
}

/// Process-wide current-op bookkeeping, serialized to status endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpInfo {
    #[serde(default)]
    pub op_id: u64,
    #[serde(default)]
    pub op_name: String,
    #[serde(default)]
    pub op_status: Option<OpStatus>,
}

/// Response to a successful op start request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartResult {
    pub op_id: u64,
    pub status_url: String,
}

/// Owner of the per-process [`OpInfo`]; one per node or coordinator
/// service value, never a module-level singleton, so tests can
/// instantiate services in isolation.
#[derive(Clone, Default)]
pub struct OpState {
    info: Arc<Mutex<OpInfo>>,
}

impl OpState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self) -> OpInfo {
        self.info.lock().unwrap().clone()
    }

    /// Take over the op slot for a new operation.
    pub fn begin(&self, op_name: &str) -> OpHandle {
        let mut info = self.info.lock().unwrap();
        info.op_id += 1;
        info.op_name = op_name.to_string();
        info.op_status = Some(OpStatus::Starting);
        debug!("op {} ({}) starting", info.op_id, op_name);
        OpHandle {
            op_id: info.op_id,
            info: self.info.clone(),
        }
    }

    /// Look up the current op for a result query; `None` when the process
    /// no longer remembers the requested id (HTTP 404 upstream).
    pub fn matches(&self, op_id: u64, op_name: Option<&str>) -> bool {
        let info = self.info.lock().unwrap();
        if info.op_id != op_id {
            return false;
        }
        match op_name {
            Some(name) => info.op_name == name,
            None => true,
        }
    }
}

/// Capability to report status for one particular op id.
#[derive(Clone)]
pub struct OpHandle {
    op_id: u64,
    info: Arc<Mutex<OpInfo>>,
}

impl OpHandle {
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn is_current(&self) -> bool {
        self.info.lock().unwrap().op_id == self.op_id
    }

    pub fn check_op_id(&self) -> Result<(), ExpiredOperation> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ExpiredOperation)
        }
    }

    /// Unconditional transition (still guarded by the op id).
    pub fn set_status(&self, status: OpStatus) -> Result<(), ExpiredOperation> {
        self.set_status_from(status, None).map(drop)
    }

    /// Compare-and-set transition; returns false without touching the
    /// state when `from` does not match the current status.
    pub fn set_status_from(
        &self,
        status: OpStatus,
        from: Option<OpStatus>,
    ) -> Result<bool, ExpiredOperation> {
        let mut info = self.info.lock().unwrap();
        if info.op_id != self.op_id {
            return Err(ExpiredOperation);
        }
        if let Some(from) = from {
            if info.op_status != Some(from) {
                return Ok(false);
            }
        }
        debug!(
            "op {} state {:?} -> {:?}",
            self.op_id, info.op_status, status
        );
        info.op_status = Some(status);
        Ok(true)
    }

    /// Best-effort failure marker for error paths; an expired op may no
    /// longer touch the state, which is exactly what we want.
    pub fn set_status_fail(&self) {
        let _ = self.set_status(OpStatus::Fail);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_done_does_not_overwrite_fail() {
        let state = OpState::new();
        let op = state.begin("snapshot");
        op.set_status(OpStatus::Running).unwrap();
        op.set_status_fail();
        assert!(!op.set_status_from(OpStatus::Done, Some(OpStatus::Running)).unwrap());
        assert_eq!(state.info().op_status, Some(OpStatus::Fail));
    }

    #[test]
    fn test_newer_op_expires_older() {
        let state = OpState::new();
        let old = state.begin("snapshot");
        let new = state.begin("upload");
        assert_eq!(old.check_op_id(), Err(ExpiredOperation));
        assert!(new.check_op_id().is_ok());
        assert!(old.set_status(OpStatus::Done).is_err());
        assert_eq!(state.info().op_id, 2);
    }
}

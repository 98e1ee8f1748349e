//! Operation progress counters.
//!
//! Each long-running operation owns one `Progress`; the coordinator polls
//! it through the node result endpoints and considers a node done once
//! `final` flips to true.

use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub handled: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

impl Progress {
    /// Reset the counters for a unit of work of known size.
    pub fn start(&mut self, total: u64) {
        self.handled = 0;
        self.failed = 0;
        self.total = total;
        self.is_final = false;
    }

    pub fn add_total(&mut self, n: u64) {
        self.total += n;
    }

    pub fn add_success(&mut self, n: u64) {
        self.handled += n;
    }

    pub fn add_fail(&mut self, n: u64) {
        self.failed += n;
    }

    pub fn done(&mut self) {
        self.is_final = true;
    }

    pub fn finished_successfully(&self) -> bool {
        self.is_final && self.failed == 0 && self.handled == self.total
    }

    pub fn finished_failed(&self) -> bool {
        self.is_final && !self.finished_successfully()
    }
}

/// Shared handle to a progress that is updated from worker threads while
/// the op result endpoint serializes it on demand.
#[derive(Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<Mutex<Progress>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Progress {
        self.inner.lock().unwrap().clone()
    }

    pub fn start(&self, total: u64) {
        self.inner.lock().unwrap().start(total);
    }

    pub fn add_total(&self, n: u64) {
        self.inner.lock().unwrap().add_total(n);
    }

    pub fn add_success(&self, n: u64) {
        self.inner.lock().unwrap().add_success(n);
    }

    pub fn add_fail(&self, n: u64) {
        self.inner.lock().unwrap().add_fail(n);
    }

    pub fn done(&self) {
        self.inner.lock().unwrap().done();
    }

    pub fn finished_successfully(&self) -> bool {
        self.inner.lock().unwrap().finished_successfully()
    }

    pub fn upload_success(&self, hexdigest: &str) {
        debug!("uploaded {}", hexdigest);
        self.add_success(1);
    }

    pub fn upload_failure(&self, hexdigest: &str) {
        debug!("upload of {} failed", hexdigest);
        self.add_fail(1);
    }

    pub fn upload_missing(&self, hexdigest: &str) {
        debug!("{} missing on this node", hexdigest);
        self.add_fail(1);
    }

    pub fn download_success(&self, size: u64) {
        self.add_success(size);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_progress_states() {
        let mut progress = Progress::default();
        progress.start(2);
        assert!(!progress.finished_successfully());
        assert!(!progress.finished_failed());

        progress.add_success(1);
        progress.add_total(1);
        progress.add_success(2);
        progress.done();
        assert!(progress.finished_successfully());
        assert!(!progress.finished_failed());

        let mut progress = Progress::default();
        progress.start(1);
        progress.add_fail(1);
        progress.done();
        assert!(!progress.finished_successfully());
        assert!(progress.finished_failed());
    }

    #[test]
    fn test_final_serialized_name() {
        let progress: Progress = serde_json::from_str(r#"{"final": true}"#).unwrap();
        assert!(progress.is_final);
        let text = serde_json::to_string(&progress).unwrap();
        assert!(text.contains(r#""final":true"#));
    }
}

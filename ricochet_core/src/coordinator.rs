//! Allocation of the test-case index space and collection of results.

use crate::crash::{CrashRecord, CrashSubmission};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{info, warn};

/// A contiguous block of sequence indices handed to one worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRange {
    pub start: u64,
    pub end: u64,
    pub iterations: u32,
}

impl TaskRange {
    pub fn indices(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Granted(TaskRange),
    NoneAvailable,
    Paused,
}

/// Hands out index ranges and receives completions and crashes.
///
/// Operations never fail from the caller's point of view; providers log and
/// degrade instead. `allocate_range` must be linearizable across callers.
pub trait Coordinator {
    fn allocate_range(&self) -> Allocation;
    fn report_completion(&self, index: u64);
    fn submit_crash(&self, record: &CrashRecord);
}

#[derive(Debug, Default)]
struct LocalState {
    cursor: u64,
    processed: u64,
    completed_at: Option<SystemTime>,
    paused: bool,
    crashes: Vec<CrashRecord>,
}

/// In-process coordinator over a fixed sequence space.
#[derive(Debug)]
pub struct LocalCoordinator {
    total: u64,
    batch_width: u64,
    iterations: u32,
    crash_dir: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalCoordinator {
    pub fn new(total: u64, batch_width: u64, iterations: u32) -> Self {
        Self {
            total,
            batch_width: batch_width.max(1),
            iterations,
            crash_dir: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Also write every submitted crash as JSON under `dir`.
    pub fn with_crash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = Some(dir.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn resume(&self) {
        self.state().paused = false;
    }

    pub fn processed(&self) -> u64 {
        self.state().processed
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        self.state().completed_at
    }

    pub fn crashes(&self) -> Vec<CrashRecord> {
        self.state().crashes.clone()
    }

    fn write_crash(dir: &Path, record: &CrashRecord) -> Result<PathBuf, anyhow::Error> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create crash directory {:?}: {}", dir, e))?;
        let path = dir.join(format!(
            "crash-{}-{}.json",
            record.index,
            record.testcase_digest()
        ));
        let json = serde_json::to_string_pretty(&CrashSubmission::from(record))?;
        std::fs::write(&path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write crash file {:?}: {}", path, e))?;
        Ok(path)
    }
}

impl Coordinator for LocalCoordinator {
    fn allocate_range(&self) -> Allocation {
        let mut state = self.state();
        if state.paused {
            return Allocation::Paused;
        }
        if state.cursor >= self.total {
            return Allocation::NoneAvailable;
        }
        let start = state.cursor;
        let end = start.saturating_add(self.batch_width).min(self.total);
        state.cursor = end;
        Allocation::Granted(TaskRange {
            start,
            end,
            iterations: self.iterations,
        })
    }

    fn report_completion(&self, index: u64) {
        let mut state = self.state();
        state.processed += 1;
        if state.processed >= self.total && state.completed_at.is_none() {
            state.completed_at = Some(SystemTime::now());
            info!(index, total = self.total, "Sequence space fully processed");
        }
    }

    fn submit_crash(&self, record: &CrashRecord) {
        info!(
            index = record.index,
            signal = %record.report.signal,
            reason = %record.report.reason,
            path = ?record.report.module_path,
            "Crash recorded"
        );
        if let Some(dir) = &self.crash_dir {
            match Self::write_crash(dir, record) {
                Ok(path) => info!(?path, "Crash written"),
                Err(e) => warn!(error = %e, "Failed to persist crash"),
            }
        }
        self.state().crashes.push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{CrashReason, CrashReport};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn record(index: u64) -> CrashRecord {
        CrashRecord::new(
            index,
            CrashReport {
                signal: "SIGSEGV".to_string(),
                reason: CrashReason::NullPointerAccess,
                instruction_pointer: 0x401000,
                fault_address: Some(0),
                module_offset: Some(0x1000),
                module_path: Some("/srv/hlds_linux".to_string()),
                log: "Signal: SIGSEGV (11)\n".to_string(),
            },
            vec![b"\x03new\x00".to_vec()],
        )
    }

    #[test]
    fn single_width_batches_drain_in_order() {
        let coordinator = LocalCoordinator::new(64, 1, 100);
        for expected in 0..64 {
            assert_eq!(
                coordinator.allocate_range(),
                Allocation::Granted(TaskRange {
                    start: expected,
                    end: expected + 1,
                    iterations: 100
                })
            );
        }
        assert_eq!(coordinator.allocate_range(), Allocation::NoneAvailable);
        assert_eq!(coordinator.allocate_range(), Allocation::NoneAvailable);
    }

    #[test]
    fn last_batch_is_clamped_to_total() {
        let coordinator = LocalCoordinator::new(64, 3, 1);
        let mut last = None;
        while let Allocation::Granted(range) = coordinator.allocate_range() {
            last = Some(range);
        }
        let last = last.unwrap();
        assert_eq!(last.indices(), 63..64);
        assert_eq!(last.len(), 1);
    }

    #[test]
    fn paused_coordinator_issues_nothing() {
        let coordinator = LocalCoordinator::new(4, 1, 1);
        coordinator.pause();
        assert_eq!(coordinator.allocate_range(), Allocation::Paused);
        coordinator.resume();
        assert!(matches!(
            coordinator.allocate_range(),
            Allocation::Granted(TaskRange { start: 0, .. })
        ));
    }

    #[test]
    fn concurrent_allocation_issues_each_index_once() {
        let coordinator = Arc::new(LocalCoordinator::new(1000, 3, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Allocation::Granted(range) = coordinator.allocate_range() {
                        seen.extend(range.indices());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), 1000);
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), 1000);
        assert_eq!(unique.iter().max(), Some(&999));
    }

    #[test]
    fn completion_time_is_stamped_at_total() {
        let coordinator = LocalCoordinator::new(2, 1, 1);
        coordinator.report_completion(0);
        assert_eq!(coordinator.processed(), 1);
        assert!(coordinator.completed_at().is_none());
        coordinator.report_completion(1);
        assert!(coordinator.completed_at().is_some());
    }

    #[test]
    fn crashes_are_kept_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = LocalCoordinator::new(8, 1, 1).with_crash_dir(dir.path().join("crashes"));
        let crash = record(5);
        coordinator.submit_crash(&crash);
        assert_eq!(coordinator.crashes(), vec![crash.clone()]);

        let path = dir
            .path()
            .join("crashes")
            .join(format!("crash-5-{}.json", crash.testcase_digest()));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["signal"], "SIGSEGV");
        assert_eq!(json["offset"], "0x1000");
        assert_eq!(json["testcase"][0], "A25ldwA=");
    }
}

use crate::coordinator::{Allocation, Coordinator, TaskRange};
use crate::crash::{CrashRecord, UniqueCrashFilter};
use crate::monitor::{Classification, CrashReport};
use crate::sequence::SequenceCodec;
use crate::target::{Target, TargetError};
use crate::template::TemplateMutator;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Target failure: {0}")]
    Target(#[from] TargetError),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Pause between allocation attempts when nothing is available.
    pub idle: Duration,
    /// Return once the coordinator reports the space drained instead of polling.
    pub exit_when_drained: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1),
            exit_when_drained: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub ranges: u64,
    pub cases_completed: u64,
    pub iterations: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub duplicate_crashes: u64,
    pub restarts: u64,
}

/// Pulls ranges from a coordinator and drives every sequence in them against the target.
pub struct WorkerLoop<C, T, M>
where
    C: Coordinator,
    T: Target,
    M: TemplateMutator<ChaCha8Rng>,
{
    coordinator: C,
    target: T,
    codec: SequenceCodec,
    mutator: M,
    rng: ChaCha8Rng,
    crashes: UniqueCrashFilter,
    stats: WorkerStats,
    settings: WorkerSettings,
}

impl<C, T, M> WorkerLoop<C, T, M>
where
    C: Coordinator,
    T: Target,
    M: TemplateMutator<ChaCha8Rng>,
{
    pub fn new(
        coordinator: C,
        target: T,
        codec: SequenceCodec,
        mutator: M,
        seed: u64,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            coordinator,
            target,
            codec,
            mutator,
            rng: ChaCha8Rng::seed_from_u64(seed),
            crashes: UniqueCrashFilter::new(),
            stats: WorkerStats::default(),
            settings,
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Runs until the coordinator is drained (if configured to stop) or a target
    /// error occurs.
    pub fn run(&mut self) -> Result<WorkerStats, WorkerError> {
        loop {
            match self.coordinator.allocate_range() {
                Allocation::Granted(range) => self.run_range(range)?,
                Allocation::NoneAvailable if self.settings.exit_when_drained => break,
                Allocation::NoneAvailable | Allocation::Paused => {
                    debug!(idle = ?self.settings.idle, "No task available, waiting");
                    std::thread::sleep(self.settings.idle);
                }
            }
        }
        self.target.stop()?;
        info!(stats = ?self.stats, "Worker finished");
        Ok(self.stats.clone())
    }

    pub fn run_range(&mut self, range: TaskRange) -> Result<(), WorkerError> {
        info!(
            start = range.start,
            end = range.end,
            iterations = range.iterations,
            "Processing range"
        );
        for index in range.indices() {
            self.run_case(index, range.iterations)?;
        }
        self.stats.ranges += 1;
        info!(stats = ?self.stats, "Range completed");
        Ok(())
    }

    fn run_case(&mut self, index: u64, iterations: u32) -> Result<(), WorkerError> {
        self.target.start()?;
        let picks = self.codec.expand(index);
        debug!(index, ?picks, "Expanded sequence");

        for _ in 0..iterations {
            let testcase = self.codec.materialize(&picks, &mut self.mutator, &mut self.rng);
            for payload in &testcase {
                self.target.send(payload)?;
            }
            self.stats.iterations += 1;

            if !self.target.is_running()? {
                if let Classification::Crashed(report) = self.target.classify()? {
                    self.record_crash(index, report, testcase);
                }
                self.target.stop()?;
                self.target.start()?;
                self.stats.restarts += 1;
            }
        }

        self.target.stop()?;
        self.coordinator.report_completion(index);
        self.stats.cases_completed += 1;
        Ok(())
    }

    fn record_crash(&mut self, index: u64, report: CrashReport, testcase: Vec<Vec<u8>>) {
        self.stats.crashes += 1;
        let record = CrashRecord::new(index, report, testcase);
        if self.crashes.admit(record.signature()) {
            self.stats.unique_crashes += 1;
            error!(
                index,
                signal = %record.report.signal,
                reason = %record.report.reason,
                offset = ?record.report.module_offset,
                path = ?record.report.module_path,
                "Target crashed\n{}",
                record.report.log
            );
            self.coordinator.submit_crash(&record);
        } else {
            self.stats.duplicate_crashes += 1;
            debug!(index, suppressed = self.crashes.suppressed(), "Duplicate crash suppressed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::monitor::CrashReason;
    use crate::template::{MessageTemplate, RandomFieldMutator};
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Liveness {
        Running,
        Exited,
        Crashed(CrashReport),
    }

    #[derive(Debug, Default)]
    struct ScriptedTarget {
        script: VecDeque<Liveness>,
        last: Option<Liveness>,
        running: bool,
        sent: Vec<Vec<u8>>,
        starts: usize,
        stops: usize,
    }

    impl ScriptedTarget {
        fn new(script: impl IntoIterator<Item = Liveness>) -> Self {
            Self {
                script: script.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl Target for ScriptedTarget {
        fn start(&mut self) -> Result<(), TargetError> {
            if !self.running {
                self.running = true;
                self.starts += 1;
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), TargetError> {
            self.running = false;
            self.stops += 1;
            Ok(())
        }

        fn send(&mut self, payload: &[u8]) -> Result<(), TargetError> {
            if !self.running {
                return Err(TargetError::NotStarted);
            }
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn is_running(&mut self) -> Result<bool, TargetError> {
            let next = self.script.pop_front().unwrap_or(Liveness::Running);
            let running = matches!(next, Liveness::Running);
            self.last = Some(next);
            Ok(running)
        }

        fn classify(&mut self) -> Result<Classification, TargetError> {
            Ok(match self.last.take() {
                Some(Liveness::Crashed(report)) => Classification::Crashed(report),
                _ => Classification::NotCrashed,
            })
        }
    }

    fn crash(instruction_pointer: u64, module_offset: u64) -> Liveness {
        Liveness::Crashed(CrashReport {
            signal: "SIGSEGV".to_string(),
            reason: CrashReason::InvalidMemoryAccess,
            instruction_pointer,
            fault_address: None,
            module_offset: Some(module_offset),
            module_path: Some("/srv/engine_i486.so".to_string()),
            log: String::new(),
        })
    }

    fn codec(depth: u32) -> SequenceCodec {
        SequenceCodec::new(
            vec![
                MessageTemplate::new("nop", 0x01, vec![]),
                MessageTemplate::new("move", 0x02, vec![]),
            ],
            depth,
        )
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            idle: Duration::from_millis(1),
            exit_when_drained: true,
        }
    }

    #[test]
    fn every_index_is_sent_and_reported() {
        let codec = codec(2);
        let total = codec.total_sequences().unwrap();
        let coordinator = LocalCoordinator::new(total, 3, 2);
        let mut worker = WorkerLoop::new(
            coordinator,
            ScriptedTarget::default(),
            codec,
            RandomFieldMutator::new(),
            0,
            settings(),
        );

        let stats = worker.run().unwrap();
        assert_eq!(stats.cases_completed, 4);
        assert_eq!(stats.iterations, 8);
        assert_eq!(stats.ranges, 2);
        assert_eq!(stats.restarts, 0);
        assert_eq!(worker.coordinator().processed(), 4);

        // Index 0 expands to no picks; 1 -> [1], 2 -> [1, 0], 3 -> [1, 1].
        let expected: Vec<Vec<u8>> = vec![
            vec![0x02],
            vec![0x02],
            vec![0x02],
            vec![0x01],
            vec![0x02],
            vec![0x01],
            vec![0x02],
            vec![0x02],
            vec![0x02],
            vec![0x02],
        ];
        assert_eq!(worker.target().sent, expected);
    }

    #[test]
    fn duplicate_signatures_are_submitted_once() {
        let target = ScriptedTarget::new([
            crash(0x7f00_0000_1000, 0x1000),
            Liveness::Running,
            crash(0x7f55_0000_1000, 0x1000),
            crash(0x7f00_0000_2000, 0x2000),
        ]);
        let coordinator = LocalCoordinator::new(2, 1, 2);
        let mut worker = WorkerLoop::new(
            coordinator,
            target,
            codec(1),
            RandomFieldMutator::new(),
            0,
            settings(),
        );

        let stats = worker.run().unwrap();
        assert_eq!(stats.crashes, 3);
        assert_eq!(stats.unique_crashes, 2);
        assert_eq!(stats.duplicate_crashes, 1);
        assert_eq!(stats.restarts, 3);

        let submitted = worker.coordinator().crashes();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].index, 0);
        assert_eq!(submitted[0].report.instruction_pointer, 0x7f00_0000_1000);
        assert_eq!(submitted[1].index, 1);
        assert_eq!(submitted[1].report.module_offset, Some(0x2000));
        assert_eq!(submitted[1].testcase, vec![vec![0x02]]);
    }

    #[test]
    fn clean_exit_restarts_without_reporting() {
        let target = ScriptedTarget::new([Liveness::Exited, Liveness::Running]);
        let coordinator = LocalCoordinator::new(1, 1, 2);
        let mut worker = WorkerLoop::new(
            coordinator,
            target,
            codec(1),
            RandomFieldMutator::new(),
            0,
            settings(),
        );

        let stats = worker.run().unwrap();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.crashes, 0);
        assert!(worker.coordinator().crashes().is_empty());
        assert_eq!(worker.target().starts, 2);
    }

    #[test]
    fn paused_coordinator_is_polled_until_work_appears() {
        let coordinator = LocalCoordinator::new(1, 1, 1);
        coordinator.pause();
        let mut worker = WorkerLoop::new(
            coordinator,
            ScriptedTarget::default(),
            codec(1),
            RandomFieldMutator::new(),
            0,
            settings(),
        );
        assert_eq!(worker.coordinator().allocate_range(), Allocation::Paused);
        worker.coordinator().resume();
        let stats = worker.run().unwrap();
        assert_eq!(stats.cases_completed, 1);
    }
}

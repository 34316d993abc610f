use crate::monitor::{CrashReason, CrashReport};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::collections::HashSet;

/// Fields that identify a crash for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrashSignature {
    pub signal: String,
    pub module_offset: Option<u64>,
    pub reason: CrashReason,
    pub module_path: Option<String>,
}

/// A classified crash together with the test case that reproduced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub index: u64,
    pub report: CrashReport,
    /// Payloads in transmission order for the crashing iteration.
    pub testcase: Vec<Vec<u8>>,
}

impl CrashRecord {
    pub fn new(index: u64, report: CrashReport, testcase: Vec<Vec<u8>>) -> Self {
        Self {
            index,
            report,
            testcase,
        }
    }

    pub fn signature(&self) -> CrashSignature {
        CrashSignature {
            signal: self.report.signal.clone(),
            module_offset: self.report.module_offset,
            reason: self.report.reason,
            module_path: self.report.module_path.clone(),
        }
    }

    /// Hex MD5 of the concatenated test case payloads.
    pub fn testcase_digest(&self) -> String {
        let mut context = md5::Context::new();
        for payload in &self.testcase {
            context.consume(payload);
        }
        format!("{:x}", context.compute())
    }
}

/// Wire shape of a crash submission.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashSubmission {
    pub index: u64,
    pub signal: String,
    pub reason: String,
    pub instruction: String,
    pub offset: Option<String>,
    pub path: Option<String>,
    pub log: String,
    pub testcase: Vec<String>,
}

impl From<&CrashRecord> for CrashSubmission {
    fn from(record: &CrashRecord) -> Self {
        let report = &record.report;
        Self {
            index: record.index,
            signal: report.signal.clone(),
            reason: report.reason.to_string(),
            instruction: format!("{:#x}", report.instruction_pointer),
            offset: report.module_offset.map(|offset| format!("{offset:#x}")),
            path: report.module_path.clone(),
            log: report.log.clone(),
            testcase: record
                .testcase
                .iter()
                .map(|payload| STANDARD.encode(payload))
                .collect(),
        }
    }
}

/// Remembers signatures seen during one worker run.
#[derive(Debug, Default)]
pub struct UniqueCrashFilter {
    known: HashSet<CrashSignature>,
    suppressed: u64,
}

impl UniqueCrashFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, signature: &CrashSignature) -> bool {
        !self.known.contains(signature)
    }

    /// Records `signature`, returning true on first sight. Repeats are counted.
    pub fn admit(&mut self, signature: CrashSignature) -> bool {
        if self.known.insert(signature) {
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    pub fn unique(&self) -> usize {
        self.known.len()
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(instruction_pointer: u64) -> CrashReport {
        CrashReport {
            signal: "SIGSEGV".to_string(),
            reason: CrashReason::InvalidMemoryAccess,
            instruction_pointer,
            fault_address: Some(0xdeadbeef),
            module_offset: Some(0x1a2b),
            module_path: Some("/opt/hlds/engine_i486.so".to_string()),
            log: "Signal: SIGSEGV (11)\n".to_string(),
        }
    }

    #[test]
    fn signature_ignores_address_and_testcase() {
        let first = CrashRecord::new(3, report(0x7f00_0000_1a2b), vec![vec![1, 2]]);
        let second = CrashRecord::new(9, report(0x7f11_0000_1a2b), vec![vec![3]]);
        assert_eq!(first.signature(), second.signature());

        let mut filter = UniqueCrashFilter::new();
        assert!(filter.admit(first.signature()));
        assert!(!filter.is_new(&second.signature()));
        assert!(!filter.admit(second.signature()));
        assert_eq!(filter.unique(), 1);
        assert_eq!(filter.suppressed(), 1);
    }

    #[test]
    fn different_reason_is_a_new_signature() {
        let mut other = report(0x1000);
        other.reason = CrashReason::AccessViolation;
        let mut filter = UniqueCrashFilter::new();
        assert!(filter.admit(CrashRecord::new(0, report(0x1000), vec![]).signature()));
        assert!(filter.admit(CrashRecord::new(0, other, vec![]).signature()));
        assert_eq!(filter.suppressed(), 0);
    }

    #[test]
    fn testcase_digest_covers_all_payloads() {
        let record = CrashRecord::new(1, report(0), vec![b"ab".to_vec(), b"c".to_vec()]);
        assert_eq!(record.testcase_digest(), format!("{:x}", md5::compute(b"abc")));
    }

    #[test]
    fn submission_uses_hex_and_base64() {
        let sequence = vec![vec![0x01], b"\x03new\x00".to_vec()];
        let record = CrashRecord::new(42, report(0x8048000), sequence);
        let submission = CrashSubmission::from(&record);
        assert_eq!(submission.instruction, "0x8048000");
        assert_eq!(submission.offset.as_deref(), Some("0x1a2b"));
        assert_eq!(submission.reason, "InvalidMemoryAccess");
        assert_eq!(submission.testcase, vec!["AQ==".to_string(), "A25ldwA=".to_string()]);

        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["index"], 42);
        assert_eq!(json["path"], "/opt/hlds/engine_i486.so");

        let mut unmapped = record.clone();
        unmapped.report.module_offset = None;
        unmapped.report.module_path = None;
        let json = serde_json::to_value(CrashSubmission::from(&unmapped)).unwrap();
        assert!(json["offset"].is_null());
        assert!(json["path"].is_null());
    }
}

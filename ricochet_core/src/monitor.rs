//! Crash detection for a target process running under a debugger.
//!
//! The platform debug API sits behind [`ProcessDebugger`]; [`CrashMonitor`] owns the
//! lifecycle state machine and turns fatal stops into [`CrashReport`]s.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// `si_code` of a signal raised by `kill`, `raise` or `sigqueue`.
const SI_USER_MAX: i32 = 0;
/// `si_code` of a SIGSEGV on a mapped page with the wrong permissions.
const SEGV_ACCERR: i32 = 2;
/// `si_code` of an integer divide by zero.
const FPE_INTDIV: i32 = 1;
/// Fault addresses below this are treated as null pointer dereferences.
const NULL_PAGE_LIMIT: u64 = 0x1000;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Launch command is empty")]
    EmptyCommand,
    #[error("Failed to spawn target: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Debugger call '{op}' failed: {reason}")]
    Debugger { op: &'static str, reason: String },
    #[error("No target process is attached")]
    NotAttached,
}

/// How to start the target process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub inherit_output: bool,
}

/// An event reported by the debugger for the traced process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    Exited { code: i32 },
    /// Stopped on delivery of a fatal signal; registers are still readable.
    Stopped { signal: i32, name: String },
    /// Killed outright without a stop.
    Terminated { signal: i32, name: String },
}

/// Processor state captured at a fatal stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultContext {
    pub instruction_pointer: u64,
    pub fault_address: Option<u64>,
    pub signal_code: i32,
    pub registers: Vec<(String, u64)>,
}

/// One line of a process memory map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub offset: u64,
    pub path: String,
}

impl MemoryMapping {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }
}

/// Parses the text format of `/proc/<pid>/maps`. Malformed lines are skipped.
pub fn parse_maps(text: &str) -> Vec<MemoryMapping> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (start, end) = parts.next()?.split_once('-')?;
            let permissions = parts.next()?.to_string();
            let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
            let path = parts.nth(2).unwrap_or_default().to_string();
            Some(MemoryMapping {
                start: u64::from_str_radix(start, 16).ok()?,
                end: u64::from_str_radix(end, 16).ok()?,
                permissions,
                offset,
                path,
            })
        })
        .collect()
}

/// Platform debug capability used by [`CrashMonitor`].
pub trait ProcessDebugger {
    /// Spawns the target under debug control and lets it run. Returns its pid.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<u32, MonitorError>;

    /// Checks for a pending event without blocking.
    fn poll_event(&mut self) -> Result<Option<DebugEvent>, MonitorError>;

    fn fault_context(&mut self) -> Result<FaultContext, MonitorError>;

    fn memory_map(&mut self) -> Result<Vec<MemoryMapping>, MonitorError>;

    /// Kills the target and ends the debug session. Must tolerate an already dead process.
    fn terminate(&mut self) -> Result<(), MonitorError>;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CrashReason {
    NullPointerAccess,
    InvalidMemoryAccess,
    AccessViolation,
    DivisionByZero,
    ArithmeticError,
    InstructionError,
    Abort,
    BusError,
    Breakpoint,
    SignalSent,
    ProcessSignal,
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub fn classify_reason(
    signal_name: &str,
    signal_code: i32,
    fault_address: Option<u64>,
) -> CrashReason {
    match signal_name {
        "SIGABRT" => return CrashReason::Abort,
        "SIGTRAP" => return CrashReason::Breakpoint,
        _ => {}
    }
    if signal_code <= SI_USER_MAX {
        return CrashReason::SignalSent;
    }
    match signal_name {
        "SIGSEGV" => match fault_address {
            Some(address) if address < NULL_PAGE_LIMIT => CrashReason::NullPointerAccess,
            _ if signal_code == SEGV_ACCERR => CrashReason::AccessViolation,
            _ => CrashReason::InvalidMemoryAccess,
        },
        "SIGFPE" if signal_code == FPE_INTDIV => CrashReason::DivisionByZero,
        "SIGFPE" => CrashReason::ArithmeticError,
        "SIGILL" => CrashReason::InstructionError,
        "SIGBUS" => CrashReason::BusError,
        _ => CrashReason::ProcessSignal,
    }
}

/// Everything learned about one fatal stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub signal: String,
    pub reason: CrashReason,
    pub instruction_pointer: u64,
    pub fault_address: Option<u64>,
    pub module_offset: Option<u64>,
    pub module_path: Option<String>,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NotCrashed,
    Crashed(CrashReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Exited,
    Signaled,
}

pub struct CrashMonitor<D: ProcessDebugger> {
    debugger: D,
    spec: LaunchSpec,
    state: MonitorState,
    pid: Option<u32>,
    pending: Option<DebugEvent>,
}

impl<D: ProcessDebugger> CrashMonitor<D> {
    pub fn new(debugger: D, spec: LaunchSpec) -> Self {
        Self {
            debugger,
            spec,
            state: MonitorState::Stopped,
            pid: None,
            pending: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn debugger(&self) -> &D {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut D {
        &mut self.debugger
    }

    /// Launches the target. Does nothing while it is still running.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.state == MonitorState::Running {
            return Ok(());
        }
        if self.state != MonitorState::Stopped {
            self.stop()?;
        }
        self.state = MonitorState::Starting;
        match self.debugger.launch(&self.spec) {
            Ok(pid) => {
                info!(pid, command = ?self.spec.command, "Target started");
                self.pid = Some(pid);
                self.state = MonitorState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = MonitorState::Stopped;
                Err(e)
            }
        }
    }

    /// Returns whether a termination event is pending. Never blocks.
    pub fn poll(&mut self) -> Result<bool, MonitorError> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.state != MonitorState::Running {
            return Ok(false);
        }
        match self.debugger.poll_event()? {
            Some(event) => {
                debug!(?event, "Target event");
                self.state = match event {
                    DebugEvent::Exited { .. } => MonitorState::Exited,
                    DebugEvent::Stopped { .. } | DebugEvent::Terminated { .. } => {
                        MonitorState::Signaled
                    }
                };
                self.pending = Some(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_running(&mut self) -> Result<bool, MonitorError> {
        Ok(!self.poll()? && self.state == MonitorState::Running)
    }

    /// Examines the pending event. Only a fatal signal stop counts as a crash.
    pub fn classify(&mut self) -> Result<Classification, MonitorError> {
        let (signal, name) = match &self.pending {
            Some(DebugEvent::Stopped { signal, name }) => (*signal, name.clone()),
            Some(DebugEvent::Terminated { name, .. }) => {
                debug!(signal = %name, "Target killed without a fault stop");
                return Ok(Classification::NotCrashed);
            }
            Some(DebugEvent::Exited { .. }) | None => return Ok(Classification::NotCrashed),
        };

        let context = self.debugger.fault_context()?;
        let maps = self.debugger.memory_map().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read target memory map");
            Vec::new()
        });
        let module = maps.iter().find(|m| m.contains(context.instruction_pointer));
        let reason = classify_reason(&name, context.signal_code, context.fault_address);
        let log = diagnostic_log(signal, &name, reason, &context, module);

        Ok(Classification::Crashed(CrashReport {
            signal: name,
            reason,
            instruction_pointer: context.instruction_pointer,
            fault_address: context.fault_address,
            module_offset: module.map(|m| context.instruction_pointer - m.start + m.offset),
            module_path: module.map(|m| m.path.clone()),
            log,
        }))
    }

    pub fn stop(&mut self) -> Result<(), MonitorError> {
        if self.pid.is_some() {
            self.debugger.terminate()?;
        }
        self.pid = None;
        self.pending = None;
        self.state = MonitorState::Stopped;
        Ok(())
    }
}

fn diagnostic_log(
    signal: i32,
    name: &str,
    reason: CrashReason,
    context: &FaultContext,
    module: Option<&MemoryMapping>,
) -> String {
    let mut log = String::new();
    let _ = writeln!(log, "Signal: {name} ({signal})");
    let _ = writeln!(log, "Reason: {reason}");
    let _ = writeln!(log, "Instruction pointer: {:#x}", context.instruction_pointer);
    match context.fault_address {
        Some(address) => {
            let _ = writeln!(log, "Fault address: {address:#x}");
        }
        None => {
            let _ = writeln!(log, "Fault address: unknown");
        }
    }
    match module {
        Some(m) => {
            let _ = writeln!(
                log,
                "Module: {} {:#x}-{:#x} {} +{:#x}",
                m.path,
                m.start,
                m.end,
                m.permissions,
                context.instruction_pointer - m.start + m.offset
            );
        }
        None => {
            let _ = writeln!(log, "Module: not mapped");
        }
    }
    if !context.registers.is_empty() {
        let _ = writeln!(log, "Registers:");
        for (register, value) in &context.registers {
            let _ = writeln!(log, "  {register:<6} {value:#018x}");
        }
    }
    log
}

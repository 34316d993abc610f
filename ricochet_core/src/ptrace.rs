//! Linux `ptrace` backend for [`ProcessDebugger`].

use crate::monitor::{
    DebugEvent, FaultContext, LaunchSpec, MemoryMapping, MonitorError, ProcessDebugger, parse_maps,
};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// Signals that never indicate a crash; they are delivered and the target continues.
const BENIGN_SIGNALS: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGWINCH,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGURG,
    Signal::SIGIO,
    Signal::SIGPROF,
    Signal::SIGVTALRM,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGHUP,
];

/// Signals whose `si_addr` holds the faulting address.
const FAULT_SIGNALS: &[Signal] = &[Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGILL, Signal::SIGFPE];

fn debugger_error(op: &'static str, errno: Errno) -> MonitorError {
    MonitorError::Debugger {
        op,
        reason: errno.desc().to_string(),
    }
}

/// Traces a single child spawned with `PTRACE_TRACEME`.
#[derive(Debug, Default)]
pub struct PtraceDebugger {
    pid: Option<Pid>,
    stop_signal: Option<Signal>,
    reaped: bool,
}

impl PtraceDebugger {
    pub fn new() -> Self {
        Self::default()
    }

    fn attached(&self) -> Result<Pid, MonitorError> {
        self.pid.ok_or(MonitorError::NotAttached)
    }
}

impl ProcessDebugger for PtraceDebugger {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<u32, MonitorError> {
        let (program, args) = spec.command.split_first().ok_or(MonitorError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args).envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        if !spec.inherit_output {
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        }
        // SAFETY: the hook only issues the traceme syscall, which is async-signal-safe.
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
        }
        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(status) => {
                return Err(MonitorError::Debugger {
                    op: "waitpid",
                    reason: format!("unexpected status after exec: {status:?}"),
                });
            }
            Err(e) => return Err(debugger_error("waitpid", e)),
        }
        // Exec by a wrapper script must surface as an event stop, not a plain SIGTRAP.
        ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL | Options::PTRACE_O_TRACEEXEC)
            .map_err(|e| debugger_error("setoptions", e))?;
        ptrace::cont(pid, None).map_err(|e| debugger_error("cont", e))?;

        self.pid = Some(pid);
        self.stop_signal = None;
        self.reaped = false;
        Ok(pid.as_raw() as u32)
    }

    fn poll_event(&mut self) -> Result<Option<DebugEvent>, MonitorError> {
        let pid = self.attached()?;
        if self.reaped || self.stop_signal.is_some() {
            return Ok(None);
        }
        loop {
            let status = waitpid(pid, Some(WaitPidFlag::WNOHANG))
                .map_err(|e| debugger_error("waitpid", e))?;
            match status {
                WaitStatus::StillAlive => return Ok(None),
                WaitStatus::Exited(_, code) => {
                    self.reaped = true;
                    return Ok(Some(DebugEvent::Exited { code }));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.reaped = true;
                    return Ok(Some(DebugEvent::Terminated {
                        signal: signal as i32,
                        name: signal.as_str().to_string(),
                    }));
                }
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    ptrace::cont(pid, None).map_err(|e| debugger_error("cont", e))?;
                }
                WaitStatus::Stopped(_, signal) if BENIGN_SIGNALS.contains(&signal) => {
                    trace!(signal = signal.as_str(), "Passing benign signal to target");
                    ptrace::cont(pid, Some(signal)).map_err(|e| debugger_error("cont", e))?;
                }
                WaitStatus::Stopped(_, signal) => {
                    self.stop_signal = Some(signal);
                    return Ok(Some(DebugEvent::Stopped {
                        signal: signal as i32,
                        name: signal.as_str().to_string(),
                    }));
                }
                status => {
                    trace!(?status, "Resuming target after trace event");
                    ptrace::cont(pid, None).map_err(|e| debugger_error("cont", e))?;
                }
            }
        }
    }

    fn fault_context(&mut self) -> Result<FaultContext, MonitorError> {
        let pid = self.attached()?;
        let info = ptrace::getsiginfo(pid).map_err(|e| debugger_error("getsiginfo", e))?;
        let fault_address = match self.stop_signal {
            // SAFETY: si_addr is populated for the fault signals listed above.
            Some(signal) if FAULT_SIGNALS.contains(&signal) => {
                Some(unsafe { info.si_addr() } as u64)
            }
            _ => None,
        };
        let (instruction_pointer, registers) = read_registers(pid)?;
        Ok(FaultContext {
            instruction_pointer,
            fault_address,
            signal_code: info.si_code,
            registers,
        })
    }

    fn memory_map(&mut self) -> Result<Vec<MemoryMapping>, MonitorError> {
        let pid = self.attached()?;
        let text = std::fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| {
            MonitorError::Debugger {
                op: "read maps",
                reason: e.to_string(),
            }
        })?;
        Ok(parse_maps(&text))
    }

    fn terminate(&mut self) -> Result<(), MonitorError> {
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        self.stop_signal = None;
        if self.reaped {
            return Ok(());
        }
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(debugger_error("kill", e)),
        }
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..))
                | Ok(WaitStatus::Signaled(..))
                | Err(Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(debugger_error("waitpid", e)),
            }
        }
        self.reaped = true;
        debug!(pid = pid.as_raw(), "Target terminated");
        Ok(())
    }
}

impl Drop for PtraceDebugger {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(target_arch = "x86_64")]
fn read_registers(pid: Pid) -> Result<(u64, Vec<(String, u64)>), MonitorError> {
    let regs = ptrace::getregs(pid).map_err(|e| debugger_error("getregs", e))?;
    let registers = [
        ("rip", regs.rip),
        ("rsp", regs.rsp),
        ("rbp", regs.rbp),
        ("rax", regs.rax),
        ("rbx", regs.rbx),
        ("rcx", regs.rcx),
        ("rdx", regs.rdx),
        ("rsi", regs.rsi),
        ("rdi", regs.rdi),
        ("r8", regs.r8),
        ("r9", regs.r9),
        ("r10", regs.r10),
        ("r11", regs.r11),
        ("r12", regs.r12),
        ("r13", regs.r13),
        ("r14", regs.r14),
        ("r15", regs.r15),
        ("eflags", regs.eflags),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect();
    Ok((regs.rip, registers))
}

#[cfg(not(target_arch = "x86_64"))]
fn read_registers(_pid: Pid) -> Result<(u64, Vec<(String, u64)>), MonitorError> {
    Err(MonitorError::Debugger {
        op: "getregs",
        reason: "register capture is only implemented for x86_64".to_string(),
    })
}

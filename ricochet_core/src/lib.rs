pub mod cipher;
pub mod config;
pub mod coordinator;
pub mod crash;
pub mod decoder;
pub mod fragment;
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod ptrace;
pub mod remote;
pub mod schema;
pub mod sequence;
pub mod session;
pub mod target;
pub mod template;
pub mod transport;
pub mod worker;

pub use config::RicochetConfig;
pub use coordinator::{Allocation, Coordinator, LocalCoordinator, TaskRange};
pub use crash::{CrashRecord, CrashSignature, UniqueCrashFilter};
pub use decoder::{DecodeError, DecodedRecord, FrameDecoder};
pub use monitor::{Classification, CrashMonitor, CrashReason, CrashReport, ProcessDebugger};
#[cfg(target_os = "linux")]
pub use ptrace::PtraceDebugger;
pub use remote::RemoteCoordinator;
pub use schema::{Layout, Schema};
pub use sequence::SequenceCodec;
pub use session::SessionHandshake;
pub use target::{Target, TargetError, TargetProcess};
pub use template::{MessageTemplate, RandomFieldMutator, TemplateMutator};
pub use transport::{Connection, LinkCodec, PacketFrame};
pub use worker::{WorkerLoop, WorkerSettings, WorkerStats};

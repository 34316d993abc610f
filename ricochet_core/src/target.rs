use crate::monitor::{Classification, CrashMonitor, LaunchSpec, MonitorError, ProcessDebugger};
use crate::schema::Schema;
use crate::session::{SessionError, SessionHandshake};
use crate::transport::{Connection, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Process monitor failed: {0}")]
    Monitor(#[from] MonitorError),
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Session handshake failed: {0}")]
    Session(#[from] SessionError),
    #[error("Target has not been started")]
    NotStarted,
}

/// A supervised process that test cases are delivered to.
pub trait Target {
    /// Brings the target up. Does nothing if it is already running.
    fn start(&mut self) -> Result<(), TargetError>;
    fn stop(&mut self) -> Result<(), TargetError>;
    fn send(&mut self, payload: &[u8]) -> Result<(), TargetError>;
    /// Non-blocking liveness check.
    fn is_running(&mut self) -> Result<bool, TargetError>;
    /// Classifies the termination observed by the last liveness check.
    fn classify(&mut self) -> Result<Classification, TargetError>;
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub launch: LaunchSpec,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub startup_delay: Duration,
    pub recv_timeout: Option<Duration>,
}

/// A local server process under a debugger, reached over its datagram port.
pub struct TargetProcess<D: ProcessDebugger> {
    monitor: CrashMonitor<D>,
    settings: TargetSettings,
    schema: Arc<Schema>,
    handshake: Option<SessionHandshake>,
    connection: Option<Connection>,
}

impl<D: ProcessDebugger> TargetProcess<D> {
    pub fn new(debugger: D, settings: TargetSettings, schema: Arc<Schema>) -> Self {
        Self {
            monitor: CrashMonitor::new(debugger, settings.launch.clone()),
            settings,
            schema,
            handshake: None,
            connection: None,
        }
    }

    pub fn with_handshake(mut self, handshake: SessionHandshake) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn monitor(&self) -> &CrashMonitor<D> {
        &self.monitor
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }
}

impl<D: ProcessDebugger> Target for TargetProcess<D> {
    fn start(&mut self) -> Result<(), TargetError> {
        if self.connection.is_some() && self.monitor.is_running()? {
            return Ok(());
        }
        self.connection = None;
        self.monitor.start()?;
        if !self.settings.startup_delay.is_zero() {
            debug!(delay = ?self.settings.startup_delay, "Waiting for target to come up");
            std::thread::sleep(self.settings.startup_delay);
        }

        let mut connection = Connection::open(
            self.settings.local_address,
            self.settings.remote_address,
            Arc::clone(&self.schema),
            self.settings.recv_timeout,
        )?;
        if let Some(handshake) = &self.handshake {
            info!(remote = %self.settings.remote_address, "Running session handshake");
            handshake.run(&mut connection)?;
        }
        self.connection = Some(connection);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TargetError> {
        if let Some(mut connection) = self.connection.take() {
            if self.monitor.is_running()? {
                connection.close();
            }
        }
        self.monitor.stop()?;
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TargetError> {
        let connection = self.connection.as_mut().ok_or(TargetError::NotStarted)?;
        connection.send(payload)?;
        Ok(())
    }

    fn is_running(&mut self) -> Result<bool, TargetError> {
        Ok(self.monitor.is_running()?)
    }

    fn classify(&mut self) -> Result<Classification, TargetError> {
        Ok(self.monitor.classify()?)
    }
}

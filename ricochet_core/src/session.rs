//! Client connection handshake that brings a freshly started server to the point
//! where it accepts in-game client messages.

use crate::cipher::{MUNGE_TABLE_2, MUNGE_TABLE_3, munge, unmunge};
use crate::config::HandshakeSettings;
use crate::decoder::DecodedRecord;
use crate::transport::{CONNECTIONLESS_MARKER, Connection, Inbound, TransportError};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

const KEEPALIVE: &[u8] = b"\x01\x01\x01\x01\x01\x01\x01\x01";
const NEW_COMMAND: &[u8] = b"\x03new\x00\x01\x01\x01";
const SENDRES_COMMAND: &[u8] = b"\x03sendres\x00\x01\x01\x01";
const RESOURCE_ACK: &[u8] = b"\x05\x00\x00\x01";
const JOIN_COMMANDS: [&[u8]; 2] = [b"\x03jointeam 1\x00", b"\x03joinclass 3\x00"];

const SERVER_INFO: &str = "serverinfo";
const RESOURCE_REQUEST: &str = "resourcerequest";
const RESOURCE_LIST: &str = "resourcelist";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport failure during handshake: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to read certificate {path:?}: {source}")]
    Certificate { path: PathBuf, source: io::Error },
    #[error("Challenge reply carried no token: {0:?}")]
    MissingChallenge(String),
    #[error("Record '{record}' has no field '{field}'")]
    MissingField { record: String, field: &'static str },
    #[error("Server did not finish the handshake within {0} attempts")]
    Exhausted(usize),
}

fn field(record: &DecodedRecord, name: &'static str) -> Result<i64, SessionError> {
    record.value(name).ok_or_else(|| SessionError::MissingField {
        record: record.name.clone(),
        field: name,
    })
}

fn is_timeout(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

/// Identity derived from `serverinfo`.
#[derive(Debug, Clone, Copy)]
struct ServerIdentity {
    checksum: [u8; 4],
    server_count: i64,
}

/// Scripted login: challenge, connect, `new`, then keepalives until the server has
/// sent its resource list and the client has spawned.
#[derive(Debug, Clone)]
pub struct SessionHandshake {
    certificate: Vec<u8>,
    protinfo: String,
    userinfo: String,
    max_attempts: usize,
    poll_interval: Duration,
}

impl SessionHandshake {
    pub fn new(certificate: Vec<u8>) -> Self {
        let defaults = HandshakeSettings::default();
        Self {
            certificate,
            protinfo: defaults.protinfo,
            userinfo: defaults.userinfo,
            max_attempts: defaults.max_attempts,
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
        }
    }

    pub fn from_settings(settings: &HandshakeSettings) -> Result<Self, SessionError> {
        let certificate = match &settings.certificate {
            Some(path) => std::fs::read(path).map_err(|source| SessionError::Certificate {
                path: path.clone(),
                source,
            })?,
            None => Vec::new(),
        };
        Ok(Self {
            certificate,
            protinfo: settings.protinfo.clone(),
            userinfo: settings.userinfo.clone(),
            max_attempts: settings.max_attempts,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        })
    }

    pub fn with_attempts(mut self, max_attempts: usize, poll_interval: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.poll_interval = poll_interval;
        self
    }

    fn connectionless(body: &[u8]) -> Vec<u8> {
        [CONNECTIONLESS_MARKER.as_slice(), body].concat()
    }

    fn request_challenge(&self, connection: &mut Connection) -> Result<String, SessionError> {
        connection.send(&Self::connectionless(b"getchallenge steam\n"))?;
        for _ in 0..self.max_attempts {
            match connection.recv() {
                Ok(Inbound::Connectionless(reply)) => {
                    let text = String::from_utf8_lossy(&reply).into_owned();
                    return text
                        .split_whitespace()
                        .nth(1)
                        .map(str::to_string)
                        .ok_or(SessionError::MissingChallenge(text));
                }
                Ok(Inbound::Sequenced(_)) => continue,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::Exhausted(self.max_attempts))
    }

    /// Runs the full handshake on a freshly opened connection.
    pub fn run(&self, connection: &mut Connection) -> Result<(), SessionError> {
        let challenge = self.request_challenge(connection)?;
        debug!(%challenge, "Received connection challenge");

        let mut connect = Self::connectionless(
            format!(
                "connect 48 {challenge} \"{}\" \"{}\"\n",
                self.protinfo, self.userinfo
            )
            .as_bytes(),
        );
        connect.extend_from_slice(&self.certificate);
        connection.send(&connect)?;
        match connection.recv() {
            Ok(reply) => trace!(reply = ?String::from_utf8_lossy(reply.payload()), "Connect reply"),
            Err(e) if is_timeout(&e) => debug!("No reply to connect request"),
            Err(e) => return Err(e.into()),
        }

        connection.send(NEW_COMMAND)?;
        let mut identity = None;
        for attempt in 0..self.max_attempts {
            connection.send(KEEPALIVE)?;
            match connection.recv() {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => trace!(attempt, "Handshake poll timed out"),
                Err(e) => return Err(e.into()),
            }
            while let Some(record) = connection.next_record() {
                if self.handle_record(connection, &record, &mut identity)? {
                    info!(attempt, "Session established");
                    return Ok(());
                }
            }
            std::thread::sleep(self.poll_interval);
        }
        Err(SessionError::Exhausted(self.max_attempts))
    }

    /// Reacts to one server record. Returns true once the client has spawned.
    fn handle_record(
        &self,
        connection: &mut Connection,
        record: &DecodedRecord,
        identity: &mut Option<ServerIdentity>,
    ) -> Result<bool, SessionError> {
        match record.name.as_str() {
            SERVER_INFO => {
                let checksum = (field(record, "server_crc")? as u32).to_le_bytes();
                let key = (-1 - field(record, "playernum")?) as u8;
                let unmunged = unmunge(&checksum, &MUNGE_TABLE_3, key);
                *identity = Some(ServerIdentity {
                    checksum: [unmunged[0], unmunged[1], unmunged[2], unmunged[3]],
                    server_count: field(record, "server_count")?,
                });
                connection.send(SENDRES_COMMAND)?;
            }
            RESOURCE_REQUEST => {
                connection.send(RESOURCE_ACK)?;
            }
            RESOURCE_LIST => {
                let Some(identity) = identity else {
                    debug!("Resource list arrived before server info");
                    return Ok(false);
                };
                connection.send(&spawn_command(identity))?;
                for command in JOIN_COMMANDS {
                    connection.send(command)?;
                }
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }
}

fn spawn_command(identity: &ServerIdentity) -> Vec<u8> {
    let key = (-1 - identity.server_count) as u8;
    let munged = munge(&identity.checksum, &MUNGE_TABLE_2, key);
    let token = i32::from_le_bytes([munged[0], munged[1], munged[2], munged[3]]);
    format!("\x03spawn {} {}\x00", identity.server_count, token).into_bytes()
}

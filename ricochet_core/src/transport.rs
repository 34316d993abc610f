//! Link layer for the target's datagram protocol.
//!
//! [`LinkCodec`] owns the per-connection framing state (sequence counter, ack
//! tracking, reliable toggle, fragment slots) and [`Connection`] binds it to a UDP
//! socket together with a [`FrameDecoder`].

use crate::cipher::{MUNGE_TABLE_2, MungeTable, munge, unmunge};
use crate::decoder::{DecodedRecord, FrameDecoder};
use crate::fragment::{FragmentBuffer, FragmentError};
use crate::schema::Schema;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Prefix of datagrams that bypass sequencing and the cipher.
pub const CONNECTIONLESS_MARKER: [u8; 4] = [0xFF; 4];

const HEADER_LEN: usize = 8;
const RELIABLE_BIT: u32 = 1 << 31;
const FRAGMENTED_BIT: u32 = 1 << 30;
const SEQUENCE_MASK: u32 = 0x3FFF_FFFF;
const MAX_DATAGRAM_LEN: usize = 65536;
const DROP_CLIENT: &[u8] = b"\x03dropclient\n\x00";
const DROP_CLIENT_REPEATS: usize = 3;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Datagram of {0} bytes is shorter than the link header")]
    ShortHeader(usize),
    #[error("Fragment reassembly failed: {0}")]
    Fragment(#[from] FragmentError),
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// A sequenced datagram as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFrame {
    pub sequence: u32,
    pub ack_word: u32,
    /// Still obfuscated.
    pub payload: Vec<u8>,
}

impl PacketFrame {
    pub fn parse(datagram: &[u8]) -> Result<Self, TransportError> {
        if datagram.len() < HEADER_LEN {
            return Err(TransportError::ShortHeader(datagram.len()));
        }
        Ok(Self {
            sequence: u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]),
            ack_word: u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
            payload: datagram[HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.ack_word.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn is_reliable(&self) -> bool {
        self.sequence & RELIABLE_BIT != 0
    }

    pub fn is_fragmented(&self) -> bool {
        self.sequence & FRAGMENTED_BIT != 0
    }

    /// Sequence number with the flag bits masked off.
    pub fn sequence_number(&self) -> u32 {
        self.sequence & SEQUENCE_MASK
    }

    pub fn cipher_key(&self) -> u8 {
        (self.sequence & 0xFF) as u8
    }
}

/// Result of decoding one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Body of a connectionless datagram, marker stripped.
    Connectionless(Vec<u8>),
    /// Deciphered and reassembled payload of a sequenced datagram.
    Sequenced(Vec<u8>),
}

impl Inbound {
    pub fn payload(&self) -> &[u8] {
        match self {
            Inbound::Connectionless(body) | Inbound::Sequenced(body) => body,
        }
    }
}

/// Framing and cipher state for one connection.
#[derive(Debug)]
pub struct LinkCodec {
    outgoing_sequence: u32,
    incoming_ack: u32,
    reliable_ack: bool,
    fragments: FragmentBuffer,
    table: MungeTable,
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(MUNGE_TABLE_2)
    }
}

impl LinkCodec {
    pub fn new(table: MungeTable) -> Self {
        Self {
            outgoing_sequence: 0,
            incoming_ack: 0,
            reliable_ack: false,
            fragments: FragmentBuffer::new(),
            table,
        }
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    pub fn incoming_ack(&self) -> u32 {
        self.incoming_ack
    }

    pub fn reliable_ack_pending(&self) -> bool {
        self.reliable_ack
    }

    pub fn fragments(&self) -> &FragmentBuffer {
        &self.fragments
    }

    /// Frames an outgoing payload. Connectionless payloads pass through verbatim.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.starts_with(&CONNECTIONLESS_MARKER) {
            return payload.to_vec();
        }
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        let ack_word = self.incoming_ack | if self.reliable_ack { RELIABLE_BIT } else { 0 };
        PacketFrame {
            sequence: self.outgoing_sequence,
            ack_word,
            payload: munge(payload, &self.table, (self.outgoing_sequence & 0xFF) as u8),
        }
        .to_bytes()
    }

    pub fn decode(&mut self, datagram: &[u8]) -> Result<Inbound, TransportError> {
        if let Some(body) = datagram.strip_prefix(CONNECTIONLESS_MARKER.as_slice()) {
            return Ok(Inbound::Connectionless(body.to_vec()));
        }
        let frame = PacketFrame::parse(datagram)?;
        self.incoming_ack = self.incoming_ack.max(frame.sequence_number());
        if frame.is_reliable() {
            self.reliable_ack = !self.reliable_ack;
        }

        let mut payload = unmunge(&frame.payload, &self.table, frame.cipher_key());
        if frame.is_fragmented() {
            payload = self.fragments.reassemble(&payload)?;
            if let Some((filled, total)) = self.fragments.pending() {
                trace!(filled, total, "Fragment set still incomplete");
            }
        }
        Ok(Inbound::Sequenced(payload))
    }
}

/// A datagram connection to one target instance.
///
/// Owns all connection-scoped state; a fresh `Connection` must be opened for every
/// target restart.
#[derive(Debug)]
pub struct Connection {
    socket: UdpSocket,
    remote: SocketAddr,
    codec: LinkCodec,
    decoder: FrameDecoder,
}

impl Connection {
    pub fn open(
        local: SocketAddr,
        remote: SocketAddr,
        schema: Arc<Schema>,
        recv_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(recv_timeout)?;
        debug!(local = %socket.local_addr()?, %remote, "Opened target connection");
        Ok(Self {
            socket,
            remote,
            codec: LinkCodec::default(),
            decoder: FrameDecoder::new(schema),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn codec(&self) -> &LinkCodec {
        &self.codec
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    /// Frames and transmits `payload`, returning the datagram length sent.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize, TransportError> {
        let datagram = self.codec.encode(payload);
        Ok(self.socket.send_to(&datagram, self.remote)?)
    }

    /// Blocks for the next datagram from the remote peer.
    ///
    /// Sequenced payloads are also fed to the frame decoder. A decode failure only
    /// loses the records of that payload and is logged, not returned.
    pub fn recv(&mut self) -> Result<Inbound, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let datagram = loop {
            let (len, from) = self.socket.recv_from(&mut buf)?;
            if from == self.remote {
                break &buf[..len];
            }
            debug!(%from, "Ignoring datagram from unexpected peer");
        };

        let inbound = self.codec.decode(datagram)?;
        if let Inbound::Sequenced(payload) = &inbound {
            if let Err(e) = self.decoder.decode(payload) {
                warn!(error = %e, len = payload.len(), "Dropped rest of undecodable payload");
            }
        }
        Ok(inbound)
    }

    pub fn next_record(&mut self) -> Option<DecodedRecord> {
        self.decoder.pop()
    }

    /// Politely disconnects from the server. Send failures are ignored.
    pub fn close(&mut self) {
        for _ in 0..DROP_CLIENT_REPEATS {
            if let Err(e) = self.send(DROP_CLIENT) {
                debug!(error = %e, "Failed to send disconnect");
                break;
            }
        }
    }
}

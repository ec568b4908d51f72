//! Control message types and the datagram codec.
//!
//! Wire format (all integers little-endian, one datagram per message):
//!
//! ```text
//! Connect:                   [opcode: u8][client_pid: u32]          exactly 5 bytes
//! DefineSimpleModifications: [opcode: u8][size: u32][payload: ...]  5 + size bytes
//! ```
//!
//! Decoding is pure and side-effect free. The only allocation is the copy
//! of the payload slice into the decoded message.

use thiserror::Error;

/// Opcode for `Connect`.
pub const OP_CONNECT: u8 = 0x01;

/// Opcode for `DefineSimpleModifications`.
pub const OP_DEFINE_SIMPLE_MODIFICATIONS: u8 = 0x02;

/// Exact length of a `Connect` datagram: opcode + client pid.
pub const CONNECT_MESSAGE_LEN: usize = 5;

/// Length of the `DefineSimpleModifications` header: opcode + size field.
pub const DEFINE_HEADER_LEN: usize = 5;

/// A decoded control message. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// A client claims the capture resource and identifies itself by pid.
    Connect {
        /// Process id of the connecting client.
        client_pid: u32,
    },

    /// Configuration payload for the currently bound capture session.
    ///
    /// The payload is forwarded verbatim to the capture engine; the daemon
    /// does not interpret it.
    DefineSimpleModifications {
        /// Opaque configuration bytes.
        payload: Vec<u8>,
    },
}

impl ControlMessage {
    /// Returns the wire opcode for this message.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Connect { .. } => OP_CONNECT,
            Self::DefineSimpleModifications { .. } => OP_DEFINE_SIMPLE_MODIFICATIONS,
        }
    }

    /// Encodes this message into a single datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Connect { client_pid } => {
                let mut bytes = Vec::with_capacity(CONNECT_MESSAGE_LEN);
                bytes.push(OP_CONNECT);
                bytes.extend_from_slice(&client_pid.to_le_bytes());
                bytes
            }
            Self::DefineSimpleModifications { payload } => {
                let mut bytes = Vec::with_capacity(DEFINE_HEADER_LEN + payload.len());
                bytes.push(OP_DEFINE_SIMPLE_MODIFICATIONS);
                bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                bytes.extend_from_slice(payload);
                bytes
            }
        }
    }
}

/// Errors produced when decoding a datagram.
///
/// All decode errors are non-fatal to the daemon: the caller logs the error
/// and drops the datagram.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The datagram length does not match what the opcode requires.
    #[error("invalid message size: {len} bytes")]
    BadSize {
        /// Actual datagram length.
        len: usize,
    },

    /// The declared payload size exceeds the bytes actually present.
    #[error("declared payload size {declared} exceeds {available} available bytes")]
    Truncated {
        /// Size claimed by the embedded size field.
        declared: usize,
        /// Bytes present after the header.
        available: usize,
    },

    /// The opcode byte is not a known operation.
    #[error("unknown opcode {opcode:#04x}")]
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
    },
}

/// Decodes a single datagram into a validated [`ControlMessage`].
pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    let Some(&opcode) = bytes.first() else {
        return Err(DecodeError::BadSize { len: 0 });
    };

    match opcode {
        OP_CONNECT => {
            if bytes.len() != CONNECT_MESSAGE_LEN {
                return Err(DecodeError::BadSize { len: bytes.len() });
            }
            let mut pid_bytes = [0u8; 4];
            pid_bytes.copy_from_slice(&bytes[1..CONNECT_MESSAGE_LEN]);
            Ok(ControlMessage::Connect {
                client_pid: u32::from_le_bytes(pid_bytes),
            })
        }

        OP_DEFINE_SIMPLE_MODIFICATIONS => {
            if bytes.len() < DEFINE_HEADER_LEN {
                return Err(DecodeError::BadSize { len: bytes.len() });
            }
            let mut size_bytes = [0u8; 4];
            size_bytes.copy_from_slice(&bytes[1..DEFINE_HEADER_LEN]);
            let declared = u32::from_le_bytes(size_bytes) as usize;

            let body = &bytes[DEFINE_HEADER_LEN..];
            if declared > body.len() {
                return Err(DecodeError::Truncated {
                    declared,
                    available: body.len(),
                });
            }
            // The size field is authoritative; trailing bytes are ignored.
            Ok(ControlMessage::DefineSimpleModifications {
                payload: body[..declared].to_vec(),
            })
        }

        other => Err(DecodeError::UnknownOpcode { opcode: other }),
    }
}

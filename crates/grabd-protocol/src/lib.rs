//! grabd protocol - wire format for the control socket
//!
//! This crate provides the message types and codec for the one-way binary
//! protocol spoken over the grabd control socket. Each datagram carries
//! exactly one message; there is no framing and no response path.

pub mod message;

pub use message::{
    decode, ControlMessage, DecodeError, CONNECT_MESSAGE_LEN, DEFINE_HEADER_LEN, OP_CONNECT,
    OP_DEFINE_SIMPLE_MODIFICATIONS,
};

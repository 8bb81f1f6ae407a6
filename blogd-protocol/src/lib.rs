//! # blogd-protocol
//!
//! Wire protocol for blogd (BRP - blogd RPC Protocol).
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON message serialization/deserialization
//! - Request/Response envelopes and streamed item messages
//! - Blog post wire types, error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, Message};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    BlogPost, Operation, Request, Response, ResponseError, ResponseStatus, StreamItem,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the blogd server.
pub const DEFAULT_PORT: u16 = 50051;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

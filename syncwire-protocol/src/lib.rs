//! # syncwire-protocol
//!
//! Wire protocol for syncwire.
//!
//! This crate provides:
//! - JSON message envelopes for requests, responses, errors and notifications
//! - The message codec (decode, validate, encode)
//! - Binary framing with length prefix and CRC32C validation
//! - Broker packets carried inside frames
//! - Topic layout and wildcard matching
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod packet;
pub mod topic;

pub use codec::MessageCodec;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    FilterOperator, FilterOption, Message, MessageType, Notification, Operation, QueryOptions,
    Response, ResponseError, ResponseMeta, SortDirection, SortOption,
};
pub use packet::{Packet, PacketDecoder, PacketHeader, QoS};
pub use topic::{topic_matches, TopicLayout};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the embedded broker.
pub const DEFAULT_BROKER_PORT: u16 = 7411;

/// Default topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "syncwire";

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

//! Broker packets.
//!
//! Each packet travels in one [`Frame`]: the JSON-encoded [`PacketHeader`]
//! sits in the header extension and the application payload (only used by
//! `publish`) sits untouched in the frame payload.

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery guarantee level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// Whether the receiver must acknowledge a publish at this level.
    pub fn requires_ack(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl From<QoS> for u8 {
    fn from(q: QoS) -> Self {
        q.as_u8()
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level: {}", other)),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Packet header, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PacketHeader {
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        clean_session: bool,
        keep_alive_secs: u16,
    },
    ConnAck {
        accepted: bool,
        #[serde(default)]
        session_present: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Subscribe {
        packet_id: u32,
        filter: String,
        qos: QoS,
    },
    SubAck {
        packet_id: u32,
        qos: QoS,
    },
    Unsubscribe {
        packet_id: u32,
        filter: String,
    },
    UnsubAck {
        packet_id: u32,
    },
    Publish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packet_id: Option<u32>,
        topic: String,
        qos: QoS,
    },
    PubAck {
        packet_id: u32,
    },
    PingReq,
    PingResp,
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PacketHeader {
    pub fn kind(&self) -> &'static str {
        match self {
            PacketHeader::Connect { .. } => "connect",
            PacketHeader::ConnAck { .. } => "conn_ack",
            PacketHeader::Subscribe { .. } => "subscribe",
            PacketHeader::SubAck { .. } => "sub_ack",
            PacketHeader::Unsubscribe { .. } => "unsubscribe",
            PacketHeader::UnsubAck { .. } => "unsub_ack",
            PacketHeader::Publish { .. } => "publish",
            PacketHeader::PubAck { .. } => "pub_ack",
            PacketHeader::PingReq => "ping_req",
            PacketHeader::PingResp => "ping_resp",
            PacketHeader::Disconnect { .. } => "disconnect",
        }
    }
}

/// A broker packet: header plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn publish(topic: impl Into<String>, qos: QoS, packet_id: Option<u32>, payload: Bytes) -> Self {
        Self {
            header: PacketHeader::Publish {
                packet_id,
                topic: topic.into(),
                qos,
            },
            payload,
        }
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let header = Bytes::from(serde_json::to_vec(&self.header)?);
        Frame::with_header(header, self.payload.clone()).encode_into(buf)
    }

    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        if frame.header_extension.is_empty() {
            return Err(ProtocolError::InvalidPacket(
                "frame carries no packet header".to_string(),
            ));
        }
        let header: PacketHeader = serde_json::from_slice(&frame.header_extension)
            .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Ok(Self {
            header,
            payload: frame.payload,
        })
    }
}

/// Buffers partial reads and yields complete packets.
pub struct PacketDecoder {
    buffer: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode(&mut self) -> Result<Option<Packet>, ProtocolError> {
        match Frame::decode(&mut self.buffer)? {
            Some(frame) => Packet::from_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire format.
//!
//! Two layers, both length-delimited:
//! - [`FrameCodec`] frames opaque byte blobs on a stream transport
//!   (`u32` big-endian length prefix, bounded by the configured maximum).
//! - [`encode_packet`] / [`decode_packet`] map a [`Packet`] to and from a
//!   frame body: stream id, tag, source rank, format descriptor, payload.
//!
//! Control messages ride on the reserved control stream (id 0) with system
//! tags below [`TAG_FIRST_APPLICATION`]; their payload is the JSON encoding of
//! [`ControlMessage`]. Control traffic is low-rate, so the readable encoding
//! is worth the bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::Packet;
use crate::stream::SyncPolicy;
use crate::topology::Rank;

/// Stream id reserved for system control traffic on every node.
pub const CONTROL_STREAM_ID: u32 = 0;

/// First tag available to applications; everything below is reserved.
pub const TAG_FIRST_APPLICATION: i32 = 100;

pub const TAG_ATTACH: i32 = 1;
pub const TAG_ATTACH_ACK: i32 = 2;
pub const TAG_TOPOLOGY_UPDATE: i32 = 3;
pub const TAG_NEW_STREAM: i32 = 4;
pub const TAG_DELETE_STREAM: i32 = 5;
pub const TAG_CLOSE_STREAM: i32 = 6;
pub const TAG_FILTER_LOAD: i32 = 7;
pub const TAG_SHUTDOWN: i32 = 8;
pub const TAG_SHUTDOWN_ACK: i32 = 9;
pub const TAG_TOPOLOGY_SYNC: i32 = 10;

/// True if the tag is reserved for the system.
pub fn is_system_tag(tag: i32) -> bool {
    tag < TAG_FIRST_APPLICATION
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {got} bytes exceeds maximum of {max}")]
    FrameTooLarge { got: usize, max: usize },
    #[error("frame truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("invalid UTF-8 in format descriptor")]
    InvalidFormat,
    #[error("unexpected control tag {0}")]
    UnexpectedTag(i32),
    #[error("malformed control payload: {0}")]
    ControlPayload(#[from] serde_json::Error),
}

/// Length-delimited frame codec: `u32` big-endian length, then the body.
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds maximum of {}", len, self.max_frame_bytes),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds maximum of {}",
                    item.len(),
                    self.max_frame_bytes
                ),
            ));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Encode a packet into a frame body.
///
/// Layout: `stream_id: u32 | tag: i32 | src_rank: u32 | fmt_len: u16 | fmt | payload`.
pub fn encode_packet(pkt: &Packet) -> Bytes {
    let fmt = pkt.fmt().as_bytes();
    let mut buf = BytesMut::with_capacity(4 + 4 + 4 + 2 + fmt.len() + pkt.payload().len());
    buf.put_u32(pkt.stream_id());
    buf.put_i32(pkt.tag());
    buf.put_u32(pkt.src_rank());
    buf.put_u16(fmt.len() as u16);
    buf.put_slice(fmt);
    buf.put_slice(pkt.payload());
    buf.freeze()
}

/// Decode a frame body back into a packet.
pub fn decode_packet(mut body: BytesMut) -> Result<Packet, WireError> {
    const HEADER: usize = 4 + 4 + 4 + 2;
    if body.len() < HEADER {
        return Err(WireError::Truncated {
            expected: HEADER,
            got: body.len(),
        });
    }
    let stream_id = body.get_u32();
    let tag = body.get_i32();
    let src_rank = body.get_u32();
    let fmt_len = body.get_u16() as usize;
    if body.len() < fmt_len {
        return Err(WireError::Truncated {
            expected: fmt_len,
            got: body.len(),
        });
    }
    let fmt_raw = body.split_to(fmt_len);
    let fmt = std::str::from_utf8(&fmt_raw)
        .map_err(|_| WireError::InvalidFormat)?
        .to_string();
    let payload = body.freeze();
    Ok(Packet::from_parts(stream_id, tag, fmt, payload, src_rank))
}

/// One entry in a topology-update batch, applied idempotently at every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub kind: UpdateKind,
    pub rank: Rank,
    pub parent_rank: Rank,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    NewBackend,
    NewInternal,
    RemoveRank,
    ChangeParent,
    ChangePort,
}

/// System control messages exchanged on the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message on every new connection: the child introduces itself and
    /// the serialized subtree hanging off it.
    Attach {
        rank: Rank,
        is_backend: bool,
        listen_port: u16,
        subtree: String,
    },
    /// Parent's reply to an attach: the serialized global topology.
    AttachAck { topology: String },
    /// Batched structural updates, flooded along tree edges.
    TopologyUpdates { updates: Vec<TopologyUpdate> },
    /// Full serialized topology, pushed down the tree after startup completes
    /// and after an adopted subtree needs to refresh its descendants' views.
    TopologySync { topology: String },
    /// Stream announcement broadcast to every member-covering node.
    NewStream {
        stream_id: u32,
        members: Vec<Rank>,
        up_filter: String,
        sync_policy: SyncPolicy,
        down_filter: String,
    },
    /// Explicit stream teardown.
    DeleteStream { stream_id: u32 },
    /// A member has stopped sending on the stream; flows upstream.
    CloseStream { stream_id: u32, rank: Rank },
    /// Ask every node to resolve a named filter from an artifact and register
    /// it under the given id.
    FilterLoad {
        filter_id: u16,
        artifact: String,
        name: String,
    },
    /// Network-wide shutdown handshake.
    Shutdown,
    ShutdownAck { rank: Rank },
}

impl ControlMessage {
    pub fn tag(&self) -> i32 {
        match self {
            ControlMessage::Attach { .. } => TAG_ATTACH,
            ControlMessage::AttachAck { .. } => TAG_ATTACH_ACK,
            ControlMessage::TopologyUpdates { .. } => TAG_TOPOLOGY_UPDATE,
            ControlMessage::TopologySync { .. } => TAG_TOPOLOGY_SYNC,
            ControlMessage::NewStream { .. } => TAG_NEW_STREAM,
            ControlMessage::DeleteStream { .. } => TAG_DELETE_STREAM,
            ControlMessage::CloseStream { .. } => TAG_CLOSE_STREAM,
            ControlMessage::FilterLoad { .. } => TAG_FILTER_LOAD,
            ControlMessage::Shutdown => TAG_SHUTDOWN,
            ControlMessage::ShutdownAck { .. } => TAG_SHUTDOWN_ACK,
        }
    }

    /// Wrap the message into a control-stream packet.
    pub fn into_packet(self, src_rank: Rank) -> Result<Packet, WireError> {
        let payload = Bytes::from(serde_json::to_vec(&self)?);
        Ok(Packet::from_parts(
            CONTROL_STREAM_ID,
            self.tag(),
            String::new(),
            payload,
            src_rank,
        ))
    }

    /// Parse a control-stream packet back into a message, verifying that the
    /// packet tag matches the encoded variant.
    pub fn from_packet(pkt: &Packet) -> Result<Self, WireError> {
        let msg: ControlMessage = serde_json::from_slice(pkt.payload())?;
        if msg.tag() != pkt.tag() {
            return Err(WireError::UnexpectedTag(pkt.tag()));
        }
        Ok(msg)
    }
}

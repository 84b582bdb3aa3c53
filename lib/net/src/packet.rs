// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application packets and the typed pack/unpack seam.
//!
//! A [`Packet`] is the unit of data flowing along tree paths: stream id,
//! application tag, a format descriptor, opaque payload bytes, and the rank of
//! the originating node. Ownership transfers along the forwarding path; each
//! hop holds the packet exclusively until it forwards or consumes it.
//!
//! Typed values are converted to and from payload bytes through the
//! [`DataCodec`] seam. The built-in [`BinaryCodec`] implements the
//! format-string grammar (`%d %ud %ld %lf %s %ad %alf`); alternative codecs
//! can be supplied without touching dispatch or filter code.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::topology::Rank;

/// A typed value carried in a packet payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Float64(f64),
    Str(String),
    ArrayInt32(Vec<i32>),
    ArrayFloat64(Vec<f64>),
}

impl Value {
    /// The format token this value packs as.
    pub fn token(&self) -> &'static str {
        match self {
            Value::Int32(_) => "%d",
            Value::UInt32(_) => "%ud",
            Value::Int64(_) => "%ld",
            Value::Float64(_) => "%lf",
            Value::Str(_) => "%s",
            Value::ArrayInt32(_) => "%ad",
            Value::ArrayFloat64(_) => "%alf",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown format token '{0}'")]
    UnknownToken(String),
    #[error("format '{fmt}' expects {expected} values, got {got}")]
    ArityMismatch {
        fmt: String,
        expected: usize,
        got: usize,
    },
    #[error("value {index} does not match token '{token}'")]
    TypeMismatch { index: usize, token: String },
    #[error("payload truncated while reading token '{0}'")]
    Truncated(String),
    #[error("trailing bytes after last format token")]
    TrailingBytes,
    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,
}

/// Pack/unpack collaborator: typed values to/from payload bytes, driven by a
/// format descriptor.
pub trait DataCodec: Send + Sync {
    fn pack(&self, fmt: &str, values: &[Value]) -> Result<Bytes, CodecError>;
    fn unpack(&self, fmt: &str, payload: &Bytes) -> Result<Vec<Value>, CodecError>;
}

/// Split a format descriptor into its tokens, validating each.
pub fn format_tokens(fmt: &str) -> Result<Vec<&str>, CodecError> {
    fmt.split_whitespace()
        .map(|tok| match tok {
            "%d" | "%ud" | "%ld" | "%lf" | "%s" | "%ad" | "%alf" => Ok(tok),
            other => Err(CodecError::UnknownToken(other.to_string())),
        })
        .collect()
}

/// Canonical single-space form of a format descriptor, used for equality
/// checks between a packet's declared format and an unpack request.
pub fn normalize_format(fmt: &str) -> String {
    fmt.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The built-in big-endian binary codec.
///
/// Strings and arrays carry a u32 length prefix; scalars are fixed width.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl DataCodec for BinaryCodec {
    fn pack(&self, fmt: &str, values: &[Value]) -> Result<Bytes, CodecError> {
        let tokens = format_tokens(fmt)?;
        if tokens.len() != values.len() {
            return Err(CodecError::ArityMismatch {
                fmt: fmt.to_string(),
                expected: tokens.len(),
                got: values.len(),
            });
        }

        let mut buf = BytesMut::new();
        for (index, (token, value)) in tokens.iter().zip(values).enumerate() {
            if value.token() != *token {
                return Err(CodecError::TypeMismatch {
                    index,
                    token: token.to_string(),
                });
            }
            match value {
                Value::Int32(v) => buf.put_i32(*v),
                Value::UInt32(v) => buf.put_u32(*v),
                Value::Int64(v) => buf.put_i64(*v),
                Value::Float64(v) => buf.put_f64(*v),
                Value::Str(s) => {
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                Value::ArrayInt32(a) => {
                    buf.put_u32(a.len() as u32);
                    for v in a {
                        buf.put_i32(*v);
                    }
                }
                Value::ArrayFloat64(a) => {
                    buf.put_u32(a.len() as u32);
                    for v in a {
                        buf.put_f64(*v);
                    }
                }
            }
        }
        Ok(buf.freeze())
    }

    fn unpack(&self, fmt: &str, payload: &Bytes) -> Result<Vec<Value>, CodecError> {
        let tokens = format_tokens(fmt)?;
        let mut buf = payload.clone();
        let mut values = Vec::with_capacity(tokens.len());

        for token in tokens {
            let need = |buf: &Bytes, n: usize| -> Result<(), CodecError> {
                if buf.remaining() < n {
                    Err(CodecError::Truncated(token.to_string()))
                } else {
                    Ok(())
                }
            };
            match token {
                "%d" => {
                    need(&buf, 4)?;
                    values.push(Value::Int32(buf.get_i32()));
                }
                "%ud" => {
                    need(&buf, 4)?;
                    values.push(Value::UInt32(buf.get_u32()));
                }
                "%ld" => {
                    need(&buf, 8)?;
                    values.push(Value::Int64(buf.get_i64()));
                }
                "%lf" => {
                    need(&buf, 8)?;
                    values.push(Value::Float64(buf.get_f64()));
                }
                "%s" => {
                    need(&buf, 4)?;
                    let len = buf.get_u32() as usize;
                    need(&buf, len)?;
                    let raw = buf.split_to(len);
                    let s = std::str::from_utf8(&raw).map_err(|_| CodecError::InvalidUtf8)?;
                    values.push(Value::Str(s.to_string()));
                }
                "%ad" => {
                    need(&buf, 4)?;
                    let len = buf.get_u32() as usize;
                    need(&buf, len * 4)?;
                    let mut a = Vec::with_capacity(len);
                    for _ in 0..len {
                        a.push(buf.get_i32());
                    }
                    values.push(Value::ArrayInt32(a));
                }
                "%alf" => {
                    need(&buf, 4)?;
                    let len = buf.get_u32() as usize;
                    need(&buf, len * 8)?;
                    let mut a = Vec::with_capacity(len);
                    for _ in 0..len {
                        a.push(buf.get_f64());
                    }
                    values.push(Value::ArrayFloat64(a));
                }
                _ => unreachable!("format_tokens validated the token"),
            }
        }

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(values)
    }
}

/// Process-wide default codec instance.
pub fn default_codec() -> Arc<dyn DataCodec> {
    Arc::new(BinaryCodec)
}

/// A unit of application data flowing along a tree path.
#[derive(Clone)]
pub struct Packet {
    stream_id: u32,
    tag: i32,
    fmt: String,
    payload: Bytes,
    src_rank: Rank,
}

impl Packet {
    /// Build a packet from raw parts (wire deserialization path).
    pub fn from_parts(stream_id: u32, tag: i32, fmt: String, payload: Bytes, src_rank: Rank) -> Self {
        Self {
            stream_id,
            tag,
            fmt,
            payload,
            src_rank,
        }
    }

    /// Pack typed values into a new packet using the built-in codec.
    pub fn pack(
        stream_id: u32,
        tag: i32,
        src_rank: Rank,
        fmt: &str,
        values: &[Value],
    ) -> Result<Self, CodecError> {
        let payload = BinaryCodec.pack(fmt, values)?;
        Ok(Self {
            stream_id,
            tag,
            fmt: normalize_format(fmt),
            payload,
            src_rank,
        })
    }

    /// Unpack the payload, verifying the caller's format against the packet's
    /// declared format. A mismatch drops nothing but this packet; the caller
    /// receives an error and other packets in the round are unaffected.
    pub fn unpack(&self, fmt: &str) -> Result<Vec<Value>, CodecError> {
        if normalize_format(fmt) != self.fmt {
            return Err(CodecError::ArityMismatch {
                fmt: format!("declared '{}', requested '{}'", self.fmt, fmt),
                expected: format_tokens(&self.fmt).map(|t| t.len()).unwrap_or(0),
                got: format_tokens(fmt).map(|t| t.len()).unwrap_or(0),
            });
        }
        BinaryCodec.unpack(&self.fmt, &self.payload)
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn fmt(&self) -> &str {
        &self.fmt
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn src_rank(&self) -> Rank {
        self.src_rank
    }

    /// Rewrite the source rank, used when a filter emits an aggregate packet
    /// that now originates at this node.
    pub fn with_src_rank(mut self, rank: Rank) -> Self {
        self.src_rank = rank;
        self
    }

    pub(crate) fn with_stream_id(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("stream_id", &self.stream_id)
            .field("tag", &self.tag)
            .field("fmt", &self.fmt)
            .field("payload_len", &self.payload.len())
            .field("src_rank", &self.src_rank)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_scalars() {
        let values = vec![
            Value::Int32(-7),
            Value::UInt32(42),
            Value::Int64(1 << 40),
            Value::Float64(2.5),
        ];
        let pkt = Packet::pack(1, 100, 3, "%d %ud %ld %lf", &values).unwrap();
        assert_eq!(pkt.unpack("%d %ud %ld %lf").unwrap(), values);
        assert_eq!(pkt.src_rank(), 3);
    }

    #[test]
    fn test_pack_unpack_strings_and_arrays() {
        let values = vec![
            Value::Str("hello tree".to_string()),
            Value::ArrayInt32(vec![1, 2, 3]),
            Value::ArrayFloat64(vec![0.5, -0.5]),
        ];
        let pkt = Packet::pack(2, 101, 0, "%s %ad %alf", &values).unwrap();
        assert_eq!(pkt.unpack("%s %ad %alf").unwrap(), values);
    }

    #[test]
    fn test_format_mismatch_is_error() {
        let pkt = Packet::pack(1, 100, 0, "%d", &[Value::Int32(5)]).unwrap();
        assert!(pkt.unpack("%lf").is_err());
        // The packet itself is still intact for a correct request.
        assert_eq!(pkt.unpack("%d").unwrap(), vec![Value::Int32(5)]);
    }

    #[test]
    fn test_arity_mismatch_rejected_at_pack() {
        let err = Packet::pack(1, 100, 0, "%d %d", &[Value::Int32(5)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_type_mismatch_rejected_at_pack() {
        let err = BinaryCodec.pack("%d", &[Value::Str("not an int".into())]);
        assert!(matches!(err, Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    fn test_unknown_token_rejected() {
        assert!(format_tokens("%d %x").is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let pkt = Packet::pack(1, 100, 0, "%ld", &[Value::Int64(9)]).unwrap();
        let short = pkt.payload().slice(0..4);
        assert!(matches!(
            BinaryCodec.unpack("%ld", &short),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_normalize_format() {
        assert_eq!(normalize_format("  %d   %s "), "%d %s");
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Arbor error system.
//!
//! Two layers, following the split used across the crate:
//! - [`NetError`] is the categorized error type. Recovery code inspects its
//!   [`ErrorKind`] to decide what action to take (e.g. a `Disconnected` peer
//!   triggers adoption, a `Topology` error at construction time is fatal).
//! - `anyhow::Error` is used at the application surface; `NetError` converts
//!   into it losslessly and can be recovered with `downcast_ref`.
//!
//! No error crosses the crate boundary as a panic. Every receive path instead
//! reports one of three distinguishable outcomes via [`RecvOutcome`] plus the
//! `Err` arm of the surrounding `Result`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::packet::Packet;

/// Categorizes errors into a fixed set of standard kinds.
///
/// Consumers (the recovery driver, stream dispatch) inspect the kind to decide
/// what action to take, rather than the error defining its own behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Uncategorized or unknown error.
    Unknown,
    /// Failed to establish a connection to a peer.
    CannotConnect,
    /// An established connection was lost unexpectedly.
    Disconnected,
    /// A connection attempt or protocol step timed out.
    Timeout,
    /// Malformed topology specification, duplicate rank, or cycle.
    Topology,
    /// A packet's declared format does not match the caller's unpack request.
    FormatMismatch,
    /// Malformed wire bytes.
    Protocol,
    /// The referenced stream or filter id is unknown.
    NotFound,
    /// The operation targets a stream or network that has shut down.
    Closed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unknown => write!(f, "Unknown"),
            ErrorKind::CannotConnect => write!(f, "CannotConnect"),
            ErrorKind::Disconnected => write!(f, "Disconnected"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Topology => write!(f, "Topology"),
            ErrorKind::FormatMismatch => write!(f, "FormatMismatch"),
            ErrorKind::Protocol => write!(f, "Protocol"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::Closed => write!(f, "Closed"),
        }
    }
}

/// The categorized error type for arbor-net.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct NetError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl NetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Shorthand for an `Unknown` error with just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Walk an `anyhow` error chain and return the first `NetError` kind found.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(net_err) = cause.downcast_ref::<NetError>() {
            return net_err.kind();
        }
    }
    ErrorKind::Unknown
}

/// Outcome of a receive operation on a stream or network.
///
/// Together with the `Err` arm of the surrounding `Result` this forms the
/// three-way contract every caller must branch on: data, closed, error.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A packet was delivered to the caller.
    Delivered(Packet),
    /// The stream (or network) is closed and no more data will arrive.
    Closed,
}

impl RecvOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, RecvOutcome::Closed)
    }

    /// Unwrap the delivered packet, or `None` if closed.
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            RecvOutcome::Delivered(pkt) => Some(pkt),
            RecvOutcome::Closed => None,
        }
    }
}

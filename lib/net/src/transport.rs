// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport collaborator: connect/listen/accept plus framed send/recv of
//! bytes.
//!
//! The network core only ever sees the [`Transport`], [`Listener`], and
//! [`Channel`] traits. [`TcpTransport`] is the production implementation;
//! [`DuplexTransport`] wires peers through in-memory pipes and exists for
//! tests and single-process demos, where it lets a whole tree run without
//! touching the loopback interface.
//!
//! A channel splits into independently owned sink/source halves so one task
//! can drain the write queue while another blocks on reads.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::error::{ErrorKind, NetError};

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Read half of a connection. `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<BytesMut>>;
}

/// A live, framed, bidirectional byte channel to one peer.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    async fn recv(&mut self) -> Result<Option<BytesMut>>;
    /// Split into independently owned halves for the per-peer reader and
    /// writer tasks.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn Channel>>;
}

/// Connection factory collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>>;
    /// Bind a listener; `port` 0 requests an ephemeral port. Returns the
    /// actually bound port.
    async fn listen(&self, host: &str, port: u16) -> Result<(u16, Box<dyn Listener>)>;
}

// ============================================================================
// Framed channel over any AsyncRead + AsyncWrite
// ============================================================================

struct FramedChannel<T> {
    framed: Framed<T, FrameCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> FramedChannel<T> {
    fn new(io: T, max_frame_bytes: usize) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_frame_bytes)),
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Channel for FramedChannel<T> {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| NetError::with_source(ErrorKind::Disconnected, "send failed", e).into())
    }

    async fn recv(&mut self) -> Result<Option<BytesMut>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                Err(NetError::with_source(ErrorKind::Disconnected, "recv failed", e).into())
            }
            None => Ok(None),
        }
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, source) = self.framed.split();
        (
            Box::new(FramedSink { sink }),
            Box::new(FramedSource { source }),
        )
    }
}

struct FramedSink<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Bytes>,
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> FrameSink for FramedSink<T> {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink
            .send(frame)
            .await
            .map_err(|e| NetError::with_source(ErrorKind::Disconnected, "send failed", e).into())
    }

    async fn flush(&mut self) -> Result<()> {
        self.sink
            .flush()
            .await
            .map_err(|e| NetError::with_source(ErrorKind::Disconnected, "flush failed", e).into())
    }
}

struct FramedSource<T> {
    source: SplitStream<Framed<T, FrameCodec>>,
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> FrameSource for FramedSource<T> {
    async fn recv(&mut self) -> Result<Option<BytesMut>> {
        match self.source.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                Err(NetError::with_source(ErrorKind::Disconnected, "recv failed", e).into())
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// TCP transport
// ============================================================================

/// TCP implementation of the transport collaborator.
pub struct TcpTransport {
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            connect_timeout,
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                NetError::new(ErrorKind::Timeout, format!("connect to {addr} timed out"))
            })?
            .map_err(|e| {
                NetError::with_source(ErrorKind::CannotConnect, format!("connect to {addr}"), e)
            })?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(FramedChannel::new(stream, self.max_frame_bytes)))
    }

    async fn listen(&self, host: &str, port: u16) -> Result<(u16, Box<dyn Listener>)> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let bound = listener.local_addr()?.port();
        Ok((
            bound,
            Box::new(TcpChannelListener {
                listener,
                max_frame_bytes: self.max_frame_bytes,
            }),
        ))
    }
}

struct TcpChannelListener {
    listener: TcpListener,
    max_frame_bytes: usize,
}

#[async_trait]
impl Listener for TcpChannelListener {
    async fn accept(&mut self) -> Result<Box<dyn Channel>> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::trace!(%peer, "accepted connection");
        stream.set_nodelay(true).ok();
        Ok(Box::new(FramedChannel::new(stream, self.max_frame_bytes)))
    }
}

// ============================================================================
// In-memory duplex transport
// ============================================================================

const DUPLEX_BUFFER: usize = 256 * 1024;

/// In-memory transport: every `connect` creates a duplex pipe and pushes the
/// far end to whoever is listening on `(host, port)`. Clones share the same
/// namespace, so one instance must be handed to every node of a tree.
#[derive(Clone, Default)]
pub struct DuplexTransport {
    inner: Arc<DuplexInner>,
}

struct DuplexInner {
    listeners: DashMap<(String, u16), mpsc::UnboundedSender<DuplexStream>>,
    next_port: AtomicU16,
    max_frame_bytes: usize,
}

impl Default for DuplexInner {
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
            next_port: AtomicU16::new(40_000),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl DuplexTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>> {
        let key = (host.to_string(), port);
        let sender = self
            .inner
            .listeners
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                NetError::new(
                    ErrorKind::CannotConnect,
                    format!("no listener at {host}:{port}"),
                )
            })?;
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        sender.send(far).map_err(|_| {
            NetError::new(
                ErrorKind::CannotConnect,
                format!("listener at {host}:{port} is gone"),
            )
        })?;
        Ok(Box::new(FramedChannel::new(
            near,
            self.inner.max_frame_bytes,
        )))
    }

    async fn listen(&self, host: &str, port: u16) -> Result<(u16, Box<dyn Listener>)> {
        let port = if port == 0 {
            self.inner.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.insert((host.to_string(), port), tx);
        Ok((
            port,
            Box::new(DuplexListener {
                rx,
                max_frame_bytes: self.inner.max_frame_bytes,
            }),
        ))
    }
}

struct DuplexListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    max_frame_bytes: usize,
}

#[async_trait]
impl Listener for DuplexListener {
    async fn accept(&mut self) -> Result<Box<dyn Channel>> {
        let io = self
            .rx
            .recv()
            .await
            .ok_or_else(|| NetError::new(ErrorKind::Closed, "duplex listener closed"))?;
        Ok(Box::new(FramedChannel::new(io, self.max_frame_bytes)))
    }
}

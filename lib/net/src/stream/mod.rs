// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Streams: named multicast/reduction channels over a subset of tree members.
//!
//! [`StreamState`] is the per-node shared state the network dispatches into:
//! membership, the three filter slots, the upstream round buffer, and the
//! delivered queue the application drains. [`Stream`] is the cloneable
//! application handle wrapping it; sends go back through the owning network
//! via the [`StreamRouter`] seam so this module never depends on dispatch
//! internals.
//!
//! `recv` has three distinguishable outcomes: a packet, `Closed` (the stream
//! will never produce data again), or an error on the `Result`. Blocking,
//! non-blocking, and readiness-watch flavors are all provided; closing a
//! stream wakes every blocked receiver.

mod sync;

pub use sync::{PushResult, RoundBuffer, SyncPolicy};

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::RecvOutcome;
use crate::filter::{Filter, FilterContext, FilterOutput};
use crate::packet::{Packet, Value};
use crate::topology::Rank;

/// How the owning network carries out a stream handle's requests.
#[async_trait]
pub(crate) trait StreamRouter: Send + Sync {
    fn local_rank(&self) -> Rank;
    /// Inject a locally originated packet into the flow (down at the
    /// front-end, up at a back-end).
    async fn send_local(&self, packet: Packet) -> Result<()>;
    /// Drain every peer's write queue.
    async fn flush_peers(&self) -> Result<()>;
    /// The local member is done sending on this stream.
    async fn close_stream(&self, stream_id: u32) -> Result<()>;
}

/// Per-node state of one stream.
pub(crate) struct StreamState {
    pub id: u32,
    pub sync_policy: SyncPolicy,
    pub up_filter_id: u16,
    pub down_filter_id: u16,
    /// Global membership (back-end ranks). Shrinks as members close or fail.
    pub members: Mutex<BTreeSet<Rank>>,
    pub up_filter: Mutex<Box<dyn Filter>>,
    pub down_filter: Mutex<Box<dyn Filter>>,
    /// Upstream per-source round buffer (sources are direct children).
    pub up_buffer: Mutex<RoundBuffer>,
    /// Packets ready for the local application.
    delivered: Mutex<VecDeque<Packet>>,
    closed: AtomicBool,
    notify: Notify,
    readable_tx: watch::Sender<bool>,
}

impl StreamState {
    pub fn new(
        id: u32,
        sync_policy: SyncPolicy,
        up_filter_id: u16,
        up_filter: Box<dyn Filter>,
        down_filter_id: u16,
        down_filter: Box<dyn Filter>,
        members: BTreeSet<Rank>,
        expected: BTreeSet<Rank>,
    ) -> Self {
        let (readable_tx, _) = watch::channel(false);
        Self {
            id,
            sync_policy,
            up_filter_id,
            down_filter_id,
            members: Mutex::new(members),
            up_filter: Mutex::new(up_filter),
            down_filter: Mutex::new(down_filter),
            up_buffer: Mutex::new(RoundBuffer::new(sync_policy, expected)),
            delivered: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            readable_tx,
        }
    }

    /// Queue a packet for the local application and wake receivers.
    pub fn deliver(&self, packet: Packet) {
        self.delivered.lock().push_back(packet);
        let _ = self.readable_tx.send(true);
        self.notify.notify_waiters();
    }

    pub fn pop(&self) -> Option<Packet> {
        let mut delivered = self.delivered.lock();
        let pkt = delivered.pop_front();
        if delivered.is_empty() && !self.is_closed() {
            let _ = self.readable_tx.send(false);
        }
        pkt
    }

    /// Mark closed and wake everyone blocked on this stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.readable_tx.send(true);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run the upstream filter over one released round.
    pub fn run_up_filter(&self, round: Vec<Packet>, ctx: &FilterContext) -> Result<FilterOutput> {
        self.up_filter.lock().filter(round, ctx)
    }

    /// Run the downstream filter over one packet heading toward the leaves.
    pub fn run_down_filter(&self, packet: Packet, ctx: &FilterContext) -> Result<FilterOutput> {
        self.down_filter.lock().filter(vec![packet], ctx)
    }

    fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.readable_tx.subscribe()
    }
}

/// Application handle to one stream. Cheap to clone.
#[derive(Clone)]
pub struct Stream {
    state: Arc<StreamState>,
    router: Arc<dyn StreamRouter>,
}

impl Stream {
    pub(crate) fn new(state: Arc<StreamState>, router: Arc<dyn StreamRouter>) -> Self {
        Self { state, router }
    }

    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.state.sync_policy
    }

    /// Filter id resolved for the upstream (reduction) slot at this node.
    pub fn up_filter_id(&self) -> u16 {
        self.state.up_filter_id
    }

    /// Filter id resolved for the downstream (multicast) slot at this node.
    pub fn down_filter_id(&self) -> u16 {
        self.state.down_filter_id
    }

    /// Current global membership (back-end ranks).
    pub fn members(&self) -> BTreeSet<Rank> {
        self.state.members.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Pack typed values and send them along the stream: multicast toward the
    /// members from the front-end, reduction toward the root from a back-end.
    pub async fn send(&self, tag: i32, fmt: &str, values: &[Value]) -> Result<()> {
        let packet = Packet::pack(self.state.id, tag, self.router.local_rank(), fmt, values)?;
        self.send_packet(packet).await
    }

    /// Send a pre-built packet (its stream id is rewritten to this stream).
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        if self.state.is_closed() {
            anyhow::bail!("stream {} is closed", self.state.id);
        }
        self.router.send_local(packet.with_stream_id(self.state.id)).await
    }

    /// Block until outbound packets have been handed to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.router.flush_peers().await
    }

    /// Blocking receive. Returns `Closed` once the stream can produce no
    /// more data; wakes immediately if the stream is already closed.
    pub async fn recv(&self) -> Result<RecvOutcome> {
        loop {
            let notified = self.state.notified();
            if let Some(pkt) = self.state.pop() {
                return Ok(RecvOutcome::Delivered(pkt));
            }
            if self.state.is_closed() {
                return Ok(RecvOutcome::Closed);
            }
            notified.await;
        }
    }

    /// Non-blocking receive: `None` means no data right now.
    pub fn try_recv(&self) -> Result<Option<RecvOutcome>> {
        if let Some(pkt) = self.state.pop() {
            return Ok(Some(RecvOutcome::Delivered(pkt)));
        }
        if self.state.is_closed() {
            return Ok(Some(RecvOutcome::Closed));
        }
        Ok(None)
    }

    /// Pollable readiness handle: `true` whenever data is waiting or the
    /// stream has closed, so callers can multiplex waiting across several
    /// streams with `tokio::select!`.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.state.readiness()
    }

    /// Stop sending on this stream. The close propagates toward the root;
    /// once every member has closed, receivers everywhere observe `Closed`.
    pub async fn close(&self) -> Result<()> {
        self.router.close_stream(self.state.id).await
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.state.id)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::IdentityFilter;

    struct NoopRouter;

    #[async_trait]
    impl StreamRouter for NoopRouter {
        fn local_rank(&self) -> Rank {
            0
        }
        async fn send_local(&self, _packet: Packet) -> Result<()> {
            Ok(())
        }
        async fn flush_peers(&self) -> Result<()> {
            Ok(())
        }
        async fn close_stream(&self, _stream_id: u32) -> Result<()> {
            Ok(())
        }
    }

    fn state() -> Arc<StreamState> {
        Arc::new(StreamState::new(
            1,
            SyncPolicy::WaitForAll,
            crate::filter::FILTER_IDENTITY,
            Box::<IdentityFilter>::default(),
            crate::filter::FILTER_IDENTITY,
            Box::<IdentityFilter>::default(),
            BTreeSet::from([2, 3]),
            BTreeSet::new(),
        ))
    }

    fn stream(state: &Arc<StreamState>) -> Stream {
        Stream::new(state.clone(), Arc::new(NoopRouter))
    }

    fn pkt(v: i32) -> Packet {
        Packet::pack(1, 100, 2, "%d", &[Value::Int32(v)]).unwrap()
    }

    #[test]
    fn test_resolved_filter_ids_exposed() {
        let state = state();
        let s = stream(&state);
        assert_eq!(s.up_filter_id(), crate::filter::FILTER_IDENTITY);
        assert_eq!(s.down_filter_id(), crate::filter::FILTER_IDENTITY);
    }

    #[tokio::test]
    async fn test_recv_returns_delivered_in_order() {
        let state = state();
        let s = stream(&state);
        state.deliver(pkt(1));
        state.deliver(pkt(2));
        let a = s.recv().await.unwrap().into_packet().unwrap();
        let b = s.recv().await.unwrap().into_packet().unwrap();
        assert_eq!(a.unpack("%d").unwrap()[0], Value::Int32(1));
        assert_eq!(b.unpack("%d").unwrap()[0], Value::Int32(2));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_deliver() {
        let state = state();
        let s = stream(&state);
        let state2 = state.clone();
        let waiter = tokio::spawn(async move { s.recv().await });
        tokio::task::yield_now().await;
        state2.deliver(pkt(7));
        let got = waiter.await.unwrap().unwrap();
        assert!(!got.is_closed());
    }

    #[tokio::test]
    async fn test_recv_on_closed_stream_returns_closed_immediately() {
        let state = state();
        let s = stream(&state);
        state.close();
        let outcome = s.recv().await.unwrap();
        assert!(outcome.is_closed());
        // And stays closed.
        assert!(s.recv().await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_buffered_data_first() {
        let state = state();
        let s = stream(&state);
        state.deliver(pkt(5));
        state.close();
        let first = s.recv().await.unwrap();
        assert!(!first.is_closed());
        assert!(s.recv().await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let state = state();
        let s = stream(&state);
        let state2 = state.clone();
        let waiter = tokio::spawn(async move { s.recv().await });
        tokio::task::yield_now().await;
        state2.close();
        assert!(waiter.await.unwrap().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_try_recv_three_way() {
        let state = state();
        let s = stream(&state);
        assert!(s.try_recv().unwrap().is_none());
        state.deliver(pkt(1));
        assert!(matches!(
            s.try_recv().unwrap(),
            Some(RecvOutcome::Delivered(_))
        ));
        state.close();
        assert!(matches!(s.try_recv().unwrap(), Some(RecvOutcome::Closed)));
    }

    #[tokio::test]
    async fn test_readiness_watch_tracks_data_and_close() {
        let state = state();
        let s = stream(&state);
        let mut readiness = s.readiness();
        assert!(!*readiness.borrow());

        state.deliver(pkt(1));
        readiness.changed().await.unwrap();
        assert!(*readiness.borrow());

        s.try_recv().unwrap();
        assert!(!*readiness.borrow_and_update());

        state.close();
        readiness.changed().await.unwrap();
        assert!(*readiness.borrow());
    }

    #[tokio::test]
    async fn test_send_on_closed_stream_errors() {
        let state = state();
        let s = stream(&state);
        state.close();
        assert!(s.send(100, "%d", &[Value::Int32(1)]).await.is_err());
    }
}

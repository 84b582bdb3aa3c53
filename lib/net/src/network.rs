// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The network coordinator: one [`Network`] instance per tree endpoint.
//!
//! A network is created in one of three roles. The front-end owns the tree:
//! it parses the topology specification, launches its children through the
//! [`ProcessLauncher`] collaborator, and is the only place streams are
//! created. Internal nodes route and aggregate; back-ends are the leaves the
//! application sends and receives on.
//!
//! Per peer connection there are two tasks: a writer draining an unbounded
//! command queue into the framed sink, and a reader dispatching inbound
//! frames. Dispatch direction is positional: packets from the parent flow
//! down (multicast), packets from a child flow up (reduction). Control
//! messages ride stream id 0 with system tags and are handled before any
//! stream lookup.
//!
//! Failure handling: losing a child removes it from the tree and floods the
//! removal; losing the parent orphans this node's whole subtree and starts
//! the adoption loop (`topology::adoption`), bounded by
//! `max_adoption_attempts` before the subtree is declared permanently failed.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::{
    decode_packet, encode_packet, is_system_tag, ControlMessage, TopologyUpdate, UpdateKind,
    CONTROL_STREAM_ID,
};
use crate::config::NetworkConfig;
use crate::error::{ErrorKind, NetError};
use crate::events::{TopologyEvent, EVENT_CAPACITY};
use crate::filter::{resolve_assignment, FilterContext, FilterFactory, FilterLoader, FilterRegistry};
use crate::launch::{LaunchSpec, ProcessLauncher};
use crate::packet::Packet;
use crate::stream::{Stream, StreamRouter, StreamState, SyncPolicy};
use crate::topology::{FanoutStats, Rank, Topology};
use crate::transport::{Channel, FrameSink, FrameSource, Listener, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    FrontEnd,
    Internal,
    BackEnd,
}

/// Outcome of [`Network::recv`]: a packet on some stream, or network closure.
#[derive(Debug)]
pub enum NetworkRecv {
    Delivered { stream: Stream, packet: Packet },
    Closed,
}

enum PeerCommand {
    Frame(Bytes),
    Flush(oneshot::Sender<()>),
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
}

/// Handle to one tree endpoint. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

pub(crate) struct NetworkInner {
    role: Role,
    local_rank: Rank,
    listen_port: u16,
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    loader: RwLock<Option<Arc<dyn FilterLoader>>>,
    registry: FilterRegistry,
    topology: Mutex<Topology>,
    streams: DashMap<u32, Arc<StreamState>>,
    peers: Mutex<HashMap<Rank, PeerHandle>>,
    parent: Mutex<Option<Rank>>,
    next_stream_id: AtomicU32,
    events_tx: broadcast::Sender<TopologyEvent>,
    cancel: CancellationToken,
    recovery_enabled: AtomicBool,
    /// Stream ids with freshly delivered packets, feeding [`Network::recv`].
    ready_tx: mpsc::UnboundedSender<u32>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u32>>,
    /// Bumped on every attach and shutdown acknowledgement; waiters poll
    /// their own predicate against it.
    progress: watch::Sender<u64>,
    pending_shutdown_acks: Mutex<BTreeSet<Rank>>,
    shutdown_done: AtomicBool,
}

impl Network {
    /// Instantiate the tree: bind the root endpoint, launch the children
    /// named in the topology specification, wait for them to attach, and
    /// push the final topology down to every node.
    pub async fn front_end(
        topology_spec: &str,
        transport: Arc<dyn Transport>,
        launcher: Arc<dyn ProcessLauncher>,
        config: NetworkConfig,
    ) -> Result<Self> {
        let mut topology = Topology::from_spec(topology_spec)?;
        let root = topology.root();
        let root_host = topology.root_node().hostname().to_string();
        let spec_port = topology.root_node().port();

        let (port, listener) = transport.listen(&root_host, spec_port).await?;
        if port != spec_port {
            topology.apply_update(&TopologyUpdate {
                kind: UpdateKind::ChangePort,
                rank: root,
                parent_rank: root,
                host: String::new(),
                port,
            })?;
        }

        let children: Vec<Rank> = topology.root_node().children().iter().copied().collect();
        let launches = child_launch_specs(&topology, root, &root_host, port);

        let inner = NetworkInner::new(
            Role::FrontEnd,
            root,
            port,
            topology,
            transport,
            None,
            config,
        );
        inner.spawn_accept_loop(listener);

        for spec in launches {
            launcher.launch(spec).await?;
        }
        inner.wait_for_children(&children).await?;

        // Until now every node only saw the slice of the tree it was launched
        // with; give everyone the complete view, final ports included.
        let sync = ControlMessage::TopologySync {
            topology: inner.topology.lock().serialize(),
        };
        inner.send_down(sync);

        tracing::info!(
            rank = root,
            port,
            nodes = inner.topology.lock().node_count(),
            "front-end is up"
        );
        Ok(Self { inner })
    }

    /// Instantiate an internal routing node from the subtree it is
    /// responsible for. Children are launched and awaited before this node
    /// attaches upward, so a parent's attach always carries a live subtree.
    pub async fn internal(
        subtree_spec: &str,
        parent_host: &str,
        parent_port: u16,
        transport: Arc<dyn Transport>,
        launcher: Arc<dyn ProcessLauncher>,
        filter_loader: Option<Arc<dyn FilterLoader>>,
        config: NetworkConfig,
    ) -> Result<Self> {
        let mut topology = Topology::from_spec(subtree_spec)?;
        let local = topology.root();
        let local_host = topology.root_node().hostname().to_string();
        let spec_port = topology.root_node().port();

        let (port, listener) = transport.listen(&local_host, spec_port).await?;
        if port != spec_port {
            topology.apply_update(&TopologyUpdate {
                kind: UpdateKind::ChangePort,
                rank: local,
                parent_rank: local,
                host: String::new(),
                port,
            })?;
        }

        let children: Vec<Rank> = topology.root_node().children().iter().copied().collect();
        let launches = child_launch_specs(&topology, local, &local_host, port);

        let inner = NetworkInner::new(
            Role::Internal,
            local,
            port,
            topology,
            transport,
            filter_loader,
            config,
        );
        inner.spawn_accept_loop(listener);

        for spec in launches {
            launcher.launch(spec).await?;
        }
        inner.wait_for_children(&children).await?;
        inner.attach_to_parent(parent_host, parent_port).await?;

        tracing::info!(rank = local, port, "internal node is up");
        Ok(Self { inner })
    }

    /// Instantiate a leaf endpoint and attach it to its parent.
    pub async fn back_end(
        host: &str,
        rank: Rank,
        parent_host: &str,
        parent_port: u16,
        transport: Arc<dyn Transport>,
        filter_loader: Option<Arc<dyn FilterLoader>>,
        config: NetworkConfig,
    ) -> Result<Self> {
        let topology = Topology::new_root(host, 0, rank);
        let inner = NetworkInner::new(
            Role::BackEnd,
            rank,
            0,
            topology,
            transport,
            filter_loader,
            config,
        );
        inner.attach_to_parent(parent_host, parent_port).await?;
        tracing::info!(rank, "back-end is up");
        Ok(Self { inner })
    }

    pub fn local_rank(&self) -> Rank {
        self.inner.local_rank
    }

    pub fn is_front_end(&self) -> bool {
        self.inner.role == Role::FrontEnd
    }

    pub fn is_back_end(&self) -> bool {
        self.inner.role == Role::BackEnd
    }

    /// Snapshot of this node's current view of the tree.
    pub fn topology(&self) -> Topology {
        self.inner.topology.lock().clone()
    }

    pub fn fanout_stats(&self) -> FanoutStats {
        self.inner.topology.lock().fanout_stats()
    }

    /// Subscribe to topology and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Enable or disable automatic adoption on parent loss. With recovery
    /// off, losing the parent permanently fails this node's subtree.
    pub fn set_recovery(&self, enabled: bool) {
        self.inner.recovery_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Install the collaborator that resolves dynamically loaded filters.
    pub fn set_filter_loader(&self, loader: Arc<dyn FilterLoader>) {
        *self.inner.loader.write() = Some(loader);
    }

    /// Register a filter factory locally, allocating a fresh id. The filter
    /// only runs at this node; combine with a rank-targeted assignment.
    pub fn register_filter(&self, factory: FilterFactory) -> u16 {
        self.inner.registry.register_user(factory)
    }

    /// Resolve a named filter from an artifact via the installed loader,
    /// register it, and tell every node in the tree to do the same.
    /// Front-end only.
    pub async fn load_filter(&self, artifact: &str, name: &str) -> Result<u16> {
        self.inner.require_front_end("load_filter")?;
        let loader = self.inner.loader.read().clone().ok_or_else(|| {
            NetError::new(ErrorKind::NotFound, "no filter loader installed")
        })?;
        let factory = loader.load(artifact, name)?;
        let filter_id = self.inner.registry.register_user(factory);
        self.inner.send_down(ControlMessage::FilterLoad {
            filter_id,
            artifact: artifact.to_string(),
            name: name.to_string(),
        });
        Ok(filter_id)
    }

    /// Create a stream over `members` (empty slice selects every live
    /// back-end) with one filter id per direction. Front-end only.
    pub async fn new_stream(
        &self,
        members: &[Rank],
        up_filter: u16,
        sync_policy: SyncPolicy,
        down_filter: u16,
    ) -> Result<Stream> {
        self.new_stream_with_assignments(
            members,
            &up_filter.to_string(),
            sync_policy,
            &down_filter.to_string(),
        )
        .await
    }

    /// Create a stream with heterogeneous filter assignments
    /// (`"<filter_id> => <rank_list> ; ..."`); each node resolves the
    /// assignment against its own rank when it installs the stream.
    pub async fn new_stream_with_assignments(
        &self,
        members: &[Rank],
        up_filter: &str,
        sync_policy: SyncPolicy,
        down_filter: &str,
    ) -> Result<Stream> {
        let inner = &self.inner;
        inner.require_front_end("new_stream")?;

        let member_vec: Vec<Rank> = if members.is_empty() {
            inner.topology.lock().live_backends().into_iter().collect()
        } else {
            let topo = inner.topology.lock();
            for m in members {
                if !topo.backend_nodes().contains(m) {
                    return Err(NetError::new(
                        ErrorKind::NotFound,
                        format!("rank {m} is not a back-end"),
                    )
                    .into());
                }
            }
            members.to_vec()
        };
        if member_vec.is_empty() {
            return Err(NetError::new(ErrorKind::Topology, "stream has no members").into());
        }

        let stream_id = inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let state = inner.install_stream(
            stream_id,
            &member_vec,
            up_filter,
            sync_policy,
            down_filter,
        )?;

        let announce = ControlMessage::NewStream {
            stream_id,
            members: member_vec,
            up_filter: up_filter.to_string(),
            sync_policy,
            down_filter: down_filter.to_string(),
        };
        let pkt = announce.into_packet(inner.local_rank)?;
        let member_set = state.members.lock().clone();
        inner.forward_covering(&pkt, &member_set);

        tracing::debug!(stream_id, "stream created");
        Ok(Stream::new(state, inner.clone()))
    }

    /// Look up an existing stream by id.
    pub fn stream(&self, stream_id: u32) -> Option<Stream> {
        self.inner
            .stream_state(stream_id)
            .map(|state| Stream::new(state, self.inner.clone()))
    }

    /// Wait for the next packet on any stream at this node. Returns `Closed`
    /// once the network has shut down. Only one caller at a time drains this
    /// queue; per-stream ordering is preserved.
    pub async fn recv(&self) -> Result<NetworkRecv> {
        let mut ready = self.inner.ready_rx.lock().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(NetworkRecv::Closed),
                id = ready.recv() => {
                    let Some(id) = id else { return Ok(NetworkRecv::Closed) };
                    let Some(state) = self.inner.stream_state(id) else { continue };
                    // A concurrent stream-scoped recv may have raced us to
                    // the packet; just move on.
                    if let Some(packet) = state.pop() {
                        let stream = Stream::new(state, self.inner.clone());
                        return Ok(NetworkRecv::Delivered { stream, packet });
                    }
                    if state.is_closed() {
                        // Closed and drained; nothing more can arrive, so
                        // the state can finally leave the registry.
                        self.inner.streams.remove(&id);
                    }
                }
            }
        }
    }

    /// Orderly tree-wide shutdown. The front-end floods a shutdown request
    /// and waits (bounded by `shutdown_timeout`) for every subtree to
    /// acknowledge; on any other node this tears down the local endpoint.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.role == Role::FrontEnd {
            let children = inner.child_peers();
            if !children.is_empty() {
                *inner.pending_shutdown_acks.lock() = children.iter().copied().collect();
                for child in &children {
                    inner.send_control_to(*child, ControlMessage::Shutdown);
                }
                let mut progress = inner.progress.subscribe();
                let acked = progress
                    .wait_for(|_| inner.pending_shutdown_acks.lock().is_empty());
                if tokio::time::timeout(inner.config.shutdown_timeout, acked)
                    .await
                    .is_err()
                {
                    tracing::warn!("shutdown acknowledgements timed out; tearing down anyway");
                }
            }
        }
        inner.finish_shutdown();
        Ok(())
    }

    /// Tear down immediately: no handshake, no acknowledgements. Peers
    /// observe an abrupt disconnect, exactly as if this endpoint crashed.
    pub fn abort(&self) {
        self.inner.shutdown_done.store(true, Ordering::SeqCst);
        self.inner.peers.lock().clear();
        self.inner.close_all_streams();
        self.inner.cancel.cancel();
    }

    /// Resolves once the network has shut down (orderly or not).
    pub async fn wait_shutdown(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("role", &self.inner.role)
            .field("rank", &self.inner.local_rank)
            .field("streams", &self.inner.streams.len())
            .finish()
    }
}

/// Launch specs for every direct child of `parent` in `topology`.
fn child_launch_specs(
    topology: &Topology,
    parent: Rank,
    parent_host: &str,
    parent_port: u16,
) -> Vec<LaunchSpec> {
    topology
        .find_node(parent)
        .map(|node| {
            node.children()
                .iter()
                .map(|child| {
                    let child_node = topology.find_node(*child).expect("child exists");
                    LaunchSpec {
                        rank: *child,
                        host: child_node.hostname().to_string(),
                        parent_host: parent_host.to_string(),
                        parent_port,
                        subtree: topology
                            .serialize_subtree(*child)
                            .expect("child exists"),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

impl NetworkInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        local_rank: Rank,
        listen_port: u16,
        topology: Topology,
        transport: Arc<dyn Transport>,
        filter_loader: Option<Arc<dyn FilterLoader>>,
        config: NetworkConfig,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (progress, _) = watch::channel(0u64);
        Arc::new(Self {
            role,
            local_rank,
            listen_port,
            recovery_enabled: AtomicBool::new(config.recovery_enabled),
            config,
            transport,
            loader: RwLock::new(filter_loader),
            registry: FilterRegistry::new(),
            topology: Mutex::new(topology),
            streams: DashMap::new(),
            peers: Mutex::new(HashMap::new()),
            parent: Mutex::new(None),
            next_stream_id: AtomicU32::new(CONTROL_STREAM_ID + 1),
            events_tx,
            cancel: CancellationToken::new(),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            progress,
            pending_shutdown_acks: Mutex::new(BTreeSet::new()),
            shutdown_done: AtomicBool::new(false),
        })
    }

    fn require_front_end(&self, operation: &str) -> Result<()> {
        if self.role != Role::FrontEnd {
            return Err(NetError::new(
                ErrorKind::Protocol,
                format!("{operation} is a front-end operation"),
            )
            .into());
        }
        Ok(())
    }

    fn stream_state(&self, stream_id: u32) -> Option<Arc<StreamState>> {
        self.streams.get(&stream_id).map(|e| e.value().clone())
    }

    fn emit(&self, event: TopologyEvent) {
        let _ = self.events_tx.send(event);
    }

    fn bump_progress(&self) {
        self.progress.send_modify(|v| *v += 1);
    }

    fn close_all_streams(&self) {
        for entry in self.streams.iter() {
            entry.value().close();
        }
    }

    fn child_peers(&self) -> Vec<Rank> {
        let parent = *self.parent.lock();
        self.peers
            .lock()
            .keys()
            .copied()
            .filter(|r| Some(*r) != parent)
            .collect()
    }

    fn filter_context(&self) -> FilterContext {
        let topo = self.topology.lock();
        FilterContext {
            rank: self.local_rank,
            num_children: topo
                .find_node(self.local_rank)
                .map(|n| n.fanout())
                .unwrap_or(0),
            num_descendants: topo.descendants(self.local_rank).len(),
        }
    }

    /// Direct children whose subtrees contain at least one of `members`.
    fn covering_children(&self, members: &BTreeSet<Rank>) -> Vec<Rank> {
        let topo = self.topology.lock();
        topo.find_node(self.local_rank)
            .map(|node| {
                node.children()
                    .iter()
                    .copied()
                    .filter(|c| members.iter().any(|m| topo.subtree_contains(*c, *m)))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    fn send_frame(&self, rank: Rank, frame: Bytes) {
        let sent = self
            .peers
            .lock()
            .get(&rank)
            .map(|h| h.tx.send(PeerCommand::Frame(frame)).is_ok())
            .unwrap_or(false);
        if !sent {
            tracing::debug!(peer = rank, "dropping frame for unavailable peer");
        }
    }

    fn send_to_peer(&self, rank: Rank, pkt: &Packet) {
        self.send_frame(rank, encode_packet(pkt));
    }

    fn send_to_parent(&self, pkt: Packet) {
        match *self.parent.lock() {
            Some(parent) => self.send_to_peer(parent, &pkt),
            // Mid-recovery there is nowhere to send; upstream traffic is
            // dropped until adoption completes.
            None => tracing::debug!(
                stream_id = pkt.stream_id(),
                "no parent; dropping upstream packet"
            ),
        }
    }

    fn send_control_to(&self, rank: Rank, msg: ControlMessage) {
        match msg.into_packet(self.local_rank) {
            Ok(pkt) => self.send_to_peer(rank, &pkt),
            Err(e) => tracing::warn!(error = %e, "failed to encode control message"),
        }
    }

    /// Send a control message to every peer except `except`.
    fn flood(&self, msg: ControlMessage, except: Option<Rank>) {
        let frame = match msg.into_packet(self.local_rank) {
            Ok(pkt) => encode_packet(&pkt),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode control message");
                return;
            }
        };
        let peers = self.peers.lock();
        for (rank, handle) in peers.iter() {
            if Some(*rank) == except {
                continue;
            }
            let _ = handle.tx.send(PeerCommand::Frame(frame.clone()));
        }
    }

    /// Send a control message toward the leaves only.
    fn send_down(&self, msg: ControlMessage) {
        let parent = *self.parent.lock();
        match msg.into_packet(self.local_rank) {
            Ok(pkt) => self.send_down_pkt(&pkt, parent),
            Err(e) => tracing::warn!(error = %e, "failed to encode control message"),
        }
    }

    fn send_down_pkt(&self, pkt: &Packet, parent: Option<Rank>) {
        let frame = encode_packet(pkt);
        let peers = self.peers.lock();
        for (rank, handle) in peers.iter() {
            if Some(*rank) == parent {
                continue;
            }
            let _ = handle.tx.send(PeerCommand::Frame(frame.clone()));
        }
    }

    /// Forward a packet to the children covering `members`.
    fn forward_covering(&self, pkt: &Packet, members: &BTreeSet<Rank>) {
        for child in self.covering_children(members) {
            self.send_to_peer(child, pkt);
        }
    }

    fn deliver_local(&self, state: &Arc<StreamState>, pkt: Packet) {
        state.deliver(pkt);
        let _ = self.ready_tx.send(state.id);
    }

    // ------------------------------------------------------------------
    // Connection establishment
    // ------------------------------------------------------------------

    fn spawn_accept_loop(self: &Arc<Self>, mut listener: Box<dyn Listener>) {
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(channel) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                if let Err(e) = inner.handle_attach(channel).await {
                                    tracing::warn!(error = %e, "inbound attach failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed; listener closed");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// First-frame handshake on an inbound connection. A known rank is being
    /// re-parented under us (startup child, or an orphan we are adopting); an
    /// unknown rank joins with its whole subtree.
    async fn handle_attach(self: &Arc<Self>, mut channel: Box<dyn Channel>) -> Result<()> {
        let frame = tokio::time::timeout(self.config.connect_timeout, channel.recv())
            .await
            .map_err(|_| NetError::new(ErrorKind::Timeout, "attach timed out"))??
            .ok_or_else(|| NetError::new(ErrorKind::Disconnected, "peer closed during attach"))?;
        let pkt = decode_packet(frame)?;
        let msg = ControlMessage::from_packet(&pkt)?;
        let (rank, is_backend, listen_port, subtree) = match msg {
            ControlMessage::Attach {
                rank,
                is_backend,
                listen_port,
                subtree,
            } => (rank, is_backend, listen_port, subtree),
            // A subtree with no live link left reports its own removal over
            // a one-shot connection instead of attaching.
            ControlMessage::TopologyUpdates { updates } => {
                tracing::info!(
                    src = pkt.src_rank(),
                    updates = updates.len(),
                    "removal report over a fresh connection"
                );
                self.apply_and_flood(updates, None).await;
                return Ok(());
            }
            other => {
                return Err(NetError::new(
                    ErrorKind::Protocol,
                    format!("expected attach, got control tag {}", other.tag()),
                )
                .into());
            }
        };

        let mut updates = Vec::new();
        let mut events = Vec::new();
        {
            let mut topo = self.topology.lock();
            if topo.contains(rank) {
                let previous_parent = topo.find_node(rank).and_then(|n| n.parent());
                topo.set_parent(rank, self.local_rank)?;
                if previous_parent != Some(self.local_rank) {
                    updates.push(TopologyUpdate {
                        kind: UpdateKind::ChangeParent,
                        rank,
                        parent_rank: self.local_rank,
                        host: String::new(),
                        port: listen_port,
                    });
                    events.push(TopologyEvent::ParentChanged {
                        rank,
                        new_parent: self.local_rank,
                    });
                }
                if listen_port != 0
                    && topo.find_node(rank).map(|n| n.port()) != Some(listen_port)
                {
                    updates.push(TopologyUpdate {
                        kind: UpdateKind::ChangePort,
                        rank,
                        parent_rank: self.local_rank,
                        host: String::new(),
                        port: listen_port,
                    });
                    topo.apply_update(updates.last().expect("just pushed"))?;
                }
            } else {
                let inserted = topo.add_subgraph(self.local_rank, &subtree)?;
                for r in inserted {
                    let node = topo.find_node(r).expect("just inserted");
                    let node_is_backend = node.is_backend();
                    // The attaching node reports its own role; descendants
                    // are classified by subtree shape.
                    let backend = if r == rank { is_backend } else { node_is_backend };
                    updates.push(TopologyUpdate {
                        kind: if backend {
                            UpdateKind::NewBackend
                        } else {
                            UpdateKind::NewInternal
                        },
                        rank: r,
                        parent_rank: node.parent().unwrap_or(self.local_rank),
                        host: node.hostname().to_string(),
                        port: if r == rank { listen_port } else { node.port() },
                    });
                    events.push(if backend {
                        TopologyEvent::BackendAdded { rank: r }
                    } else {
                        TopologyEvent::InternalAdded { rank: r }
                    });
                }
            }
        }

        let ack = ControlMessage::AttachAck {
            topology: self.topology.lock().serialize(),
        };
        channel
            .send(encode_packet(&ack.into_packet(self.local_rank)?))
            .await?;
        self.register_peer(rank, channel);

        if !updates.is_empty() {
            self.flood(ControlMessage::TopologyUpdates { updates }, Some(rank));
        }
        for event in events {
            self.emit(event);
        }
        self.recompute_streams().await;
        tracing::debug!(child = rank, "peer attached");
        Ok(())
    }

    /// Connect to a (new) parent and run the attach handshake from the child
    /// side. The acknowledgement carries the parent's global view, which
    /// replaces ours.
    async fn attach_to_parent(self: &Arc<Self>, host: &str, port: u16) -> Result<Rank> {
        let mut channel = self.transport.connect(host, port).await?;
        let subtree = self
            .topology
            .lock()
            .serialize_subtree(self.local_rank)
            .unwrap_or_default();
        let attach = ControlMessage::Attach {
            rank: self.local_rank,
            is_backend: self.role == Role::BackEnd,
            listen_port: self.listen_port,
            subtree,
        };
        channel
            .send(encode_packet(&attach.into_packet(self.local_rank)?))
            .await?;

        let frame = tokio::time::timeout(self.config.connect_timeout, channel.recv())
            .await
            .map_err(|_| NetError::new(ErrorKind::Timeout, "attach acknowledgement timed out"))??
            .ok_or_else(|| NetError::new(ErrorKind::Disconnected, "peer closed during attach"))?;
        let pkt = decode_packet(frame)?;
        let ControlMessage::AttachAck { topology } = ControlMessage::from_packet(&pkt)? else {
            return Err(NetError::new(
                ErrorKind::Protocol,
                format!("expected attach ack, got control tag {}", pkt.tag()),
            )
            .into());
        };
        let parent_rank = pkt.src_rank();

        let global = Topology::from_spec(&topology)?;
        if !global.contains(self.local_rank) {
            return Err(NetError::new(
                ErrorKind::Protocol,
                "attach acknowledgement does not contain this node",
            )
            .into());
        }
        *self.topology.lock() = global;
        *self.parent.lock() = Some(parent_rank);
        self.register_peer(parent_rank, channel);
        Ok(parent_rank)
    }

    fn register_peer(self: &Arc<Self>, rank: Rank, channel: Box<dyn Channel>) {
        let (sink, source) = channel.split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(rank, PeerHandle { tx });
        tokio::spawn(writer_loop(rank, sink, rx));
        let inner = self.clone();
        tokio::spawn(async move { inner.reader_loop(rank, source).await });
        self.bump_progress();
    }

    /// Block until every rank in `expected` has attached, bounded by the
    /// connect timeout.
    async fn wait_for_children(&self, expected: &[Rank]) -> Result<()> {
        if expected.is_empty() {
            return Ok(());
        }
        let mut progress = self.progress.subscribe();
        let attached = progress.wait_for(|_| {
            let peers = self.peers.lock();
            expected.iter().all(|r| peers.contains_key(r))
        });
        tokio::time::timeout(self.config.connect_timeout, attached)
            .await
            .map_err(|_| {
                NetError::new(
                    ErrorKind::Timeout,
                    "timed out waiting for children to attach",
                )
            })??;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, rank: Rank, mut source: Box<dyn FrameSource>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = source.recv() => match frame {
                    Ok(Some(frame)) => match decode_packet(frame) {
                        Ok(pkt) => self.dispatch(pkt, rank).await,
                        Err(e) => tracing::warn!(peer = rank, error = %e, "undecodable frame"),
                    },
                    Ok(None) => {
                        self.handle_peer_failure(rank).await;
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(peer = rank, error = %e, "read failed");
                        self.handle_peer_failure(rank).await;
                        return;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(self: &Arc<Self>, pkt: Packet, from: Rank) {
        if pkt.stream_id() == CONTROL_STREAM_ID && is_system_tag(pkt.tag()) {
            if let Err(e) = self.handle_control(pkt, from).await {
                tracing::warn!(peer = from, error = %e, "control message failed");
            }
            return;
        }
        let from_parent = *self.parent.lock() == Some(from);
        if from_parent {
            self.flow_down(pkt).await;
        } else {
            self.flow_up(pkt, from).await;
        }
    }

    /// Multicast path: run the downstream filter, deliver locally if this
    /// node is a member, forward to every child covering a member.
    async fn flow_down(&self, pkt: Packet) {
        let stream_id = pkt.stream_id();
        let Some(state) = self.stream_state(stream_id) else {
            tracing::warn!(stream_id, "downstream packet for unknown stream");
            return;
        };
        let ctx = self.filter_context();
        let output = match state.run_down_filter(pkt, &ctx) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "downstream filter failed");
                return;
            }
        };
        for rev in output.reverse {
            self.send_to_parent(rev);
        }
        let members = state.members.lock().clone();
        let deliver_here = self.role == Role::BackEnd && members.contains(&self.local_rank);
        let targets = self.covering_children(&members);
        for pkt in output.forward {
            for target in &targets {
                self.send_to_peer(*target, &pkt);
            }
            if deliver_here {
                self.deliver_local(&state, pkt);
            }
        }
    }

    /// Reduction path: buffer by source, release rounds per the stream's
    /// synchronization policy, aggregate, and forward toward the root.
    async fn flow_up(self: &Arc<Self>, pkt: Packet, from: Rank) {
        let stream_id = pkt.stream_id();
        let Some(state) = self.stream_state(stream_id) else {
            tracing::warn!(stream_id, peer = from, "upstream packet for unknown stream");
            return;
        };
        let result = state.up_buffer.lock().push(from, pkt);
        if let Some((generation, delay)) = result.arm_deadline {
            self.arm_deadline(&state, generation, delay);
        }
        self.process_rounds(&state, result.rounds).await;
    }

    async fn process_rounds(self: &Arc<Self>, state: &Arc<StreamState>, rounds: Vec<Vec<Packet>>) {
        for round in rounds {
            let ctx = self.filter_context();
            match state.run_up_filter(round, &ctx) {
                Ok(output) => {
                    if !output.reverse.is_empty() {
                        let sources: Vec<Rank> =
                            state.up_buffer.lock().expected().iter().copied().collect();
                        for pkt in output.reverse {
                            for src in &sources {
                                self.send_to_peer(*src, &pkt);
                            }
                        }
                    }
                    for pkt in output.forward {
                        if self.role == Role::FrontEnd {
                            self.deliver_local(state, pkt);
                        } else {
                            self.send_to_parent(pkt);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(stream_id = state.id, error = %e, "upstream filter failed")
                }
            }
        }
    }

    fn arm_deadline(self: &Arc<Self>, state: &Arc<StreamState>, generation: u64, delay: Duration) {
        let inner = self.clone();
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = state.up_buffer.lock().fire_deadline(generation);
            if let Some(round) = fired {
                inner.process_rounds(&state, vec![round]).await;
            }
            let rearm = state.up_buffer.lock().arm_if_pending();
            if let Some((generation, delay)) = rearm {
                inner.arm_deadline(&state, generation, delay);
            }
        });
    }

    // ------------------------------------------------------------------
    // Control handling
    // ------------------------------------------------------------------

    async fn handle_control(self: &Arc<Self>, pkt: Packet, from: Rank) -> Result<()> {
        let msg = ControlMessage::from_packet(&pkt)?;
        match msg {
            ControlMessage::Attach { .. } | ControlMessage::AttachAck { .. } => {
                return Err(NetError::new(
                    ErrorKind::Protocol,
                    "attach handshake message on an established connection",
                )
                .into());
            }
            ControlMessage::TopologyUpdates { updates } => {
                self.apply_and_flood(updates, Some(from)).await;
            }
            ControlMessage::TopologySync { topology } => {
                match Topology::from_spec(&topology) {
                    Ok(global) if global.contains(self.local_rank) => {
                        *self.topology.lock() = global;
                    }
                    Ok(_) => tracing::warn!("topology sync does not contain this node; ignored"),
                    Err(e) => tracing::warn!(error = %e, "malformed topology sync"),
                }
                let parent = *self.parent.lock();
                self.send_down_pkt(&pkt, parent);
                self.recompute_streams().await;
            }
            ControlMessage::NewStream {
                stream_id,
                members,
                up_filter,
                sync_policy,
                down_filter,
            } => {
                if self.streams.contains_key(&stream_id) {
                    return Ok(());
                }
                let state = self.install_stream(
                    stream_id,
                    &members,
                    &up_filter,
                    sync_policy,
                    &down_filter,
                )?;
                let member_set = state.members.lock().clone();
                self.forward_covering(&pkt, &member_set);
            }
            ControlMessage::DeleteStream { stream_id } => {
                if self.role == Role::Internal {
                    // No local application here; the state can go at once.
                    self.streams.remove(&stream_id);
                } else if let Some(state) = self.stream_state(stream_id) {
                    // Close but stay registered: packets delivered just
                    // before the delete (and the close itself) must still
                    // reach the application. `recv` retires the state once
                    // it has been drained.
                    state.close();
                    let _ = self.ready_tx.send(stream_id);
                }
                let parent = *self.parent.lock();
                self.send_down_pkt(&pkt, parent);
            }
            ControlMessage::CloseStream { stream_id, rank } => {
                self.member_closed(stream_id, rank).await;
            }
            ControlMessage::FilterLoad {
                filter_id,
                artifact,
                name,
            } => {
                match self.loader.read().clone() {
                    Some(loader) => match loader.load(&artifact, &name) {
                        Ok(factory) => self.registry.register_with_id(filter_id, factory),
                        Err(e) => {
                            tracing::warn!(filter_id, error = %e, "filter load failed")
                        }
                    },
                    None => tracing::warn!(
                        filter_id,
                        "no filter loader installed; filter unavailable here"
                    ),
                }
                let parent = *self.parent.lock();
                self.send_down_pkt(&pkt, parent);
            }
            ControlMessage::Shutdown => {
                self.begin_shutdown().await;
            }
            ControlMessage::ShutdownAck { rank } => {
                self.pending_shutdown_acks.lock().remove(&rank);
                self.bump_progress();
            }
        }
        Ok(())
    }

    fn install_stream(
        &self,
        stream_id: u32,
        members: &[Rank],
        up_assignment: &str,
        sync_policy: SyncPolicy,
        down_assignment: &str,
    ) -> Result<Arc<StreamState>> {
        let up_id = resolve_assignment(up_assignment, self.local_rank)?;
        let down_id = resolve_assignment(down_assignment, self.local_rank)?;
        let member_set: BTreeSet<Rank> = members.iter().copied().collect();
        let expected: BTreeSet<Rank> =
            self.covering_children(&member_set).into_iter().collect();
        let state = Arc::new(StreamState::new(
            stream_id,
            sync_policy,
            up_id,
            self.registry.instantiate(up_id)?,
            down_id,
            self.registry.instantiate(down_id)?,
            member_set,
            expected,
        ));
        self.streams.insert(stream_id, state.clone());
        Ok(state)
    }

    /// A member stopped sending on a stream. Shrinks membership and the
    /// local wait set, closes the stream once no member remains, and
    /// propagates the close toward the root.
    async fn member_closed(self: &Arc<Self>, stream_id: u32, rank: Rank) {
        let Some(state) = self.stream_state(stream_id) else {
            return;
        };
        let (members, now_empty) = {
            let mut members = state.members.lock();
            members.remove(&rank);
            (members.clone(), members.is_empty())
        };
        let expected: BTreeSet<Rank> = self.covering_children(&members).into_iter().collect();
        let rounds = state.up_buffer.lock().set_expected(expected);
        self.process_rounds(&state, rounds).await;
        if now_empty {
            state.close();
            if self.role == Role::Internal {
                self.streams.remove(&stream_id);
            } else {
                let _ = self.ready_tx.send(stream_id);
            }
        }
        if self.role != Role::FrontEnd {
            self.send_control_to_parent(ControlMessage::CloseStream { stream_id, rank });
        }
    }

    fn send_control_to_parent(&self, msg: ControlMessage) {
        if let Some(parent) = *self.parent.lock() {
            self.send_control_to(parent, msg);
        }
    }

    /// Apply a batch of structural updates, flood it onward, emit events,
    /// and bring stream wait sets and memberships back in line.
    async fn apply_and_flood(
        self: &Arc<Self>,
        updates: Vec<TopologyUpdate>,
        except: Option<Rank>,
    ) {
        let mut events = Vec::new();
        let mut removed_backends = Vec::new();
        {
            let mut topo = self.topology.lock();
            for update in &updates {
                let was_backend = update.kind == UpdateKind::RemoveRank
                    && topo
                        .find_node(update.rank)
                        .map(|n| n.is_backend())
                        .unwrap_or(false);
                match topo.apply_update(update) {
                    Ok(true) => {
                        if was_backend {
                            removed_backends.push(update.rank);
                        }
                        events.push(match update.kind {
                            UpdateKind::NewBackend => {
                                TopologyEvent::BackendAdded { rank: update.rank }
                            }
                            UpdateKind::NewInternal => {
                                TopologyEvent::InternalAdded { rank: update.rank }
                            }
                            UpdateKind::RemoveRank => {
                                TopologyEvent::NodeFailed { rank: update.rank }
                            }
                            UpdateKind::ChangeParent => TopologyEvent::ParentChanged {
                                rank: update.rank,
                                new_parent: update.parent_rank,
                            },
                            UpdateKind::ChangePort => TopologyEvent::PortChanged {
                                rank: update.rank,
                                port: update.port,
                            },
                        });
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(rank = update.rank, error = %e, "topology update failed")
                    }
                }
            }
        }

        if !removed_backends.is_empty() {
            events.push(TopologyEvent::BackendsRemoved {
                ranks: removed_backends.clone(),
            });
            for entry in self.streams.iter() {
                let state = entry.value();
                let mut members = state.members.lock();
                for rank in &removed_backends {
                    members.remove(rank);
                }
                if members.is_empty() {
                    drop(members);
                    state.close();
                    let _ = self.ready_tx.send(state.id);
                }
            }
        }

        self.flood(ControlMessage::TopologyUpdates { updates }, except);
        for event in events {
            self.emit(event);
        }
        self.recompute_streams().await;
    }

    /// Recompute every stream's wait set against the current topology,
    /// releasing any rounds the shrunken sets already satisfy.
    async fn recompute_streams(self: &Arc<Self>) {
        let states: Vec<Arc<StreamState>> =
            self.streams.iter().map(|e| e.value().clone()).collect();
        for state in states {
            let members = state.members.lock().clone();
            let expected: BTreeSet<Rank> =
                self.covering_children(&members).into_iter().collect();
            let rounds = state.up_buffer.lock().set_expected(expected);
            self.process_rounds(&state, rounds).await;
        }
    }

    // ------------------------------------------------------------------
    // Failure handling and recovery
    // ------------------------------------------------------------------

    /// Removal updates covering this node's whole subtree, leaves first.
    fn subtree_removal_updates(&self) -> Vec<TopologyUpdate> {
        let topo = self.topology.lock();
        let mut ranks = topo.descendants(self.local_rank);
        ranks.reverse();
        ranks.push(self.local_rank);
        ranks
            .into_iter()
            .map(|rank| {
                let node = topo.find_node(rank);
                TopologyUpdate {
                    kind: UpdateKind::RemoveRank,
                    rank,
                    parent_rank: self.local_rank,
                    host: node.map(|n| n.hostname().to_string()).unwrap_or_default(),
                    port: node.map(|n| n.port()).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Last-gasp report: this subtree is leaving the tree for good and has
    /// no live link left, so hand the root its removal updates over a
    /// one-shot connection. Best effort; the root applies and re-floods.
    async fn send_death_notice(&self) {
        let (root, host, port) = {
            let topo = self.topology.lock();
            let node = topo.root_node();
            (topo.root(), node.hostname().to_string(), node.port())
        };
        if root == self.local_rank {
            return;
        }
        let updates = self.subtree_removal_updates();
        let pkt = match (ControlMessage::TopologyUpdates { updates }).into_packet(self.local_rank)
        {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode subtree removal report");
                return;
            }
        };
        match self.transport.connect(&host, port).await {
            Ok(mut channel) => {
                if let Err(e) = channel.send(encode_packet(&pkt)).await {
                    tracing::warn!(error = %e, "subtree removal report was not delivered");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot reach the root to report subtree removal")
            }
        }
    }

    async fn handle_peer_failure(self: &Arc<Self>, rank: Rank) {
        if self.cancel.is_cancelled() || self.shutdown_done.load(Ordering::SeqCst) {
            return;
        }
        if self.peers.lock().remove(&rank).is_none() {
            return;
        }
        let was_parent = {
            let mut parent = self.parent.lock();
            if *parent == Some(rank) {
                *parent = None;
                true
            } else {
                false
            }
        };
        tracing::warn!(peer = rank, was_parent, "lost connection to peer");

        if was_parent {
            let parent_is_root = self.topology.lock().root() == rank;
            if parent_is_root || !self.recovery_enabled.load(Ordering::SeqCst) {
                // This whole subtree is out of the tree.
                self.emit(TopologyEvent::NodeFailed { rank });
                if !parent_is_root {
                    // The root is still up; it must stop counting us.
                    self.send_death_notice().await;
                }
                // Dropping the peer handles severs the links to any
                // descendants, so they observe the failure too.
                self.peers.lock().clear();
                self.close_all_streams();
                self.cancel.cancel();
                return;
            }
            let inner = self.clone();
            tokio::spawn(async move { inner.recover(rank).await });
        } else {
            let update = {
                let topo = self.topology.lock();
                let node = topo.find_node(rank);
                TopologyUpdate {
                    kind: UpdateKind::RemoveRank,
                    rank,
                    parent_rank: self.local_rank,
                    host: node.map(|n| n.hostname().to_string()).unwrap_or_default(),
                    port: node.map(|n| n.port()).unwrap_or(0),
                }
            };
            self.apply_and_flood(vec![update], None).await;
        }
    }

    /// Adoption loop for this node's orphaned subtree: score candidates,
    /// connect to one, and re-attach. Candidate selection happens under the
    /// topology lock; the connect never does. Bounded by
    /// `max_adoption_attempts` distinct candidates.
    async fn recover(self: Arc<Self>, dead_parent: Rank) {
        {
            let mut topo = self.topology.lock();
            if topo.contains(dead_parent) {
                if let Err(e) = topo.remove_node(dead_parent) {
                    tracing::warn!(rank = dead_parent, error = %e, "failed to drop dead parent");
                }
            }
            topo.mark_orphan(self.local_rank);
        }
        self.emit(TopologyEvent::NodeFailed { rank: dead_parent });
        self.send_down(ControlMessage::TopologyUpdates {
            updates: vec![TopologyUpdate {
                kind: UpdateKind::RemoveRank,
                rank: dead_parent,
                parent_rank: self.local_rank,
                host: String::new(),
                port: 0,
            }],
        });

        let mut tried: Vec<Rank> = Vec::new();
        for attempt in 1..=self.config.max_adoption_attempts {
            if self.cancel.is_cancelled() {
                return;
            }
            let candidate = {
                let mut topo = self.topology.lock();
                let mut rng = StdRng::from_entropy();
                topo.choose_adopter(self.local_rank, &self.config, &tried, &mut rng)
            };
            let Some(candidate) = candidate else { break };
            let (host, port) = match self.topology.lock().find_node(candidate) {
                Some(node) => (node.hostname().to_string(), node.port()),
                None => {
                    tried.push(candidate);
                    continue;
                }
            };
            tracing::info!(
                orphan = self.local_rank,
                candidate,
                attempt,
                "attempting adoption"
            );
            match self.attach_to_parent(&host, port).await {
                Ok(parent) => {
                    tracing::info!(orphan = self.local_rank, parent, "adopted");
                    self.emit(TopologyEvent::ParentChanged {
                        rank: self.local_rank,
                        new_parent: parent,
                    });
                    // Descendants still hold the pre-failure view; refresh it.
                    let sync = ControlMessage::TopologySync {
                        topology: self.topology.lock().serialize(),
                    };
                    self.send_down(sync);
                    self.recompute_streams().await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(candidate, error = %e, "adoption attempt failed");
                    tried.push(candidate);
                }
            }
        }

        tracing::error!(
            orphan = self.local_rank,
            attempts = tried.len(),
            "adoption exhausted; subtree is permanently failed"
        );
        let affected = self.topology.lock().mark_failed_subtree(self.local_rank);
        if !affected.is_empty() {
            self.emit(TopologyEvent::BackendsRemoved { ranks: affected });
        }
        self.send_death_notice().await;
        self.peers.lock().clear();
        self.close_all_streams();
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Shutdown request arrived from the parent: forward it to every child
    /// and tear down once they all acknowledge (or the timeout passes).
    async fn begin_shutdown(self: &Arc<Self>) {
        let children = self.child_peers();
        if children.is_empty() {
            self.finish_shutdown();
            return;
        }
        *self.pending_shutdown_acks.lock() = children.iter().copied().collect();
        for child in &children {
            self.send_control_to(*child, ControlMessage::Shutdown);
        }
        let inner = self.clone();
        tokio::spawn(async move {
            let mut progress = inner.progress.subscribe();
            let acked = progress.wait_for(|_| inner.pending_shutdown_acks.lock().is_empty());
            let _ = tokio::time::timeout(inner.config.shutdown_timeout, acked).await;
            inner.finish_shutdown();
        });
    }

    fn finish_shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.role != Role::FrontEnd {
            self.send_control_to_parent(ControlMessage::ShutdownAck {
                rank: self.local_rank,
            });
        }
        // Dropping the peer handles lets each writer drain its queue (the
        // acknowledgement included) and exit.
        self.peers.lock().clear();
        self.close_all_streams();
        self.cancel.cancel();
        tracing::info!(rank = self.local_rank, "network shut down");
    }
}

async fn writer_loop(
    rank: Rank,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PeerCommand::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(peer = rank, error = %e, "write failed");
                    return;
                }
            }
            PeerCommand::Flush(done) => {
                let _ = sink.flush().await;
                let _ = done.send(());
            }
        }
    }
}

#[async_trait]
impl StreamRouter for NetworkInner {
    fn local_rank(&self) -> Rank {
        self.local_rank
    }

    async fn send_local(&self, packet: Packet) -> Result<()> {
        match self.role {
            Role::FrontEnd => {
                self.flow_down(packet).await;
                Ok(())
            }
            Role::BackEnd => {
                self.send_to_parent(packet);
                Ok(())
            }
            Role::Internal => Err(NetError::new(
                ErrorKind::Protocol,
                "internal nodes do not originate stream traffic",
            )
            .into()),
        }
    }

    async fn flush_peers(&self) -> Result<()> {
        let receivers: Vec<oneshot::Receiver<()>> = {
            let peers = self.peers.lock();
            peers
                .values()
                .filter_map(|handle| {
                    let (tx, rx) = oneshot::channel();
                    handle.tx.send(PeerCommand::Flush(tx)).ok().map(|_| rx)
                })
                .collect()
        };
        for rx in receivers {
            let _ = rx.await;
        }
        Ok(())
    }

    async fn close_stream(&self, stream_id: u32) -> Result<()> {
        match self.role {
            Role::FrontEnd => {
                // Closing from the root is deletion: the stream is torn down
                // everywhere. The local state stays registered until `recv`
                // has drained it.
                if let Some(state) = self.stream_state(stream_id) {
                    state.close();
                    let _ = self.ready_tx.send(stream_id);
                }
                self.send_down(ControlMessage::DeleteStream { stream_id });
                Ok(())
            }
            Role::BackEnd => {
                if let Some(state) = self.stream_state(stream_id) {
                    state.members.lock().remove(&self.local_rank);
                    state.close();
                }
                self.send_control_to_parent(ControlMessage::CloseStream {
                    stream_id,
                    rank: self.local_rank,
                });
                Ok(())
            }
            Role::Internal => Ok(()),
        }
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topology and failure change events.
//!
//! Applications subscribe through [`crate::network::Network::subscribe`];
//! events are fan-out broadcast, and a slow subscriber only ever loses its
//! own backlog (`tokio::sync::broadcast` semantics).

use serde::{Deserialize, Serialize};

use crate::topology::Rank;

/// What changed in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyEvent {
    /// A new back-end attached.
    BackendAdded { rank: Rank },
    /// A new internal node attached.
    InternalAdded { rank: Rank },
    /// Communication with a node was lost.
    NodeFailed { rank: Rank },
    /// An orphaned subtree found a new parent.
    ParentChanged { rank: Rank, new_parent: Rank },
    /// These back-ends are permanently gone and excluded from all future
    /// multicast/reduction membership.
    BackendsRemoved { ranks: Vec<Rank> },
    /// A node's listening port changed.
    PortChanged { rank: Rank, port: u16 },
}

/// Capacity of the broadcast ring; subscribers lagging further than this
/// lose oldest events first.
pub(crate) const EVENT_CAPACITY: usize = 256;

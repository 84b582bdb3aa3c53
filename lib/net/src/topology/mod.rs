// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The authoritative tree of nodes.
//!
//! Nodes live in an arena keyed by rank (a stable integer), with parent,
//! children, and ascendant relationships stored as rank sets rather than
//! references. The owning [`crate::network::Network`] guards the whole
//! structure with a single lock; everything here is pure structure plus
//! query/mutation operations.
//!
//! Invariants, checked by [`Topology::validate`]:
//! - exactly one root (no parent), every other node reachable from it;
//! - `N ∈ children(parent(N))` for every non-root N, and vice versa;
//! - ranks are unique; back-end and internal index sets are disjoint and,
//!   together with the root, cover the node set.
//!
//! Nodes in the `orphans` working set are structurally valid subtree roots
//! that have lost their path to the root; the adoption algorithm
//! (`topology::adoption`) re-parents or permanently fails them.

mod adoption;
mod serial;

pub use adoption::AdoptionScore;
pub use serial::{parse as parse_spec, ParseError, SpecNode};

use std::collections::{BTreeSet, HashMap, VecDeque};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::codec::{TopologyUpdate, UpdateKind};
use crate::error::{ErrorKind, NetError};

/// Globally unique node identifier.
pub type Rank = u32;

/// One node record in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    rank: Rank,
    hostname: String,
    port: u16,
    parent: Option<Rank>,
    children: BTreeSet<Rank>,
    ascendants: BTreeSet<Rank>,
    is_backend: bool,
    failed: bool,
    depth: u32,
    // Adoption scratch fields, only meaningful during a scoring pass.
    pub(crate) adoption_score: f64,
    pub(crate) weighted_key: f64,
}

impl Node {
    fn new(rank: Rank, hostname: String, port: u16, is_backend: bool) -> Self {
        Self {
            rank,
            hostname,
            port,
            parent: None,
            children: BTreeSet::new(),
            ascendants: BTreeSet::new(),
            is_backend,
            failed: false,
            depth: 0,
            adoption_score: 0.0,
            weighted_key: 0.0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn parent(&self) -> Option<Rank> {
        self.parent
    }

    pub fn children(&self) -> &BTreeSet<Rank> {
        &self.children
    }

    pub fn ascendants(&self) -> &BTreeSet<Rank> {
        &self.ascendants
    }

    pub fn is_backend(&self) -> bool {
        self.is_backend
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn fanout(&self) -> usize {
        self.children.len()
    }
}

/// Aggregate fan-out statistics over nodes that currently have children.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanoutStats {
    pub min: usize,
    pub max: usize,
    pub avg: f64,
    pub stddev: f64,
}

/// The tree arena plus its index sets.
#[derive(Debug, Clone)]
pub struct Topology {
    root: Rank,
    nodes: HashMap<Rank, Node>,
    backends: BTreeSet<Rank>,
    internals: BTreeSet<Rank>,
    orphans: BTreeSet<Rank>,
    fanout_sum: f64,
    fanout_sum_sq: f64,
    fanout_count: usize,
}

impl Topology {
    /// A topology holding only the root node.
    pub fn new_root(hostname: impl Into<String>, port: u16, rank: Rank) -> Self {
        let root = Node::new(rank, hostname.into(), port, false);
        let mut nodes = HashMap::new();
        nodes.insert(rank, root);
        Self {
            root: rank,
            nodes,
            backends: BTreeSet::new(),
            internals: BTreeSet::new(),
            orphans: BTreeSet::new(),
            fanout_sum: 0.0,
            fanout_sum_sq: 0.0,
            fanout_count: 0,
        }
    }

    /// Build a topology from its textual specification.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let parsed = serial::parse(spec)
            .map_err(|e| NetError::with_source(ErrorKind::Topology, "malformed topology specification", e))?;
        let mut topology = Self::new_root(parsed.host.clone(), parsed.port, parsed.rank);
        for child in &parsed.children {
            topology.insert_spec(parsed.rank, child)?;
        }
        Ok(topology)
    }

    /// Serialize the tree reachable from the root back into the textual
    /// grammar. Orphaned and failed subtrees are not part of the output.
    pub fn serialize(&self) -> String {
        self.spec_node(self.root).serialize()
    }

    /// The subtree rooted at `rank` in textual form.
    pub fn serialize_subtree(&self, rank: Rank) -> Option<String> {
        if !self.nodes.contains_key(&rank) {
            return None;
        }
        Some(self.spec_node(rank).serialize())
    }

    fn spec_node(&self, rank: Rank) -> SpecNode {
        let node = &self.nodes[&rank];
        SpecNode {
            host: node.hostname.clone(),
            port: node.port,
            rank,
            children: node
                .children
                .iter()
                .filter(|c| !self.nodes[c].failed)
                .map(|c| self.spec_node(*c))
                .collect(),
        }
    }

    pub fn root(&self) -> Rank {
        self.root
    }

    pub fn root_node(&self) -> &Node {
        &self.nodes[&self.root]
    }

    pub fn find_node(&self, rank: Rank) -> Option<&Node> {
        self.nodes.get(&rank)
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.nodes.contains_key(&rank)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes without children, in rank order.
    pub fn leaves(&self) -> Vec<Rank> {
        let mut out: Vec<Rank> = self
            .nodes
            .values()
            .filter(|n| n.children.is_empty())
            .map(|n| n.rank)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn backend_nodes(&self) -> &BTreeSet<Rank> {
        &self.backends
    }

    pub fn internal_nodes(&self) -> &BTreeSet<Rank> {
        &self.internals
    }

    pub fn orphans(&self) -> &BTreeSet<Rank> {
        &self.orphans
    }

    /// Live (non-failed) back-ends.
    pub fn live_backends(&self) -> BTreeSet<Rank> {
        self.backends
            .iter()
            .filter(|r| !self.nodes[r].failed)
            .copied()
            .collect()
    }

    /// All ranks strictly below `rank`, breadth-first.
    pub fn descendants(&self, rank: Rank) -> Vec<Rank> {
        let mut out = Vec::new();
        let mut queue: VecDeque<Rank> = self
            .nodes
            .get(&rank)
            .map(|n| n.children.iter().copied().collect())
            .unwrap_or_default();
        while let Some(r) = queue.pop_front() {
            out.push(r);
            if let Some(n) = self.nodes.get(&r) {
                queue.extend(n.children.iter().copied());
            }
        }
        out
    }

    /// Height of the subtree rooted at `rank` (a leaf has height 0).
    pub fn subtree_height(&self, rank: Rank) -> u32 {
        match self.nodes.get(&rank) {
            None => 0,
            Some(n) => n
                .children
                .iter()
                .map(|c| 1 + self.subtree_height(*c))
                .max()
                .unwrap_or(0),
        }
    }

    /// True if `target` lies in the subtree rooted at `root` (inclusive).
    pub fn subtree_contains(&self, root: Rank, target: Rank) -> bool {
        if root == target {
            return true;
        }
        self.nodes
            .get(&target)
            .map(|n| n.ascendants.contains(&root))
            .unwrap_or(false)
    }

    /// Which child of `from` leads toward `target`, if any.
    pub fn child_toward(&self, from: Rank, target: Rank) -> Option<Rank> {
        let node = self.nodes.get(&from)?;
        node.children
            .iter()
            .copied()
            .find(|c| self.subtree_contains(*c, target))
    }

    /// Parse a recursive specification and insert it under `parent`.
    ///
    /// Rejected if any rank in the specification already exists (which also
    /// covers every way the insertion could create a cycle, since all inserted
    /// nodes are new). Returns the inserted ranks, preorder.
    pub fn add_subgraph(&mut self, parent: Rank, spec: &str) -> Result<Vec<Rank>> {
        let parsed = serial::parse(spec)
            .map_err(|e| NetError::with_source(ErrorKind::Topology, "malformed subgraph specification", e))?;
        self.insert_spec(parent, &parsed)
    }

    fn insert_spec(&mut self, parent: Rank, spec: &SpecNode) -> Result<Vec<Rank>> {
        if !self.nodes.contains_key(&parent) {
            return Err(NetError::new(
                ErrorKind::Topology,
                format!("unknown parent rank {parent}"),
            )
            .into());
        }
        for rank in spec.ranks() {
            if self.nodes.contains_key(&rank) {
                return Err(NetError::new(
                    ErrorKind::Topology,
                    format!("duplicate rank {rank} in subgraph"),
                )
                .into());
            }
        }
        let mut inserted = Vec::new();
        self.insert_spec_inner(parent, spec, &mut inserted);
        Ok(inserted)
    }

    fn insert_spec_inner(&mut self, parent: Rank, spec: &SpecNode, inserted: &mut Vec<Rank>) {
        let is_backend = spec.is_leaf();
        let mut node = Node::new(spec.rank, spec.host.clone(), spec.port, is_backend);
        let parent_node = &self.nodes[&parent];
        node.depth = parent_node.depth + 1;
        node.ascendants = parent_node.ascendants.clone();
        node.ascendants.insert(parent);
        node.parent = Some(parent);
        self.nodes.insert(spec.rank, node);
        if is_backend {
            self.backends.insert(spec.rank);
        } else {
            self.internals.insert(spec.rank);
        }
        self.link(parent, spec.rank);
        inserted.push(spec.rank);
        for child in &spec.children {
            self.insert_spec_inner(spec.rank, child, inserted);
        }
    }

    /// Detach `rank` from the tree and drop its record. Its children become
    /// orphans: structurally valid subtrees lacking a path to the root.
    pub fn remove_node(&mut self, rank: Rank) -> Result<Vec<Rank>> {
        if rank == self.root {
            return Err(NetError::new(ErrorKind::Topology, "cannot remove the root").into());
        }
        let node = self
            .nodes
            .get(&rank)
            .ok_or_else(|| NetError::new(ErrorKind::NotFound, format!("unknown rank {rank}")))?;
        let parent = node.parent;
        let children: Vec<Rank> = node.children.iter().copied().collect();

        if let Some(p) = parent {
            self.unlink(p, rank);
        }
        for child in &children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parent = None;
                c.ascendants.clear();
            }
            self.orphans.insert(*child);
        }
        // The removed node keeps no fan-out contribution.
        self.stats_on_fanout_change(self.nodes[&rank].children.len(), 0);
        self.nodes.remove(&rank);
        self.backends.remove(&rank);
        self.internals.remove(&rank);
        self.orphans.remove(&rank);
        Ok(children)
    }

    /// Atomically re-parent `child` under `new_parent`, refreshing child and
    /// ascendant sets plus depths across the moved subtree.
    pub fn set_parent(&mut self, child: Rank, new_parent: Rank) -> Result<()> {
        let parent_node = self
            .nodes
            .get(&new_parent)
            .ok_or_else(|| NetError::new(ErrorKind::NotFound, format!("unknown rank {new_parent}")))?;
        if parent_node.is_backend {
            return Err(NetError::new(
                ErrorKind::Topology,
                format!("back-end {new_parent} cannot adopt"),
            )
            .into());
        }
        if parent_node.failed {
            return Err(NetError::new(
                ErrorKind::Topology,
                format!("failed node {new_parent} cannot adopt"),
            )
            .into());
        }
        if !self.nodes.contains_key(&child) {
            return Err(NetError::new(ErrorKind::NotFound, format!("unknown rank {child}")).into());
        }
        if child == new_parent || self.subtree_contains(child, new_parent) {
            return Err(NetError::new(
                ErrorKind::Topology,
                format!("re-parenting {child} under {new_parent} would create a cycle"),
            )
            .into());
        }

        let old_parent = self.nodes[&child].parent;
        if old_parent == Some(new_parent) {
            return Ok(());
        }
        if let Some(p) = old_parent {
            self.unlink(p, child);
        }
        self.link(new_parent, child);
        self.nodes.get_mut(&child).expect("checked above").parent = Some(new_parent);
        self.orphans.remove(&child);
        self.refresh_subtree(child);
        Ok(())
    }

    /// Recompute depth and ascendant sets below `rank` after a re-parent.
    fn refresh_subtree(&mut self, rank: Rank) {
        let (depth, ascendants) = match self.nodes[&rank].parent {
            Some(p) => {
                let parent = &self.nodes[&p];
                let mut asc = parent.ascendants.clone();
                asc.insert(p);
                (parent.depth + 1, asc)
            }
            None => (0, BTreeSet::new()),
        };
        {
            let node = self.nodes.get_mut(&rank).expect("caller verified rank");
            node.depth = depth;
            node.ascendants = ascendants;
        }
        let children: Vec<Rank> = self.nodes[&rank].children.iter().copied().collect();
        for child in children {
            self.refresh_subtree(child);
        }
    }

    /// Mark `rank` and every descendant permanently failed. Returns the
    /// back-end ranks affected, for the topology-change report.
    pub fn mark_failed_subtree(&mut self, rank: Rank) -> Vec<Rank> {
        let mut affected = Vec::new();
        let mut ranks = vec![rank];
        ranks.extend(self.descendants(rank));
        for r in ranks {
            if let Some(node) = self.nodes.get_mut(&r) {
                node.failed = true;
                if node.is_backend {
                    affected.push(r);
                }
            }
            self.orphans.remove(&r);
        }
        affected
    }

    pub fn mark_orphan(&mut self, rank: Rank) {
        if let Some(node) = self.nodes.get_mut(&rank) {
            node.parent = None;
            node.ascendants.clear();
            self.orphans.insert(rank);
        }
    }

    /// Apply one flooded structural update. Idempotent: updates that are
    /// already reflected (or whose subject is unknown) are ignored.
    pub fn apply_update(&mut self, update: &TopologyUpdate) -> Result<bool> {
        match update.kind {
            UpdateKind::NewBackend | UpdateKind::NewInternal => {
                if self.nodes.contains_key(&update.rank) {
                    return Ok(false);
                }
                if !self.nodes.contains_key(&update.parent_rank) {
                    return Ok(false);
                }
                let spec = SpecNode {
                    host: update.host.clone(),
                    port: update.port,
                    rank: update.rank,
                    children: Vec::new(),
                };
                self.insert_spec(update.parent_rank, &spec)?;
                if update.kind == UpdateKind::NewInternal {
                    // insert_spec classifies childless nodes as back-ends.
                    self.backends.remove(&update.rank);
                    self.internals.insert(update.rank);
                    if let Some(n) = self.nodes.get_mut(&update.rank) {
                        n.is_backend = false;
                    }
                }
                Ok(true)
            }
            UpdateKind::RemoveRank => {
                if !self.nodes.contains_key(&update.rank) {
                    return Ok(false);
                }
                self.remove_node(update.rank)?;
                Ok(true)
            }
            UpdateKind::ChangeParent => {
                if !self.nodes.contains_key(&update.rank)
                    || !self.nodes.contains_key(&update.parent_rank)
                {
                    return Ok(false);
                }
                if self.nodes[&update.rank].parent == Some(update.parent_rank) {
                    return Ok(false);
                }
                self.set_parent(update.rank, update.parent_rank)?;
                Ok(true)
            }
            UpdateKind::ChangePort => match self.nodes.get_mut(&update.rank) {
                Some(node) if node.port != update.port => {
                    node.port = update.port;
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    /// Aggregate fan-out statistics over nodes that currently have children.
    pub fn fanout_stats(&self) -> FanoutStats {
        let fanouts: Vec<usize> = self
            .nodes
            .values()
            .filter(|n| !n.children.is_empty())
            .map(|n| n.children.len())
            .collect();
        if fanouts.is_empty() {
            return FanoutStats {
                min: 0,
                max: 0,
                avg: 0.0,
                stddev: 0.0,
            };
        }
        let avg = self.fanout_sum / self.fanout_count as f64;
        let variance = (self.fanout_sum_sq / self.fanout_count as f64 - avg * avg).max(0.0);
        FanoutStats {
            min: *fanouts.iter().min().expect("non-empty"),
            max: *fanouts.iter().max().expect("non-empty"),
            avg,
            stddev: variance.sqrt(),
        }
    }

    fn link(&mut self, parent: Rank, child: Rank) {
        let old = self.nodes[&parent].children.len();
        self.nodes
            .get_mut(&parent)
            .expect("caller verified parent")
            .children
            .insert(child);
        self.stats_on_fanout_change(old, old + 1);
    }

    fn unlink(&mut self, parent: Rank, child: Rank) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            let old = node.children.len();
            if node.children.remove(&child) {
                self.stats_on_fanout_change(old, old - 1);
            }
        }
    }

    /// Incremental update of the fan-out sum/sum-of-squares accumulators when
    /// one node's fan-out moves from `old` to `new`.
    fn stats_on_fanout_change(&mut self, old: usize, new: usize) {
        if old > 0 {
            self.fanout_sum -= old as f64;
            self.fanout_sum_sq -= (old * old) as f64;
            self.fanout_count -= 1;
        }
        if new > 0 {
            self.fanout_sum += new as f64;
            self.fanout_sum_sq += (new * new) as f64;
            self.fanout_count += 1;
        }
    }

    /// Full structural check; used by tests and after recovery passes.
    pub fn validate(&self) -> Result<()> {
        let mut reachable = 0usize;
        let mut queue = VecDeque::from([self.root]);
        let mut seen = BTreeSet::new();
        while let Some(r) = queue.pop_front() {
            if !seen.insert(r) {
                return Err(NetError::new(ErrorKind::Topology, format!("cycle through rank {r}")).into());
            }
            reachable += 1;
            let node = &self.nodes[&r];
            for child in &node.children {
                let child_node = self.nodes.get(child).ok_or_else(|| {
                    NetError::new(ErrorKind::Topology, format!("dangling child rank {child}"))
                })?;
                if child_node.parent != Some(r) {
                    return Err(NetError::new(
                        ErrorKind::Topology,
                        format!("child {child} does not point back at parent {r}"),
                    )
                    .into());
                }
                queue.push_back(*child);
            }
        }
        let orphan_subtree: usize = self
            .orphans
            .iter()
            .map(|o| 1 + self.descendants(*o).len())
            .sum();
        if reachable + orphan_subtree != self.nodes.len() {
            return Err(NetError::new(
                ErrorKind::Topology,
                format!(
                    "tree disconnected: {} reachable + {} orphaned of {} nodes",
                    reachable,
                    orphan_subtree,
                    self.nodes.len()
                ),
            )
            .into());
        }
        if self.nodes[&self.root].parent.is_some() {
            return Err(NetError::new(ErrorKind::Topology, "root has a parent").into());
        }
        if !self.backends.is_disjoint(&self.internals) {
            return Err(NetError::new(ErrorKind::Topology, "backend/internal sets overlap").into());
        }
        let mut union: BTreeSet<Rank> = self.backends.union(&self.internals).copied().collect();
        union.insert(self.root);
        if union.len() != self.nodes.len() {
            return Err(NetError::new(ErrorKind::Topology, "index sets do not cover node set").into());
        }
        Ok(())
    }
}

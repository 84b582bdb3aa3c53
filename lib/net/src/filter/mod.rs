// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Filters and the filter registry.
//!
//! A filter transforms the packets flowing through a node on one stream.
//! Persistent per-(stream, node) state is simply the filter instance's own
//! fields: the registry stores factories, and every stream instantiates a
//! fresh filter per slot when it is created, destroying it with the stream.
//!
//! The registry is owned by the network that created it; there is no
//! process-wide filter table. User filters enter through the narrow
//! [`FilterLoader`] seam ("resolve a named function from an external
//! artifact"), so dispatch never depends on how a filter's code was obtained.

mod builtins;

pub use builtins::{
    AverageFilter, IdentityFilter, IntMaxFilter, IntMinFilter, IntSumFilter, NullFilter,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::error::{ErrorKind, NetError};
use crate::packet::Packet;
use crate::topology::Rank;

/// Control-only identity, reserved for administrative streams.
pub const FILTER_NULL: u16 = 0;
/// Pass-through.
pub const FILTER_IDENTITY: u16 = 1;
pub const FILTER_INT_SUM: u16 = 2;
pub const FILTER_INT_MIN: u16 = 3;
pub const FILTER_INT_MAX: u16 = 4;
pub const FILTER_AVERAGE: u16 = 5;

/// First id handed out for dynamically loaded filters.
pub const FIRST_USER_FILTER_ID: u16 = 100;

/// Local topology info passed to every filter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterContext {
    pub rank: Rank,
    pub num_children: usize,
    pub num_descendants: usize,
}

/// What a filter invocation produced.
#[derive(Debug, Default)]
pub struct FilterOutput {
    /// Packets continuing in the flow direction.
    pub forward: Vec<Packet>,
    /// Packets sent immediately back toward the source, for two-phase
    /// protocols.
    pub reverse: Vec<Packet>,
}

impl FilterOutput {
    pub fn forward(packets: Vec<Packet>) -> Self {
        Self {
            forward: packets,
            reverse: Vec::new(),
        }
    }

    pub fn one(packet: Packet) -> Self {
        Self::forward(vec![packet])
    }
}

/// A packet transformation applied at one node on one stream.
///
/// Implementations keep whatever state they need across invocations; the
/// instance lives exactly as long as the (stream, node) pair it serves.
pub trait Filter: Send {
    fn filter(&mut self, packets: Vec<Packet>, ctx: &FilterContext) -> Result<FilterOutput>;
}

/// Creates a fresh filter instance for a new (stream, node) pair.
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Resolves a named filter function from an externally supplied artifact.
///
/// How the code is obtained (shared object, embedded table, ...) is the
/// collaborator's business; the core only ever sees the factory.
pub trait FilterLoader: Send + Sync {
    fn load(&self, artifact: &str, name: &str) -> Result<FilterFactory>;
}

/// Id-indexed filter table: built-ins statically registered, user filters
/// added through [`FilterRegistry::register_user`].
pub struct FilterRegistry {
    table: RwLock<HashMap<u16, FilterFactory>>,
    next_user_id: AtomicU16,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        let registry = Self {
            table: RwLock::new(HashMap::new()),
            next_user_id: AtomicU16::new(FIRST_USER_FILTER_ID),
        };
        registry.register_with_id(FILTER_NULL, Arc::new(|| Box::<NullFilter>::default()));
        registry.register_with_id(FILTER_IDENTITY, Arc::new(|| Box::<IdentityFilter>::default()));
        registry.register_with_id(FILTER_INT_SUM, Arc::new(|| Box::<IntSumFilter>::default()));
        registry.register_with_id(FILTER_INT_MIN, Arc::new(|| Box::<IntMinFilter>::default()));
        registry.register_with_id(FILTER_INT_MAX, Arc::new(|| Box::<IntMaxFilter>::default()));
        registry.register_with_id(FILTER_AVERAGE, Arc::new(|| Box::<AverageFilter>::default()));
        registry
    }

    /// Register under an explicit id. Replaces any previous entry, which is
    /// what the flooded filter-load path wants: every node converges on the
    /// id the front-end allocated.
    pub fn register_with_id(&self, id: u16, factory: FilterFactory) {
        self.table.write().insert(id, factory);
    }

    /// Register a user filter, allocating the next free id.
    pub fn register_user(&self, factory: FilterFactory) -> u16 {
        let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
        self.register_with_id(id, factory);
        id
    }

    pub fn contains(&self, id: u16) -> bool {
        self.table.read().contains_key(&id)
    }

    /// Instantiate a fresh filter for a new (stream, node) pair.
    pub fn instantiate(&self, id: u16) -> Result<Box<dyn Filter>> {
        let table = self.table.read();
        let factory = table
            .get(&id)
            .ok_or_else(|| NetError::new(ErrorKind::NotFound, format!("unknown filter id {id}")))?;
        Ok(factory())
    }
}

/// Resolve which filter id applies to `rank` under a filter-assignment
/// string: `<filter_id> => <rank_list> ; ...`.
///
/// Clauses are evaluated left to right and the first match wins. A bare id
/// (no `=>`) or a `*` rank list matches every rank, so heterogeneous
/// assignments typically end with a catch-all clause. An empty string or no
/// matching clause resolves to the identity filter.
pub fn resolve_assignment(assignment: &str, rank: Rank) -> Result<u16> {
    for clause in assignment.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (id_str, ranks_str) = match clause.split_once("=>") {
            Some((id, ranks)) => (id.trim(), Some(ranks.trim())),
            None => (clause, None),
        };
        let id: u16 = id_str.parse().map_err(|_| {
            NetError::new(
                ErrorKind::Protocol,
                format!("invalid filter id '{id_str}' in assignment '{assignment}'"),
            )
        })?;
        match ranks_str {
            None | Some("*") => return Ok(id),
            Some(ranks) => {
                for r in ranks.split(',') {
                    let r = r.trim();
                    if r.is_empty() {
                        continue;
                    }
                    let parsed: Rank = r.parse().map_err(|_| {
                        NetError::new(
                            ErrorKind::Protocol,
                            format!("invalid rank '{r}' in assignment '{assignment}'"),
                        )
                    })?;
                    if parsed == rank {
                        return Ok(id);
                    }
                }
            }
        }
    }
    Ok(FILTER_IDENTITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Value;

    #[test]
    fn test_builtin_ids_registered() {
        let registry = FilterRegistry::new();
        for id in [
            FILTER_NULL,
            FILTER_IDENTITY,
            FILTER_INT_SUM,
            FILTER_INT_MIN,
            FILTER_INT_MAX,
            FILTER_AVERAGE,
        ] {
            assert!(registry.contains(id), "missing builtin {id}");
        }
        assert!(!registry.contains(99));
        assert!(registry.instantiate(99).is_err());
    }

    #[test]
    fn test_user_ids_start_above_builtins() {
        let registry = FilterRegistry::new();
        let id = registry.register_user(Arc::new(|| Box::<IdentityFilter>::default()));
        assert_eq!(id, FIRST_USER_FILTER_ID);
        let id2 = registry.register_user(Arc::new(|| Box::<IdentityFilter>::default()));
        assert_eq!(id2, FIRST_USER_FILTER_ID + 1);
        assert!(registry.contains(id));
    }

    #[test]
    fn test_instances_are_independent() {
        struct Counter(u32);
        impl Filter for Counter {
            fn filter(&mut self, packets: Vec<Packet>, _ctx: &FilterContext) -> Result<FilterOutput> {
                self.0 += 1;
                Ok(FilterOutput::forward(packets))
            }
        }
        let registry = FilterRegistry::new();
        let id = registry.register_user(Arc::new(|| Box::new(Counter(0))));
        let ctx = FilterContext {
            rank: 0,
            num_children: 0,
            num_descendants: 0,
        };
        let pkt = Packet::pack(1, 100, 0, "%d", &[Value::Int32(1)]).unwrap();
        let mut a = registry.instantiate(id).unwrap();
        let mut b = registry.instantiate(id).unwrap();
        a.filter(vec![pkt.clone()], &ctx).unwrap();
        a.filter(vec![pkt.clone()], &ctx).unwrap();
        // `b` is unaffected by `a`'s invocations; exercised indirectly by the
        // fact that both succeed from their initial state.
        b.filter(vec![pkt], &ctx).unwrap();
    }

    #[test]
    fn test_assignment_bare_id() {
        assert_eq!(resolve_assignment("2", 7).unwrap(), 2);
        assert_eq!(resolve_assignment(" 2 ", 0).unwrap(), 2);
    }

    #[test]
    fn test_assignment_heterogeneous() {
        let assignment = "3 => 4,5 ; 2 => 6 ; 1 => *";
        assert_eq!(resolve_assignment(assignment, 4).unwrap(), 3);
        assert_eq!(resolve_assignment(assignment, 5).unwrap(), 3);
        assert_eq!(resolve_assignment(assignment, 6).unwrap(), 2);
        assert_eq!(resolve_assignment(assignment, 7).unwrap(), 1);
    }

    #[test]
    fn test_assignment_first_match_wins() {
        assert_eq!(resolve_assignment("4 => 1 ; 5 => 1", 1).unwrap(), 4);
    }

    #[test]
    fn test_assignment_defaults_to_identity() {
        assert_eq!(resolve_assignment("", 3).unwrap(), FILTER_IDENTITY);
        assert_eq!(resolve_assignment("2 => 9", 3).unwrap(), FILTER_IDENTITY);
    }

    #[test]
    fn test_assignment_malformed() {
        assert!(resolve_assignment("notanid", 0).is_err());
        assert!(resolve_assignment("2 => x", 0).is_err());
    }
}

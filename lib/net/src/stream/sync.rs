// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Round synchronization for buffered upstream packets.
//!
//! Every intermediate node buffers arriving packets per source (its direct
//! children); the synchronization policy decides when a buffered "round" is
//! ready to hand to the filter:
//!
//! - `WaitForAll`: one packet from every currently-live expected source.
//!   A source marked failed leaves the wait set immediately, which may
//!   release pending rounds with fewer inputs.
//! - `DontWait`: every arrival fires on its own.
//! - `Timeout`: like `WaitForAll`, but a deadline set at the first arrival of
//!   a round fires whatever is buffered (best-effort partial aggregation).
//! - `WaitForAny`: the first arrival of a round fires; later arrivals for the
//!   same round are discarded. Round membership is a source's per-stream
//!   arrival index: the n-th packet from a source belongs to round n.
//!
//! Failure handling is policy-independent: the wait set shrinks immediately,
//! even while a `Timeout` deadline is pending (the timer stays armed for
//! whatever the shrunken set still owes).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::topology::Rank;

/// When a buffered round is ready to invoke the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SyncPolicy {
    WaitForAll,
    DontWait,
    Timeout { millis: u64 },
    WaitForAny,
}

impl SyncPolicy {
    pub fn timeout(duration: Duration) -> Self {
        SyncPolicy::Timeout {
            millis: duration.as_millis() as u64,
        }
    }
}

/// Result of buffering one packet.
#[derive(Debug, Default)]
pub struct PushResult {
    /// Rounds released by this arrival, in firing order.
    pub rounds: Vec<Vec<Packet>>,
    /// Deadline the caller must arm, tagged with the round generation it
    /// belongs to (Timeout policy only, at most one per round).
    pub arm_deadline: Option<(u64, Duration)>,
}

/// Per-source round buffer for one stream at one node.
#[derive(Debug)]
pub struct RoundBuffer {
    policy: SyncPolicy,
    /// Live sources a `WaitForAll`/`Timeout` round waits on.
    expected: BTreeSet<Rank>,
    /// Buffered packets per source, FIFO. BTreeMap keeps round assembly
    /// deterministic.
    queues: BTreeMap<Rank, VecDeque<Packet>>,
    /// Total packets accepted per source; assigns `WaitForAny` rounds.
    arrivals: HashMap<Rank, u64>,
    /// Rounds fired so far; doubles as the deadline generation tag.
    round: u64,
    /// Whether a deadline is armed for the current round.
    deadline_armed: bool,
}

impl RoundBuffer {
    pub fn new(policy: SyncPolicy, expected: BTreeSet<Rank>) -> Self {
        Self {
            policy,
            expected,
            queues: BTreeMap::new(),
            arrivals: HashMap::new(),
            round: 0,
            deadline_armed: false,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn expected(&self) -> &BTreeSet<Rank> {
        &self.expected
    }

    /// Replace the wait set (membership or topology changed). May release
    /// rounds if the new set is already satisfied.
    pub fn set_expected(&mut self, expected: BTreeSet<Rank>) -> Vec<Vec<Packet>> {
        self.expected = expected;
        self.drain_ready()
    }

    /// Number of packets currently buffered across all sources.
    pub fn buffered(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Buffer one arrival from `src`.
    pub fn push(&mut self, src: Rank, packet: Packet) -> PushResult {
        let mut result = PushResult::default();
        match self.policy {
            SyncPolicy::DontWait => {
                self.round += 1;
                result.rounds.push(vec![packet]);
            }
            SyncPolicy::WaitForAny => {
                let index = {
                    let counter = self.arrivals.entry(src).or_insert(0);
                    let index = *counter;
                    *counter += 1;
                    index
                };
                if index >= self.round {
                    self.round = index + 1;
                    result.rounds.push(vec![packet]);
                }
                // else: a round that already fired; discard.
            }
            SyncPolicy::WaitForAll => {
                self.enqueue(src, packet);
                result.rounds = self.drain_ready();
            }
            SyncPolicy::Timeout { millis } => {
                self.enqueue(src, packet);
                result.rounds = self.drain_ready();
                if self.buffered() > 0 && !self.deadline_armed {
                    self.deadline_armed = true;
                    result.arm_deadline = Some((self.round, Duration::from_millis(millis)));
                }
            }
        }
        result
    }

    /// Remove a failed (or departed) source from the wait set. Its already
    /// buffered packets still count toward pending rounds.
    pub fn mark_failed(&mut self, src: Rank) -> Vec<Vec<Packet>> {
        self.expected.remove(&src);
        self.arrivals.remove(&src);
        self.drain_ready()
    }

    /// Arm a deadline for the current round if packets are waiting and no
    /// timer is pending (Timeout policy only). Called after a deadline fires
    /// with leftovers still buffered.
    pub fn arm_if_pending(&mut self) -> Option<(u64, Duration)> {
        if let SyncPolicy::Timeout { millis } = self.policy {
            if self.buffered() > 0 && !self.deadline_armed {
                self.deadline_armed = true;
                return Some((self.round, Duration::from_millis(millis)));
            }
        }
        None
    }

    /// A previously armed deadline fired. Returns the partial round if the
    /// generation still matches (i.e. the round did not complete in the
    /// meantime) and anything is buffered.
    pub fn fire_deadline(&mut self, generation: u64) -> Option<Vec<Packet>> {
        if generation != self.round {
            return None;
        }
        self.deadline_armed = false;
        let round = self.collect_round();
        if round.is_empty() {
            None
        } else {
            self.round += 1;
            Some(round)
        }
    }

    fn enqueue(&mut self, src: Rank, packet: Packet) {
        self.queues.entry(src).or_default().push_back(packet);
    }

    /// True when every live expected source has a buffered packet.
    fn ready(&self) -> bool {
        !self.expected.is_empty()
            && self
                .expected
                .iter()
                .all(|r| self.queues.get(r).map(|q| !q.is_empty()).unwrap_or(false))
    }

    /// Pop one packet from every non-empty queue (not just expected ones, so
    /// contributions from sources that failed after arrival are not lost).
    fn collect_round(&mut self) -> Vec<Packet> {
        let mut round = Vec::new();
        for queue in self.queues.values_mut() {
            if let Some(pkt) = queue.pop_front() {
                round.push(pkt);
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        round
    }

    fn drain_ready(&mut self) -> Vec<Vec<Packet>> {
        let mut rounds = Vec::new();
        while self.ready() {
            rounds.push(self.collect_round());
            self.round += 1;
            self.deadline_armed = false;
        }
        rounds
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Orphan adoption: choosing a new parent for a subtree that lost its path to
//! the root.
//!
//! Candidates are every non-failed, non-back-end node outside the orphan's
//! own subtree. Each is scored by combining the depth increase the orphan
//! would impose on the tree with how the adopter's resulting fan-out sits
//! relative to the configured `[min_fanout, max_fanout]` band; a random key
//! spreads load and breaks ties. Selection among scored candidates follows
//! the configured [`AdoptionPolicy`].
//!
//! This module only picks; connection establishment and the `set_parent`
//! mutation are driven by the network's recovery loop, which holds the
//! topology lock for the mutation but never across a connect.

use rand::Rng;

use crate::config::{AdoptionPolicy, NetworkConfig};

use super::{Rank, Topology};

/// Score breakdown for one candidate, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdoptionScore {
    pub candidate: Rank,
    /// Levels the adoption would add beyond the current tree height.
    pub depth_increase: u32,
    /// Candidate fan-out after adopting the orphan.
    pub resulting_fanout: usize,
    /// Combined weight; higher is better, always positive.
    pub weight: f64,
}

impl Topology {
    /// Every node eligible to adopt `orphan`: reachable from the root, not
    /// failed, not a back-end, and not inside the orphan's own subtree.
    pub fn adoption_candidates(&self, orphan: Rank) -> Vec<Rank> {
        let root = self.root();
        let mut out: Vec<Rank> = std::iter::once(root)
            .chain(self.internal_nodes().iter().copied())
            .filter(|r| {
                let node = match self.find_node(*r) {
                    Some(n) => n,
                    None => return false,
                };
                if node.is_failed() || self.subtree_contains(orphan, *r) {
                    return false;
                }
                // Internal nodes detached by an earlier failure are not
                // routes to the root.
                *r == root || self.subtree_contains(root, *r)
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Score one candidate for adopting `orphan`.
    pub fn score_candidate(&self, candidate: Rank, orphan: Rank, config: &NetworkConfig) -> AdoptionScore {
        let tree_height = self.subtree_height(self.root());
        let orphan_height = self.subtree_height(orphan);
        let cand_node = self.find_node(candidate).expect("candidate exists");

        let new_path = cand_node.depth() + 1 + orphan_height;
        let depth_increase = new_path.saturating_sub(tree_height);
        let resulting_fanout = cand_node.fanout() + 1;

        let w_depth = 1.0 / (1.0 + depth_increase as f64);
        let w_fanout = if resulting_fanout > config.max_fanout {
            0.25 / (1.0 + (resulting_fanout - config.max_fanout) as f64)
        } else if resulting_fanout <= config.min_fanout {
            1.5
        } else {
            1.0
        };

        AdoptionScore {
            candidate,
            depth_increase,
            resulting_fanout,
            weight: w_depth * w_fanout,
        }
    }

    /// Pick an adopter for `orphan`, skipping ranks in `exclude` (candidates
    /// already tried in this recovery pass). Returns `None` when no eligible
    /// candidate remains.
    pub fn choose_adopter<R: Rng>(
        &mut self,
        orphan: Rank,
        config: &NetworkConfig,
        exclude: &[Rank],
        rng: &mut R,
    ) -> Option<Rank> {
        let candidates: Vec<Rank> = self
            .adoption_candidates(orphan)
            .into_iter()
            .filter(|r| !exclude.contains(r))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let scores: Vec<AdoptionScore> = candidates
            .iter()
            .map(|c| self.score_candidate(*c, orphan, config))
            .collect();
        for score in &scores {
            if let Some(node) = self.nodes.get_mut(&score.candidate) {
                node.adoption_score = score.weight;
            }
        }

        match config.adoption_policy {
            AdoptionPolicy::Random => {
                // Prefer candidates that stay within the fan-out cap.
                let within: Vec<Rank> = scores
                    .iter()
                    .filter(|s| s.resulting_fanout <= config.max_fanout)
                    .map(|s| s.candidate)
                    .collect();
                let pool = if within.is_empty() { candidates } else { within };
                Some(pool[rng.gen_range(0..pool.len())])
            }
            AdoptionPolicy::WeightedRandom => {
                // Weighted random sampling without replacement (we only need
                // the top item): key = u^(1/weight), pick the max key.
                let mut best: Option<(f64, Rank)> = None;
                for score in &scores {
                    let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                    let key = u.powf(1.0 / score.weight);
                    if let Some(node) = self.nodes.get_mut(&score.candidate) {
                        node.weighted_key = key;
                    }
                    if best.map(|(k, _)| key > k).unwrap_or(true) {
                        best = Some((key, score.candidate));
                    }
                }
                best.map(|(_, r)| r)
            }
            AdoptionPolicy::SortedRoundRobin => {
                let mut sorted = scores;
                sorted.sort_by(|a, b| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.candidate.cmp(&b.candidate))
                });
                sorted.first().map(|s| s.candidate)
            }
        }
    }
}

//! Layered proximity graph: construction and search.
//!
//! Implements the HNSW algorithms over a [`NodeStore`]:
//! - level draw from an exponential distribution with factor `1 / ln(M)`
//! - width-1 greedy descent through the upper layers
//! - beam search within one layer
//! - diversity-pruning neighbor selection
//! - bidirectional linking with copy-then-install pruning of over-full lists
//!
//! All methods take `&self`; concurrent inserts and searches synchronise through
//! the store's per-slot locks, the entry-point lock and, for inserts that
//! raise the top layer, a promotion mutex.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use parking_lot::{Mutex, RwLock};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::config::IndexConfig;
use crate::distance::Distance;
use crate::error::{Error, Result};
use crate::store::{Label, NodeId, NodeStore};
use crate::visited::VisitedPool;

/// Node at the top of the hierarchy where every descent starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub(crate) id: NodeId,
    pub(crate) level: usize,
}

/// The multi-layer graph plus the parameters that shaped it.
#[derive(Debug)]
pub(crate) struct Graph {
    pub(crate) store: NodeStore,
    distance: Distance,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ml: f64,
    seed: u64,
    entry: RwLock<Option<EntryPoint>>,
    /// Held by an insert whose level is above the entry point, from linking
    /// through promotion, so promotions happen one at a time.
    promotion: Mutex<()>,
    /// One generator for all threads: single-threaded builds are reproducible
    /// for a given seed, multi-threaded builds depend on scheduling.
    rng: Mutex<ChaCha8Rng>,
    visited: VisitedPool,
}

impl Graph {
    /// Create an empty graph.
    pub(crate) fn new(distance: Distance, capacity: usize, config: &IndexConfig) -> Self {
        Self::from_store(NodeStore::new(distance.dim(), capacity), distance, config, None)
    }

    /// Wrap an already populated store (used when loading).
    pub(crate) fn from_store(
        store: NodeStore,
        distance: Distance,
        config: &IndexConfig,
        entry: Option<EntryPoint>,
    ) -> Self {
        Self {
            store,
            distance,
            m: config.m,
            m0: config.m0,
            ef_construction: config.ef_construction,
            ml: config.ml(),
            seed: config.seed,
            entry: RwLock::new(entry),
            promotion: Mutex::new(()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed)),
            visited: VisitedPool::new(),
        }
    }

    pub(crate) fn m(&self) -> usize {
        self.m
    }

    pub(crate) fn m0(&self) -> usize {
        self.m0
    }

    pub(crate) fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn entry_point(&self) -> Option<EntryPoint> {
        *self.entry.read()
    }

    /// Neighbor limit at `layer`.
    #[inline]
    pub(crate) fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Generate a random level for a new node.
    fn random_level(&self) -> usize {
        // gen() is in [0, 1); flip it so ln never sees 0.
        let r: f64 = 1.0 - self.rng.lock().gen::<f64>();
        (-r.ln() * self.ml).floor() as usize
    }

    #[inline]
    fn dist(&self, query: &[f32], id: NodeId) -> f32 {
        match self.store.vector(id) {
            Some(v) => self.distance.eval(query, v),
            None => f32::INFINITY,
        }
    }

    /// Width-1 greedy search: move to a strictly closer neighbor until none is.
    ///
    /// `skip` is never moved to (the node being inserted, which concurrent
    /// inserts may already link to).
    fn greedy_closest(
        &self,
        query: &[f32],
        entry_point: NodeId,
        layer: usize,
        skip: Option<NodeId>,
    ) -> NodeId {
        let mut curr_node = entry_point;
        let mut curr_dist = self.dist(query, curr_node);

        loop {
            let mut changed = false;
            let links = self.store.links(curr_node, layer);
            for &neighbor in links.iter() {
                if Some(neighbor) == skip {
                    continue;
                }
                let dist = self.dist(query, neighbor);
                if dist < curr_dist {
                    curr_dist = dist;
                    curr_node = neighbor;
                    changed = true;
                }
            }
            drop(links);

            if !changed {
                break;
            }
        }

        curr_node
    }

    /// Beam search within one layer.
    ///
    /// Every reached node can route the search, but only nodes passing `accept`
    /// enter the result set. Returns `(distance, id)` ascending, at most `ef`.
    fn search_layer<F>(
        &self,
        query: &[f32],
        seeds: &[NodeId],
        ef: usize,
        layer: usize,
        accept: F,
    ) -> Vec<(f32, NodeId)>
    where
        F: Fn(NodeId) -> bool,
    {
        let mut visited = self.visited.acquire(self.store.len());

        // candidates: min-heap (closest first) of nodes to expand
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, NodeId)>> = BinaryHeap::new();
        // results: max-heap (furthest first) for pruning
        let mut results: BinaryHeap<(OrderedFloat<f32>, NodeId)> = BinaryHeap::new();

        for &seed in seeds {
            if !visited.insert(seed) {
                continue;
            }
            let dist = self.dist(query, seed);
            candidates.push(Reverse((OrderedFloat(dist), seed)));
            if accept(seed) {
                results.push((OrderedFloat(dist), seed));
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        let mut lower_bound = results.peek().map_or(f32::INFINITY, |(d, _)| d.0);

        while let Some(Reverse((OrderedFloat(cand_dist), cand_id))) = candidates.pop() {
            if cand_dist > lower_bound && results.len() >= ef {
                break;
            }

            let links = self.store.links(cand_id, layer);
            for &neighbor in links.iter() {
                if !visited.insert(neighbor) {
                    continue;
                }

                let dist = self.dist(query, neighbor);
                if results.len() < ef || dist < lower_bound {
                    candidates.push(Reverse((OrderedFloat(dist), neighbor)));

                    if accept(neighbor) {
                        results.push((OrderedFloat(dist), neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }

                    if let Some((worst, _)) = results.peek() {
                        lower_bound = worst.0;
                    }
                }
            }
        }

        self.visited.release(visited);

        let mut result_vec: Vec<(f32, NodeId)> =
            results.into_iter().map(|(d, id)| (d.0, id)).collect();
        result_vec.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        result_vec
    }

    /// Diversity-pruning heuristic.
    ///
    /// `candidates` must be sorted by ascending distance to the base node. A
    /// candidate is admitted only if it is at least as close to the base as to
    /// every neighbor admitted before it. Stops at `m` admissions.
    fn select_neighbors(&self, candidates: &[(f32, NodeId)], m: usize) -> Vec<(f32, NodeId)> {
        let mut selected: Vec<(f32, NodeId)> = Vec::with_capacity(m);

        for &(dist_to_base, cid) in candidates {
            if selected.len() >= m {
                break;
            }
            let Some(cand_vec) = self.store.vector(cid) else {
                continue;
            };

            let is_diverse = selected.iter().all(|&(_, sid)| {
                self.store
                    .vector(sid)
                    .is_none_or(|sel_vec| self.distance.eval(cand_vec, sel_vec) >= dist_to_base)
            });

            if is_diverse {
                selected.push((dist_to_base, cid));
            }
        }

        selected
    }

    /// Shrink `ids` to at most `max` neighbors of `base` using the heuristic.
    fn prune(&self, base: NodeId, ids: &[NodeId], max: usize) -> Vec<NodeId> {
        let Some(base_vec) = self.store.vector(base) else {
            return ids.iter().copied().take(max).collect();
        };

        let mut scored: Vec<(f32, NodeId)> =
            ids.iter().map(|&n| (self.dist(base_vec, n), n)).collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        self.select_neighbors(&scored, max)
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }

    /// Link a freshly inserted node to its selected neighbors at one layer.
    fn connect(&self, id: NodeId, layer: usize, selected: &[(f32, NodeId)]) {
        let max = self.max_links(layer);

        // Own list first. Concurrent inserts may already have linked to us.
        {
            let _guard = self.store.lock(id);
            let existing: Vec<NodeId> = self.store.links(id, layer).to_vec();
            let mut list: Vec<NodeId> = selected.iter().map(|&(_, n)| n).collect();
            for n in existing {
                if n != id && !list.contains(&n) {
                    list.push(n);
                }
            }
            if list.len() > max {
                list = self.prune(id, &list, max);
            }
            self.store.set_links(id, layer, list);
        }

        // Reverse edges. Both slots are locked so the forward edge cannot be
        // pruned away between the check and the append.
        for &(_, neighbor) in selected {
            if self.store.level(neighbor).is_none_or(|l| l < layer) {
                continue;
            }

            let _guard = self.store.lock_pair(id, neighbor);
            if !self.store.links(id, layer).contains(&neighbor) {
                continue;
            }

            let mut list: Vec<NodeId> = self.store.links(neighbor, layer).to_vec();
            if list.contains(&id) {
                continue;
            }
            list.push(id);
            if list.len() > max {
                list = self.prune(neighbor, &list, max);
            }
            self.store.set_links(neighbor, layer, list);
        }
    }

    /// Insert a validated vector under `label`. Returns the new internal id.
    ///
    /// Fails only before anything is written (duplicate label, full store).
    pub(crate) fn insert(&self, label: Label, vector: &[f32]) -> Result<NodeId> {
        let level = self.random_level();
        let id = self.store.allocate(label, vector, level)?;

        let mut entry = match self.entry_point() {
            Some(entry) => entry,
            None => {
                let mut slot = self.entry.write();
                match *slot {
                    Some(entry) => entry,
                    None => {
                        *slot = Some(EntryPoint { id, level });
                        return Ok(id);
                    }
                }
            }
        };

        // A node reaching above the entry point links against the entry point
        // current after any promotion in flight has finished.
        let _promotion = if level > entry.level {
            let guard = self.promotion.lock();
            if let Some(current) = self.entry_point() {
                entry = current;
            }
            Some(guard)
        } else {
            None
        };

        // Greedy descent to the node's own top layer
        let mut curr_node = entry.id;
        for layer in (level + 1..=entry.level).rev() {
            curr_node = self.greedy_closest(vector, curr_node, layer, Some(id));
        }

        let mut seeds = vec![curr_node];
        for layer in (0..=level.min(entry.level)).rev() {
            let candidates =
                self.search_layer(vector, &seeds, self.ef_construction, layer, |n| n != id);

            let selected = self.select_neighbors(&candidates, self.max_links(layer));
            self.connect(id, layer, &selected);

            seeds.clear();
            seeds.extend(candidates.iter().map(|&(_, n)| n));
            if seeds.is_empty() {
                seeds.push(entry.id);
            }
        }

        if level > entry.level {
            let mut slot = self.entry.write();
            if slot.is_none_or(|current| level > current.level) {
                tracing::debug!(id, level, "promoting new entry point");
                *slot = Some(EntryPoint { id, level });
            }
        }

        Ok(id)
    }

    /// k nearest live nodes to a validated query, `(distance, id)` ascending.
    ///
    /// Tombstoned nodes still route the search; they are only kept out of the
    /// result set.
    pub(crate) fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(f32, NodeId)> {
        if k == 0 {
            return Vec::new();
        }
        let Some(entry) = self.entry_point() else {
            return Vec::new();
        };

        let mut curr_node = entry.id;
        for layer in (1..=entry.level).rev() {
            curr_node = self.greedy_closest(query, curr_node, layer, None);
        }

        let ef = ef.max(k);
        let mut results =
            self.search_layer(query, &[curr_node], ef, 0, |n| !self.store.is_deleted(n));
        results.truncate(k);
        results
    }

    /// Verify the structural invariants of a quiescent graph.
    pub(crate) fn check_invariants(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Integrity(msg));
        let count = self.store.len();

        let mut top_level = None;
        for id in 0..count as NodeId {
            let Some(level) = self.store.level(id) else {
                return fail(format!("slot {} below count is empty", id));
            };
            top_level = top_level.max(Some(level));

            let links = self.store.all_links(id);
            if links.len() != level + 1 {
                return fail(format!(
                    "node {} has {} layers of links, expected {}",
                    id,
                    links.len(),
                    level + 1
                ));
            }

            for (layer, list) in links.iter().enumerate() {
                if list.len() > self.max_links(layer) {
                    return fail(format!(
                        "node {} has {} neighbors at layer {}, limit {}",
                        id,
                        list.len(),
                        layer,
                        self.max_links(layer)
                    ));
                }
                for (pos, &n) in list.iter().enumerate() {
                    if n == id {
                        return fail(format!("node {} links to itself at layer {}", id, layer));
                    }
                    if n as usize >= count {
                        return fail(format!(
                            "node {} links to {} at layer {}, beyond count {}",
                            id, n, layer, count
                        ));
                    }
                    if self.store.level(n).is_none_or(|l| l < layer) {
                        return fail(format!(
                            "node {} links to {} at layer {} above its top layer",
                            id, n, layer
                        ));
                    }
                    if list[..pos].contains(&n) {
                        return fail(format!(
                            "node {} lists {} twice at layer {}",
                            id, n, layer
                        ));
                    }
                }
            }
        }

        match (self.entry_point(), top_level) {
            (None, None) => {}
            (Some(entry), Some(top)) => {
                if self.store.level(entry.id) != Some(entry.level) || entry.level != top {
                    return fail(format!(
                        "entry point {} at level {} is not at the top layer {}",
                        entry.id, entry.level, top
                    ));
                }
            }
            (entry, _) => {
                return fail(format!(
                    "entry point {:?} inconsistent with {} elements",
                    entry, count
                ));
            }
        }

        let labels = self.store.label_entries();
        if labels.len() != count {
            return fail(format!(
                "label map has {} entries for {} elements",
                labels.len(),
                count
            ));
        }
        for (label, id) in labels {
            if self.store.label(id) != Some(label) {
                return fail(format!("label {} maps to id {} holding another label", label, id));
            }
        }

        Ok(())
    }
}

//! Nearest-neighbor index over resource embeddings.
//!
//! Two layers answer a query:
//!
//! - a **graph** (HNSW, cosine distance) built from a snapshot of the live
//!   vectors by [`SimilarityIndex::rebuild`], and
//! - a **delta** of resources upserted since that snapshot, scanned exactly.
//!
//! Removals and re-upserts invalidate their graph slot immediately; stale
//! slots are filtered at query time. Every `upsert`/`remove` is therefore
//! visible to the very next `search`: the staleness window affects only
//! speed (delta and stale slots grow until the next rebuild), never results.
//!
//! Below `min_vectors_for_ann` live vectors the index falls back to an exact
//! linear scan. A graph query that cannot fill `k` results (the graph is
//! approximate, and filtering drops inactive slots) is answered by the exact
//! scan as well, so every active resource is returned when fewer than `k`
//! exist.
//!
//! Rebuilds are serialized; each one recomputes the delta from the live
//! vectors when it swaps its graph in.
//!
//! ## Ordering
//!
//! Results are sorted by distance ascending, ties broken by resource id
//! ascending, and contain only resources whose status is `Active`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hnsw_rs::prelude::*;
use parking_lot::{Mutex, RwLock};

use crate::core::embedding_store::validate_vector;
use crate::core::waitlist::StatusObserver;
use crate::core::MatchError;
use crate::util::serde::{ResourceId, ResourceStatus};

/// HNSW needs a handful of points before its layer heuristics make sense.
const MIN_GRAPH_POINTS: usize = 10;

/// Configuration for index construction and querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Neighbors per graph node. Default: 16
    pub m: usize,
    /// Candidate list size during construction. Default: 200
    pub ef_construction: usize,
    /// Candidate list size during search. Default: 64
    pub ef_search: usize,
    /// Minimum live vectors before the graph is used. Default: 1000
    pub min_vectors_for_ann: usize,
    /// Pending changes (delta + stale slots) that make `needs_rebuild` true. Default: 256
    pub rebuild_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            min_vectors_for_ann: 1000,
            rebuild_threshold: 256,
        }
    }
}

impl IndexConfig {
    /// Set neighbors per node.
    #[must_use]
    pub const fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    /// Set construction candidate list size.
    #[must_use]
    pub const fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Set search candidate list size.
    #[must_use]
    pub const fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Set the graph threshold.
    #[must_use]
    pub const fn with_min_vectors_for_ann(mut self, min: usize) -> Self {
        self.min_vectors_for_ann = min;
        self
    }

    /// Set the auto-rebuild threshold.
    #[must_use]
    pub const fn with_rebuild_threshold(mut self, threshold: usize) -> Self {
        self.rebuild_threshold = threshold;
        self
    }

    /// Whether the graph should serve queries at this dataset size.
    pub const fn should_use_ann(&self, num_vectors: usize) -> bool {
        num_vectors >= self.min_vectors_for_ann
    }

    /// Validate construction parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.m == 0 {
            return Err("m must be greater than 0".into());
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err("ef_construction and ef_search must be greater than 0".into());
        }
        if self.rebuild_threshold == 0 {
            return Err("rebuild_threshold must be greater than 0".into());
        }
        Ok(())
    }
}

/// A search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Matching resource.
    pub resource_id: ResourceId,
    /// Cosine distance to the query (lower = closer), in `[0, 2]`.
    pub distance: f32,
}

impl Neighbor {
    /// Similarity score shown to users: `max(1 - distance / 2, 0)`.
    pub fn similarity(&self) -> f32 {
        (1.0 - self.distance / 2.0).max(0.0)
    }
}

/// Distance ascending, then resource id ascending.
pub(crate) fn nearest_first(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.resource_id.cmp(&b.resource_id))
}

struct Graph {
    hnsw: Hnsw<'static, f32, DistCosine>,
    /// Graph data id → resource.
    slots: Vec<ResourceId>,
}

#[derive(Default)]
struct IndexState {
    vectors: HashMap<ResourceId, Arc<Vec<f32>>>,
    status: HashMap<ResourceId, ResourceStatus>,
    graph: Option<Graph>,
    /// Resources whose graph slot holds their current vector.
    in_graph: HashSet<ResourceId>,
    /// Live resources not (currently) represented in the graph.
    delta: HashSet<ResourceId>,
}

impl IndexState {
    fn is_searchable(&self, id: ResourceId) -> bool {
        self.status
            .get(&id)
            .is_some_and(|s| s.is_searchable())
    }

    fn stale_slots(&self) -> usize {
        self.graph
            .as_ref()
            .map_or(0, |g| g.slots.len().saturating_sub(self.in_graph.len()))
    }
}

/// Concurrent similarity index with incremental upsert/remove.
pub struct SimilarityIndex {
    dimension: usize,
    config: IndexConfig,
    state: RwLock<IndexState>,
    build_guard: Mutex<()>,
}

impl SimilarityIndex {
    /// Create an empty index.
    pub fn new(dimension: usize, config: IndexConfig) -> Self {
        Self {
            dimension,
            config,
            state: RwLock::new(IndexState::default()),
            build_guard: Mutex::new(()),
        }
    }

    /// Insert or replace the vector of a resource. New resources start `Active`.
    pub fn upsert(&self, resource_id: ResourceId, vector: Vec<f32>) -> Result<(), MatchError> {
        validate_vector(self.dimension, &vector)?;
        let mut state = self.state.write();
        state.vectors.insert(resource_id, Arc::new(vector));
        state
            .status
            .entry(resource_id)
            .or_insert(ResourceStatus::Active);
        state.in_graph.remove(&resource_id);
        state.delta.insert(resource_id);
        Ok(())
    }

    /// Remove a resource. Returns whether it was indexed.
    pub fn remove(&self, resource_id: ResourceId) -> bool {
        let mut state = self.state.write();
        state.status.remove(&resource_id);
        state.in_graph.remove(&resource_id);
        state.delta.remove(&resource_id);
        state.vectors.remove(&resource_id).is_some()
    }

    /// Record the status of an indexed resource. Returns false if it is not indexed.
    pub fn set_status(&self, resource_id: ResourceId, status: ResourceStatus) -> bool {
        let mut state = self.state.write();
        if !state.vectors.contains_key(&resource_id) {
            return false;
        }
        state.status.insert(resource_id, status);
        true
    }

    /// Status of an indexed resource.
    pub fn status(&self, resource_id: ResourceId) -> Option<ResourceStatus> {
        self.state.read().status.get(&resource_id).copied()
    }

    /// Up to `k` active resources nearest to `query`, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, MatchError> {
        validate_vector(self.dimension, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let hits = match state.graph.as_ref() {
            Some(graph) if self.config.should_use_ann(state.vectors.len()) => {
                Self::graph_search(&state, graph, query, k, self.config.ef_search)
                    .map(|mut hits| {
                        hits.extend(
                            state
                                .delta
                                .iter()
                                .filter_map(|id| Self::exact_hit(&state, *id, query)),
                        );
                        nearest_k(hits, k)
                    })
                    .filter(|hits| hits.len() == k)
                    .unwrap_or_else(|| nearest_k(Self::exact_scan(&state, query), k))
            }
            _ => nearest_k(Self::exact_scan(&state, query), k),
        };
        Ok(hits)
    }

    fn exact_scan(state: &IndexState, query: &[f32]) -> Vec<Neighbor> {
        state
            .vectors
            .keys()
            .filter_map(|id| Self::exact_hit(state, *id, query))
            .collect()
    }

    fn exact_hit(state: &IndexState, id: ResourceId, query: &[f32]) -> Option<Neighbor> {
        if !state.is_searchable(id) {
            return None;
        }
        state.vectors.get(&id).map(|v| Neighbor {
            resource_id: id,
            distance: cosine_distance(query, v),
        })
    }

    /// `None` when the over-fetch would cover the whole graph; the exact scan
    /// is then both cheaper and complete.
    fn graph_search(
        state: &IndexState,
        graph: &Graph,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Option<Vec<Neighbor>> {
        // Over-fetch by the number of slots the filter will discard.
        let inactive = state
            .in_graph
            .iter()
            .filter(|id| !state.is_searchable(**id))
            .count();
        let fetch = k + state.stale_slots() + inactive;
        if fetch >= graph.slots.len() {
            return None;
        }
        let ef = ef_search.max(fetch);

        let hits = graph
            .hnsw
            .search(query, fetch, ef)
            .into_iter()
            .filter_map(|n| {
                let id = *graph.slots.get(n.get_origin_id())?;
                (state.in_graph.contains(&id) && state.is_searchable(id)).then_some(Neighbor {
                    resource_id: id,
                    distance: n.distance,
                })
            })
            .collect();
        Some(hits)
    }

    /// Rebuild the graph from the current live vectors. Returns the number of
    /// vectors placed in the graph (0 when the index is below the graph threshold).
    ///
    /// The graph is built without holding the index lock; resources upserted
    /// or removed during the build stay in the delta. Concurrent calls run
    /// one after another.
    pub fn rebuild(&self) -> usize {
        let _build = self.build_guard.lock();
        let mut snapshot: Vec<(ResourceId, Arc<Vec<f32>>)> = {
            let state = self.state.read();
            state
                .vectors
                .iter()
                .map(|(id, v)| (*id, Arc::clone(v)))
                .collect()
        };
        snapshot.sort_unstable_by_key(|(id, _)| *id);

        let nb_elem = snapshot.len();
        if nb_elem < MIN_GRAPH_POINTS || !self.config.should_use_ann(nb_elem) {
            let mut state = self.state.write();
            state.graph = None;
            state.in_graph.clear();
            let live: HashSet<ResourceId> = state.vectors.keys().copied().collect();
            state.delta = live;
            tracing::debug!(vectors = nb_elem, "index below graph threshold; using linear scan");
            return 0;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let nb_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);
        let hnsw = Hnsw::<f32, DistCosine>::new(
            self.config.m,
            nb_elem,
            nb_layer,
            self.config.ef_construction,
            DistCosine {},
        );
        let data_for_insertion: Vec<(&Vec<f32>, usize)> = snapshot
            .iter()
            .enumerate()
            .map(|(slot, (_, v))| (v.as_ref(), slot))
            .collect();
        hnsw.parallel_insert(&data_for_insertion);
        let slots: Vec<ResourceId> = snapshot.iter().map(|(id, _)| *id).collect();

        let mut state = self.state.write();
        let in_graph: HashSet<ResourceId> = snapshot
            .iter()
            .filter(|(id, v)| state.vectors.get(id).is_some_and(|live| Arc::ptr_eq(live, v)))
            .map(|(id, _)| *id)
            .collect();
        let delta: HashSet<ResourceId> = state
            .vectors
            .keys()
            .filter(|id| !in_graph.contains(id))
            .copied()
            .collect();
        state.in_graph = in_graph;
        state.delta = delta;
        state.graph = Some(Graph { hnsw, slots });
        let carried = state.delta.len();
        drop(state);

        tracing::info!(vectors = nb_elem, carried_delta = carried, "similarity index rebuilt");
        nb_elem
    }

    /// Delta entries plus stale graph slots awaiting the next rebuild.
    pub fn pending_changes(&self) -> usize {
        let state = self.state.read();
        if state.graph.is_none() {
            // No graph: everything is scanned exactly, nothing is pending.
            return if self.config.should_use_ann(state.vectors.len()) {
                state.vectors.len()
            } else {
                0
            };
        }
        state.delta.len() + state.stale_slots()
    }

    /// Whether a rebuild is due.
    pub fn needs_rebuild(&self) -> bool {
        let pending = self.pending_changes();
        pending > 0 && pending >= self.config.rebuild_threshold.min(self.len().max(1))
    }

    /// Whether a graph is currently built.
    pub fn is_built(&self) -> bool {
        self.state.read().graph.is_some()
    }

    /// Number of indexed resources (any status).
    pub fn len(&self) -> usize {
        self.state.read().vectors.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.state.read().vectors.is_empty()
    }

    /// Configured dimension.
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current configuration.
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }
}

impl StatusObserver for SimilarityIndex {
    fn status_changed(&self, resource_id: ResourceId, status: ResourceStatus) {
        self.set_status(resource_id, status);
    }
}

/// Sort nearest first, drop duplicate ids and keep `k`.
fn nearest_k(mut hits: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    hits.sort_by(nearest_first);
    hits.dedup_by_key(|n| n.resource_id);
    hits.truncate(k);
    hits
}

/// Cosine distance (1 - cosine similarity). Zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle_deg: f32) -> Vec<f32> {
        let r = angle_deg.to_radians();
        vec![r.cos(), r.sin(), 0.0]
    }

    #[test]
    fn test_linear_search_orders_by_distance() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        index.upsert(1, unit(0.0)).unwrap();
        index.upsert(2, unit(60.0)).unwrap();
        index.upsert(3, unit(20.0)).unwrap();

        let hits = index.search(&unit(0.0), 3).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.resource_id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((hits[0].similarity() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        index.upsert(9, vec![0.8, 0.6, 0.0]).unwrap();
        index.upsert(4, vec![0.8, -0.6, 0.0]).unwrap();
        index.upsert(7, vec![0.8, 0.6, 0.0]).unwrap();

        let ids: Vec<_> = index
            .search(&[1.0, 0.0, 0.0], 3)
            .unwrap()
            .iter()
            .map(|h| h.resource_id)
            .collect();
        assert_eq!(ids, vec![4, 7, 9]);
    }

    #[test]
    fn test_excludes_inactive_without_padding() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        for (id, angle) in [(1, 0.0), (2, 10.0), (3, 20.0), (4, 30.0), (5, 40.0)] {
            index.upsert(id, unit(angle)).unwrap();
        }
        assert!(index.set_status(1, ResourceStatus::Exhausted));
        assert!(index.set_status(3, ResourceStatus::Exhausted));

        let ids: Vec<_> = index
            .search(&unit(0.0), 3)
            .unwrap()
            .iter()
            .map(|h| h.resource_id)
            .collect();
        assert_eq!(ids, vec![2, 4, 5]);

        index.set_status(5, ResourceStatus::Withdrawn);
        assert_eq!(index.search(&unit(0.0), 3).unwrap().len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_on_query_and_upsert() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        assert!(matches!(
            index.upsert(1, vec![1.0, 0.0]),
            Err(MatchError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(MatchError::DimensionMismatch { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn test_upsert_replaces_and_remove_hides() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        index.upsert(1, unit(90.0)).unwrap();
        index.upsert(2, unit(45.0)).unwrap();
        assert_eq!(index.search(&unit(0.0), 1).unwrap()[0].resource_id, 2);

        index.upsert(1, unit(1.0)).unwrap();
        assert_eq!(index.search(&unit(0.0), 1).unwrap()[0].resource_id, 1);

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert_eq!(index.search(&unit(0.0), 5).unwrap().len(), 1);
        assert!(!index.set_status(1, ResourceStatus::Active));
    }

    #[test]
    fn test_k_zero_and_empty_index() {
        let index = SimilarityIndex::new(3, IndexConfig::default());
        assert!(index.search(&unit(0.0), 4).unwrap().is_empty());
        index.upsert(1, unit(0.0)).unwrap();
        assert!(index.search(&unit(0.0), 0).unwrap().is_empty());
    }

    fn graph_index() -> SimilarityIndex {
        let index = SimilarityIndex::new(
            3,
            IndexConfig::default()
                .with_min_vectors_for_ann(1)
                .with_rebuild_threshold(4),
        );
        for i in 0..20u64 {
            #[allow(clippy::cast_precision_loss)]
            index.upsert(i, unit(i as f32 * 4.0)).unwrap();
        }
        index
    }

    #[test]
    fn test_rebuild_builds_graph_and_clears_delta() {
        let index = graph_index();
        assert!(!index.is_built());
        assert_eq!(index.pending_changes(), 20);

        assert_eq!(index.rebuild(), 20);
        assert!(index.is_built());
        assert_eq!(index.pending_changes(), 0);
        assert!(!index.needs_rebuild());

        let hits = index.search(&unit(40.0), 3).unwrap();
        assert_eq!(hits[0].resource_id, 10);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_changes_after_rebuild_are_visible_immediately() {
        let index = graph_index();
        index.rebuild();

        // New resource lands in the delta.
        index.upsert(100, unit(41.0)).unwrap();
        // Moved resource invalidates its slot.
        index.upsert(0, unit(39.5)).unwrap();
        // Removed resource leaves a stale slot.
        index.remove(10);
        assert_eq!(index.pending_changes(), 4);
        assert!(index.needs_rebuild());

        let ids: Vec<_> = index
            .search(&unit(40.5), 3)
            .unwrap()
            .iter()
            .map(|h| h.resource_id)
            .collect();
        assert_eq!(ids, vec![100, 0, 11]);

        index.rebuild();
        assert_eq!(index.pending_changes(), 0);
    }

    #[test]
    fn test_graph_search_filters_inactive() {
        let index = graph_index();
        index.rebuild();
        index.set_status(10, ResourceStatus::Exhausted);
        index.set_status(11, ResourceStatus::Exhausted);

        let ids: Vec<_> = index
            .search(&unit(41.0), 2)
            .unwrap()
            .iter()
            .map(|h| h.resource_id)
            .collect();
        assert_eq!(ids, vec![9, 12]);
    }

    #[test]
    fn test_graph_mode_returns_every_active_resource_when_k_covers_index() {
        let index = graph_index();
        index.rebuild();
        index.set_status(3, ResourceStatus::Withdrawn);
        index.upsert(100, unit(170.0)).unwrap();

        let hits = index.search(&unit(0.0), 50).unwrap();
        let mut ids: Vec<_> = hits.iter().map(|h| h.resource_id).collect();
        assert_eq!(ids.len(), 20);
        assert!(!ids.contains(&3));
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));

        ids.sort_unstable();
        let expected: Vec<u64> = (0..20u64).filter(|id| *id != 3).chain([100]).collect();
        assert_eq!(ids, expected);

        // One short of everything still sees the far-away delta entry.
        assert_eq!(index.search(&unit(0.0), 19).unwrap().len(), 19);
        assert!(index
            .search(&unit(170.0), 19)
            .unwrap()
            .iter()
            .any(|h| h.resource_id == 100));
    }

    #[test]
    fn test_concurrent_rebuilds_keep_late_upserts_in_delta() {
        let index = Arc::new(graph_index());
        index.rebuild();

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for round in 0..10u64 {
                        if t % 2 == 0 {
                            index.rebuild();
                        } else {
                            let id = 1000 + t * 100 + round;
                            #[allow(clippy::cast_precision_loss)]
                            index.upsert(id, unit(round as f32 * 7.0 + 1.0)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        {
            let state = index.state.read();
            for id in state.vectors.keys() {
                assert!(
                    state.in_graph.contains(id) != state.delta.contains(id),
                    "resource {id} must be in exactly one of graph and delta"
                );
            }
        }
        let hits = index.search(&unit(0.0), 100).unwrap();
        assert_eq!(hits.len(), 40);
        for id in (1100..1110).chain(1300..1310) {
            assert!(hits.iter().any(|h| h.resource_id == id), "resource {id} not found");
        }

        index.rebuild();
        assert_eq!(index.pending_changes(), 0);
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}

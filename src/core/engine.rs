//! The assembled engine: listing-service entry points plus matching.
//!
//! `MatchEngine` keeps catalog, embedding store, similarity index and ledger
//! in step. The index observes ledger status changes under the ledger lock,
//! and index writes made here run under the same lock, so search only returns
//! active resources.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::catalog::{Listing, NewListing, ResourceCatalog, ResourceView};
use crate::core::embedding_store::{validate_vector, Embedder, EmbeddingStore};
use crate::core::orchestrator::{
    MatchOrchestrator, MatchQuery, MatchResult, OrchestratorStats, RankedCandidate,
};
use crate::core::scorer::{
    Candidate, DemandModel, ModelHandle, RankingScorer, Score, ScorerStats,
};
use crate::core::similarity_index::SimilarityIndex;
use crate::core::waitlist::{StatusObserver, WaitlistEntry, WaitlistManager, WaitlistStats};
use crate::core::MatchError;
use crate::util::serde::{EntryId, RequesterContext, RequesterId, ResourceId, ResourceStatus};

const POPULAR_TOP_N: usize = 10;
const ACTIVE_REQUESTERS_TOP_N: usize = 10;

/// Components an engine is assembled from.
pub struct EngineParts {
    /// Default `k` for matches that do not name one.
    pub default_k: usize,
    /// Listing metadata.
    pub catalog: Arc<ResourceCatalog>,
    /// Embedding store.
    pub store: Arc<EmbeddingStore>,
    /// Similarity index.
    pub index: Arc<SimilarityIndex>,
    /// Ranking scorer.
    pub scorer: Arc<RankingScorer>,
    /// Waitlist manager.
    pub waitlist: Arc<WaitlistManager>,
    /// Text embedder, if text queries and text listings are supported.
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// Dashboard aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Listings ever created.
    pub listings: usize,
    /// Vectors in the similarity index.
    pub indexed: usize,
    /// Index changes not yet folded into the graph.
    pub pending_index_changes: usize,
    /// Waitlist and allocation figures.
    pub waitlist: WaitlistStats,
    /// Scoring figures.
    pub scorer: ScorerStats,
    /// Match outcome figures.
    pub matches: OrchestratorStats,
    /// Most requested resources with request counts.
    pub popular: Vec<(ResourceId, u64)>,
    /// Requesters with the most accepted requests.
    pub active_requesters: Vec<(RequesterId, u64)>,
}

/// A resource's demand score independent of any requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Resource identifier.
    pub resource_id: ResourceId,
    /// Listing title.
    pub title: String,
    /// Score and where it came from.
    pub score: Score,
}

/// Resource matching and allocation engine.
pub struct MatchEngine {
    default_k: usize,
    catalog: Arc<ResourceCatalog>,
    store: Arc<EmbeddingStore>,
    index: Arc<SimilarityIndex>,
    scorer: Arc<RankingScorer>,
    waitlist: Arc<WaitlistManager>,
    embedder: Option<Arc<dyn Embedder>>,
    orchestrator: MatchOrchestrator,
}

impl MatchEngine {
    /// Assemble an engine.
    ///
    /// The index becomes the waitlist's status observer.
    pub fn new(parts: EngineParts) -> Self {
        parts
            .waitlist
            .set_status_observer(Arc::clone(&parts.index) as Arc<dyn StatusObserver>);
        let orchestrator = MatchOrchestrator::new(
            Arc::clone(&parts.catalog),
            Arc::clone(&parts.index),
            Arc::clone(&parts.scorer),
            Arc::clone(&parts.waitlist),
            parts.embedder.clone(),
        );
        Self {
            default_k: parts.default_k,
            catalog: parts.catalog,
            store: parts.store,
            index: parts.index,
            scorer: parts.scorer,
            waitlist: parts.waitlist,
            embedder: parts.embedder,
            orchestrator,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MatchError::Embedding("no embedder configured".into()))?;
        embedder.embed(text).await
    }

    /// List a resource, embedding its text with the configured embedder.
    pub async fn list_resource(
        &self,
        listing: NewListing,
        total_units: u32,
        now_ms: u128,
    ) -> Result<ResourceView, MatchError> {
        listing.validate(now_ms)?;
        let vector = self.embed(&listing.embedding_text()).await?;
        self.list_resource_with_vector(listing, total_units, vector, now_ms)
    }

    /// List a resource with a precomputed embedding.
    pub fn list_resource_with_vector(
        &self,
        listing: NewListing,
        total_units: u32,
        vector: Vec<f32>,
        now_ms: u128,
    ) -> Result<ResourceView, MatchError> {
        validate_vector(self.store.dimension(), &vector)?;
        if total_units == 0 {
            return Err(MatchError::InvalidUnits {
                resource_id: 0,
                detail: "a resource needs at least one unit".into(),
            });
        }
        let listing = self.catalog.insert(listing, now_ms)?;
        let id = listing.id;
        self.waitlist.register(id, total_units)?;
        self.store.put(id, vector.clone())?;
        self.waitlist.with_status(id, |status| {
            self.index.upsert(id, vector)?;
            self.index.set_status(id, status);
            Ok(())
        })?;
        tracing::info!(
            resource_id = id,
            category = %listing.category,
            total_units,
            "resource listed"
        );
        self.resource(id)
    }

    /// Replace a listing's description and re-embed it.
    pub async fn update_description(
        &self,
        resource_id: ResourceId,
        description: &str,
        now_ms: u128,
    ) -> Result<ResourceView, MatchError> {
        let current = self.editable(resource_id)?;
        let mut edited = Listing::clone(&current);
        description.clone_into(&mut edited.description);
        let vector = self.embed(&edited.embedding_text()).await?;
        self.update_description_with_vector(resource_id, description, vector, now_ms)
    }

    /// Replace a listing's description with a precomputed embedding.
    pub fn update_description_with_vector(
        &self,
        resource_id: ResourceId,
        description: &str,
        vector: Vec<f32>,
        now_ms: u128,
    ) -> Result<ResourceView, MatchError> {
        self.editable(resource_id)?;
        validate_vector(self.store.dimension(), &vector)?;
        self.waitlist.with_status(resource_id, |status| {
            if status == ResourceStatus::Withdrawn {
                return Err(MatchError::ResourceInactive {
                    resource_id,
                    status,
                });
            }
            self.catalog
                .update_description(resource_id, description, now_ms)?;
            self.store.put(resource_id, vector.clone())?;
            self.index.upsert(resource_id, vector)?;
            self.index.set_status(resource_id, status);
            Ok(())
        })?;
        tracing::info!(resource_id, "description updated");
        self.resource(resource_id)
    }

    fn editable(&self, resource_id: ResourceId) -> Result<Arc<Listing>, MatchError> {
        let listing = self
            .catalog
            .get(resource_id)
            .ok_or(MatchError::UnknownResource(resource_id))?;
        let ledger = self.waitlist.ledger(resource_id)?;
        if ledger.status == ResourceStatus::Withdrawn {
            return Err(MatchError::ResourceInactive {
                resource_id,
                status: ledger.status,
            });
        }
        Ok(listing)
    }

    /// Withdraw a resource: cancel its waitlist and drop it from search.
    pub fn withdraw(&self, resource_id: ResourceId) -> Result<Vec<WaitlistEntry>, MatchError> {
        let cancelled = self.waitlist.withdraw(resource_id)?;
        self.index.remove(resource_id);
        self.store.remove(resource_id);
        Ok(cancelled)
    }

    /// Add new stock; waiting entries are served first.
    pub fn restock(
        &self,
        resource_id: ResourceId,
        units: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        self.waitlist.restock(resource_id, units)
    }

    /// Units came back from holders; serve the waitlist.
    pub fn return_units(
        &self,
        resource_id: ResourceId,
        units: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        self.waitlist.try_allocate(resource_id, units)
    }

    /// Owner changes the total unit count.
    pub fn adjust_total(
        &self,
        resource_id: ResourceId,
        new_total: u32,
    ) -> Result<Vec<WaitlistEntry>, MatchError> {
        self.waitlist.adjust_total(resource_id, new_total)
    }

    /// Match a requester; `k` defaults to the configured value.
    pub async fn match_request(
        &self,
        query: MatchQuery,
        ctx: &RequesterContext,
        k: Option<usize>,
        now_ms: u128,
    ) -> Result<MatchResult, MatchError> {
        self.orchestrator
            .match_request(query, ctx, k.unwrap_or(self.default_k), now_ms)
            .await
    }

    /// Ranked candidates without admission.
    pub async fn rank(
        &self,
        query: MatchQuery,
        ctx: &RequesterContext,
        k: Option<usize>,
        now_ms: u128,
    ) -> Result<Vec<RankedCandidate>, MatchError> {
        self.orchestrator
            .rank(query, ctx, k.unwrap_or(self.default_k), now_ms)
            .await
    }

    /// The `n` active resources with the highest requester-independent
    /// score, best first and ties by id. Uses the recency fallback when no
    /// model is installed.
    pub async fn top_predicted(&self, n: usize, now_ms: u128) -> Vec<Prediction> {
        let candidates: Vec<Candidate> = self
            .catalog
            .listings()
            .into_iter()
            .filter_map(|listing| {
                let ledger = self.waitlist.snapshot(listing.id)?;
                (ledger.status == ResourceStatus::Active).then_some(Candidate {
                    listing,
                    distance: 0.0,
                    available: ledger.available,
                    waitlist_len: ledger.waitlist_len,
                })
            })
            .collect();
        let scores = self
            .scorer
            .score_all(&RequesterContext::anonymous(), &candidates, now_ms)
            .await;
        let mut predictions: Vec<Prediction> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| Prediction {
                resource_id: candidate.listing.id,
                title: candidate.listing.title.clone(),
                score,
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.score
                .value
                .total_cmp(&a.score.value)
                .then(a.resource_id.cmp(&b.resource_id))
        });
        predictions.truncate(n);
        predictions
    }

    /// Cancel a waitlist entry.
    pub fn cancel(&self, entry_id: EntryId) -> Result<WaitlistEntry, MatchError> {
        self.waitlist.cancel(entry_id)
    }

    /// Expire overdue waitlist entries.
    pub fn expire_overdue(&self, now_ms: u128) -> usize {
        self.waitlist.expire_overdue(now_ms)
    }

    /// Full record of a resource.
    pub fn resource(&self, resource_id: ResourceId) -> Result<ResourceView, MatchError> {
        let listing = self
            .catalog
            .get(resource_id)
            .ok_or(MatchError::UnknownResource(resource_id))?;
        let ledger = self
            .waitlist
            .snapshot(resource_id)
            .ok_or(MatchError::UnknownResource(resource_id))?;
        Ok(ResourceView {
            listing,
            ledger,
            embedding: self.store.get(resource_id),
        })
    }

    /// Rebuild the index graph if enough changes accumulated. Returns the
    /// number of graph points when a rebuild ran.
    pub fn maybe_rebuild_index(&self) -> Option<usize> {
        self.index.needs_rebuild().then(|| self.index.rebuild())
    }

    /// Install a new ranking model; in-flight scoring keeps the old one.
    pub fn install_model(&self, model: Arc<dyn DemandModel>) -> u64 {
        self.scorer.handle().install(model)
    }

    /// Shared model handle.
    pub fn models(&self) -> &Arc<ModelHandle> {
        self.scorer.handle()
    }

    /// Waitlist manager.
    pub fn waitlist(&self) -> &WaitlistManager {
        &self.waitlist
    }

    /// Similarity index.
    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    /// Default `k`.
    pub const fn default_k(&self) -> usize {
        self.default_k
    }

    /// Dashboard aggregates from counters and lock-free mirrors.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            listings: self.catalog.len(),
            indexed: self.index.len(),
            pending_index_changes: self.index.pending_changes(),
            waitlist: self.waitlist.stats(),
            scorer: self.scorer.stats(),
            matches: self.orchestrator.stats(),
            popular: self.waitlist.popular(POPULAR_TOP_N),
            active_requesters: self.waitlist.active_requesters(ACTIVE_REQUESTERS_TOP_N),
        }
    }

    /// Whether text listings and text queries are supported.
    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }
}

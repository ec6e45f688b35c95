//! Query → candidates → scores → admission.
//!
//! Retrieval and scoring run without any resource lock. The admission step
//! (`WaitlistManager::admit`) re-checks availability under the candidate's
//! lock, so a resource that ran out after search simply queues the requester.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::catalog::{Listing, ResourceCatalog};
use crate::core::embedding_store::Embedder;
use crate::core::scorer::{Candidate, RankingScorer, Score};
use crate::core::similarity_index::SimilarityIndex;
use crate::core::waitlist::{validate_requester, Admission, WaitlistManager};
use crate::core::MatchError;
use crate::util::serde::{EntryId, RequesterContext, ResourceId};

/// What the requester is looking for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuery {
    /// Free text, embedded by the configured embedder.
    Text(String),
    /// A ready-made query vector.
    Vector(Vec<f32>),
}

/// Outcome of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    /// A unit was granted right away.
    Allocated {
        /// Resource granted.
        resource_id: ResourceId,
        /// Units granted.
        units_granted: u32,
    },
    /// The requester joined the resource's waitlist.
    Queued {
        /// Resource waited on.
        resource_id: ResourceId,
        /// Waitlist entry created.
        entry_id: EntryId,
        /// 1-based position at enqueue time.
        position: usize,
    },
}

impl MatchResult {
    /// Resource the result refers to.
    pub const fn resource_id(&self) -> ResourceId {
        match self {
            Self::Allocated { resource_id, .. } | Self::Queued { resource_id, .. } => *resource_id,
        }
    }
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    /// Listing metadata.
    pub listing: Arc<Listing>,
    /// Cosine distance to the query.
    pub distance: f32,
    /// `max(1 - distance / 2, 0)`.
    pub similarity: f32,
    /// Demand score and its provenance.
    pub score: Score,
    /// Units free when ranked (advisory).
    pub available: u32,
    /// Pending waitlist length when ranked.
    pub waitlist_len: usize,
}

impl RankedCandidate {
    /// Resource identifier.
    pub fn resource_id(&self) -> ResourceId {
        self.listing.id
    }
}

/// Orchestrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Match requests handled.
    pub matches: u64,
    /// Matches that ended in an immediate allocation.
    pub allocated: u64,
    /// Matches that ended on a waitlist.
    pub queued: u64,
    /// Matches that found nothing admissible.
    pub no_viable: u64,
    /// Candidates skipped because admission was refused.
    pub fall_throughs: u64,
}

#[derive(Debug, Default)]
struct OrchestratorCounters {
    matches: AtomicU64,
    allocated: AtomicU64,
    queued: AtomicU64,
    no_viable: AtomicU64,
    fall_throughs: AtomicU64,
}

impl OrchestratorCounters {
    fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            matches: self.matches.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            no_viable: self.no_viable.load(Ordering::Relaxed),
            fall_throughs: self.fall_throughs.load(Ordering::Relaxed),
        }
    }
}

/// Composes index, scorer and waitlist into `match`.
pub struct MatchOrchestrator {
    catalog: Arc<ResourceCatalog>,
    index: Arc<SimilarityIndex>,
    scorer: Arc<RankingScorer>,
    waitlist: Arc<WaitlistManager>,
    embedder: Option<Arc<dyn Embedder>>,
    counters: OrchestratorCounters,
}

impl MatchOrchestrator {
    /// Wire an orchestrator over shared components.
    pub fn new(
        catalog: Arc<ResourceCatalog>,
        index: Arc<SimilarityIndex>,
        scorer: Arc<RankingScorer>,
        waitlist: Arc<WaitlistManager>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            catalog,
            index,
            scorer,
            waitlist,
            embedder,
            counters: OrchestratorCounters::default(),
        }
    }

    async fn query_vector(&self, query: MatchQuery) -> Result<Vec<f32>, MatchError> {
        match query {
            MatchQuery::Vector(v) => Ok(v),
            MatchQuery::Text(text) => {
                let embedder = self
                    .embedder
                    .as_ref()
                    .ok_or_else(|| MatchError::Embedding("no embedder configured".into()))?;
                embedder.embed(&text).await
            }
        }
    }

    /// Retrieve, score and order up to `k` candidates without admitting.
    ///
    /// Order: score descending, then distance ascending, then resource id.
    pub async fn rank(
        &self,
        query: MatchQuery,
        ctx: &RequesterContext,
        k: usize,
        now_ms: u128,
    ) -> Result<Vec<RankedCandidate>, MatchError> {
        let vector = self.query_vector(query).await?;
        let neighbors = self.index.search(&vector, k)?;

        let candidates: Vec<Candidate> = neighbors
            .iter()
            .filter_map(|n| {
                let listing = self.catalog.get(n.resource_id)?;
                let ledger = self.waitlist.snapshot(n.resource_id)?;
                Some(Candidate {
                    listing,
                    distance: n.distance,
                    available: ledger.available,
                    waitlist_len: ledger.waitlist_len,
                })
            })
            .collect();

        let scores = self.scorer.score_all(ctx, &candidates, now_ms).await;
        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .zip(scores)
            .map(|(c, score)| RankedCandidate {
                similarity: (1.0 - c.distance / 2.0).max(0.0),
                listing: c.listing,
                distance: c.distance,
                score,
                available: c.available,
                waitlist_len: c.waitlist_len,
            })
            .collect();
        ranked.sort_by(ranking_order);
        Ok(ranked)
    }

    /// Match a requester to the best admissible resource.
    ///
    /// Candidates are tried in rank order; a candidate whose admission is
    /// refused as a duplicate (or that went inactive, vanished or filled up
    /// since search) is skipped. Fails with `NoViableMatch` when every
    /// candidate is skipped or none was found, and with `InvalidRequester`
    /// before any search when the requester id is blank.
    pub async fn match_request(
        &self,
        query: MatchQuery,
        ctx: &RequesterContext,
        k: usize,
        now_ms: u128,
    ) -> Result<MatchResult, MatchError> {
        validate_requester(&ctx.requester_id)?;
        self.counters.matches.fetch_add(1, Ordering::Relaxed);
        let ranked = self.rank(query, ctx, k, now_ms).await?;

        for candidate in &ranked {
            let resource_id = candidate.resource_id();
            match self.waitlist.admit(
                resource_id,
                &ctx.requester_id,
                Some(candidate.score.value),
                now_ms,
            ) {
                Ok(Admission::Allocated { units_granted }) => {
                    self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                    return Ok(MatchResult::Allocated {
                        resource_id,
                        units_granted,
                    });
                }
                Ok(Admission::Queued(queued)) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    return Ok(MatchResult::Queued {
                        resource_id,
                        entry_id: queued.entry.id,
                        position: queued.position,
                    });
                }
                Err(e) if e.falls_through() => {
                    self.counters.fall_throughs.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        resource_id,
                        requester_id = %ctx.requester_id,
                        reason = %e,
                        "candidate skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.counters.no_viable.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            requester_id = %ctx.requester_id,
            candidates = ranked.len(),
            "no viable match"
        );
        Err(MatchError::NoViableMatch)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> OrchestratorStats {
        self.counters.snapshot()
    }
}

fn ranking_order(a: &RankedCandidate, b: &RankedCandidate) -> CmpOrdering {
    b.score
        .value
        .total_cmp(&a.score.value)
        .then(a.distance.total_cmp(&b.distance))
        .then(a.resource_id().cmp(&b.resource_id()))
}

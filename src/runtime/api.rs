//! API-facing request/response models.

use serde::{Deserialize, Serialize};

use crate::core::{
    CircuitState, MatchEngine, MatchError, MatchQuery, MatchResult, RankedCandidate,
};
use crate::util::serde::{Category, EntryId, RequesterContext, RequesterId, ResourceId};

/// Match or search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Who is asking.
    pub requester: RequesterContext,
    /// What they are looking for.
    pub query: MatchQuery,
    /// Candidates to consider; engine default when absent.
    #[serde(default)]
    pub k: Option<usize>,
}

/// Match outcome as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResponse {
    /// A unit was granted.
    Allocated {
        /// Resource granted.
        resource_id: ResourceId,
        /// Units granted.
        units_granted: u32,
    },
    /// The requester was queued.
    Queued {
        /// Resource waited on.
        resource_id: ResourceId,
        /// Entry to cancel or poll.
        entry_id: EntryId,
        /// 1-based position.
        position: usize,
    },
    /// Nothing currently matches.
    NoMatch,
}

impl From<MatchResult> for MatchResponse {
    fn from(result: MatchResult) -> Self {
        match result {
            MatchResult::Allocated {
                resource_id,
                units_granted,
            } => Self::Allocated {
                resource_id,
                units_granted,
            },
            MatchResult::Queued {
                resource_id,
                entry_id,
                position,
            } => Self::Queued {
                resource_id,
                entry_id,
                position,
            },
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Resource identifier.
    pub resource_id: ResourceId,
    /// Listing title.
    pub title: String,
    /// Category.
    pub category: Category,
    /// Pick-up location.
    pub location: String,
    /// `max(1 - distance / 2, 0)`.
    pub similarity: f32,
    /// Demand score.
    pub score: f64,
    /// Whether the score came from the recency fallback.
    pub fallback_score: bool,
    /// Units free when ranked.
    pub available: u32,
    /// Pending waitlist length when ranked.
    pub waitlist_len: usize,
}

impl From<&RankedCandidate> for SearchHit {
    fn from(c: &RankedCandidate) -> Self {
        Self {
            resource_id: c.listing.id,
            title: c.listing.title.clone(),
            category: c.listing.category,
            location: c.listing.location.clone(),
            similarity: c.similarity,
            score: c.score.value,
            fallback_score: c.score.is_fallback(),
            available: c.available,
            waitlist_len: c.waitlist_len,
        }
    }
}

/// A frequently requested resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularResource {
    /// Resource identifier.
    pub resource_id: ResourceId,
    /// Listing title.
    pub title: String,
    /// Requests received.
    pub requests: u64,
}

/// A requester with many accepted requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRequester {
    /// Requester identity.
    pub requester_id: RequesterId,
    /// Requests accepted (allocated or queued).
    pub requests: u64,
}

/// A resource expected to be in demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedResource {
    /// Resource identifier.
    pub resource_id: ResourceId,
    /// Listing title.
    pub title: String,
    /// Predicted demand.
    pub score: f64,
    /// Whether the score came from the recency fallback.
    pub fallback_score: bool,
}

/// Dashboard figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Resources ever listed.
    pub total_resources: usize,
    /// Resources with no units offered.
    pub exhausted_resources: usize,
    /// Withdrawn resources.
    pub withdrawn_resources: usize,
    /// Pending waitlist entries.
    pub pending_waitlist: usize,
    /// Requests that received a unit.
    pub confirmed_requests: u64,
    /// Requests that joined a waitlist.
    pub waitlisted_requests: u64,
    /// Share of admissions that found no free unit.
    pub exhaustion_rate: f64,
    /// Most requested resources.
    pub popular: Vec<PopularResource>,
    /// Requesters with the most accepted requests.
    pub active_requesters: Vec<ActiveRequester>,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Installed ranking model version.
    pub model_version: Option<u64>,
    /// Ranking model breaker state.
    pub circuit: CircuitState,
}

/// Run a match. `NoViableMatch` becomes [`MatchResponse::NoMatch`]; other
/// errors are returned as strings.
pub async fn submit_match(
    engine: &MatchEngine,
    req: MatchRequest,
    now_ms: u128,
) -> Result<MatchResponse, String> {
    match engine
        .match_request(req.query, &req.requester, req.k, now_ms)
        .await
    {
        Ok(result) => Ok(result.into()),
        Err(MatchError::NoViableMatch) => Ok(MatchResponse::NoMatch),
        Err(e) => Err(e.to_string()),
    }
}

/// Ranked search without admission.
pub async fn submit_search(
    engine: &MatchEngine,
    req: MatchRequest,
    now_ms: u128,
) -> Result<Vec<SearchHit>, String> {
    let ranked = engine
        .rank(req.query, &req.requester, req.k, now_ms)
        .await
        .map_err(|e| e.to_string())?;
    Ok(ranked.iter().map(SearchHit::from).collect())
}

/// Dashboard figures from lock-free reads.
pub fn stats(engine: &MatchEngine) -> StatsResponse {
    let s = engine.stats();
    let popular = s
        .popular
        .iter()
        .filter_map(|&(resource_id, requests)| {
            let view = engine.resource(resource_id).ok()?;
            Some(PopularResource {
                resource_id,
                title: view.listing.title.clone(),
                requests,
            })
        })
        .collect();
    StatsResponse {
        total_resources: s.listings,
        exhausted_resources: s.waitlist.exhausted_resources,
        withdrawn_resources: s.waitlist.withdrawn_resources,
        pending_waitlist: s.waitlist.pending_entries,
        confirmed_requests: s.waitlist.allocations(),
        waitlisted_requests: s.waitlist.enqueued,
        exhaustion_rate: s.waitlist.exhaustion_rate,
        popular,
        active_requesters: s
            .active_requesters
            .into_iter()
            .map(|(requester_id, requests)| ActiveRequester {
                requester_id,
                requests,
            })
            .collect(),
    }
}

/// The `n` active resources with the highest predicted demand.
pub async fn predictions(engine: &MatchEngine, n: usize, now_ms: u128) -> Vec<PredictedResource> {
    engine
        .top_predicted(n, now_ms)
        .await
        .into_iter()
        .map(|p| PredictedResource {
            resource_id: p.resource_id,
            title: p.title,
            score: p.score.value,
            fallback_score: p.score.is_fallback(),
        })
        .collect()
}

/// Return a health payload.
pub fn health(engine: &MatchEngine) -> Health {
    let scorer = engine.stats().scorer;
    Health {
        ok: true,
        model_version: scorer.model_version,
        circuit: scorer.circuit,
    }
}

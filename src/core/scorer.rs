//! Demand/priority scoring of candidate resources.
//!
//! The ranking model is trained offline and reached through [`DemandModel`].
//! It lives behind a [`ModelHandle`]: installing a new model swaps an `Arc`,
//! so a scoring call that already cloned the old handle finishes on the old
//! version.
//!
//! Scoring never fails. A missing model, an error, a timeout, a non-finite
//! score or an open circuit breaker all degrade to a deterministic
//! recency score: `0.5^(age / half_life)`, where `age` is the time since the
//! resource was listed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::breaker::{CircuitBreaker, CircuitState};
use crate::core::catalog::Listing;
use crate::core::MatchError;
use crate::util::serde::RequesterContext;

/// A shortlisted resource handed to the model.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Listing metadata (category, condition, rating, availability).
    pub listing: Arc<Listing>,
    /// Cosine distance to the query.
    pub distance: f32,
    /// Units available when the candidate was gathered (advisory only).
    pub available: u32,
    /// Pending waitlist length when the candidate was gathered.
    pub waitlist_len: usize,
}

/// Externally trained demand model.
#[async_trait]
pub trait DemandModel: Send + Sync {
    /// Model name for logs.
    fn name(&self) -> &str;

    /// Priority/demand score for this requester on this candidate. Higher
    /// ranks earlier; any finite value is accepted.
    async fn score(&self, ctx: &RequesterContext, candidate: &Candidate) -> Result<f64, MatchError>;
}

/// A model together with the version it was installed under.
pub struct VersionedModel {
    /// Monotonic install version, starting at 1.
    pub version: u64,
    /// The model.
    pub model: Arc<dyn DemandModel>,
}

/// Atomically swappable handle to the current model.
pub struct ModelHandle {
    current: RwLock<Option<Arc<VersionedModel>>>,
    next_version: AtomicU64,
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelHandle {
    /// Handle with no model installed.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            next_version: AtomicU64::new(1),
        }
    }

    /// Install `model`, replacing any previous one. Returns the new version.
    pub fn install(&self, model: Arc<dyn DemandModel>) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let name = model.name().to_string();
        *self.current.write() = Some(Arc::new(VersionedModel { version, model }));
        tracing::info!(model = %name, version, "ranking model installed");
        version
    }

    /// Remove the installed model. Returns the version that was removed.
    pub fn clear(&self) -> Option<u64> {
        self.current.write().take().map(|m| m.version)
    }

    /// The installed model, if any.
    pub fn current(&self) -> Option<Arc<VersionedModel>> {
        self.current.read().clone()
    }

    /// Version of the installed model.
    pub fn version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|m| m.version)
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Upper bound on one model call.
    pub timeout_ms: u64,
    /// Half-life of the recency fallback.
    pub fallback_half_life_secs: u64,
    /// Consecutive failures before the model is bypassed.
    pub failure_threshold: u32,
    /// How long the model stays bypassed before a trial call.
    pub reset_timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            fallback_half_life_secs: 7 * 24 * 60 * 60,
            failure_threshold: 5,
            reset_timeout_secs: 30,
        }
    }
}

impl ScorerConfig {
    /// Validate values.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".into());
        }
        if self.fallback_half_life_secs == 0 {
            return Err("fallback_half_life_secs must be greater than 0".into());
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".into());
        }
        Ok(())
    }
}

/// Why the fallback score was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No model installed.
    NoModel,
    /// Model call exceeded the timeout.
    Timeout,
    /// Model returned an error.
    ModelError,
    /// Model returned NaN or infinity.
    InvalidScore,
    /// Breaker is open after repeated failures.
    CircuitOpen,
}

/// Where a score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// The installed model at this version.
    Model {
        /// Model version.
        version: u64,
    },
    /// Deterministic recency fallback.
    Fallback(FallbackReason),
}

/// A candidate's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Score value; higher ranks first.
    pub value: f64,
    /// Provenance.
    pub source: ScoreSource,
}

impl Score {
    /// True when the value came from the fallback.
    pub const fn is_fallback(&self) -> bool {
        matches!(self.source, ScoreSource::Fallback(_))
    }
}

/// Scorer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorerStats {
    /// Scores produced by the model.
    pub model_scores: u64,
    /// Scores produced by the fallback.
    pub fallback_scores: u64,
    /// Installed model version.
    pub model_version: Option<u64>,
    /// Breaker state.
    pub circuit: CircuitState,
}

/// Scores candidates with the installed model, degrading to recency.
pub struct RankingScorer {
    handle: Arc<ModelHandle>,
    config: ScorerConfig,
    breaker: CircuitBreaker,
    model_scores: AtomicU64,
    fallback_scores: AtomicU64,
}

impl RankingScorer {
    /// Create a scorer over a shared model handle.
    pub fn new(handle: Arc<ModelHandle>, config: ScorerConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout_secs),
        );
        Self {
            handle,
            config,
            breaker,
            model_scores: AtomicU64::new(0),
            fallback_scores: AtomicU64::new(0),
        }
    }

    /// Score one candidate. Never fails.
    pub async fn score(&self, ctx: &RequesterContext, candidate: &Candidate, now_ms: u128) -> Score {
        let Some(model) = self.handle.current() else {
            return self.fallback(candidate, now_ms, FallbackReason::NoModel);
        };
        if !self.breaker.allow_request() {
            return self.fallback(candidate, now_ms, FallbackReason::CircuitOpen);
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let reason = match tokio::time::timeout(timeout, model.model.score(ctx, candidate)).await {
            Ok(Ok(value)) if value.is_finite() => {
                self.breaker.record_success();
                self.model_scores.fetch_add(1, Ordering::Relaxed);
                return Score {
                    value,
                    source: ScoreSource::Model {
                        version: model.version,
                    },
                };
            }
            Ok(Ok(value)) => {
                tracing::warn!(
                    model = model.model.name(),
                    resource_id = candidate.listing.id,
                    value,
                    "model returned a non-finite score; using fallback"
                );
                FallbackReason::InvalidScore
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    model = model.model.name(),
                    resource_id = candidate.listing.id,
                    error = %e,
                    "model scoring failed; using fallback"
                );
                FallbackReason::ModelError
            }
            Err(_) => {
                tracing::warn!(
                    model = model.model.name(),
                    resource_id = candidate.listing.id,
                    timeout_ms = self.config.timeout_ms,
                    "model scoring timed out; using fallback"
                );
                FallbackReason::Timeout
            }
        };
        self.breaker.record_failure();
        self.fallback(candidate, now_ms, reason)
    }

    /// Score all candidates concurrently, preserving input order.
    pub async fn score_all(
        &self,
        ctx: &RequesterContext,
        candidates: &[Candidate],
        now_ms: u128,
    ) -> Vec<Score> {
        futures::future::join_all(candidates.iter().map(|c| self.score(ctx, c, now_ms))).await
    }

    /// The recency score in `(0, 1]`: 1 for a brand-new listing, halving every half-life.
    pub fn fallback_score(&self, candidate: &Candidate, now_ms: u128) -> f64 {
        let age_ms = now_ms.saturating_sub(candidate.listing.listed_at_ms);
        let half_life_ms = u128::from(self.config.fallback_half_life_secs) * 1000;
        #[allow(clippy::cast_precision_loss)]
        let halvings = age_ms as f64 / half_life_ms as f64;
        0.5f64.powf(halvings).max(f64::MIN_POSITIVE)
    }

    fn fallback(&self, candidate: &Candidate, now_ms: u128, reason: FallbackReason) -> Score {
        self.fallback_scores.fetch_add(1, Ordering::Relaxed);
        Score {
            value: self.fallback_score(candidate, now_ms),
            source: ScoreSource::Fallback(reason),
        }
    }

    /// Shared model handle.
    pub const fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ScorerStats {
        ScorerStats {
            model_scores: self.model_scores.load(Ordering::Relaxed),
            fallback_scores: self.fallback_scores.load(Ordering::Relaxed),
            model_version: self.handle.version(),
            circuit: self.breaker.state(),
        }
    }
}

//! Matching components, waitlist accounting and the assembled engine.

pub mod breaker;
pub mod catalog;
pub mod embedding_store;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod scorer;
pub mod similarity_index;
pub mod waitlist;

pub use breaker::{CircuitBreaker, CircuitState};
pub use catalog::{AvailabilityWindow, Listing, NewListing, ResourceCatalog, ResourceView};
pub use embedding_store::{l2_normalize_in_place, Embedder, EmbeddingStore, HashingEmbedder};
pub use engine::{EngineParts, EngineStats, MatchEngine, Prediction};
pub use error::{AppResult, MatchError};
#[cfg(not(target_arch = "wasm32"))]
pub use events::ChannelEventSink;
pub use events::{build_event, EventKind, EventSink, InMemoryEventSink, MatchEvent};
pub use orchestrator::{
    MatchOrchestrator, MatchQuery, MatchResult, OrchestratorStats, RankedCandidate,
};
pub use scorer::{
    Candidate, DemandModel, FallbackReason, ModelHandle, RankingScorer, Score, ScoreSource,
    ScorerConfig, ScorerStats, VersionedModel,
};
pub use similarity_index::{cosine_distance, IndexConfig, Neighbor, SimilarityIndex};
pub use waitlist::{
    validate_requester, Admission, LedgerSnapshot, QueuedEntry, StatusObserver, WaitlistConfig,
    WaitlistEntry, WaitlistManager, WaitlistStats,
};

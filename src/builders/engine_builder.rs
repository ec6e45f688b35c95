//! Build a [`MatchEngine`] from [`EngineConfig`].

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::{
    DemandModel, Embedder, EmbeddingStore, EngineParts, EventSink, InMemoryEventSink, MatchEngine,
    MatchError, ModelHandle, RankingScorer, ResourceCatalog, SimilarityIndex, WaitlistManager,
};

/// Build an engine from configuration and the external collaborators.
///
/// `model` is installed as version 1 when given; without it scoring runs on
/// the recency fallback until a model is installed.
pub fn build_engine(
    cfg: &EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    model: Option<Arc<dyn DemandModel>>,
    sink: Option<Arc<dyn EventSink>>,
) -> Result<MatchEngine, MatchError> {
    cfg.validate()
        .map_err(|e| MatchError::InvalidConfig(format!("config invalid: {e}")))?;
    if let Some(embedder) = &embedder {
        if embedder.dimension() != cfg.dimension {
            return Err(MatchError::DimensionMismatch {
                expected: cfg.dimension,
                got: embedder.dimension(),
            });
        }
    }

    let handle = Arc::new(ModelHandle::new());
    if let Some(model) = model {
        handle.install(model);
    }
    let mut waitlist = WaitlistManager::new(cfg.waitlist.clone());
    if let Some(sink) = sink {
        waitlist = waitlist.with_events(sink);
    }

    let engine = MatchEngine::new(EngineParts {
        default_k: cfg.default_k,
        catalog: Arc::new(ResourceCatalog::new()),
        store: Arc::new(EmbeddingStore::new(cfg.dimension)),
        index: Arc::new(SimilarityIndex::new(cfg.dimension, cfg.index)),
        scorer: Arc::new(RankingScorer::new(handle, cfg.scorer.clone())),
        waitlist: Arc::new(waitlist),
        embedder,
    });
    tracing::info!(
        dimension = cfg.dimension,
        default_k = cfg.default_k,
        "match engine built"
    );
    Ok(engine)
}

/// Build an engine whose events land in an in-memory buffer sized by
/// `cfg.events.buffer`.
pub fn build_engine_with_memory_events(
    cfg: &EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    model: Option<Arc<dyn DemandModel>>,
) -> Result<(MatchEngine, Arc<InMemoryEventSink>), MatchError> {
    let sink = Arc::new(InMemoryEventSink::new(cfg.events.buffer));
    let shared: Arc<dyn EventSink> = sink.clone();
    let engine = build_engine(cfg, embedder, model, Some(shared))?;
    Ok((engine, sink))
}

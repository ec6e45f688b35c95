//! Tests for builder modules

use std::sync::Arc;

use async_trait::async_trait;
use commons_match::builders::{build_engine, build_engine_with_memory_events};
use commons_match::config::EngineConfig;
use commons_match::core::{
    Candidate, DemandModel, Embedder, EventKind, HashingEmbedder, MatchError, MatchQuery,
    NewListing,
};
use commons_match::util::serde::{Category, RequesterContext};

const NOW: u128 = 1_700_000_000_000;

struct Flat;

#[async_trait]
impl DemandModel for Flat {
    fn name(&self) -> &str {
        "flat"
    }

    async fn score(&self, _: &RequesterContext, _: &Candidate) -> Result<f64, MatchError> {
        Ok(0.5)
    }
}

fn small_config() -> EngineConfig {
    EngineConfig {
        dimension: 32,
        ..EngineConfig::default()
    }
}

#[test]
fn test_build_rejects_invalid_config() {
    let cfg = EngineConfig {
        default_k: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        build_engine(&cfg, None, None, None),
        Err(MatchError::InvalidConfig(_))
    ));
}

#[test]
fn test_build_rejects_embedder_dimension() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(16));
    assert!(matches!(
        build_engine(&small_config(), Some(embedder), None, None),
        Err(MatchError::DimensionMismatch {
            expected: 32,
            got: 16
        })
    ));
}

#[test]
fn test_build_installs_model() {
    let model: Arc<dyn DemandModel> = Arc::new(Flat);
    let engine = build_engine(&small_config(), None, Some(model), None).unwrap();
    assert_eq!(engine.models().version(), Some(1));
    assert_eq!(engine.default_k(), 10);
    assert!(!engine.has_embedder());
}

#[tokio::test]
async fn test_memory_events_wired_to_waitlist() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(32));
    let (engine, sink) =
        build_engine_with_memory_events(&small_config(), Some(embedder), None).unwrap();
    let view = engine
        .list_resource(
            NewListing::new("owner", "Kayak", Category::Outdoor, "Harbour"),
            1,
            NOW,
        )
        .await
        .unwrap();
    engine
        .match_request(
            MatchQuery::Text("kayak".into()),
            &RequesterContext::new("alice"),
            None,
            NOW,
        )
        .await
        .unwrap();
    let allocated = sink.events_of(EventKind::Allocated);
    assert_eq!(allocated.len(), 1);
    assert_eq!(allocated[0].resource_id, view.listing.id);
}

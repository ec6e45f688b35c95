//! Tests for runtime adapters and the API surface

use std::sync::Arc;
use std::time::Duration;

use commons_match::builders::build_engine;
use commons_match::config::EngineConfig;
use commons_match::core::{
    CircuitState, Embedder, HashingEmbedder, MatchEngine, MatchQuery, NewListing,
};
use commons_match::runtime::{
    health, predictions, stats, submit_match, submit_search, ExpirySweeper, MatchRequest,
    MatchResponse, Spawn, TokioSpawner,
};
use commons_match::util::serde::{Category, RequesterContext};

const NOW: u128 = 1_700_000_000_000;

fn engine() -> MatchEngine {
    let cfg = EngineConfig {
        dimension: 32,
        ..EngineConfig::default()
    };
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(32));
    build_engine(&cfg, Some(embedder), None, None).unwrap()
}

fn request(who: &str, text: &str) -> MatchRequest {
    MatchRequest {
        requester: RequesterContext::new(who),
        query: MatchQuery::Text(text.into()),
        k: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_tokio_spawner_current_outside_runtime() {
    assert!(TokioSpawner::current().is_err());
}

#[tokio::test]
async fn test_submit_match_maps_outcomes() {
    let engine = engine();
    engine
        .list_resource(NewListing::new("o", "Tent", Category::Outdoor, "Park"), 1, NOW)
        .await
        .unwrap();

    let first = submit_match(&engine, request("a", "tent"), NOW).await.unwrap();
    assert!(matches!(first, MatchResponse::Allocated { units_granted: 1, .. }));
    let second = submit_match(&engine, request("b", "tent"), NOW).await.unwrap();
    assert!(matches!(second, MatchResponse::Queued { position: 1, .. }));
    let again = submit_match(&engine, request("b", "tent"), NOW).await.unwrap();
    assert_eq!(again, MatchResponse::NoMatch);

    let json = serde_json::to_value(&second).unwrap();
    assert_eq!(json["status"], "queued");
}

#[tokio::test]
async fn test_submit_match_reports_errors() {
    let engine = engine();
    let req = MatchRequest {
        requester: RequesterContext::new("a"),
        query: MatchQuery::Vector(vec![1.0; 3]),
        k: Some(2),
    };
    let err = submit_match(&engine, req, NOW).await.unwrap_err();
    assert!(err.contains("dimension mismatch"));
}

#[tokio::test]
async fn test_search_and_stats() {
    let engine = engine();
    let tent = engine
        .list_resource(NewListing::new("o", "Tent", Category::Outdoor, "Park"), 1, NOW)
        .await
        .unwrap();
    let hits = submit_search(&engine, request("a", "tent park"), NOW).await.unwrap();
    assert_eq!(hits[0].resource_id, tent.listing.id);
    assert_eq!(hits[0].title, "Tent");
    assert!(hits[0].fallback_score);

    submit_match(&engine, request("a", "tent"), NOW).await.unwrap();
    submit_match(&engine, request("b", "tent"), NOW).await.unwrap();
    let s = stats(&engine);
    assert_eq!(s.total_resources, 1);
    assert_eq!(s.confirmed_requests, 1);
    assert_eq!(s.waitlisted_requests, 1);
    assert_eq!(s.pending_waitlist, 1);
    assert_eq!(s.popular[0].title, "Tent");
    assert_eq!(s.popular[0].requests, 2);
    assert_eq!(s.active_requesters.len(), 2);
    assert_eq!(s.active_requesters[0].requester_id, "a");
    assert_eq!(s.active_requesters[0].requests, 1);

    let h = health(&engine);
    assert!(h.ok);
    assert_eq!(h.model_version, None);
    assert_eq!(h.circuit, CircuitState::Closed);
}

#[tokio::test]
async fn test_predictions_rank_newest_first_without_model() {
    let engine = engine();
    let old = engine
        .list_resource(NewListing::new("o", "Tent", Category::Outdoor, "Park"), 1, NOW)
        .await
        .unwrap();
    let new = engine
        .list_resource(NewListing::new("o", "Kayak", Category::Outdoor, "Lake"), 1, NOW + 60_000)
        .await
        .unwrap();

    let top = predictions(&engine, 10, NOW + 120_000).await;
    let ids: Vec<_> = top.iter().map(|p| p.resource_id).collect();
    assert_eq!(ids, vec![new.listing.id, old.listing.id]);
    assert_eq!(top[0].title, "Kayak");
    assert!(top.iter().all(|p| p.fallback_score));
    assert_eq!(predictions(&engine, 1, NOW + 120_000).await.len(), 1);
}

#[tokio::test]
async fn test_blank_requester_is_an_error() {
    let engine = engine();
    engine
        .list_resource(NewListing::new("o", "Tent", Category::Outdoor, "Park"), 1, NOW)
        .await
        .unwrap();
    let err = submit_match(&engine, request("  ", "tent"), NOW).await.unwrap_err();
    assert!(err.contains("invalid requester id"));
    assert!(stats(&engine).active_requesters.is_empty());
}

#[tokio::test]
async fn test_sweeper_expires_overdue_entries() {
    let engine = Arc::new(engine());
    let id = engine
        .list_resource(NewListing::new("o", "Tent", Category::Outdoor, "Park"), 1, NOW)
        .await
        .unwrap()
        .listing
        .id;
    engine.waitlist().admit(id, "a", None, NOW).unwrap();
    engine.waitlist().enqueue(id, "b", None, NOW).unwrap();

    let sweeper = ExpirySweeper::new(Arc::clone(&engine), Duration::from_secs(60));
    let max_wait_ms = u128::from(engine.waitlist().config().max_wait_secs) * 1000;
    assert_eq!(sweeper.sweep_once(NOW + max_wait_ms).expired, 0);
    let report = sweeper.sweep_once(NOW + max_wait_ms + 1);
    assert_eq!(report.expired, 1);
    assert_eq!(engine.waitlist().waitlist_len(id), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeper_loop_stops_on_shutdown() {
    let engine = Arc::new(engine());
    let sweeper = ExpirySweeper::new(engine, Duration::from_millis(5));
    sweeper.start(&TokioSpawner::current().unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    sweeper.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
}

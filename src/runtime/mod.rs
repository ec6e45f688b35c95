//! Runtime adapters and API surface.

use std::future::Future;

pub mod api;
pub mod sweeper;
pub mod tokio_spawner;

pub use api::{
    health, predictions, stats, submit_match, submit_search, ActiveRequester, Health,
    MatchRequest, MatchResponse, PopularResource, PredictedResource, SearchHit, StatsResponse,
};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use tokio_spawner::TokioSpawner;

/// Abstraction for spawning background work on a runtime.
pub trait Spawn {
    /// Spawn a future that runs to completion in the background.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

//! # Commons Match
//!
//! Resource matching and allocation engine for community sharing platforms.
//!
//! People offer items (tools, books, camping gear...) and other people ask for
//! them. This crate is the part of such a platform with real algorithmic and
//! consistency concerns: it finds the listings closest to a request, ranks
//! them with a demand model, and hands out units, or waitlist places when
//! everything is on loan, without ever double-granting a unit.
//!
//! ## Components
//!
//! - **Embedding Store** (`core::embedding_store`): resource → vector map with a
//!   fixed dimension.
//! - **Similarity Index** (`core::similarity_index`): cosine nearest-neighbor
//!   search. An HNSW graph is used for large catalogs, with an exactly scanned
//!   delta so upserts are visible immediately.
//! - **Ranking Scorer** (`core::scorer`): calls the externally trained demand
//!   model behind a swappable, versioned handle, with a timeout, a circuit
//!   breaker and a deterministic recency fallback.
//! - **Waitlist Manager** (`core::waitlist`): per-resource ledgers, each behind
//!   its own lock, holding unit counts and the ordered waitlist.
//! - **Matching Orchestrator** (`core::orchestrator`): query → candidates →
//!   scores → allocate or enqueue, falling through to the next candidate on a
//!   duplicate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use commons_match::builders::build_engine;
//! use commons_match::config::EngineConfig;
//! use commons_match::core::{HashingEmbedder, MatchQuery, NewListing};
//! use commons_match::util::serde::{Category, RequesterContext};
//!
//! let cfg = EngineConfig::from_env()?;
//! let embedder = Arc::new(HashingEmbedder::new(cfg.dimension));
//! let engine = build_engine(&cfg, Some(embedder), None, None)?;
//!
//! let listing = NewListing::new("owner-1", "Cordless drill", Category::Tools, "Riverside");
//! engine.list_resource(listing, 1, now_ms()).await?;
//!
//! let result = engine
//!     .match_request(MatchQuery::Text("drill".into()), &RequesterContext::new("alice"), None, now_ms())
//!     .await?;
//! ```
//!
//! For complete scenarios, see `tests/matching_scenarios_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct engines from configuration.
pub mod builders;
/// Configuration models for the engine and its components.
pub mod config;
/// Matching components, waitlist accounting and the assembled engine.
pub mod core;
/// Runtime adapters, background sweeper and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;

//! Configuration models for the engine, its components and event buffering.

pub mod engine;

pub use engine::{
    EngineConfig, EventsConfig, ENV_DEFAULT_K, ENV_DIMENSION, ENV_MAX_RETAINED_TERMINAL,
    ENV_MAX_WAITLIST_DEPTH, ENV_MAX_WAIT_SECS, ENV_SCORER_TIMEOUT_MS,
};

//! Engine configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, IndexConfig, ScorerConfig, WaitlistConfig};

/// Env key overriding [`EngineConfig::dimension`].
pub const ENV_DIMENSION: &str = "COMMONS_MATCH_DIMENSION";
/// Env key overriding [`EngineConfig::default_k`].
pub const ENV_DEFAULT_K: &str = "COMMONS_MATCH_DEFAULT_K";
/// Env key overriding [`ScorerConfig::timeout_ms`].
pub const ENV_SCORER_TIMEOUT_MS: &str = "COMMONS_MATCH_SCORER_TIMEOUT_MS";
/// Env key overriding [`WaitlistConfig::max_wait_secs`].
pub const ENV_MAX_WAIT_SECS: &str = "COMMONS_MATCH_MAX_WAIT_SECS";
/// Env key overriding [`WaitlistConfig::max_depth`].
pub const ENV_MAX_WAITLIST_DEPTH: &str = "COMMONS_MATCH_MAX_WAITLIST_DEPTH";
/// Env key overriding [`WaitlistConfig::max_retained_terminal`].
pub const ENV_MAX_RETAINED_TERMINAL: &str = "COMMONS_MATCH_MAX_RETAINED_TERMINAL";

/// Notification event buffering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the event buffer or channel.
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 4096 }
    }
}

impl EventsConfig {
    /// Validate values.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer == 0 {
            return Err("buffer must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimension shared by store, index and embedder.
    pub dimension: usize,
    /// Candidates retrieved when a match does not name `k`.
    pub default_k: usize,
    /// Similarity index tuning.
    pub index: IndexConfig,
    /// Ranking scorer timeouts and fallback.
    pub scorer: ScorerConfig,
    /// Waitlist limits.
    pub waitlist: WaitlistConfig,
    /// Event buffering.
    pub events: EventsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            default_k: 10,
            index: IndexConfig::default(),
            scorer: ScorerConfig::default(),
            waitlist: WaitlistConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if self.dimension == 0 {
            return Err("dimension must be greater than 0".into());
        }
        if self.default_k == 0 {
            return Err("default_k must be greater than 0".into());
        }
        self.index.validate().map_err(|e| format!("index invalid: {e}"))?;
        self.scorer
            .validate()
            .map_err(|e| format!("scorer invalid: {e}"))?;
        self.waitlist
            .validate()
            .map_err(|e| format!("waitlist invalid: {e}"))?;
        self.events
            .validate()
            .map_err(|e| format!("events invalid: {e}"))?;
        Ok(())
    }

    /// Parse engine configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json_str(&raw)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("loading config file {}", path.display()))
    }

    /// Defaults overridden by the process environment (after loading `.env`
    /// if present).
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok())
            .map_err(anyhow::Error::msg)
            .context("applying environment overrides")?;
        Ok(cfg)
    }

    /// Apply overrides from `lookup` (keyed by the `COMMONS_MATCH_*`
    /// variable names) and validate the result.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_DIMENSION)? {
            self.dimension = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_DEFAULT_K)? {
            self.default_k = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SCORER_TIMEOUT_MS)? {
            self.scorer.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_WAIT_SECS)? {
            self.waitlist.max_wait_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_WAITLIST_DEPTH)? {
            self.waitlist.max_depth = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_RETAINED_TERMINAL)? {
            self.waitlist.max_retained_terminal = v;
        }
        self.validate()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}={raw:?}: {e}"))
        })
        .transpose()
}

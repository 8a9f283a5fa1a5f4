use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::memory_engine::confidence::ConfidenceParams;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub backend_url: String,
    pub embedding_model: String,
    pub embedding_timeout_ms: u64,
    pub embedding_cache_capacity: u64,
    pub embedding_cache_ttl_seconds: u64,
    pub summary_model: String,
    pub summarize_timeout_seconds: u64,
    pub summarize_max_events: usize,
    pub search_source_timeout_ms: u64,
    pub search_default_limit: usize,
    pub search_min_similarity: f32,
    pub confidence_half_life: f64,
    pub confidence_prior_weight: f64,
    pub prune_interval_seconds: u64,
    pub prune_min_observations: u32,
    pub prune_confidence_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/agent_memory.db"),
            backend_url: "http://127.0.0.1:8081".to_string(),
            embedding_model: "local-embedding".to_string(),
            embedding_timeout_ms: 5_000,
            embedding_cache_capacity: 1_024,
            embedding_cache_ttl_seconds: 600,
            summary_model: "local-llm".to_string(),
            summarize_timeout_seconds: 60,
            summarize_max_events: 200,
            search_source_timeout_ms: 2_000,
            search_default_limit: 10,
            search_min_similarity: 0.3,
            confidence_half_life: 5.0,
            confidence_prior_weight: 2.0,
            prune_interval_seconds: 3_600,
            prune_min_observations: 5,
            prune_confidence_threshold: 0.2,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing keys take their
    /// defaults; present but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            db_path: lookup("AGENT_MEMORY_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            backend_url: lookup("LLM_BACKEND_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.backend_url),
            embedding_model: lookup("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_timeout_ms: parse_var(&lookup, "EMBEDDING_TIMEOUT_MS", defaults.embedding_timeout_ms)?,
            embedding_cache_capacity: parse_var(&lookup, "EMBEDDING_CACHE_CAPACITY", defaults.embedding_cache_capacity)?,
            embedding_cache_ttl_seconds: parse_var(
                &lookup,
                "EMBEDDING_CACHE_TTL_SECONDS",
                defaults.embedding_cache_ttl_seconds,
            )?,
            summary_model: lookup("SUMMARY_MODEL").unwrap_or(defaults.summary_model),
            summarize_timeout_seconds: parse_var(&lookup, "SUMMARIZE_TIMEOUT_SECONDS", defaults.summarize_timeout_seconds)?,
            summarize_max_events: parse_var(&lookup, "SUMMARIZE_MAX_EVENTS", defaults.summarize_max_events)?,
            search_source_timeout_ms: parse_var(&lookup, "SEARCH_SOURCE_TIMEOUT_MS", defaults.search_source_timeout_ms)?,
            search_default_limit: parse_var(&lookup, "SEARCH_DEFAULT_LIMIT", defaults.search_default_limit)?,
            search_min_similarity: parse_var(&lookup, "SEARCH_MIN_SIMILARITY", defaults.search_min_similarity)?,
            confidence_half_life: parse_var(&lookup, "CONFIDENCE_HALF_LIFE", defaults.confidence_half_life)?,
            confidence_prior_weight: parse_var(&lookup, "CONFIDENCE_PRIOR_WEIGHT", defaults.confidence_prior_weight)?,
            prune_interval_seconds: parse_var(&lookup, "PRUNE_INTERVAL_SECONDS", defaults.prune_interval_seconds)?,
            prune_min_observations: parse_var(&lookup, "PRUNE_MIN_OBSERVATIONS", defaults.prune_min_observations)?,
            prune_confidence_threshold: parse_var(
                &lookup,
                "PRUNE_CONFIDENCE_THRESHOLD",
                defaults.prune_confidence_threshold,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.confidence_half_life > 0.0) {
            anyhow::bail!("CONFIDENCE_HALF_LIFE must be positive, got {}", self.confidence_half_life);
        }
        if self.confidence_prior_weight < 0.0 {
            anyhow::bail!("CONFIDENCE_PRIOR_WEIGHT must not be negative, got {}", self.confidence_prior_weight);
        }
        if !(-1.0..=1.0).contains(&self.search_min_similarity) {
            anyhow::bail!("SEARCH_MIN_SIMILARITY must be within [-1, 1], got {}", self.search_min_similarity);
        }
        if self.prune_interval_seconds == 0 {
            anyhow::bail!("PRUNE_INTERVAL_SECONDS must be at least 1");
        }
        if self.search_default_limit == 0 {
            anyhow::bail!("SEARCH_DEFAULT_LIMIT must be at least 1");
        }
        Ok(())
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    pub fn embedding_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_cache_ttl_seconds)
    }

    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_secs(self.summarize_timeout_seconds)
    }

    pub fn search_source_timeout(&self) -> Duration {
        Duration::from_millis(self.search_source_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }

    pub fn confidence_params(&self) -> ConfidenceParams {
        ConfidenceParams {
            half_life: self.confidence_half_life,
            prior_weight: self.confidence_prior_weight,
        }
    }

    pub fn print_config(&self) {
        info!("Agent memory configuration:");
        info!("  Database: {}", self.db_path.display());
        info!("  LLM backend: {}", self.backend_url);
        info!(
            "  Embedding: model={}, timeout={}ms, cache={} entries / {}s",
            self.embedding_model, self.embedding_timeout_ms, self.embedding_cache_capacity, self.embedding_cache_ttl_seconds
        );
        info!(
            "  Summarization: model={}, timeout={}s, max events={}",
            self.summary_model, self.summarize_timeout_seconds, self.summarize_max_events
        );
        info!(
            "  Search: source timeout={}ms, default limit={}, min similarity={}",
            self.search_source_timeout_ms, self.search_default_limit, self.search_min_similarity
        );
        info!(
            "  Confidence: half-life={}, prior weight={}",
            self.confidence_half_life, self.confidence_prior_weight
        );
        info!(
            "  Pruning: every {}s, min observations={}, threshold={}",
            self.prune_interval_seconds, self.prune_min_observations, self.prune_confidence_threshold
        );
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.search_default_limit, 10);
        assert_eq!(config.confidence_params(), ConfidenceParams::default());
        assert_eq!(config.embedding_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("AGENT_MEMORY_DB_PATH", "/tmp/m.db"),
            ("LLM_BACKEND_URL", "http://llm:9000/"),
            ("SEARCH_MIN_SIMILARITY", "0.55"),
            ("CONFIDENCE_HALF_LIFE", "8"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/m.db"));
        assert_eq!(config.backend_url, "http://llm:9000");
        assert!((config.search_min_similarity - 0.55).abs() < f32::EPSILON);
        assert_eq!(config.confidence_half_life, 8.0);
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("SEARCH_DEFAULT_LIMIT", "ten")])).unwrap_err();
        assert!(err.to_string().contains("SEARCH_DEFAULT_LIMIT"));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("CONFIDENCE_HALF_LIFE", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("SEARCH_MIN_SIMILARITY", "1.5")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("SEARCH_DEFAULT_LIMIT", "0")])).is_err());
    }
}

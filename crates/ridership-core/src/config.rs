use std::env;
use std::time::Duration;

use crate::error::{PipelineError, Result};

pub const DEFAULT_SOURCE_URL: &str = "http://64.111.127.166/origin-destination";
const DEFAULT_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Runtime settings for a pipeline run, read from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub source_url: String,
    pub max_connections: u32,
    pub http_timeout: Duration,
}

impl PipelineConfig {
    /// Reads configuration from the process environment. Call
    /// `dotenvy::dotenv()` beforehand to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .or_else(|| lookup("RIDERSHIP_DATABASE_URL"))
            .ok_or_else(|| {
                PipelineError::Config(
                    "DATABASE_URL (or RIDERSHIP_DATABASE_URL) must be set".to_string(),
                )
            })?;

        let source_url = lookup("RIDERSHIP_SOURCE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());

        let max_connections = match lookup("RIDERSHIP_DB_MAX_CONNECTIONS") {
            Some(raw) => parse_positive("RIDERSHIP_DB_MAX_CONNECTIONS", &raw)? as u32,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let http_timeout = match lookup("RIDERSHIP_HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("RIDERSHIP_HTTP_TIMEOUT_SECS", &raw)?),
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        Ok(Self {
            database_url,
            source_url,
            max_connections,
            http_timeout,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 && value <= u32::MAX as u64 => Ok(value),
        _ => Err(PipelineError::Config(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/bart")]))
                .expect("config");
        assert_eq!(config.database_url, "postgres://localhost/bart");
        assert_eq!(config.source_url, DEFAULT_SOURCE_URL);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.http_timeout, Duration::from_secs(300));
    }

    #[test]
    fn falls_back_to_prefixed_database_url_and_trims_source_slash() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("RIDERSHIP_DATABASE_URL", "postgres://db/warehouse"),
            ("RIDERSHIP_SOURCE_URL", "https://mirror.example/od/"),
            ("RIDERSHIP_DB_MAX_CONNECTIONS", "1"),
        ]))
        .expect("config");
        assert_eq!(config.database_url, "postgres://db/warehouse");
        assert_eq!(config.source_url, "https://mirror.example/od");
        assert_eq!(config.max_connections, 1);
    }

    #[test]
    fn missing_database_url_is_a_config_error() {
        let err = PipelineConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = PipelineConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/bart"),
            ("RIDERSHIP_HTTP_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RIDERSHIP_HTTP_TIMEOUT_SECS"));
    }
}

//! Runtime configuration.
//!
//! One threshold and one set of minimum lengths for every calling flow; the
//! intake, new-client and merge screens all read the same `SearchConfig`.

use anyhow::{anyhow, Context, Result};
use crate::store::MAX_LOCK_TTL_SECS;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Candidate search tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates must score strictly above this
    pub threshold: u32,
    /// Maximum candidates returned
    pub limit: usize,
    /// A name must have at least this many characters to drive a lookup
    pub min_name_len: usize,
    /// A phone must have at least this many digits to drive a lookup
    pub min_phone_digits: usize,
    /// An email must have at least this many characters to drive a lookup
    pub min_email_len: usize,
    /// Rows fetched from storage before scoring
    pub lookup_cap: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: 21,
            limit: 10,
            min_name_len: 3,
            min_phone_digits: 10,
            min_email_len: 6,
            lookup_cap: 200,
        }
    }
}

/// Merge execution tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Dependents moved per storage call
    pub batch_size: usize,
    /// Lifetime of a merge lock before it counts as abandoned
    pub lock_ttl_secs: i64,
    /// Recorded on audit events
    pub actor: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            lock_ttl_secs: 120,
            actor: "staff".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub database_path: PathBuf,
    pub search: SearchConfig,
    pub merge: MergeConfig,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("clients.db"),
            search: SearchConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl ResolutionConfig {
    /// Read a JSON config file (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => ResolutionConfig::default(),
        };

        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CLIENT_IDENTITY_*` overrides from any key/value source
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("CLIENT_IDENTITY_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(v) = lookup("CLIENT_IDENTITY_MATCH_THRESHOLD") {
            self.search.threshold = parse_var("CLIENT_IDENTITY_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("CLIENT_IDENTITY_MATCH_LIMIT") {
            self.search.limit = parse_var("CLIENT_IDENTITY_MATCH_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CLIENT_IDENTITY_BATCH_SIZE") {
            self.merge.batch_size = parse_var("CLIENT_IDENTITY_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("CLIENT_IDENTITY_LOCK_TTL_SECS") {
            self.merge.lock_ttl_secs = parse_var("CLIENT_IDENTITY_LOCK_TTL_SECS", &v)?;
        }
        if let Some(actor) = lookup("CLIENT_IDENTITY_ACTOR") {
            self.merge.actor = actor;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.limit == 0 {
            return Err(anyhow!("search.limit must be at least 1"));
        }
        if self.merge.batch_size == 0 {
            return Err(anyhow!("merge.batch_size must be at least 1"));
        }
        if self.merge.lock_ttl_secs <= 0 || self.merge.lock_ttl_secs > MAX_LOCK_TTL_SECS {
            return Err(anyhow!(
                "merge.lock_ttl_secs must be between 1 and {}",
                MAX_LOCK_TTL_SECS
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ResolutionConfig::default();

        assert_eq!(config.search.threshold, 21);
        assert_eq!(config.search.limit, 10);
        assert_eq!(config.merge.batch_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"search": {{"threshold": 40}}}}"#).unwrap();
        file.flush().unwrap();

        let config = ResolutionConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.search.threshold, 40);
        assert_eq!(config.search.limit, 10);
        assert_eq!(config.merge.lock_ttl_secs, 120);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CLIENT_IDENTITY_DB", "/tmp/office.db"),
            ("CLIENT_IDENTITY_BATCH_SIZE", "50"),
        ]
        .into_iter()
        .collect();

        let mut config = ResolutionConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/office.db"));
        assert_eq!(config.merge.batch_size, 50);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut config = ResolutionConfig::default();
        let result = config.apply_env(|key| {
            (key == "CLIENT_IDENTITY_MATCH_LIMIT").then(|| "ten".to_string())
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = ResolutionConfig::default();
        config.merge.batch_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_ttl_above_one_day_rejected() {
        let mut config = ResolutionConfig::default();
        config.merge.lock_ttl_secs = 1_000_000_000_000;
        assert!(config.validate().is_err());

        config.merge.lock_ttl_secs = MAX_LOCK_TTL_SECS;
        assert!(config.validate().is_ok());
    }
}

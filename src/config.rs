use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Everything needed to bind a [`crate::Service`].
///
/// Deserializable from TOML for file-driven deployments; constructable
/// directly for embedded use. Only `data_dir` is mandatory up front —
/// the remaining invariants (known format, api_key for hosted providers,
/// chunking bound vs. service max) are checked at bind time once the
/// service record is resolved.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Directory holding `embeddings.db` and (optionally) `text.db`.
    pub data_dir: PathBuf,
    /// Bearer token for hosted embedding APIs.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of a pre-registered embedding service to bind.
    #[serde(default)]
    pub service: Option<String>,
    /// Provider protocol for inline service registration.
    #[serde(default)]
    pub format: Option<String>,
    /// Endpoint override for the provider.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dimensions: Option<i64>,
    /// Provider-side token limit for the service being registered.
    #[serde(default)]
    pub max_tokens: Option<i64>,
    /// Upper bound on tokens per chunk; must not exceed the service's
    /// `max_tokens`.
    #[serde(default = "default_chunking_max_tokens")]
    pub chunking_max_tokens: i64,
    /// Chunks below this estimate are fused with their right neighbor.
    #[serde(default = "default_chunking_min_tokens")]
    pub chunking_min_tokens: i64,
    /// Inputs below this estimate are embedded whole, unchunked.
    #[serde(default = "default_no_chunk_threshold")]
    pub no_chunk_threshold: i64,
    /// Keep chunk text in the attached text database (enables LIKE / FTS
    /// filters and `include_text`).
    #[serde(default = "default_store_text")]
    pub store_text: bool,
    /// Auxiliary databases attached under a schema alias, for
    /// application-side `sql_where` joins.
    #[serde(default)]
    pub attach: BTreeMap<String, PathBuf>,
    /// Queue rows dequeued per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Attempts before a queue item goes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// HTTP timeout for provider calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Instance-scoped prefix applied to every table name, for
    /// shared-database deployments.
    #[serde(default)]
    pub table_prefix: String,
    /// Default upper bound on squared projection distance during search.
    #[serde(default = "default_projection_threshold")]
    pub projection_threshold: f64,
}

fn default_chunking_max_tokens() -> i64 {
    2000
}
fn default_chunking_min_tokens() -> i64 {
    50
}
fn default_no_chunk_threshold() -> i64 {
    200
}
fn default_store_text() -> bool {
    true
}
fn default_batch_size() -> i64 {
    100
}
fn default_max_retries() -> i64 {
    3
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_projection_threshold() -> f64 {
    2.0
}

impl ServiceConfig {
    /// Minimal config pointing at a data directory; everything else at
    /// defaults.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_key: None,
            service: None,
            format: None,
            base_url: None,
            model: None,
            dimensions: None,
            max_tokens: None,
            chunking_max_tokens: default_chunking_max_tokens(),
            chunking_min_tokens: default_chunking_min_tokens(),
            no_chunk_threshold: default_no_chunk_threshold(),
            store_text: default_store_text(),
            attach: BTreeMap::new(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            table_prefix: String::new(),
            projection_threshold: default_projection_threshold(),
        }
    }

    /// Checks that do not require the database or the service record.
    pub fn validate(&self) -> Result<()> {
        if self.chunking_max_tokens < 1 {
            return Err(Error::Config("chunking_max_tokens must be >= 1".into()));
        }
        if self.chunking_min_tokens < 0 {
            return Err(Error::Config("chunking_min_tokens must be >= 0".into()));
        }
        if self.batch_size < 1 {
            return Err(Error::Config("batch_size must be >= 1".into()));
        }
        if self.max_retries < 1 {
            return Err(Error::Config("max_retries must be >= 1".into()));
        }
        if self.projection_threshold <= 0.0 {
            return Err(Error::Config("projection_threshold must be > 0".into()));
        }
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(
                "table_prefix may only contain [A-Za-z0-9_]".into(),
            ));
        }
        for alias in self.attach.keys() {
            if alias.is_empty()
                || !alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                || alias == "main"
                || alias == "temp"
                || alias == crate::db::TEXT_SCHEMA
            {
                return Err(Error::Config(format!("invalid attach alias '{}'", alias)));
            }
        }
        if self.service.is_none() {
            // Inline registration needs the full service tuple.
            for (field, missing) in [
                ("format", self.format.is_none()),
                ("model", self.model.is_none()),
                ("dimensions", self.dimensions.is_none()),
                ("max_tokens", self.max_tokens.is_none()),
            ] {
                if missing {
                    return Err(Error::Config(format!(
                        "{} is required when no pre-registered service name is given",
                        field
                    )));
                }
            }
            if self.dimensions.unwrap_or(0) < 1 {
                return Err(Error::Config("dimensions must be >= 1".into()));
            }
            if self.max_tokens.unwrap_or(0) < 1 {
                return Err(Error::Config("max_tokens must be >= 1".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn chunking(&self) -> crate::chunk::ChunkingConfig {
        crate::chunk::ChunkingConfig {
            min_tokens: self.chunking_min_tokens as usize,
            max_tokens: self.chunking_max_tokens as usize,
            no_chunk_threshold: self.no_chunk_threshold as usize,
        }
    }
}

/// Load a [`ServiceConfig`] from a TOML file.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ServiceConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

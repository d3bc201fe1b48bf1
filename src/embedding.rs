//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete providers:
//!
//! - **[`HttpProvider`]** — calls an OpenAI-compatible embeddings endpoint
//!   with bearer authentication. One POST per batch; retry policy lives in
//!   the ingestion queue, not here.
//! - **[`MockProvider`]** — deterministic vectors derived from the input's
//!   SHA-256 digest. Registered under format `"mock"` and used by tests.
//!
//! Providers are constructed through the [`ProviderRegistry`], a mapping
//! from format name to constructor. Applications can register their own
//! formats alongside the builtins.
//!
//! Also provides the vector utilities shared by storage and search:
//!
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB codec
//! - [`cosine_similarity`] — similarity between two stored vectors

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::estimate_tokens;
use crate::error::{Error, Result};

/// Default endpoint for the `"openai"` format.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Vectors and token accounting for one batch of inputs, in input order.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub token_counts: Vec<i64>,
    pub total_tokens: i64,
}

/// A source of embeddings for one vector space.
///
/// Implementations must return vectors of exactly [`dimensions`] floats,
/// in the same order as the inputs, and report failure through
/// [`Error::Provider`].
///
/// [`dimensions`]: EmbeddingProvider::dimensions
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Vector length this provider produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    /// Embed a single text; convenience wrapper over [`embed_texts`].
    ///
    /// [`embed_texts`]: EmbeddingProvider::embed_texts
    async fn embed_text(&self, text: &str) -> Result<(Vec<f32>, i64)> {
        let batch = self.embed_texts(&[text.to_string()]).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("empty embedding response".into()))?;
        let tokens = batch.token_counts.first().copied().unwrap_or(0);
        Ok((vector, tokens))
    }
}

// ============ HTTP provider ============

/// Provider speaking the OpenAI embeddings wire format.
///
/// Issues a single `POST {base}/embeddings` with the full input list and a
/// bearer token. Non-success HTTP and transport failures surface as
/// [`Error::Provider`]; the queue decides whether to retry.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    api_key: String,
}

impl HttpProvider {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        dimensions: usize,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            dimensions,
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: Vec::new(),
                token_counts: Vec::new(),
                total_tokens: 0,
            });
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "embedding API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid embedding response: {}", e)))?;

        self.parse_response(&json, texts)
    }
}

impl HttpProvider {
    /// Extract `data[].embedding` in input order and the usage totals.
    ///
    /// The API reports only aggregate token usage, so per-text counts fall
    /// back to the chars/4 estimate.
    fn parse_response(
        &self,
        json: &serde_json::Value,
        texts: &[String],
    ) -> Result<EmbeddingBatch> {
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Provider("embedding response missing data array".into()))?;

        if data.len() != texts.len() {
            return Err(Error::Provider(format!(
                "embedding response has {} vectors for {} inputs",
                data.len(),
                texts.len()
            )));
        }

        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (pos, item) in data.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .map(|i| i as usize)
                .unwrap_or(pos);

            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::Provider("embedding response missing vector".into()))?;

            let vector: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();

            if vector.len() != self.dimensions {
                return Err(Error::Provider(format!(
                    "expected {} dimensions, API returned {}",
                    self.dimensions,
                    vector.len()
                )));
            }
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);

        let token_counts: Vec<i64> = texts.iter().map(|t| estimate_tokens(t) as i64).collect();
        let total_tokens = json
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| token_counts.iter().sum());

        Ok(EmbeddingBatch {
            vectors: indexed.into_iter().map(|(_, v)| v).collect(),
            token_counts,
            total_tokens,
        })
    }
}

// ============ Mock provider ============

/// Deterministic provider for tests: vectors are derived from the SHA-256
/// digest of the input, so identical texts embed identically and distinct
/// texts almost surely do not.
pub struct MockProvider {
    dimensions: usize,
}

impl MockProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        // Unit-length vectors with non-negative components, mirroring
        // hosted embedding APIs: every pairwise cosine lands in [0, 1]
        // and every pairwise squared distance in [0, 2].
        let digest = Sha256::digest(text.as_bytes());
        let mut vector: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let byte = digest[i % digest.len()].wrapping_add(i as u8);
                byte as f32 / 255.0
            })
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| self.embed_one(t)).collect();
        let token_counts: Vec<i64> = texts.iter().map(|t| estimate_tokens(t) as i64).collect();
        let total_tokens = token_counts.iter().sum();
        Ok(EmbeddingBatch {
            vectors,
            token_counts,
            total_tokens,
        })
    }
}

// ============ Registry ============

/// Inputs handed to a provider constructor, resolved from the bound
/// service record and the caller's configuration.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub format: String,
    pub base_url: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

type Constructor = Box<dyn Fn(&ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Mapping from format name to provider constructor.
///
/// [`ProviderRegistry::with_builtins`] pre-loads `"openai"` and `"mock"`;
/// applications may [`register`](ProviderRegistry::register) additional
/// formats before binding a service.
pub struct ProviderRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in formats.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |spec| {
            let api_key = spec.api_key.as_deref().ok_or_else(|| {
                Error::Config(format!("format '{}' requires an api_key", spec.format))
            })?;
            Ok(Arc::new(HttpProvider::new(
                spec.base_url.as_deref(),
                &spec.model,
                spec.dimensions,
                api_key,
                spec.timeout,
            )?))
        });
        registry.register("mock", |spec| Ok(Arc::new(MockProvider::new(spec.dimensions))));
        registry
    }

    pub fn register<F>(&mut self, format: &str, constructor: F)
    where
        F: Fn(&ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(format.to_string(), Box::new(constructor));
    }

    pub fn create(&self, spec: &ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>> {
        match self.constructors.get(&spec.format) {
            Some(constructor) => constructor(spec),
            None => {
                let mut known: Vec<&str> =
                    self.constructors.keys().map(String::as_str).collect();
                known.sort_unstable();
                Err(Error::Config(format!(
                    "unknown embedding format '{}'; known formats: {}",
                    spec.format,
                    known.join(", ")
                )))
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB of little-endian f32 bytes.
///
/// Each value is stored as 4 bytes; the f32 truncation of f64-valued
/// arithmetic elsewhere is the designed precision loss.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector; length is inferred from the
/// byte count.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, accumulated in f64.
///
/// Returns `0.0` when either magnitude is zero or the lengths differ; the
/// search executor uses [`cosine_similarity_checked`] to turn a length
/// mismatch into an error instead.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// As [`cosine_similarity`], but a length mismatch is a validation error.
pub fn cosine_similarity_checked(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::Validation(format!(
            "vector dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(cosine_similarity(a, b))
}

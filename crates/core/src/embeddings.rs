use crate::error::PipelineError;
use crate::services::{post_json, LazyClient, DEFAULT_OLLAMA_URL, DEFAULT_REQUEST_TIMEOUT};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;
const OLLAMA_PREFIX: &str = "ollama/";

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        self.embed(&[text.to_string()])?
            .pop()
            .ok_or_else(|| PipelineError::external(self.model_id(), "no vector returned for query"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Accelerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Accelerator,
}

impl ComputeDevice {
    /// Best device satisfying the preference; accelerators are never required.
    pub fn negotiate(preference: DevicePreference) -> Self {
        match preference {
            DevicePreference::Cpu => ComputeDevice::Cpu,
            DevicePreference::Auto | DevicePreference::Accelerator => {
                if accelerator_available() {
                    ComputeDevice::Accelerator
                } else {
                    if preference == DevicePreference::Accelerator {
                        debug!("no accelerator found, embedding on cpu");
                    }
                    ComputeDevice::Cpu
                }
            }
        }
    }
}

fn accelerator_available() -> bool {
    ["/dev/nvidia0", "/dev/kfd"]
        .iter()
        .any(|device| Path::new(device).exists())
}

#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    model_id: String,
    dimensions: usize,
    seed: u64,
    device: ComputeDevice,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new("char-ngram", DEFAULT_EMBEDDING_DIMENSIONS, ComputeDevice::Cpu)
    }
}

impl CharacterNgramEmbedder {
    pub fn new(model_id: impl Into<String>, dimensions: usize, device: ComputeDevice) -> Self {
        let model_id = model_id.into();
        let seed = fnv1a(FNV_OFFSET, model_id.as_bytes());
        Self {
            model_id,
            dimensions: dimensions.max(1),
            seed,
            device,
        }
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let hash = fnv1a(self.seed, token.as_bytes());
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings served by Ollama's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    model_id: String,
    model: String,
    dimensions: usize,
    endpoint: Url,
    client: LazyClient,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Result<Self, PipelineError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self {
            model_id: format!("{OLLAMA_PREFIX}{model}"),
            model: model.to_string(),
            dimensions,
            endpoint: base.join("api/embed")?,
            client: LazyClient::new(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = json!({ "model": self.model, "input": texts });
        let response: OllamaEmbedResponse =
            post_json(&self.client, "embedding", &self.endpoint, None, &payload)?;

        if response.embeddings.len() != texts.len() {
            return Err(PipelineError::external(
                "embedding",
                format!(
                    "expected {} vectors, received {}",
                    texts.len(),
                    response.embeddings.len()
                ),
            ));
        }

        if let Some(vector) = response
            .embeddings
            .iter()
            .find(|vector| vector.len() != self.dimensions)
        {
            return Err(PipelineError::external(
                "embedding",
                format!(
                    "model {} returned dimension {} instead of {}",
                    self.model,
                    vector.len(),
                    self.dimensions
                ),
            ));
        }

        Ok(response.embeddings)
    }
}

type ProviderKey = (String, usize);

/// Lazily creates one provider per model identifier and dimension, shared across requests.
///
/// `ollama/<model>` identifiers are served by Ollama; any other identifier maps to the trigram
/// embedder seeded by the identifier.
pub struct EmbeddingRegistry {
    dimensions: usize,
    device: DevicePreference,
    ollama_url: String,
    providers: Mutex<HashMap<ProviderKey, Arc<dyn EmbeddingProvider>>>,
}

impl Default for EmbeddingRegistry {
    fn default() -> Self {
        Self::new(
            DEFAULT_EMBEDDING_DIMENSIONS,
            DevicePreference::Auto,
            DEFAULT_OLLAMA_URL,
        )
    }
}

impl EmbeddingRegistry {
    pub fn new(dimensions: usize, device: DevicePreference, ollama_url: impl Into<String>) -> Self {
        Self {
            dimensions,
            device,
            ollama_url: ollama_url.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a ready-made provider under its own model identifier and dimension.
    pub fn register(&self, provider: Arc<dyn EmbeddingProvider>) -> Result<(), PipelineError> {
        let mut providers = self.lock()?;
        providers.insert(
            (provider.model_id().to_string(), provider.dimensions()),
            provider,
        );
        Ok(())
    }

    /// Provider for new indices, at the configured dimension.
    pub fn get(&self, model_id: &str) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
        self.get_with_dimensions(model_id, self.dimensions)
    }

    /// Provider matching an existing index, whatever dimension it was built with.
    pub fn get_with_dimensions(
        &self,
        model_id: &str,
        dimensions: usize,
    ) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "embedding model identifier is empty".to_string(),
            ));
        }

        let key = (model_id.to_string(), dimensions);
        let mut providers = self.lock()?;
        if let Some(provider) = providers.get(&key) {
            return Ok(provider.clone());
        }

        let provider: Arc<dyn EmbeddingProvider> = match model_id.strip_prefix(OLLAMA_PREFIX) {
            Some(model) => Arc::new(OllamaEmbedder::new(&self.ollama_url, model, dimensions)?),
            None => {
                let device = ComputeDevice::negotiate(self.device);
                Arc::new(CharacterNgramEmbedder::new(model_id, dimensions, device))
            }
        };

        info!(model = model_id, dimensions = provider.dimensions(), "embedding provider ready");
        providers.insert(key, provider.clone());
        Ok(provider)
    }

    /// Drops every cached provider.
    pub fn shutdown(&self) {
        if let Ok(mut providers) = self.providers.lock() {
            providers.clear();
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ProviderKey, Arc<dyn EmbeddingProvider>>>, PipelineError>
    {
        self.providers.lock().map_err(|_| {
            PipelineError::TransientResourceBusy("embedding registry lock poisoned".to_string())
        })
    }
}

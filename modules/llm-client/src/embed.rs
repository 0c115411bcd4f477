use anyhow::Result;

use trellis_common::TextEmbedder;

use crate::openai::OpenAi;

// ---------------------------------------------------------------------------
// OpenAI embeddings
// ---------------------------------------------------------------------------

/// OpenAI-backed embedder.
pub struct OpenAiEmbedder {
    client: OpenAi,
    model: String,
    dim: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, model: &str, dim: usize) -> Self {
        let client = OpenAi::new(api_key, model).with_embedding_model(model);
        Self {
            client,
            model: model.to_string(),
            dim,
        }
    }
}

#[async_trait::async_trait]
impl TextEmbedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.client.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding batch"))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.client.embed_batch(&texts).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Local hashed fallback
// ---------------------------------------------------------------------------

/// Deterministic offline embedder. Token hashes are scattered into the
/// vector and the result L2-normalized, so identical texts embed
/// identically and token overlap produces nonzero cosine similarity.
/// Useful for air-gapped runs and tests; not semantically meaningful.
pub struct LocalHashEmbedder {
    dim: usize,
}

impl LocalHashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.split_whitespace() {
            // FNV-1a; DefaultHasher is randomized per process and would
            // break cross-run determinism.
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.to_lowercase().as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            let idx = (hash % self.dim as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl TextEmbedder for LocalHashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_vector(text))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        "local-hash"
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Zero-vector fallback
// ---------------------------------------------------------------------------

/// Emits zero vectors. Keeps the indexing path alive when no embedding
/// provider is configured; similarity over these is meaningless.
pub struct ZeroEmbedder {
    dim: usize,
}

impl ZeroEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait::async_trait]
impl TextEmbedder for ZeroEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.0; self.dim])
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0; self.dim]).collect())
    }

    fn model_name(&self) -> &str {
        "zero"
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

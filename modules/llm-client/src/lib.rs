pub mod claude;
pub mod embed;
pub mod openai;
pub mod traits;

pub use claude::Claude;
pub use embed::{LocalHashEmbedder, OpenAiEmbedder, ZeroEmbedder};
pub use openai::OpenAi;
pub use traits::ChatModel;

use std::sync::Arc;

use trellis_common::{Config, TextEmbedder};

/// Select the embedding provider from config: "openai" needs an API key,
/// "local" is the deterministic hashed embedder, anything else falls back
/// to zero vectors (indexing still runs, similarity is meaningless).
pub fn embedder_from_config(config: &Config) -> Arc<dyn TextEmbedder> {
    match config.embedding_provider.as_str() {
        "openai" => match &config.openai_api_key {
            Some(key) => Arc::new(OpenAiEmbedder::new(
                key,
                &config.embedding_model,
                config.embed_dim,
            )),
            None => {
                tracing::warn!("EMBEDDING_PROVIDER=openai but OPENAI_API_KEY is unset, using zero vectors");
                Arc::new(ZeroEmbedder::new(config.embed_dim))
            }
        },
        "local" => Arc::new(LocalHashEmbedder::new(config.embed_dim)),
        _ => Arc::new(ZeroEmbedder::new(config.embed_dim)),
    }
}

/// Select the chat model for insight generation. Returns `None` when no
/// provider is configured; callers fall back to echo insights.
pub fn chat_model_from_config(config: &Config) -> Option<Arc<dyn ChatModel>> {
    match config.insight_provider.as_str() {
        "anthropic" => {
            let key = config.anthropic_api_key.as_deref()?;
            let model = if config.insight_model.is_empty() {
                "claude-haiku-4-5-20251001"
            } else {
                &config.insight_model
            };
            Some(Arc::new(Claude::new(key, model)))
        }
        "openai" => {
            let key = config.openai_api_key.as_deref()?;
            let model = if config.insight_model.is_empty() {
                "gpt-4o-mini"
            } else {
                &config.insight_model
            };
            Some(Arc::new(OpenAi::new(key, model)))
        }
        _ => None,
    }
}

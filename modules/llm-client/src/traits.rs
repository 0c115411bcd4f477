use anyhow::Result;
use async_trait::async_trait;

/// A chat-completion model. One system prompt, one user prompt, one text
/// reply. Implementations enforce the request timeout.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat_completion(&self, system: &str, user: &str) -> Result<String>;

    /// Provider label attached to generated insights (e.g. "anthropic").
    fn provider(&self) -> &str;

    fn model(&self) -> &str;
}

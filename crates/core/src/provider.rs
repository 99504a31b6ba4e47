use async_trait::async_trait;
use homeops_wecom::{IncomingMessage, SendError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
    #[error("reply delivery failed: {0}")]
    Delivery(#[from] SendError),
}

/// A pluggable backend the router dispatches to.
///
/// Providers own their session: once the router has handed a user to a
/// provider (keyword, menu selection or a namespaced event), the provider
/// reads and writes that user's conversation state and sends its own replies.
/// Handlers return `Ok(false)` to decline, which lets the router try the next
/// rule instead of assuming the message was consumed.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Stable identifier. Also the namespace of the provider's event keys
    /// (`<key>.<rest>`).
    fn key(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Free-text phrases that enter this provider directly.
    fn entry_keywords(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_enter(&self, user_id: &str) -> Result<(), ProviderError>;

    async fn handle_text(&self, user_id: &str, text: &str) -> Result<bool, ProviderError>;

    async fn handle_event(&self, user_id: &str, msg: &IncomingMessage) -> Result<bool, ProviderError>;

    /// Called only when this provider owns a state awaiting confirmation.
    async fn handle_confirm(&self, user_id: &str) -> Result<bool, ProviderError>;
}

/// Keyword comparison form: trimmed and lowercased.
pub fn normalize_keyword(text: &str) -> String {
    text.trim().to_lowercase()
}

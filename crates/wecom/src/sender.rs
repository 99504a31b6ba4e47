use crate::card::Menu;
use crate::message::{TemplateCardMessage, TextMessage};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("wecom api error: {code} {msg}")]
    Api { code: i64, msg: String },
    #[error("partial delivery failure: {0}")]
    PartialFailure(String),
    #[error("access token unavailable: {0}")]
    Token(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Outbound message delivery. Every outbound surface (the HTTP client, the
/// text-fallback presenter, test doubles) implements this.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, msg: TextMessage) -> Result<(), SendError>;

    async fn send_template_card(&self, msg: TemplateCardMessage) -> Result<(), SendError>;
}

/// Replaces the pressed button of an already delivered card with a
/// non-clickable label.
#[async_trait]
pub trait CardUpdater: Send + Sync {
    async fn update_template_card_button(
        &self,
        response_code: &str,
        replace_name: &str,
    ) -> Result<(), SendError>;
}

/// Publishes the application's static menu.
#[async_trait]
pub trait MenuPublisher: Send + Sync {
    async fn create_menu(&self, menu: &Menu) -> Result<(), SendError>;
}

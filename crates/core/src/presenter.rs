//! Card presentation with a plain-text fallback.
//!
//! Some clients cannot render interactive cards. In `text` and `both` modes a
//! card is flattened into a numbered list and the number → event-key mapping
//! is parked in the user's conversation state, where the router picks it up
//! when the user answers with a bare number.

use crate::state::ConversationStore;
use async_trait::async_trait;
use homeops_wecom::card::render_text_menu;
use homeops_wecom::{MenuChoice, MessageSender, SendError, TemplateCardMessage, TextMessage};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const UNRENDERABLE_CARD_TEXT: &str =
    "(Cards are switched to text mode, but this card cannot be shown as a text menu.)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CardMode {
    #[default]
    TemplateCard,
    Both,
    Text,
}

#[derive(Debug, Error)]
#[error("unknown template card mode '{0}' (expected template_card, both or text)")]
pub struct UnknownCardMode(pub String);

impl FromStr for CardMode {
    type Err = UnknownCardMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "template_card" => Ok(CardMode::TemplateCard),
            "both" => Ok(CardMode::Both),
            "text" => Ok(CardMode::Text),
            other => Err(UnknownCardMode(other.to_string())),
        }
    }
}

/// Wraps the real sender. Every outbound message resets the user's pending
/// numbered choices, so a stale list is never reinterpreted.
pub struct TemplateCardSender {
    base: Arc<dyn MessageSender>,
    store: Arc<ConversationStore>,
    mode: CardMode,
}

impl TemplateCardSender {
    pub fn new(base: Arc<dyn MessageSender>, store: Arc<ConversationStore>, mode: CardMode) -> Self {
        Self { base, store, mode }
    }

    pub fn mode(&self) -> CardMode {
        self.mode
    }

    fn clear_pending_buttons(&self, user_id: &str) {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return;
        }
        if let Some(mut state) = self.store.get(user_id) {
            if !state.pending_buttons.is_empty() {
                state.pending_buttons.clear();
                self.store.set(user_id, state);
            }
        }
    }

    fn set_pending_buttons(&self, user_id: &str, choices: Vec<MenuChoice>) {
        let user_id = user_id.trim();
        if user_id.is_empty() || choices.is_empty() {
            return;
        }
        let mut state = self.store.get(user_id).unwrap_or_default();
        debug!(user_id, choices = choices.len(), "Pending buttons stored");
        state.pending_buttons = choices;
        self.store.set(user_id, state);
    }
}

#[async_trait]
impl MessageSender for TemplateCardSender {
    async fn send_text(&self, msg: TextMessage) -> Result<(), SendError> {
        self.clear_pending_buttons(&msg.to_user);
        self.base.send_text(msg).await
    }

    async fn send_template_card(&self, msg: TemplateCardMessage) -> Result<(), SendError> {
        self.clear_pending_buttons(&msg.to_user);
        if self.mode == CardMode::TemplateCard {
            return self.base.send_template_card(msg).await;
        }

        let rendered = render_text_menu(&msg.card);
        let to_user = msg.to_user.clone();

        let (result, choices) = match (self.mode, rendered) {
            (CardMode::Both, rendered) => {
                self.base.send_template_card(msg).await?;
                match rendered {
                    Some((text, choices)) => (
                        self.base.send_text(TextMessage::new(to_user.clone(), text)).await,
                        choices,
                    ),
                    None => (Ok(()), Vec::new()),
                }
            }
            (_, Some((text, choices))) => (
                self.base.send_text(TextMessage::new(to_user.clone(), text)).await,
                choices,
            ),
            (_, None) => (
                self.base
                    .send_text(TextMessage::new(to_user.clone(), UNRENDERABLE_CARD_TEXT))
                    .await,
                Vec::new(),
            ),
        };

        // A list the user never received must not be answerable.
        if result.is_ok() {
            self.set_pending_buttons(&to_user, choices);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::ConversationState;
    use homeops_wecom::TemplateCard;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Sent {
        Text(String, String),
        Card(String, TemplateCard),
    }

    /// Records everything it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSender {
        pub(crate) fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().expect("lock"))
        }

        pub(crate) fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("lock")
                .iter()
                .filter_map(|s| match s {
                    Sent::Text(_, t) => Some(t.clone()),
                    Sent::Card(..) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(&self, msg: TextMessage) -> Result<(), SendError> {
            self.sent.lock().expect("lock").push(Sent::Text(msg.to_user, msg.content));
            Ok(())
        }

        async fn send_template_card(&self, msg: TemplateCardMessage) -> Result<(), SendError> {
            self.sent.lock().expect("lock").push(Sent::Card(msg.to_user, msg.card));
            Ok(())
        }
    }

    fn card() -> TemplateCard {
        TemplateCard::button_interaction("Docker", "")
            .with_button("Restart", 1, "docker.action.restart")
            .with_button("Logs", 2, "docker.view.logs")
    }

    fn setup(mode: CardMode) -> (Arc<RecordingSender>, Arc<ConversationStore>, TemplateCardSender) {
        let base = Arc::new(RecordingSender::default());
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        let sender = TemplateCardSender::new(base.clone(), store.clone(), mode);
        (base, store, sender)
    }

    #[test]
    fn parses_modes() {
        assert_eq!("".parse::<CardMode>().expect("empty"), CardMode::TemplateCard);
        assert_eq!(" Both ".parse::<CardMode>().expect("both"), CardMode::Both);
        assert_eq!("text".parse::<CardMode>().expect("text"), CardMode::Text);
        assert!("markdown".parse::<CardMode>().is_err());
    }

    #[tokio::test]
    async fn card_mode_passes_through() {
        let (base, store, sender) = setup(CardMode::TemplateCard);
        sender
            .send_template_card(TemplateCardMessage::new("u1", card()))
            .await
            .expect("send");
        assert!(matches!(base.take().as_slice(), [Sent::Card(u, _)] if u == "u1"));
        assert!(store.get("u1").is_none());
    }

    #[tokio::test]
    async fn text_mode_stores_pending_buttons() {
        let (base, store, sender) = setup(CardMode::Text);
        let mut state = ConversationState::for_service("docker");
        state.action = "restart".to_string();
        store.set("u1", state);

        sender
            .send_template_card(TemplateCardMessage::new("u1", card()))
            .await
            .expect("send");

        let sent = base.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Text(_, t) if t.contains("1. Restart") && t.contains("2. Logs")));

        let state = store.get("u1").expect("state");
        assert_eq!(state.service_key, "docker");
        assert_eq!(state.action, "restart");
        assert_eq!(state.pending_buttons.len(), 2);
        assert_eq!(state.pending_buttons[1].event_key, "docker.view.logs");
    }

    #[tokio::test]
    async fn both_mode_sends_card_then_text() {
        let (base, store, sender) = setup(CardMode::Both);
        sender
            .send_template_card(TemplateCardMessage::new("u1", card()))
            .await
            .expect("send");
        let sent = base.take();
        assert!(matches!(sent.as_slice(), [Sent::Card(..), Sent::Text(..)]));
        assert_eq!(store.get("u1").expect("state").pending_buttons.len(), 2);
    }

    #[tokio::test]
    async fn any_other_send_clears_pending_buttons() {
        let (_base, store, sender) = setup(CardMode::Text);
        sender
            .send_template_card(TemplateCardMessage::new("u1", card()))
            .await
            .expect("card");
        sender
            .send_text(TextMessage::new("u1", "done"))
            .await
            .expect("text");
        assert!(store.get("u1").expect("state").pending_buttons.is_empty());
    }

    struct DownSender;

    #[async_trait]
    impl MessageSender for DownSender {
        async fn send_text(&self, _msg: TextMessage) -> Result<(), SendError> {
            Err(SendError::Api {
                code: 45009,
                msg: "api freq out of limit".to_string(),
            })
        }

        async fn send_template_card(&self, _msg: TemplateCardMessage) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_send_leaves_no_pending_buttons() {
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        store.set("u1", ConversationState::for_service("docker"));

        for mode in [CardMode::Text, CardMode::Both] {
            let sender = TemplateCardSender::new(Arc::new(DownSender), store.clone(), mode);
            let err = sender
                .send_template_card(TemplateCardMessage::new("u1", card()))
                .await
                .expect_err("send fails");
            assert!(matches!(err, SendError::Api { code: 45009, .. }));
            let state = store.get("u1").expect("state");
            assert!(state.pending_buttons.is_empty());
            assert_eq!(state.service_key, "docker");
        }
    }

    #[tokio::test]
    async fn unrenderable_card_in_text_mode() {
        let (base, store, sender) = setup(CardMode::Text);
        sender
            .send_template_card(TemplateCardMessage::new(
                "u1",
                TemplateCard::button_interaction("Empty", ""),
            ))
            .await
            .expect("send");
        assert_eq!(base.texts(), vec![UNRENDERABLE_CARD_TEXT.to_string()]);
        assert!(store.get("u1").is_none());
    }
}

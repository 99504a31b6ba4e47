use homeops_wecom::{
    CardUpdater, MenuPublisher, MessageSender, SendError, TemplateCard, TemplateCardMessage,
    TextMessage,
};
use std::sync::Arc;

/// Outbound capabilities handed to the router and to providers.
///
/// Sending text and cards is mandatory. Card updates and menu publishing are
/// optional and fixed when the bundle is built, so callers check for them
/// with a plain `Option` instead of probing the sender at call time.
#[derive(Clone)]
pub struct Outbound {
    sender: Arc<dyn MessageSender>,
    /// Bypasses presentation; used for replies that must not touch
    /// conversation state.
    raw_sender: Option<Arc<dyn MessageSender>>,
    card_updater: Option<Arc<dyn CardUpdater>>,
    menu_publisher: Option<Arc<dyn MenuPublisher>>,
}

impl Outbound {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            raw_sender: None,
            card_updater: None,
            menu_publisher: None,
        }
    }

    pub fn with_raw_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.raw_sender = Some(sender);
        self
    }

    pub fn with_card_updater(mut self, updater: Arc<dyn CardUpdater>) -> Self {
        self.card_updater = Some(updater);
        self
    }

    pub fn with_menu_publisher(mut self, publisher: Arc<dyn MenuPublisher>) -> Self {
        self.menu_publisher = Some(publisher);
        self
    }

    pub fn sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    pub fn card_updater(&self) -> Option<&Arc<dyn CardUpdater>> {
        self.card_updater.as_ref()
    }

    pub fn menu_publisher(&self) -> Option<&Arc<dyn MenuPublisher>> {
        self.menu_publisher.as_ref()
    }

    pub async fn send_text(&self, user_id: &str, content: impl Into<String>) -> Result<(), SendError> {
        self.sender.send_text(TextMessage::new(user_id, content)).await
    }

    /// Sends through the raw sender when one is configured, else through
    /// the regular one.
    pub async fn send_text_raw(&self, user_id: &str, content: impl Into<String>) -> Result<(), SendError> {
        let sender = self.raw_sender.as_ref().unwrap_or(&self.sender);
        sender.send_text(TextMessage::new(user_id, content)).await
    }

    pub async fn send_card(&self, user_id: &str, card: TemplateCard) -> Result<(), SendError> {
        self.sender
            .send_template_card(TemplateCardMessage::new(user_id, card))
            .await
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("raw_sender", &self.raw_sender.is_some())
            .field("card_updater", &self.card_updater.is_some())
            .field("menu_publisher", &self.menu_publisher.is_some())
            .finish()
    }
}

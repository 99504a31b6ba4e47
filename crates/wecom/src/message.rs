use crate::card::TemplateCard;
use serde::Deserialize;
use thiserror::Error;

pub const MSG_TYPE_TEXT: &str = "text";
pub const MSG_TYPE_EVENT: &str = "event";

pub const EVENT_TEMPLATE_CARD: &str = "template_card_event";
pub const EVENT_CLICK: &str = "click";
pub const EVENT_ENTER_AGENT: &str = "enter_agent";

// Event keys owned by the router itself. Everything else is namespaced by
// provider key (`<provider>.<rest>`).
pub const EVENT_KEY_CORE_MENU: &str = "core.menu";
pub const EVENT_KEY_CORE_HELP: &str = "core.help";
pub const EVENT_KEY_CORE_SELFTEST: &str = "core.selftest";
pub const EVENT_KEY_CONFIRM: &str = "core.action.confirm";
pub const EVENT_KEY_CANCEL: &str = "core.action.cancel";
pub const EVENT_KEY_SERVICE_SELECT_PREFIX: &str = "svc.select.";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::DeError),
}

/// Outer callback body. Only `Encrypt` is needed; `ToUserName` is kept for
/// logging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: String,
    #[serde(rename = "Encrypt", default)]
    pub encrypt: String,
}

impl EncryptedEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, XmlError> {
        Ok(quick_xml::de::from_str(std::str::from_utf8(body)?)?)
    }
}

/// Decrypted callback payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: String,
    #[serde(rename = "FromUserName", default)]
    pub from_user_name: String,
    #[serde(rename = "CreateTime", default)]
    pub create_time: i64,
    #[serde(rename = "MsgType", default)]
    pub msg_type: String,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "Event", default)]
    pub event: String,
    #[serde(rename = "EventKey", default)]
    pub event_key: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: String,
    #[serde(rename = "TaskId", default)]
    pub task_id: String,
    #[serde(rename = "CardType", default)]
    pub card_type: String,
    #[serde(rename = "ResponseCode", default)]
    pub response_code: String,
    #[serde(rename = "AgentID", default)]
    pub agent_id: String,
}

impl IncomingMessage {
    pub fn parse(plain: &[u8]) -> Result<Self, XmlError> {
        Ok(quick_xml::de::from_str(std::str::from_utf8(plain)?)?)
    }

    /// Synthetic card-button press, used to replay a numbered text reply as
    /// the event it stands for.
    pub fn card_event(user_id: &str, event_key: &str) -> Self {
        Self {
            from_user_name: user_id.to_string(),
            msg_type: MSG_TYPE_EVENT.to_string(),
            event: EVENT_TEMPLATE_CARD.to_string(),
            event_key: event_key.to_string(),
            ..Default::default()
        }
    }

    pub fn user_id(&self) -> &str {
        self.from_user_name.trim()
    }

    pub fn is_text(&self) -> bool {
        self.msg_type.trim() == MSG_TYPE_TEXT
    }

    pub fn is_event(&self) -> bool {
        self.msg_type.trim() == MSG_TYPE_EVENT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub to_user: String,
    pub content: String,
}

impl TextMessage {
    pub fn new(to_user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to_user: to_user.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateCardMessage {
    pub to_user: String,
    pub card: TemplateCard,
}

impl TemplateCardMessage {
    pub fn new(to_user: impl Into<String>, card: TemplateCard) -> Self {
        Self {
            to_user: to_user.into(),
            card,
        }
    }
}

//! WeCom (WeChat Work) self-built application protocol: the signed and
//! encrypted callback envelope, the XML message model, interactive cards
//! and the outbound API client.

pub mod card;
pub mod client;
pub mod crypto;
pub mod message;
pub mod sender;

pub use card::{Menu, MenuButton, MenuChoice, ServiceOption, TemplateCard};
pub use client::{ClientConfig, WeComClient};
pub use crypto::{CryptoError, EnvelopeCodec};
pub use message::{EncryptedEnvelope, IncomingMessage, TemplateCardMessage, TextMessage, XmlError};
pub use sender::{CardUpdater, MenuPublisher, MessageSender, SendError};

//! Inbound pipeline core: conversation state, replay suppression, the
//! provider contract and the router that ties them together.

pub mod audit;
pub mod config;
pub mod dedupe;
pub mod outbound;
pub mod presenter;
pub mod provider;
pub mod router;
pub mod state;
pub mod sweep;

pub use config::{AppConfig, ConfigError};
pub use dedupe::{dedupe_key, Deduper};
pub use outbound::Outbound;
pub use presenter::{CardMode, TemplateCardSender};
pub use provider::{ProviderError, ServiceProvider};
pub use router::{Router, RouterDeps, RouterError};
pub use state::{ConversationState, ConversationStore, Step};

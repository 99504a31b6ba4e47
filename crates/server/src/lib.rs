//! HTTP surface of the callback service.

pub mod gateway;
pub mod metrics;

pub use gateway::{shutdown_signal, Gateway, GatewayConfig, MessageHandler};
pub use metrics::{CallbackMetrics, MetricsSnapshot};

use crate::metrics::{CallbackMetrics, MetricsSnapshot, RejectReason};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use homeops_core::{dedupe_key, Deduper};
use homeops_wecom::{EncryptedEnvelope, EnvelopeCodec, IncomingMessage};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const CALLBACK_PATH: &str = "/wecom/callback";

/// Acknowledgement body for every structurally valid callback.
pub const ACK_BODY: &str = "success";

/// Consumes decrypted, de-duplicated callbacks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &IncomingMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl MessageHandler for homeops_core::Router {
    async fn handle(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        self.handle_message(msg).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    codec: Arc<EnvelopeCodec>,
    deduper: Arc<Deduper>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<CallbackMetrics>,
}

pub struct Gateway {
    config: GatewayConfig,
    state: AppState,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    msg_signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    echostr: String,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        codec: EnvelopeCodec,
        deduper: Arc<Deduper>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            config,
            state: AppState {
                codec: Arc::new(codec),
                deduper,
                handler,
                metrics: CallbackMetrics::new(),
            },
        }
    }

    pub fn metrics(&self) -> Arc<CallbackMetrics> {
        self.state.metrics.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(CALLBACK_PATH, get(verify_url).post(receive_callback))
            .route("/healthz", get(probe))
            .route("/readyz", get(probe))
            .route("/api/monitor/metrics", get(get_metrics))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(middleware::from_fn(log_request))
            .with_state(self.state.clone())
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Request"
    );
    response
}

async fn probe() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// URL verification handshake: echo the decrypted challenge.
async fn verify_url(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<String, StatusCode> {
    if !state.codec.verify_signature(
        &query.msg_signature,
        &query.timestamp,
        &query.nonce,
        &query.echostr,
    ) {
        warn!("URL verification rejected: bad signature");
        state.metrics.inc_rejected(RejectReason::BadSignature);
        return Err(StatusCode::FORBIDDEN);
    }

    let plain = state.codec.decrypt(&query.echostr).map_err(|e| {
        warn!("URL verification rejected: {}", e);
        state.metrics.inc_rejected(RejectReason::DecryptFailed);
        StatusCode::FORBIDDEN
    })?;

    state.metrics.inc_verifications();
    String::from_utf8(plain).map_err(|_| {
        state.metrics.inc_rejected(RejectReason::DecryptFailed);
        StatusCode::FORBIDDEN
    })
}

async fn receive_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    state.metrics.inc_received();

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            warn!(status = status.as_u16(), "Callback body rejected: {}", rejection.body_text());
            let reason = if status == StatusCode::PAYLOAD_TOO_LARGE {
                RejectReason::TooLarge
            } else {
                RejectReason::BadRequest
            };
            state.metrics.inc_rejected(reason);
            return status.into_response();
        }
    };

    let envelope = match EncryptedEnvelope::parse(&body) {
        Ok(env) if !env.encrypt.trim().is_empty() => env,
        Ok(_) => {
            warn!("Callback envelope has no Encrypt element");
            state.metrics.inc_rejected(RejectReason::BadRequest);
            return StatusCode::BAD_REQUEST.into_response();
        }
        Err(e) => {
            warn!("Callback envelope rejected: {}", e);
            state.metrics.inc_rejected(RejectReason::BadRequest);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if !state.codec.verify_signature(
        &query.msg_signature,
        &query.timestamp,
        &query.nonce,
        &envelope.encrypt,
    ) {
        warn!("Callback rejected: bad signature");
        state.metrics.inc_rejected(RejectReason::BadSignature);
        return StatusCode::FORBIDDEN.into_response();
    }

    let plaintext = match state.codec.decrypt(&envelope.encrypt) {
        Ok(p) => p,
        Err(e) => {
            warn!("Callback rejected: {}", e);
            state.metrics.inc_rejected(RejectReason::DecryptFailed);
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    let msg = match IncomingMessage::parse(&plaintext) {
        Ok(m) => m,
        Err(e) => {
            warn!("Callback payload rejected: {}", e);
            state.metrics.inc_rejected(RejectReason::BadRequest);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let key = dedupe_key(&msg, &plaintext);
    if state.deduper.seen_or_mark(&key) {
        debug!(user_id = msg.user_id(), key = %key, "Duplicate callback absorbed");
        state.metrics.inc_duplicates();
        return (StatusCode::OK, ACK_BODY).into_response();
    }

    state.metrics.inc_accepted();
    debug!(
        user_id = msg.user_id(),
        msg_type = %msg.msg_type,
        event_key = %msg.event_key,
        "Callback accepted"
    );

    // Provider failures are acknowledged anyway so the platform does not retry.
    if let Err(e) = state.handler.handle(&msg).await {
        warn!(user_id = msg.user_id(), "Message handling failed: {:#}", e);
        state.metrics.inc_handler_errors();
    }

    (StatusCode::OK, ACK_BODY).into_response()
}

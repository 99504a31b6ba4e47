use crate::card::Menu;
use crate::message::{TemplateCardMessage, TextMessage};
use crate::sender::{CardUpdater, MenuPublisher, MessageSender, SendError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DEFAULT_API_BASE_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin";

/// Tokens are treated as stale this long before the platform expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub corp_id: String,
    pub agent_id: i64,
    pub secret: String,
    pub timeout: Duration,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    invaliduser: String,
    #[serde(default)]
    invalidparty: String,
    #[serde(default)]
    invalidtag: String,
    #[serde(default)]
    unlicenseduser: String,
}

impl ApiResponse {
    fn check(&self) -> Result<(), SendError> {
        if self.errcode != 0 {
            return Err(SendError::Api {
                code: self.errcode,
                msg: self.errmsg.clone(),
            });
        }
        Ok(())
    }

    fn partial_failure(&self) -> Option<String> {
        let parts: Vec<String> = [
            ("invaliduser", &self.invaliduser),
            ("invalidparty", &self.invalidparty),
            ("invalidtag", &self.invalidtag),
            ("unlicenseduser", &self.unlicenseduser),
        ]
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// HTTP client for the WeCom application API.
///
/// The access token is cached and shared. The cache mutex is held for the
/// whole refresh, so concurrent callers that find the token stale wait for a
/// single `gettoken` round trip instead of issuing their own.
pub struct WeComClient {
    cfg: ClientConfig,
    http: Client,
    token: Mutex<Option<CachedToken>>,
}

impl WeComClient {
    pub fn new(cfg: ClientConfig) -> Result<Self, SendError> {
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self::with_http_client(cfg, http))
    }

    pub fn with_http_client(mut cfg: ClientConfig, http: Client) -> Self {
        cfg.api_base_url = cfg.api_base_url.trim_end_matches('/').to_string();
        Self {
            cfg,
            http,
            token: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.cfg.agent_id
    }

    async fn access_token(&self) -> Result<String, SendError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch_access_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch_access_token(&self) -> Result<CachedToken, SendError> {
        let start = Instant::now();
        let url = format!("{}/gettoken", self.cfg.api_base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("corpid", &self.cfg.corp_id), ("corpsecret", &self.cfg.secret)])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, duration_ms = start.elapsed().as_millis() as u64, "WeCom gettoken request failed");
                SendError::Http(e)
            })?;
        let status = resp.status().as_u16();
        let out: ApiResponse = resp.json().await?;
        if let Err(e) = out.check() {
            error!(
                error = %e,
                status,
                duration_ms = start.elapsed().as_millis() as u64,
                "WeCom gettoken returned error"
            );
            return Err(e);
        }
        if out.access_token.is_empty() || out.expires_in == 0 {
            return Err(SendError::Token("gettoken returned an empty token".to_string()));
        }

        info!(
            status,
            expires_in = out.expires_in,
            duration_ms = start.elapsed().as_millis() as u64,
            "WeCom gettoken ok"
        );
        let ttl = Duration::from_secs(out.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        Ok(CachedToken {
            value: out.access_token,
            refresh_at: Instant::now() + ttl,
        })
    }

    async fn post(&self, endpoint: &str, extra_query: &[(&str, String)], body: &Value) -> Result<ApiResponse, SendError> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", self.cfg.api_base_url, endpoint);
        let mut query: Vec<(&str, String)> = vec![("access_token", token)];
        query.extend(extra_query.iter().cloned());

        let resp = self.http.post(&url).query(&query).json(body).send().await?;
        Ok(resp.json().await?)
    }

    async fn send_message(&self, payload: Value) -> Result<(), SendError> {
        let start = Instant::now();
        let to_user = payload["touser"].as_str().unwrap_or_default().to_string();
        let msg_type = payload["msgtype"].as_str().unwrap_or_default().to_string();

        let out = match self.post("message/send", &[], &payload).await {
            Ok(out) => out,
            Err(e) => {
                error!(error = %e, to_user = %to_user, msg_type = %msg_type, "WeCom message/send failed");
                return Err(e);
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Err(e) = out.check() {
            error!(error = %e, to_user = %to_user, msg_type = %msg_type, duration_ms, "WeCom message/send returned error");
            return Err(e);
        }
        if let Some(detail) = out.partial_failure() {
            warn!(to_user = %to_user, msg_type = %msg_type, detail = %detail, duration_ms, "WeCom message/send partially failed");
            return Err(SendError::PartialFailure(detail));
        }

        info!(to_user = %to_user, msg_type = %msg_type, duration_ms, "WeCom message/send ok");
        Ok(())
    }
}

#[async_trait]
impl MessageSender for WeComClient {
    async fn send_text(&self, msg: TextMessage) -> Result<(), SendError> {
        self.send_message(json!({
            "touser": msg.to_user,
            "msgtype": "text",
            "agentid": self.cfg.agent_id,
            "text": { "content": msg.content },
        }))
        .await
    }

    async fn send_template_card(&self, msg: TemplateCardMessage) -> Result<(), SendError> {
        let mut card = msg.card;
        if card.task_id.is_none() {
            card.task_id = Some(format!("homeops-{}", uuid::Uuid::new_v4().simple()));
        }
        let card = serde_json::to_value(&card)
            .map_err(|e| SendError::InvalidRequest(format!("encode card: {}", e)))?;
        self.send_message(json!({
            "touser": msg.to_user,
            "msgtype": "template_card",
            "agentid": self.cfg.agent_id,
            "template_card": card,
        }))
        .await
    }
}

#[async_trait]
impl CardUpdater for WeComClient {
    async fn update_template_card_button(
        &self,
        response_code: &str,
        replace_name: &str,
    ) -> Result<(), SendError> {
        if response_code.is_empty() {
            return Err(SendError::InvalidRequest("response_code is empty".to_string()));
        }
        let replace_name = if replace_name.is_empty() { "Done" } else { replace_name };
        let payload = json!({
            "agentid": self.cfg.agent_id,
            "response_code": response_code,
            "button": { "replace_name": replace_name },
        });

        let out = self.post("message/update_template_card", &[], &payload).await?;
        if let Err(e) = out.check() {
            error!(error = %e, response_code_len = response_code.len(), "WeCom update_template_card returned error");
            return Err(e);
        }
        info!(replace_name, "WeCom update_template_card ok");
        Ok(())
    }
}

#[async_trait]
impl MenuPublisher for WeComClient {
    async fn create_menu(&self, menu: &Menu) -> Result<(), SendError> {
        let payload = serde_json::to_value(menu)
            .map_err(|e| SendError::InvalidRequest(format!("encode menu: {}", e)))?;
        let out = self
            .post("menu/create", &[("agentid", self.cfg.agent_id.to_string())], &payload)
            .await?;
        if let Err(e) = out.check() {
            error!(error = %e, agent_id = self.cfg.agent_id, "WeCom menu/create returned error");
            return Err(e);
        }
        info!(agent_id = self.cfg.agent_id, top_buttons = menu.buttons.len(), "WeCom menu/create ok");
        Ok(())
    }
}

use crate::audit::{
    log_audit, EVENT_CANCEL, EVENT_CONFIRM_DISPATCH, EVENT_MENU_SYNC, EVENT_PROVIDER_ENTER,
    EVENT_UNAUTHORIZED,
};
use crate::outbound::Outbound;
use crate::provider::{normalize_keyword, ProviderError, ServiceProvider};
use crate::state::{ConversationState, ConversationStore};
use homeops_wecom::card::{default_menu, service_select_card, ServiceOption};
use homeops_wecom::message::{
    EVENT_ENTER_AGENT, EVENT_KEY_CANCEL, EVENT_KEY_CONFIRM, EVENT_KEY_CORE_HELP,
    EVENT_KEY_CORE_MENU, EVENT_KEY_CORE_SELFTEST, EVENT_KEY_SERVICE_SELECT_PREFIX,
};
use homeops_wecom::{IncomingMessage, SendError};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const REPLY_NOT_AUTHORIZED: &str = "Not authorized.";
pub const REPLY_SESSION_EXPIRED: &str = "Session expired, please start over.";
pub const REPLY_CANCELLED: &str = "Cancelled.";
pub const REPLY_DEFAULT: &str = "Type \"help\" for commands or \"menu\" to choose a service.";
pub const REPLY_UNSUPPORTED_TYPE: &str = "Unsupported message type. Please send text.";
pub const REPLY_MENU_SYNC_UNSUPPORTED: &str = "Menu sync is not supported by the current sender.";
pub const REPLY_NO_SERVICES: &str = "No services are registered.";

pub const CARD_CONFIRMED: &str = "Confirmed";
pub const CARD_CANCELLED: &str = "Cancelled";

const KEYWORDS_PING: &[&str] = &["ping", "selftest", "自检"];
const KEYWORDS_HELP: &[&str] = &["help", "?", "帮助"];
const KEYWORDS_MENU: &[&str] = &["menu", "菜单"];
const KEYWORDS_SYNC_MENU: &[&str] = &["sync menu", "同步菜单"];
const KEYWORDS_CONFIRM: &[&str] = &["confirm", "yes", "确认"];
const KEYWORDS_CANCEL: &[&str] = &["cancel", "no", "取消"];

fn is_builtin_keyword(normalized: &str) -> bool {
    [
        KEYWORDS_PING,
        KEYWORDS_HELP,
        KEYWORDS_MENU,
        KEYWORDS_SYNC_MENU,
        KEYWORDS_CONFIRM,
        KEYWORDS_CANCEL,
    ]
    .iter()
    .any(|set| set.contains(&normalized))
}

pub fn service_unavailable_reply(provider_key: &str) -> String {
    format!("service unavailable: {}", provider_key)
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("reply to {user_id} failed: {source}")]
    Reply {
        user_id: String,
        #[source]
        source: SendError,
    },
    #[error("provider {provider} failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },
    #[error("menu publishing is not supported by the outbound sender")]
    MenuUnsupported,
    #[error("menu sync failed: {0}")]
    MenuSync(#[source] SendError),
}

pub struct RouterDeps {
    pub outbound: Outbound,
    pub store: Arc<ConversationStore>,
    pub allowed_user_ids: Vec<String>,
    pub providers: Vec<Arc<dyn ServiceProvider>>,
}

/// Authenticates senders, tracks where each user is and dispatches to
/// built-in commands or the owning provider.
///
/// The provider list, key map and keyword index are built once and never
/// change afterwards.
pub struct Router {
    outbound: Outbound,
    store: Arc<ConversationStore>,
    allowed: HashSet<String>,
    providers: Vec<Arc<dyn ServiceProvider>>,
    by_key: HashMap<String, Arc<dyn ServiceProvider>>,
    keywords: HashMap<String, String>,
}

impl Router {
    pub fn new(deps: RouterDeps) -> Self {
        let allowed: HashSet<String> = deps
            .allowed_user_ids
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();

        let mut providers: Vec<Arc<dyn ServiceProvider>> = Vec::new();
        let mut by_key: HashMap<String, Arc<dyn ServiceProvider>> = HashMap::new();
        let mut keywords: HashMap<String, String> = HashMap::new();

        for provider in deps.providers {
            let key = provider.key().trim().to_string();
            if key.is_empty() || key.contains('.') || key == "core" || key == "svc" {
                warn!(provider = %key, "Provider skipped: key must be non-empty, dot-free and not reserved");
                continue;
            }
            if by_key.contains_key(&key) {
                warn!(provider = %key, "Provider skipped: duplicate key");
                continue;
            }

            for keyword in provider.entry_keywords() {
                let normalized = normalize_keyword(&keyword);
                if normalized.is_empty() {
                    continue;
                }
                if is_builtin_keyword(&normalized) {
                    warn!(provider = %key, keyword = %normalized, "Keyword skipped: collides with a built-in command");
                    continue;
                }
                if let Some(owner) = keywords.get(&normalized) {
                    warn!(provider = %key, keyword = %normalized, owner = %owner, "Keyword skipped: already registered");
                    continue;
                }
                keywords.insert(normalized, key.clone());
            }

            by_key.insert(key, provider.clone());
            providers.push(provider);
        }

        info!(
            providers = providers.len(),
            keywords = keywords.len(),
            allowed_users = allowed.len(),
            "Router ready"
        );

        Self {
            outbound: deps.outbound,
            store: deps.store,
            allowed,
            providers,
            by_key,
            keywords,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.allowed.contains(user_id)
    }

    pub fn service_options(&self) -> Vec<ServiceOption> {
        self.providers
            .iter()
            .map(|p| ServiceOption {
                key: p.key().trim().to_string(),
                name: p.display_name().to_string(),
            })
            .collect()
    }

    pub async fn handle_message(&self, msg: &IncomingMessage) -> Result<(), RouterError> {
        let user_id = msg.user_id();
        if user_id.is_empty() {
            debug!(msg_type = %msg.msg_type, "Message without sender ignored");
            return Ok(());
        }

        if !self.is_allowed(user_id) {
            warn!(user_id, msg_type = %msg.msg_type, "Unauthorized sender");
            log_audit(EVENT_UNAUTHORIZED, user_id, json!({ "msg_type": msg.msg_type }));
            // Unknown senders never reach the conversation store.
            return self
                .outbound
                .send_text_raw(user_id, REPLY_NOT_AUTHORIZED)
                .await
                .map_err(|source| RouterError::Reply {
                    user_id: user_id.to_string(),
                    source,
                });
        }

        if msg.is_text() {
            self.handle_text(user_id, msg).await
        } else if msg.is_event() {
            self.handle_event(user_id, msg).await
        } else {
            debug!(user_id, msg_type = %msg.msg_type, "Unsupported message type");
            self.reply(user_id, REPLY_UNSUPPORTED_TYPE).await
        }
    }

    async fn handle_text(&self, user_id: &str, msg: &IncomingMessage) -> Result<(), RouterError> {
        let text = msg.content.trim();
        if text.is_empty() {
            return Ok(());
        }
        let normalized = normalize_keyword(text);

        if KEYWORDS_PING.contains(&normalized.as_str()) {
            return self.reply_selftest(user_id, msg).await;
        }

        let state = self.store.get(user_id);

        if let Some(state) = state.as_ref().filter(|s| !s.pending_buttons.is_empty()) {
            if let Ok(n) = text.parse::<usize>() {
                let total = state.pending_buttons.len();
                return match n.checked_sub(1).and_then(|i| state.pending_buttons.get(i)) {
                    Some(choice) => {
                        debug!(user_id, choice = n, event_key = %choice.event_key, "Numbered reply resolved");
                        let event = IncomingMessage::card_event(user_id, &choice.event_key);
                        self.handle_event(user_id, &event).await
                    }
                    None => {
                        self.reply(user_id, &format!("Please reply with a number between 1 and {}.", total))
                            .await
                    }
                };
            }
        }

        let is_confirm = KEYWORDS_CONFIRM.contains(&normalized.as_str());
        let is_cancel = KEYWORDS_CANCEL.contains(&normalized.as_str());

        if let Some(pending) = state.as_ref().filter(|s| s.awaiting_confirm() && s.has_owner()) {
            if is_confirm {
                return self.dispatch_confirm(user_id, pending, "").await;
            }
            if is_cancel {
                return self.cancel(user_id, "").await;
            }
        }

        if KEYWORDS_HELP.contains(&normalized.as_str()) {
            return self.reply(user_id, &self.help_text()).await;
        }
        if KEYWORDS_SYNC_MENU.contains(&normalized.as_str()) {
            return self.sync_menu_for(user_id).await;
        }
        if KEYWORDS_MENU.contains(&normalized.as_str()) {
            return self.show_menu(user_id).await;
        }

        if let Some(key) = self.keywords.get(&normalized) {
            if let Some(provider) = self.by_key.get(key) {
                return self.enter_provider(user_id, provider.clone()).await;
            }
        }

        // Outside a pending confirmation, yes/no belong to the active provider.
        if let Some(provider) = state.as_ref().and_then(|s| self.by_key.get(&s.service_key)) {
            let handled = provider
                .handle_text(user_id, text)
                .await
                .map_err(|e| provider_error(provider.as_ref(), e))?;
            if handled {
                return Ok(());
            }
        }

        let has_owner = state.as_ref().is_some_and(|s| s.has_owner());
        if is_confirm {
            return self.reply(user_id, REPLY_SESSION_EXPIRED).await;
        }
        if is_cancel && has_owner {
            return self.cancel(user_id, "").await;
        }

        self.reply(user_id, REPLY_DEFAULT).await
    }

    async fn handle_event(&self, user_id: &str, msg: &IncomingMessage) -> Result<(), RouterError> {
        let event = msg.event.trim();
        let key = msg.event_key.trim();

        if event == EVENT_ENTER_AGENT {
            return self.show_menu(user_id).await;
        }
        if key.is_empty() {
            debug!(user_id, event, "Event without key ignored");
            return Ok(());
        }

        match key {
            EVENT_KEY_CORE_SELFTEST => return self.reply_selftest(user_id, msg).await,
            EVENT_KEY_CORE_HELP => return self.reply(user_id, &self.help_text()).await,
            EVENT_KEY_CORE_MENU => return self.show_menu(user_id).await,
            EVENT_KEY_CONFIRM => {
                let state = self.store.get(user_id);
                return match state.filter(|s| s.awaiting_confirm() && s.has_owner()) {
                    Some(state) => self.dispatch_confirm(user_id, &state, &msg.response_code).await,
                    None => self.reply(user_id, REPLY_SESSION_EXPIRED).await,
                };
            }
            EVENT_KEY_CANCEL => return self.cancel(user_id, &msg.response_code).await,
            _ => {}
        }

        if let Some(service_key) = key.strip_prefix(EVENT_KEY_SERVICE_SELECT_PREFIX) {
            return match self.by_key.get(service_key) {
                Some(provider) => self.enter_provider(user_id, provider.clone()).await,
                None => self.reply(user_id, &service_unavailable_reply(service_key)).await,
            };
        }

        let mut declined_by: Option<&str> = None;
        match key.split_once('.').map(|(ns, _)| (ns, self.by_key.get(ns))) {
            Some((namespace, Some(provider))) => {
                let handled = provider
                    .handle_event(user_id, msg)
                    .await
                    .map_err(|e| provider_error(provider.as_ref(), e))?;
                if handled {
                    return Ok(());
                }
                debug!(user_id, event_key = key, provider = namespace, "Namespaced event declined");
                declined_by = Some(namespace);
            }
            Some((namespace, None)) if namespace != "core" => {
                info!(user_id, event_key = key, "Event for unregistered provider");
                return self.reply(user_id, &service_unavailable_reply(namespace)).await;
            }
            // Dotless keys and unknown core.* keys belong to the active session.
            _ => {}
        }

        let active = self
            .store
            .get(user_id)
            .and_then(|s| self.by_key.get(&s.service_key))
            .filter(|p| Some(p.key().trim()) != declined_by);
        if let Some(provider) = active {
            let handled = provider
                .handle_event(user_id, msg)
                .await
                .map_err(|e| provider_error(provider.as_ref(), e))?;
            if handled {
                return Ok(());
            }
        }

        self.reply(user_id, REPLY_DEFAULT).await
    }

    /// Confirmation always resolves against the provider recorded in state.
    async fn dispatch_confirm(
        &self,
        user_id: &str,
        state: &ConversationState,
        response_code: &str,
    ) -> Result<(), RouterError> {
        let Some(provider) = self.by_key.get(&state.service_key) else {
            self.store.clear(user_id);
            return self.reply(user_id, REPLY_SESSION_EXPIRED).await;
        };

        log_audit(
            EVENT_CONFIRM_DISPATCH,
            user_id,
            json!({ "provider": state.service_key, "action": state.action }),
        );
        let handled = provider
            .handle_confirm(user_id)
            .await
            .map_err(|e| provider_error(provider.as_ref(), e))?;
        if !handled {
            return self.reply(user_id, REPLY_SESSION_EXPIRED).await;
        }
        self.update_card(response_code, CARD_CONFIRMED).await;
        Ok(())
    }

    async fn cancel(&self, user_id: &str, response_code: &str) -> Result<(), RouterError> {
        let previous = self.store.get(user_id).map(|s| s.service_key).unwrap_or_default();
        self.store.clear(user_id);
        log_audit(EVENT_CANCEL, user_id, json!({ "provider": previous }));
        self.reply(user_id, REPLY_CANCELLED).await?;
        self.update_card(response_code, CARD_CANCELLED).await;
        Ok(())
    }

    async fn update_card(&self, response_code: &str, label: &str) {
        let response_code = response_code.trim();
        if response_code.is_empty() {
            return;
        }
        let Some(updater) = self.outbound.card_updater() else {
            debug!("Card update capability not available");
            return;
        };
        if let Err(e) = updater.update_template_card_button(response_code, label).await {
            warn!(error = %e, label, "Card button update failed");
        }
    }

    async fn enter_provider(&self, user_id: &str, provider: Arc<dyn ServiceProvider>) -> Result<(), RouterError> {
        let key = provider.key().trim().to_string();
        self.store.clear(user_id);
        self.store.set(user_id, ConversationState::for_service(key.clone()));
        log_audit(EVENT_PROVIDER_ENTER, user_id, json!({ "provider": key }));
        info!(user_id, provider = %key, "Entering provider");
        provider
            .on_enter(user_id)
            .await
            .map_err(|e| provider_error(provider.as_ref(), e))
    }

    async fn show_menu(&self, user_id: &str) -> Result<(), RouterError> {
        self.store.clear(user_id);
        if self.providers.is_empty() {
            return self.reply(user_id, REPLY_NO_SERVICES).await;
        }
        let card = service_select_card(&self.service_options());
        self.outbound
            .send_card(user_id, card)
            .await
            .map_err(|source| RouterError::Reply {
                user_id: user_id.to_string(),
                source,
            })
    }

    /// Publishes the default application menu built from the registered
    /// providers.
    pub async fn publish_menu(&self) -> Result<(), RouterError> {
        let publisher = self.outbound.menu_publisher().ok_or(RouterError::MenuUnsupported)?;
        let menu = default_menu(&self.service_options());
        publisher.create_menu(&menu).await.map_err(RouterError::MenuSync)
    }

    async fn sync_menu_for(&self, user_id: &str) -> Result<(), RouterError> {
        match self.publish_menu().await {
            Ok(()) => {
                log_audit(EVENT_MENU_SYNC, user_id, json!({ "ok": true }));
                self.reply(user_id, "Application menu synced.").await
            }
            Err(RouterError::MenuUnsupported) => self.reply(user_id, REPLY_MENU_SYNC_UNSUPPORTED).await,
            Err(e) => {
                warn!(user_id, error = %e, "Menu sync failed");
                log_audit(EVENT_MENU_SYNC, user_id, json!({ "ok": false, "error": e.to_string() }));
                self.reply(user_id, &format!("Menu sync failed: {}", e)).await
            }
        }
    }

    async fn reply_selftest(&self, user_id: &str, msg: &IncomingMessage) -> Result<(), RouterError> {
        let msg_id = if msg.msg_id.is_empty() { "-" } else { msg.msg_id.as_str() };
        let text = format!(
            "pong\nserver_time: {}\nfrom: {}\nmsg_id: {}",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            user_id,
            msg_id,
        );
        self.reply(user_id, &text).await
    }

    pub fn help_text(&self) -> String {
        let mut lines = vec![
            "Commands:".to_string(),
            "- menu: choose a service".to_string(),
            "- help: show this help".to_string(),
            "- ping: self-test".to_string(),
            "- sync menu: publish the application menu".to_string(),
            "- confirm / cancel: answer a pending confirmation".to_string(),
        ];

        let mut by_provider: Vec<(&str, &str, Vec<&str>)> = self
            .providers
            .iter()
            .map(|p| {
                let key = p.key().trim();
                let mut kws: Vec<&str> = self
                    .keywords
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == key)
                    .map(|(kw, _)| kw.as_str())
                    .collect();
                kws.sort_unstable();
                (key, p.display_name(), kws)
            })
            .collect();
        by_provider.sort_by(|a, b| a.0.cmp(b.0));

        if !by_provider.is_empty() {
            lines.push("Services:".to_string());
            for (_, name, kws) in by_provider {
                if kws.is_empty() {
                    lines.push(format!("- {}", name));
                } else {
                    lines.push(format!("- {}: {}", name, kws.join(", ")));
                }
            }
        }
        lines.join("\n")
    }

    async fn reply(&self, user_id: &str, text: &str) -> Result<(), RouterError> {
        self.outbound
            .send_text(user_id, text)
            .await
            .map_err(|source| RouterError::Reply {
                user_id: user_id.to_string(),
                source,
            })
    }
}

fn provider_error(provider: &dyn ServiceProvider, source: ProviderError) -> RouterError {
    RouterError::Provider {
        provider: provider.key().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presenter::tests::{RecordingSender, Sent};
    use crate::presenter::{CardMode, TemplateCardSender};
    use crate::state::Step;
    use async_trait::async_trait;
    use homeops_wecom::card::confirm_card;
    use homeops_wecom::{CardUpdater, Menu, MenuPublisher};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider double that records calls and enters an awaiting-confirm
    /// step on `<key>.action.*` events.
    struct FakeProvider {
        key: String,
        keywords: Vec<String>,
        store: Arc<ConversationStore>,
        outbound: Outbound,
        calls: Mutex<Vec<String>>,
        accepts_events: bool,
        accepts_text: bool,
    }

    impl FakeProvider {
        fn new(key: &str, keywords: &[&str], store: Arc<ConversationStore>, outbound: Outbound) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                store,
                outbound,
                calls: Mutex::new(Vec::new()),
                accepts_events: true,
                accepts_text: true,
            })
        }

        fn declining(key: &str, store: Arc<ConversationStore>, outbound: Outbound) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                keywords: Vec::new(),
                store,
                outbound,
                calls: Mutex::new(Vec::new()),
                accepts_events: false,
                accepts_text: false,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }
    }

    #[async_trait]
    impl ServiceProvider for FakeProvider {
        fn key(&self) -> &str {
            &self.key
        }

        fn display_name(&self) -> &str {
            &self.key
        }

        fn entry_keywords(&self) -> Vec<String> {
            self.keywords.clone()
        }

        async fn on_enter(&self, user_id: &str) -> Result<(), ProviderError> {
            self.record(format!("enter:{}", user_id));
            Ok(())
        }

        async fn handle_text(&self, user_id: &str, text: &str) -> Result<bool, ProviderError> {
            self.record(format!("text:{}:{}", user_id, text));
            if text == "boom" {
                return Err(ProviderError::Backend("backend down".to_string()));
            }
            Ok(self.accepts_text)
        }

        async fn handle_event(&self, user_id: &str, msg: &IncomingMessage) -> Result<bool, ProviderError> {
            self.record(format!("event:{}:{}", user_id, msg.event_key));
            if !self.accepts_events {
                return Ok(false);
            }
            if msg.event_key.starts_with(&format!("{}.action.", self.key)) {
                let mut state = ConversationState::for_service(self.key.clone());
                state.step = Step::AwaitingConfirm;
                state.action = "restart".to_string();
                self.store.set(user_id, state);
                self.outbound.send_card(user_id, confirm_card("Restart", "nginx")).await?;
            }
            Ok(true)
        }

        async fn handle_confirm(&self, user_id: &str) -> Result<bool, ProviderError> {
            self.record(format!("confirm:{}", user_id));
            self.store.clear(user_id);
            self.outbound.send_text(user_id, "done").await?;
            Ok(true)
        }
    }

    #[derive(Default)]
    struct FakeCapabilities {
        updates: Mutex<Vec<(String, String)>>,
        menus: Mutex<Vec<Menu>>,
    }

    #[async_trait]
    impl CardUpdater for FakeCapabilities {
        async fn update_template_card_button(&self, response_code: &str, replace_name: &str) -> Result<(), SendError> {
            self.updates
                .lock()
                .expect("lock")
                .push((response_code.to_string(), replace_name.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl MenuPublisher for FakeCapabilities {
        async fn create_menu(&self, menu: &Menu) -> Result<(), SendError> {
            self.menus.lock().expect("lock").push(menu.clone());
            Ok(())
        }
    }

    struct Harness {
        router: Router,
        sent: Arc<RecordingSender>,
        store: Arc<ConversationStore>,
        docker: Arc<FakeProvider>,
        pve: Arc<FakeProvider>,
        caps: Arc<FakeCapabilities>,
    }

    fn harness_with(mode: CardMode, capabilities: bool) -> Harness {
        let sent = Arc::new(RecordingSender::default());
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        let presenter = Arc::new(TemplateCardSender::new(sent.clone(), store.clone(), mode));
        let caps = Arc::new(FakeCapabilities::default());
        let mut outbound = Outbound::new(presenter);
        if capabilities {
            outbound = outbound
                .with_card_updater(caps.clone())
                .with_menu_publisher(caps.clone());
        }

        let docker = FakeProvider::new("docker", &["Docker", "容器", "help"], store.clone(), outbound.clone());
        let pve = FakeProvider::new("pve", &["pve", "docker"], store.clone(), outbound.clone());
        let router = Router::new(RouterDeps {
            outbound,
            store: store.clone(),
            allowed_user_ids: vec!["u1".to_string()],
            providers: vec![pve.clone() as Arc<dyn ServiceProvider>, docker.clone()],
        });
        Harness {
            router,
            sent,
            store,
            docker,
            pve,
            caps,
        }
    }

    fn harness() -> Harness {
        harness_with(CardMode::TemplateCard, true)
    }

    fn text(user: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            from_user_name: user.to_string(),
            msg_type: "text".to_string(),
            content: content.to_string(),
            msg_id: "m1".to_string(),
            ..Default::default()
        }
    }

    fn event(user: &str, key: &str) -> IncomingMessage {
        IncomingMessage::card_event(user, key)
    }

    #[tokio::test]
    async fn unauthorized_sender_gets_one_reply_and_no_dispatch() {
        let h = harness();
        for msg in [text("mallory", "docker"), event("mallory", "docker.action.restart"), text("mallory", "confirm")] {
            h.router.handle_message(&msg).await.expect("handled");
        }
        assert_eq!(h.sent.texts(), vec![REPLY_NOT_AUTHORIZED.to_string(); 3]);
        assert!(h.docker.calls().is_empty());
        assert!(h.pve.calls().is_empty());
        assert!(h.store.get("mallory").is_none());
    }

    #[tokio::test]
    async fn unauthorized_reply_bypasses_presentation() {
        let presented = Arc::new(RecordingSender::default());
        let raw = Arc::new(RecordingSender::default());
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        let presenter = Arc::new(TemplateCardSender::new(presented.clone(), store.clone(), CardMode::Text));
        let router = Router::new(RouterDeps {
            outbound: Outbound::new(presenter).with_raw_sender(raw.clone()),
            store: store.clone(),
            allowed_user_ids: vec!["u1".to_string()],
            providers: Vec::new(),
        });

        router.handle_message(&text("mallory", "menu")).await.expect("handled");
        assert_eq!(raw.texts(), vec![REPLY_NOT_AUTHORIZED.to_string()]);
        assert!(presented.take().is_empty());

        router.handle_message(&text("u1", "what")).await.expect("handled");
        assert_eq!(presented.texts(), vec![REPLY_DEFAULT.to_string()]);
        assert_eq!(raw.texts().len(), 1);
    }

    #[tokio::test]
    async fn empty_sender_and_empty_text_are_ignored() {
        let h = harness();
        h.router.handle_message(&text("", "menu")).await.expect("empty user");
        h.router.handle_message(&text("u1", "   ")).await.expect("empty text");
        assert!(h.sent.take().is_empty());
    }

    #[tokio::test]
    async fn ping_answers_without_routing() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        h.router.handle_message(&text("u1", " PING ")).await.expect("ping");
        let texts = h.sent.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("pong\nserver_time: "));
        assert!(texts[0].contains("from: u1"));
        assert!(texts[0].contains("msg_id: m1"));
        assert!(h.docker.calls().is_empty());
    }

    #[tokio::test]
    async fn keyword_enters_provider_and_clears_prior_state() {
        let h = harness();
        let mut stale = ConversationState::for_service("docker");
        stale.step = Step::AwaitingConfirm;
        h.store.set("u1", stale);

        h.router.handle_message(&text("u1", "  PVE ")).await.expect("keyword");
        assert_eq!(h.pve.calls(), vec!["enter:u1".to_string()]);
        assert!(h.docker.calls().is_empty());

        let state = h.store.get("u1").expect("state");
        assert_eq!(state.service_key, "pve");
        assert_eq!(state.step, Step::Idle);
    }

    #[tokio::test]
    async fn colliding_keywords_are_skipped() {
        let h = harness();
        // "docker" was claimed by pve first; "help" is built in.
        h.router.handle_message(&text("u1", "docker")).await.expect("keyword");
        assert_eq!(h.pve.calls(), vec!["enter:u1".to_string()]);

        h.router.handle_message(&text("u1", "容器")).await.expect("keyword");
        assert_eq!(h.docker.calls(), vec!["enter:u1".to_string()]);

        h.sent.take();
        h.router.handle_message(&text("u1", "help")).await.expect("help");
        let texts = h.sent.texts();
        assert!(texts[0].starts_with("Commands:"));
        assert!(texts[0].contains("- docker: 容器"));
        assert!(texts[0].contains("- pve: docker, pve"));
    }

    #[tokio::test]
    async fn menu_lists_providers_sorted_by_key() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("pve"));
        h.router.handle_message(&text("u1", "menu")).await.expect("menu");

        let sent = h.sent.take();
        let [Sent::Card(user, card)] = sent.as_slice() else {
            panic!("expected one card, got {:?}", sent);
        };
        assert_eq!(user, "u1");
        let keys: Vec<&str> = card.button_list.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["svc.select.docker", "svc.select.pve"]);
        assert!(h.store.get("u1").is_none());
    }

    #[tokio::test]
    async fn confirm_resolves_only_against_owning_provider() {
        let h = harness();
        let mut state = ConversationState::for_service("docker");
        state.step = Step::AwaitingConfirm;
        h.store.set("u1", state);

        h.router.handle_message(&text("u1", "Confirm")).await.expect("confirm");
        assert_eq!(h.docker.calls(), vec!["confirm:u1".to_string()]);
        assert!(h.pve.calls().is_empty());
        assert_eq!(h.sent.texts(), vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn confirm_event_updates_card() {
        let h = harness();
        h.router
            .handle_message(&event("u1", "docker.action.restart"))
            .await
            .expect("action");
        assert!(h.store.get("u1").expect("state").awaiting_confirm());

        let mut confirm = event("u1", EVENT_KEY_CONFIRM);
        confirm.response_code = "RC1".to_string();
        h.router.handle_message(&confirm).await.expect("confirm");

        assert_eq!(
            h.docker.calls(),
            vec!["event:u1:docker.action.restart".to_string(), "confirm:u1".to_string()]
        );
        assert_eq!(
            h.caps.updates.lock().expect("lock").clone(),
            vec![("RC1".to_string(), CARD_CONFIRMED.to_string())]
        );
    }

    #[tokio::test]
    async fn confirm_without_pending_state_expires() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        h.router.handle_message(&event("u1", EVENT_KEY_CONFIRM)).await.expect("event");
        h.router.handle_message(&text("u2", "confirm")).await.expect("other user");
        h.store.clear("u1");
        h.router.handle_message(&text("u1", "yes")).await.expect("text");
        assert!(h.docker.calls().is_empty());
        assert_eq!(
            h.sent.texts(),
            vec![
                REPLY_SESSION_EXPIRED.to_string(),
                REPLY_NOT_AUTHORIZED.to_string(),
                REPLY_SESSION_EXPIRED.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn yes_and_no_reach_provider_awaiting_input() {
        let h = harness();
        let mut state = ConversationState::for_service("docker");
        state.step = Step::AwaitingInput;
        h.store.set("u1", state);

        h.router.handle_message(&text("u1", "yes")).await.expect("yes");
        h.router.handle_message(&text("u1", "no")).await.expect("no");

        assert_eq!(
            h.docker.calls(),
            vec!["text:u1:yes".to_string(), "text:u1:no".to_string()]
        );
        assert!(h.sent.take().is_empty());
        let state = h.store.get("u1").expect("state kept");
        assert_eq!(state.step, Step::AwaitingInput);
        assert_eq!(state.service_key, "docker");
    }

    #[tokio::test]
    async fn declined_yes_and_no_fall_back_to_builtins() {
        let sent = Arc::new(RecordingSender::default());
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        let outbound = Outbound::new(sent.clone());
        let picky = FakeProvider::declining("picky", store.clone(), outbound.clone());
        let router = Router::new(RouterDeps {
            outbound,
            store: store.clone(),
            allowed_user_ids: vec!["u1".to_string()],
            providers: vec![picky.clone() as Arc<dyn ServiceProvider>],
        });

        store.set("u1", ConversationState::for_service("picky"));
        router.handle_message(&text("u1", "confirm")).await.expect("confirm");
        assert!(store.get("u1").is_some());

        router.handle_message(&text("u1", "cancel")).await.expect("cancel");
        assert!(store.get("u1").is_none());

        assert_eq!(
            picky.calls(),
            vec!["text:u1:confirm".to_string(), "text:u1:cancel".to_string()]
        );
        assert_eq!(
            sent.texts(),
            vec![REPLY_SESSION_EXPIRED.to_string(), REPLY_CANCELLED.to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_clears_state_and_acknowledges() {
        let h = harness();
        let mut state = ConversationState::for_service("docker");
        state.step = Step::AwaitingConfirm;
        h.store.set("u1", state);

        let mut cancel = event("u1", EVENT_KEY_CANCEL);
        cancel.response_code = "RC2".to_string();
        h.router.handle_message(&cancel).await.expect("cancel");

        assert!(h.store.get("u1").is_none());
        assert_eq!(h.sent.texts(), vec![REPLY_CANCELLED.to_string()]);
        assert!(h.docker.calls().is_empty());
        assert_eq!(
            h.caps.updates.lock().expect("lock").clone(),
            vec![("RC2".to_string(), CARD_CANCELLED.to_string())]
        );

        let mut state = ConversationState::for_service("docker");
        state.step = Step::AwaitingConfirm;
        h.store.set("u1", state);
        h.router.handle_message(&text("u1", "取消")).await.expect("cancel text");
        assert!(h.store.get("u1").is_none());
        assert!(h.docker.calls().is_empty());
    }

    #[tokio::test]
    async fn unregistered_namespace_is_unavailable() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        h.router.handle_message(&event("u1", "B.actionX")).await.expect("event");
        assert_eq!(h.sent.texts(), vec!["service unavailable: B".to_string()]);
        assert!(h.docker.calls().is_empty());
        assert!(h.pve.calls().is_empty());
    }

    #[tokio::test]
    async fn dotless_event_goes_to_active_session() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        h.router.handle_message(&event("u1", "refresh")).await.expect("event");
        assert_eq!(h.docker.calls(), vec!["event:u1:refresh".to_string()]);
        assert!(h.sent.take().is_empty());

        h.store.clear("u1");
        h.router.handle_message(&event("u1", "refresh")).await.expect("event");
        assert_eq!(h.sent.texts(), vec![REPLY_DEFAULT.to_string()]);
        assert!(h.pve.calls().is_empty());
    }

    #[tokio::test]
    async fn namespaced_event_reaches_provider_regardless_of_session() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("pve"));
        h.router.handle_message(&event("u1", "docker.view.logs")).await.expect("event");
        assert_eq!(h.docker.calls(), vec!["event:u1:docker.view.logs".to_string()]);
        assert!(h.pve.calls().is_empty());
    }

    #[tokio::test]
    async fn declined_namespaced_event_falls_back_to_session() {
        let sent = Arc::new(RecordingSender::default());
        let store = Arc::new(ConversationStore::new(Duration::from_secs(60)));
        let outbound = Outbound::new(sent.clone());
        let picky = FakeProvider::declining("picky", store.clone(), outbound.clone());
        let docker = FakeProvider::new("docker", &[], store.clone(), outbound.clone());
        let router = Router::new(RouterDeps {
            outbound,
            store: store.clone(),
            allowed_user_ids: vec!["u1".to_string()],
            providers: vec![picky.clone() as Arc<dyn ServiceProvider>, docker.clone()],
        });

        store.set("u1", ConversationState::for_service("docker"));
        router.handle_message(&event("u1", "picky.other")).await.expect("event");
        assert_eq!(picky.calls(), vec!["event:u1:picky.other".to_string()]);
        assert_eq!(docker.calls(), vec!["event:u1:picky.other".to_string()]);
        assert!(sent.take().is_empty());
    }

    #[tokio::test]
    async fn service_select_enters_provider() {
        let h = harness();
        h.router.handle_message(&event("u1", "svc.select.pve")).await.expect("select");
        assert_eq!(h.pve.calls(), vec!["enter:u1".to_string()]);
        assert_eq!(h.store.get("u1").expect("state").service_key, "pve");

        h.router.handle_message(&event("u1", "svc.select.nas")).await.expect("select");
        assert_eq!(h.sent.texts(), vec!["service unavailable: nas".to_string()]);
    }

    #[tokio::test]
    async fn active_session_receives_free_text() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        h.router.handle_message(&text("u1", "nginx")).await.expect("text");
        assert_eq!(h.docker.calls(), vec!["text:u1:nginx".to_string()]);
        assert!(h.sent.take().is_empty());
    }

    #[tokio::test]
    async fn provider_error_is_returned() {
        let h = harness();
        h.store.set("u1", ConversationState::for_service("docker"));
        let err = h.router.handle_message(&text("u1", "boom")).await.expect_err("provider error");
        assert!(matches!(err, RouterError::Provider { ref provider, .. } if provider == "docker"));
    }

    #[tokio::test]
    async fn default_reply_without_session() {
        let h = harness();
        h.router.handle_message(&text("u1", "what")).await.expect("text");
        assert_eq!(h.sent.texts(), vec![REPLY_DEFAULT.to_string()]);
    }

    #[tokio::test]
    async fn unsupported_type_and_keyless_events() {
        let h = harness();
        let mut image = text("u1", "");
        image.msg_type = "image".to_string();
        h.router.handle_message(&image).await.expect("image");

        let mut location = event("u1", "");
        location.event = "LOCATION".to_string();
        h.router.handle_message(&location).await.expect("location");

        assert_eq!(h.sent.texts(), vec![REPLY_UNSUPPORTED_TYPE.to_string()]);
    }

    #[tokio::test]
    async fn enter_agent_shows_menu() {
        let h = harness();
        let mut enter = event("u1", "");
        enter.event = EVENT_ENTER_AGENT.to_string();
        h.router.handle_message(&enter).await.expect("enter_agent");
        assert!(matches!(h.sent.take().as_slice(), [Sent::Card(..)]));
    }

    #[tokio::test]
    async fn numbered_reply_replays_button() {
        let h = harness_with(CardMode::Text, true);
        h.router.handle_message(&text("u1", "menu")).await.expect("menu");
        let texts = h.sent.texts();
        assert!(texts[0].contains("1. docker"));
        assert!(texts[0].contains("2. pve"));

        h.router.handle_message(&text("u1", "9")).await.expect("out of range");
        assert_eq!(h.sent.texts().last().expect("hint"), "Please reply with a number between 1 and 2.");
        // The hint is an outbound text, so the list is gone now.
        assert!(h.store.get("u1").expect("state").pending_buttons.is_empty());

        h.router.handle_message(&text("u1", "menu")).await.expect("menu");
        h.router.handle_message(&text("u1", "2")).await.expect("choice");
        assert_eq!(h.pve.calls(), vec!["enter:u1".to_string()]);
        assert_eq!(h.store.get("u1").expect("state").service_key, "pve");
    }

    #[tokio::test]
    async fn numbered_confirm_in_text_mode() {
        let h = harness_with(CardMode::Text, true);
        h.router
            .handle_message(&event("u1", "docker.action.restart"))
            .await
            .expect("action");
        h.router.handle_message(&text("u1", "1")).await.expect("confirm");
        assert_eq!(
            h.docker.calls(),
            vec!["event:u1:docker.action.restart".to_string(), "confirm:u1".to_string()]
        );
    }

    #[tokio::test]
    async fn sync_menu_uses_publisher_when_available() {
        let h = harness();
        h.router.handle_message(&text("u1", "sync menu")).await.expect("sync");
        let menus = h.caps.menus.lock().expect("lock").clone();
        assert_eq!(menus.len(), 1);
        assert_eq!(menus[0].buttons[1].sub_buttons.len(), 2);
        assert_eq!(h.sent.texts(), vec!["Application menu synced.".to_string()]);

        let bare = harness_with(CardMode::TemplateCard, false);
        bare.router.handle_message(&text("u1", "同步菜单")).await.expect("sync");
        assert_eq!(bare.sent.texts(), vec![REPLY_MENU_SYNC_UNSUPPORTED.to_string()]);
        assert!(matches!(bare.router.publish_menu().await, Err(RouterError::MenuUnsupported)));
    }

    #[tokio::test]
    async fn card_update_skipped_without_capability() {
        let h = harness_with(CardMode::TemplateCard, false);
        let mut cancel = event("u1", EVENT_KEY_CANCEL);
        cancel.response_code = "RC".to_string();
        h.router.handle_message(&cancel).await.expect("cancel");
        assert_eq!(h.sent.texts(), vec![REPLY_CANCELLED.to_string()]);
        assert!(h.caps.updates.lock().expect("lock").is_empty());
    }
}

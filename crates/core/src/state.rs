use crate::sweep::Sweeper;
use homeops_wecom::MenuChoice;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 60);

/// Where a user is inside a flow. The router only ever branches on
/// `AwaitingConfirm`; every other value belongs to the owning provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Step {
    #[default]
    Idle,
    AwaitingInput,
    AwaitingConfirm,
    Custom(String),
}

/// Provider-private scratch data, tagged with the provider key that wrote it.
#[derive(Debug, Clone, PartialEq)]
struct ProviderPayload {
    owner: String,
    data: Value,
}

/// Per-user dialogue record.
///
/// An empty `service_key` means the router owns the record. Otherwise
/// `step`, `action` and the payload are interpreted by that provider alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub step: Step,
    pub service_key: String,
    pub action: String,
    pub pending_buttons: Vec<MenuChoice>,
    payload: Option<ProviderPayload>,
    expires_at: Option<Instant>,
}

impl ConversationState {
    pub fn for_service(service_key: impl Into<String>) -> Self {
        Self {
            service_key: service_key.into(),
            ..Default::default()
        }
    }

    pub fn has_owner(&self) -> bool {
        !self.service_key.is_empty()
    }

    pub fn is_owned_by(&self, service_key: &str) -> bool {
        !service_key.is_empty() && self.service_key == service_key
    }

    pub fn awaiting_confirm(&self) -> bool {
        self.step == Step::AwaitingConfirm
    }

    /// Stores provider scratch data. Replaces whatever another owner left.
    pub fn set_payload<T: Serialize>(&mut self, owner: &str, value: &T) -> Result<(), serde_json::Error> {
        self.payload = Some(ProviderPayload {
            owner: owner.to_string(),
            data: serde_json::to_value(value)?,
        });
        Ok(())
    }

    /// Scratch data written by `owner`, if any. Another provider's payload
    /// is never visible.
    pub fn payload<T: DeserializeOwned>(&self, owner: &str) -> Option<T> {
        let payload = self.payload.as_ref().filter(|p| p.owner == owner)?;
        serde_json::from_value(payload.data.clone()).ok()
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    fn expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

type StateMap = HashMap<String, ConversationState>;

fn lock_map(map: &Mutex<StateMap>) -> MutexGuard<'_, StateMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TTL-bounded per-user conversation records with a sliding expiry.
pub struct ConversationStore {
    ttl: Duration,
    entries: Arc<Mutex<StateMap>>,
    sweeper: Sweeper,
}

impl ConversationStore {
    /// A zero TTL falls back to [`DEFAULT_STATE_TTL`].
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_STATE_TTL } else { ttl };
        let entries: Arc<Mutex<StateMap>> = Arc::new(Mutex::new(HashMap::new()));

        let swept = entries.clone();
        let sweeper = Sweeper::spawn("conversation_state", ttl, move || {
            let now = Instant::now();
            let mut map = lock_map(&swept);
            let before = map.len();
            map.retain(|_, state| !state.expired_at(now));
            before - map.len()
        });

        Self { ttl, entries, sweeper }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expired entries are removed and reported as absent.
    pub fn get(&self, user_id: &str) -> Option<ConversationState> {
        let mut map = lock_map(&self.entries);
        match map.get(user_id) {
            Some(state) if state.expired_at(Instant::now()) => {
                map.remove(user_id);
                None
            }
            Some(state) => Some(state.clone()),
            None => None,
        }
    }

    /// Every write pushes the expiry forward by the full TTL.
    pub fn set(&self, user_id: &str, mut state: ConversationState) {
        state.expires_at = Some(Instant::now() + self.ttl);
        lock_map(&self.entries).insert(user_id.to_string(), state);
    }

    pub fn clear(&self, user_id: &str) {
        lock_map(&self.entries).remove(user_id);
    }

    pub fn len(&self) -> usize {
        lock_map(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the background sweep. Idempotent.
    pub fn close(&self) {
        self.sweeper.stop();
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        self.close();
    }
}

use crate::sweep::Sweeper;
use homeops_wecom::IncomingMessage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(10 * 60);

type ExpiryMap = HashMap<String, Instant>;

fn lock_map(map: &Mutex<ExpiryMap>) -> MutexGuard<'_, ExpiryMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of a delivery for replay suppression.
///
/// Platform ids are stable across retries while timestamp and nonce are not,
/// so they win over the content hash.
pub fn dedupe_key(msg: &IncomingMessage, plaintext: &[u8]) -> String {
    let user = msg.user_id();
    let task_id = msg.task_id.trim();
    if !task_id.is_empty() {
        return format!("task:{}:{}", user, task_id);
    }
    let msg_id = msg.msg_id.trim();
    if !msg_id.is_empty() {
        return format!("msg:{}:{}", user, msg_id);
    }

    let digest = Sha256::digest(plaintext);
    let mut key = String::with_capacity(7 + digest.len() * 2);
    key.push_str("sha256:");
    for b in digest.iter() {
        let _ = write!(key, "{:02x}", b);
    }
    key
}

/// Write-once TTL cache of processed delivery keys.
pub struct Deduper {
    ttl: Duration,
    entries: Arc<Mutex<ExpiryMap>>,
    sweeper: Sweeper,
}

impl Deduper {
    /// A zero TTL falls back to [`DEFAULT_DEDUPE_TTL`].
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_DEDUPE_TTL } else { ttl };
        let entries: Arc<Mutex<ExpiryMap>> = Arc::new(Mutex::new(HashMap::new()));

        let swept = entries.clone();
        let sweeper = Sweeper::spawn("dedupe", ttl, move || {
            let now = Instant::now();
            let mut map = lock_map(&swept);
            let before = map.len();
            map.retain(|_, exp| now < *exp);
            before - map.len()
        });

        Self { ttl, entries, sweeper }
    }

    /// `true` if `key` was already marked within its TTL. Otherwise marks it
    /// and returns `false`. Empty keys are never considered duplicates.
    pub fn seen_or_mark(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut map = lock_map(&self.entries);
        if map.get(key).is_some_and(|exp| now < *exp) {
            return true;
        }
        map.insert(key.to_string(), now + self.ttl);
        false
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

impl Drop for Deduper {
    fn drop(&mut self) {
        self.close();
    }
}

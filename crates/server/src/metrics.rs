use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge,
    BadRequest,
    BadSignature,
    DecryptFailed,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RejectedSnapshot {
    pub too_large: u64,
    pub bad_request: u64,
    pub bad_signature: u64,
    pub decrypt_failed: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub verifications: u64,
    pub rejected: RejectedSnapshot,
    pub handler_errors: u64,
}

/// Callback counters exposed on the monitor endpoint.
#[derive(Debug)]
pub struct CallbackMetrics {
    start_time: Instant,
    received: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    verifications: AtomicU64,
    rejected_too_large: AtomicU64,
    rejected_bad_request: AtomicU64,
    rejected_bad_signature: AtomicU64,
    rejected_decrypt_failed: AtomicU64,
    handler_errors: AtomicU64,
}

impl CallbackMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            received: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            verifications: AtomicU64::new(0),
            rejected_too_large: AtomicU64::new(0),
            rejected_bad_request: AtomicU64::new(0),
            rejected_bad_signature: AtomicU64::new(0),
            rejected_decrypt_failed: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        })
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_verifications(&self) {
        self.verifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::TooLarge => &self.rejected_too_large,
            RejectReason::BadRequest => &self.rejected_bad_request,
            RejectReason::BadSignature => &self.rejected_bad_signature,
            RejectReason::DecryptFailed => &self.rejected_decrypt_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            verifications: self.verifications.load(Ordering::Relaxed),
            rejected: RejectedSnapshot {
                too_large: self.rejected_too_large.load(Ordering::Relaxed),
                bad_request: self.rejected_bad_request.load(Ordering::Relaxed),
                bad_signature: self.rejected_bad_signature.load(Ordering::Relaxed),
                decrypt_failed: self.rejected_decrypt_failed.load(Ordering::Relaxed),
            },
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

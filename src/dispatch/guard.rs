//! Staleness check run before any handler work.

use std::time::{Duration, SystemTime};

use crate::dispatch::envelope::RequestEnvelope;

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutGuard {
    max_age: Option<Duration>,
}

impl TimeoutGuard {
    /// A zero age disables the guard.
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            max_age: (max_age_ms > 0).then(|| Duration::from_millis(max_age_ms)),
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn is_stale(&self, envelope: &RequestEnvelope) -> bool {
        self.is_stale_at(envelope.created_at, SystemTime::now())
    }

    /// A creation time in the future is never stale.
    pub fn is_stale_at(&self, created_at: SystemTime, now: SystemTime) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        now.duration_since(created_at)
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

//! Provider status with a freshness window
//!
//! A probed status is reused until it is older than the TTL, so repeated
//! availability checks do not hit the network.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How long a probed status stays fresh
pub const STATUS_TTL: Duration = Duration::from_secs(300);

/// Upper bound on a single availability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of an availability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Whether the provider answered the probe
    pub available: bool,
    /// Why the probe failed
    pub error: Option<String>,
    /// When the probe ran
    pub last_checked: DateTime<Utc>,
    /// How long the probe took
    pub response_time: Option<Duration>,
}

impl ProviderStatus {
    pub fn available(response_time: Duration) -> Self {
        Self {
            available: true,
            error: None,
            last_checked: Utc::now(),
            response_time: Some(response_time),
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(error.into()),
            last_checked: Utc::now(),
            response_time: None,
        }
    }
}

/// Single-slot status cache owned by one provider
#[derive(Debug)]
pub struct StatusCache {
    entry: Option<(ProviderStatus, Instant)>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    /// Cached status, if still fresh
    pub fn get(&self) -> Option<ProviderStatus> {
        self.entry
            .as_ref()
            .filter(|(_, checked_at)| checked_at.elapsed() < self.ttl)
            .map(|(status, _)| status.clone())
    }

    /// Store a freshly probed status
    pub fn set(&mut self, status: ProviderStatus) {
        self.entry = Some((status, Instant::now()));
    }

    /// Force the next lookup to re-probe
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(STATUS_TTL)
    }
}

//! Per-provider usage accounting

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cumulative usage of one provider
///
/// Totals only grow between resets. The average response time is updated
/// incrementally and the error rate is derived from an explicit error
/// counter on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Requests that completed or failed
    pub total_requests: u64,
    /// Requests that failed
    pub total_errors: u64,
    /// Tokens consumed
    pub total_tokens: u64,
    /// Cost in the provider's billing currency
    pub total_cost: f64,
    /// Running mean response time in milliseconds
    pub average_response_time_ms: f64,
}

impl UsageStats {
    /// Fold one settled call into the totals
    pub fn record(&mut self, tokens: u64, cost: f64, response_time: Duration, is_error: bool) {
        let previous = self.total_requests as f64;
        self.total_requests += 1;
        self.total_tokens += tokens;
        self.total_cost += cost;
        self.average_response_time_ms = (self.average_response_time_ms * previous
            + response_time.as_secs_f64() * 1000.0)
            / self.total_requests as f64;
        if is_error {
            self.total_errors += 1;
        }
    }

    /// Fraction of requests that failed
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_requests as f64
        }
    }

    /// Merge another provider's stats, for aggregate views
    pub fn combine(&self, other: &UsageStats) -> UsageStats {
        let total_requests = self.total_requests + other.total_requests;
        let average_response_time_ms = if total_requests == 0 {
            0.0
        } else {
            (self.average_response_time_ms * self.total_requests as f64
                + other.average_response_time_ms * other.total_requests as f64)
                / total_requests as f64
        };
        UsageStats {
            total_requests,
            total_errors: self.total_errors + other.total_errors,
            total_tokens: self.total_tokens + other.total_tokens,
            total_cost: self.total_cost + other.total_cost,
            average_response_time_ms,
        }
    }
}

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config_parser::{FailPolicy, QuotaConfig};
use crate::usage::{next_utc_midnight, GatewayMetrics, UsageStore};

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    Allow {
        remaining_requests: u32,
    },
    Deny {
        reason: String,
        reset_time: DateTime<Utc>,
        remaining_requests: u32,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow { .. })
    }
}

/// Decides whether a user may make another AI-backed request today.
///
/// The caller is responsible for authentication; the user id is trusted as
/// given. The check and the subsequent tracking write are not transactional,
/// so two concurrent requests can both pass before either lands — an accepted
/// looseness. The counter update itself is atomic in the store.
pub struct QuotaChecker {
    store: Arc<UsageStore>,
    config: QuotaConfig,
    metrics: Arc<GatewayMetrics>,
}

impl QuotaChecker {
    pub fn new(store: Arc<UsageStore>, config: QuotaConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.config.daily_limit
    }

    pub async fn check_usage_limits(&self, user_id: &str) -> QuotaDecision {
        match self
            .store
            .read_summary(user_id, self.config.daily_limit)
            .await
        {
            Ok(Some(summary)) => {
                // read_summary already zeroed a stale daily bucket
                if summary.daily.requests >= self.config.daily_limit {
                    debug!(
                        user_id,
                        requests = summary.daily.requests,
                        limit = self.config.daily_limit,
                        "Daily quota exhausted"
                    );
                    self.metrics.record_denied();
                    QuotaDecision::Deny {
                        reason: format!(
                            "Daily limit of {} requests reached",
                            self.config.daily_limit
                        ),
                        reset_time: summary.next_reset,
                        remaining_requests: 0,
                    }
                } else {
                    self.metrics.record_allowed();
                    QuotaDecision::Allow {
                        remaining_requests: summary.remaining_requests(),
                    }
                }
            }
            // No summary yet: first request of the day for a new user
            Ok(None) => {
                self.metrics.record_allowed();
                QuotaDecision::Allow {
                    remaining_requests: self.config.daily_limit,
                }
            }
            Err(e) => {
                self.metrics.record_store_error();
                match self.config.fail_policy {
                    FailPolicy::FailOpen => {
                        warn!("Usage store unavailable, allowing request (fail-open): {e}");
                        self.metrics.record_allowed();
                        QuotaDecision::Allow {
                            remaining_requests: self.config.daily_limit,
                        }
                    }
                    FailPolicy::FailClosed => {
                        warn!("Usage store unavailable, denying request (fail-closed): {e}");
                        self.metrics.record_denied();
                        QuotaDecision::Deny {
                            reason: "Unable to verify usage limits".to_string(),
                            reset_time: next_utc_midnight(),
                            remaining_requests: 0,
                        }
                    }
                }
            }
        }
    }
}

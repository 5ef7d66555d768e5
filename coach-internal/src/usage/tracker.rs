use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config_parser::{AiConfig, QuotaConfig};
use crate::error::Error;
use crate::usage::{GatewayMetrics, InsightMethod, UsageRecord, UsageStore};

/// Everything the tracker needs to account for one call attempt. Built by the
/// endpoint handlers on every exit path.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub user_id: String,
    pub endpoint: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub cache_hit: bool,
    pub method: InsightMethod,
    pub user_agent: Option<String>,
    pub forwarded_for: Option<String>,
    pub request_id: Option<String>,
}

/// Appends usage records and applies the atomic per-user summary increment.
///
/// Record write strictly precedes the summary update: if the record write
/// fails, the summary is untouched (no drift); if the summary update fails
/// after a successful record write, the undercount is tolerated until the
/// next read recomputes state.
pub struct UsageTracker {
    store: Arc<UsageStore>,
    quota: QuotaConfig,
    ai: AiConfig,
    metrics: Arc<GatewayMetrics>,
}

impl UsageTracker {
    pub fn new(
        store: Arc<UsageStore>,
        quota: QuotaConfig,
        ai: AiConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            store,
            quota,
            ai,
            metrics,
        }
    }

    /// Create exactly one usage record for this call attempt and update the
    /// summary. Repeated calls with the same `request_id` create separate
    /// records; the audit trail is append-only.
    pub async fn record(&self, usage: NewUsage) -> Result<Uuid, Error> {
        let model = self.ai.model.clone();
        let cost = self
            .ai
            .cost_for(&model, usage.input_tokens, usage.output_tokens);
        let record = UsageRecord {
            id: Uuid::now_v7(),
            user_id: usage.user_id.clone(),
            endpoint: usage.endpoint,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration_ms: usage.duration_ms,
            success: usage.success,
            error_message: usage.error_message,
            cache_hit: usage.cache_hit,
            method: usage.method,
            cost,
            user_agent: usage.user_agent,
            forwarded_for: usage.forwarded_for,
            request_id: usage.request_id,
            timestamp: Utc::now(),
        };

        self.store.append_record(&record).await?;
        self.metrics.record_written();

        let counted = record.success || self.quota.count_failed_requests;
        if let Err(e) = self.store.apply_usage(&usage.user_id, counted, cost).await {
            // Summary is derived state; a missed increment self-corrects on
            // the next full recompute, so don't fail the request over it.
            warn!("Usage summary update failed after record write: {e}");
        }

        Ok(record.id)
    }

    /// Tracking variant for response paths: failures are logged and counted
    /// but never surfaced to the HTTP caller.
    pub async fn record_best_effort(&self, usage: NewUsage) {
        if let Err(e) = self.record(usage).await {
            self.metrics.record_tracking_failure();
            warn!("Failed to write usage record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_parser::FailPolicy;

    fn new_usage(success: bool, method: InsightMethod) -> NewUsage {
        NewUsage {
            user_id: "user_1".to_string(),
            endpoint: "quick-insight".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 5,
            success,
            error_message: None,
            cache_hit: false,
            method,
            user_agent: Some("test-agent".to_string()),
            forwarded_for: None,
            request_id: Some("req-1".to_string()),
        }
    }

    fn tracker(store: Arc<UsageStore>, count_failed_requests: bool) -> UsageTracker {
        UsageTracker::new(
            store,
            QuotaConfig {
                daily_limit: 10,
                fail_policy: FailPolicy::FailOpen,
                count_failed_requests,
            },
            AiConfig::default(),
            Arc::new(GatewayMetrics::default()),
        )
    }

    #[tokio::test]
    async fn test_success_creates_record_and_counts() {
        let store = Arc::new(UsageStore::new_mock(true));
        let tracker = tracker(store.clone(), false);

        tracker
            .record(new_usage(true, InsightMethod::Template))
            .await
            .unwrap();

        let records = store.as_mock().unwrap().records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 1);
    }

    #[tokio::test]
    async fn test_failed_calls_not_counted_by_default() {
        let store = Arc::new(UsageStore::new_mock(true));
        let tracker = tracker(store.clone(), false);

        tracker
            .record(new_usage(false, InsightMethod::None))
            .await
            .unwrap();

        // Record exists for the audit trail, but the quota counter is untouched
        assert_eq!(store.as_mock().unwrap().records().len(), 1);
        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 0);
    }

    #[tokio::test]
    async fn test_failed_calls_counted_when_policy_enabled() {
        let store = Arc::new(UsageStore::new_mock(true));
        let tracker = tracker(store.clone(), true);

        tracker
            .record(new_usage(false, InsightMethod::None))
            .await
            .unwrap();

        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 1);
    }

    #[tokio::test]
    async fn test_record_write_failure_leaves_summary_untouched() {
        let store = Arc::new(UsageStore::new_mock(true));
        let tracker = tracker(store.clone(), false);

        store.as_mock().unwrap().set_healthy(false);
        assert!(tracker
            .record(new_usage(true, InsightMethod::Template))
            .await
            .is_err());

        store.as_mock().unwrap().set_healthy(true);
        assert!(store.as_mock().unwrap().records().is_empty());
        assert!(store.read_summary("user_1", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cost_computed_from_tokens() {
        let store = Arc::new(UsageStore::new_mock(true));
        let tracker = tracker(store.clone(), false);

        let mut usage = new_usage(true, InsightMethod::Ai);
        usage.input_tokens = 1_000_000;
        usage.output_tokens = 1_000_000;
        tracker.record(usage).await.unwrap();

        let records = store.as_mock().unwrap().records();
        // Default pricing: $1/M input + $5/M output
        assert!((records[0].cost - 6.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let store = Arc::new(UsageStore::new_mock(false));
        let tracker = tracker(store, false);
        // Must not panic or propagate
        tracker
            .record_best_effort(new_usage(true, InsightMethod::Template))
            .await;
    }
}

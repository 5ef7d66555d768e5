use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub mod limiter;
pub mod store;
pub mod tracker;

pub use limiter::{QuotaChecker, QuotaDecision};
pub use store::UsageStore;
pub use tracker::{NewUsage, UsageTracker};

/// How an insight was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightMethod {
    Template,
    Fallback,
    Ai,
    /// No insight was produced (validation failures, rate limits).
    None,
}

impl InsightMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightMethod::Template => "template",
            InsightMethod::Fallback => "fallback",
            InsightMethod::Ai => "ai",
            InsightMethod::None => "none",
        }
    }
}

/// One immutable log entry per API call attempt. Written once, never updated
/// or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub endpoint: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub cache_hit: bool,
    pub method: InsightMethod,
    pub cost: f64,
    pub user_agent: Option<String>,
    pub forwarded_for: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-day request/cost counters inside a summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub requests: u32,
    pub cost: f64,
}

/// Derived per-user rollup of usage records. Not a source of truth: it is
/// recomputed from increments on write and re-zeroed on read when the stored
/// date has rolled over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUsageSummary {
    pub user_id: String,
    pub daily: DailyBucket,
    pub weekly_requests: u64,
    pub monthly_requests: u64,
    pub total_requests: u64,
    pub total_cost: f64,
    pub daily_limit: u32,
    pub next_reset: DateTime<Utc>,
    pub limit_exceeded: bool,
}

impl UserUsageSummary {
    pub fn empty(user_id: &str, daily_limit: u32) -> Self {
        let today = Utc::now().date_naive();
        Self {
            user_id: user_id.to_string(),
            daily: DailyBucket {
                date: today,
                requests: 0,
                cost: 0.0,
            },
            weekly_requests: 0,
            monthly_requests: 0,
            total_requests: 0,
            total_cost: 0.0,
            daily_limit,
            next_reset: next_utc_midnight(),
            limit_exceeded: false,
        }
    }

    /// Zero the daily bucket if its stored date is not today.
    pub fn reset_daily_if_stale(&mut self) {
        let today = Utc::now().date_naive();
        if self.daily.date != today {
            self.daily = DailyBucket {
                date: today,
                requests: 0,
                cost: 0.0,
            };
            self.limit_exceeded = false;
        }
        self.next_reset = next_utc_midnight();
    }

    /// Remaining requests today, always within `[0, daily_limit]`.
    pub fn remaining_requests(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily.requests)
    }
}

/// The next midnight (UTC), when the daily bucket rolls over.
pub fn next_utc_midnight() -> DateTime<Utc> {
    let tomorrow = Utc::now().date_naive() + Days::new(1);
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(naive) => naive.and_utc(),
        // and_hms_opt(0, 0, 0) is always valid for a calendar date
        None => Utc::now(),
    }
}

/// ISO-week identifier (`2026-W05`) used as the weekly rollup key.
pub fn week_key(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{:04}-W{:02}", week.year(), week.week())
}

/// Month identifier (`2026-08`) used as the monthly rollup key.
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Atomic counters mirrored into the Prometheus recorder. Kept as plain
/// atomics as well so the JSON telemetry view can read them back.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
    pub store_errors: AtomicU64,
    pub records_written: AtomicU64,
    pub tracking_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub template_hits: AtomicU64,
    pub fallback_served: AtomicU64,
    pub ai_calls: AtomicU64,
    pub ai_failures: AtomicU64,
}

impl GatewayMetrics {
    pub fn record_allowed(&self) {
        self.requests_allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_quota_requests_allowed_total").increment(1);
    }

    pub fn record_denied(&self) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_quota_requests_denied_total").increment(1);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_usage_store_errors_total").increment(1);
    }

    pub fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_usage_records_written_total").increment(1);
    }

    pub fn record_tracking_failure(&self) {
        self.tracking_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_usage_tracking_failures_total").increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_insight_cache_hits_total").increment(1);
    }

    pub fn record_template_hit(&self) {
        self.template_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_insight_template_hits_total").increment(1);
    }

    pub fn record_fallback(&self) {
        self.fallback_served.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_insight_fallback_total").increment(1);
    }

    pub fn record_ai_call(&self) {
        self.ai_calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_insight_ai_calls_total").increment(1);
    }

    pub fn record_ai_failure(&self) {
        self.ai_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("coach_insight_ai_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "business": {
                "requests_allowed": self.requests_allowed.load(Ordering::Relaxed),
                "requests_denied": self.requests_denied.load(Ordering::Relaxed),
                "usage_records_written": self.records_written.load(Ordering::Relaxed),
            },
            "technical": {
                "usage_store_errors": self.store_errors.load(Ordering::Relaxed),
                "tracking_failures": self.tracking_failures.load(Ordering::Relaxed),
                "ai_failures": self.ai_failures.load(Ordering::Relaxed),
            },
            "ux": {
                "cache_hits": self.cache_hits.load(Ordering::Relaxed),
                "template_hits": self.template_hits.load(Ordering::Relaxed),
                "fallback_served": self.fallback_served.load(Ordering::Relaxed),
                "ai_calls": self.ai_calls.load(Ordering::Relaxed),
            },
        })
    }
}

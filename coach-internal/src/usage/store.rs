use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};

use crate::error::{Error, ErrorDetails};
use crate::usage::{month_key, week_key, DailyBucket, UsageRecord, UserUsageSummary};

/// Where usage records and summaries live.
///
/// `Production` keeps per-user state in Redis; `Mock` is an in-memory stand-in
/// for tests (with a `healthy` switch to simulate an unreachable store);
/// `Disabled` drops everything, which also disables quota enforcement.
pub enum UsageStore {
    Disabled,
    Mock(MockUsageStore),
    Production(RedisUsageStore),
}

impl UsageStore {
    pub fn new_mock(healthy: bool) -> Self {
        UsageStore::Mock(MockUsageStore::new(healthy))
    }

    pub async fn new_production(redis_url: &str) -> Result<Self, Error> {
        Ok(UsageStore::Production(RedisUsageStore::new(redis_url).await?))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, UsageStore::Disabled)
    }

    /// Append one immutable usage record. Must succeed before the summary is
    /// touched; a failed append aborts the whole tracking write.
    pub async fn append_record(&self, record: &UsageRecord) -> Result<(), Error> {
        match self {
            UsageStore::Disabled => Ok(()),
            UsageStore::Mock(mock) => mock.append_record(record),
            UsageStore::Production(redis) => redis.append_record(record).await,
        }
    }

    /// Atomically apply one call's outcome to the per-user summary, resetting
    /// any stale daily/weekly/monthly buckets first. Returns the new daily
    /// request count.
    pub async fn apply_usage(
        &self,
        user_id: &str,
        counted: bool,
        cost: f64,
    ) -> Result<u32, Error> {
        match self {
            UsageStore::Disabled => Ok(0),
            UsageStore::Mock(mock) => mock.apply_usage(user_id, counted, cost),
            UsageStore::Production(redis) => redis.apply_usage(user_id, counted, cost).await,
        }
    }

    /// Load the user's summary, re-zeroing stale buckets in the returned view.
    /// `None` means the user has no usage yet.
    pub async fn read_summary(
        &self,
        user_id: &str,
        daily_limit: u32,
    ) -> Result<Option<UserUsageSummary>, Error> {
        match self {
            UsageStore::Disabled => Ok(None),
            UsageStore::Mock(mock) => mock.read_summary(user_id, daily_limit),
            UsageStore::Production(redis) => redis.read_summary(user_id, daily_limit).await,
        }
    }

    /// Mock-store accessor for tests; `None` for other variants.
    pub fn as_mock(&self) -> Option<&MockUsageStore> {
        match self {
            UsageStore::Mock(mock) => Some(mock),
            _ => None,
        }
    }
}

/// In-memory store used by tests and local development.
pub struct MockUsageStore {
    healthy: AtomicBool,
    records: Mutex<Vec<UsageRecord>>,
    summaries: Mutex<HashMap<String, UserUsageSummary>>,
}

impl MockUsageStore {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            records: Mutex::new(Vec::new()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    fn check_healthy(&self) -> Result<(), Error> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::UsageStore {
                message: "Mock store is unhealthy".to_string(),
            }))
        }
    }

    fn append_record(&self, record: &UsageRecord) -> Result<(), Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut records = self.records.lock().expect("Mutex poisoned");
        records.push(record.clone());
        Ok(())
    }

    fn apply_usage(&self, user_id: &str, counted: bool, cost: f64) -> Result<u32, Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut summaries = self.summaries.lock().expect("Mutex poisoned");
        let summary = summaries
            .entry(user_id.to_string())
            .or_insert_with(|| UserUsageSummary::empty(user_id, 0));
        summary.reset_daily_if_stale();
        if counted {
            summary.daily.requests += 1;
            summary.weekly_requests += 1;
            summary.monthly_requests += 1;
            summary.total_requests += 1;
        }
        summary.daily.cost += cost;
        summary.total_cost += cost;
        Ok(summary.daily.requests)
    }

    fn read_summary(
        &self,
        user_id: &str,
        daily_limit: u32,
    ) -> Result<Option<UserUsageSummary>, Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let summaries = self.summaries.lock().expect("Mutex poisoned");
        Ok(summaries.get(user_id).map(|summary| {
            let mut view = summary.clone();
            view.reset_daily_if_stale();
            view.daily_limit = daily_limit;
            view.limit_exceeded = view.daily.requests >= daily_limit;
            view
        }))
    }

    /// Snapshot of all appended records, oldest first.
    pub fn records(&self) -> Vec<UsageRecord> {
        #[expect(clippy::expect_used)]
        let records = self.records.lock().expect("Mutex poisoned");
        records.clone()
    }

    /// Seed a summary directly, bypassing the increment path. Test helper.
    pub fn insert_summary(&self, summary: UserUsageSummary) {
        #[expect(clippy::expect_used)]
        let mut summaries = self.summaries.lock().expect("Mutex poisoned");
        summaries.insert(summary.user_id.clone(), summary);
    }
}

// Conditional period reset + increment in one round trip, so concurrent
// writers never lose updates (plain read-modify-write would).
const APPLY_USAGE_SCRIPT: &str = r"
local key = KEYS[1]
local today = ARGV[1]
local week = ARGV[2]
local month = ARGV[3]
local inc = tonumber(ARGV[4])
local cost = ARGV[5]
if redis.call('HGET', key, 'date') ~= today then
  redis.call('HSET', key, 'date', today, 'daily_requests', 0, 'daily_cost', 0)
end
if redis.call('HGET', key, 'week') ~= week then
  redis.call('HSET', key, 'week', week, 'weekly_requests', 0)
end
if redis.call('HGET', key, 'month') ~= month then
  redis.call('HSET', key, 'month', month, 'monthly_requests', 0)
end
local daily = redis.call('HINCRBY', key, 'daily_requests', inc)
redis.call('HINCRBY', key, 'weekly_requests', inc)
redis.call('HINCRBY', key, 'monthly_requests', inc)
redis.call('HINCRBY', key, 'total_requests', inc)
redis.call('HINCRBYFLOAT', key, 'daily_cost', cost)
redis.call('HINCRBYFLOAT', key, 'total_cost', cost)
return daily
";

pub struct RedisUsageStore {
    client: redis::Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    apply_usage_script: redis::Script,
    op_timeout: Duration,
}

impl RedisUsageStore {
    pub async fn new(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            Error::new(ErrorDetails::UsageStore {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;

        // Connect eagerly but tolerate failure; ops reconnect on demand.
        let conn = match client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                tracing::info!("Connected to Redis for usage tracking");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!("Failed to connect to Redis for usage tracking: {e}");
                None
            }
        };

        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(conn)),
            apply_usage_script: redis::Script::new(APPLY_USAGE_SCRIPT),
            op_timeout: Duration::from_millis(500),
        })
    }

    fn record_key(user_id: &str) -> String {
        format!("usage_records:{user_id}")
    }

    fn summary_key(user_id: &str) -> String {
        format!("usage_summary:{user_id}")
    }

    async fn conn(&self) -> Result<MultiplexedConnection, Error> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.conn.write().await;
        // Another task may have reconnected while we waited for the lock
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                tracing::info!("Reconnected to Redis for usage tracking");
                *guard = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => Err(Error::new(ErrorDetails::UsageStore {
                message: format!("No Redis connection available: {e}"),
            })),
        }
    }

    async fn drop_conn(&self) {
        *self.conn.write().await = None;
    }

    async fn append_record(&self, record: &UsageRecord) -> Result<(), Error> {
        let payload = serde_json::to_string(record).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize usage record: {e}"),
            })
        })?;
        let mut conn = self.conn().await?;
        let result: Result<Result<(), redis::RedisError>, _> = timeout(
            self.op_timeout,
            conn.rpush(Self::record_key(&record.user_id), payload),
        )
        .await;
        self.unwrap_op(result, "append usage record").await
    }

    async fn apply_usage(&self, user_id: &str, counted: bool, cost: f64) -> Result<u32, Error> {
        let today = Utc::now().date_naive();
        let mut conn = self.conn().await?;
        let invocation_result: Result<Result<i64, redis::RedisError>, _> = timeout(
            self.op_timeout,
            self.apply_usage_script
                .key(Self::summary_key(user_id))
                .arg(today.to_string())
                .arg(week_key(today))
                .arg(month_key(today))
                .arg(i64::from(counted))
                .arg(cost)
                .invoke_async(&mut conn),
        )
        .await;
        let daily = self.unwrap_op(invocation_result, "apply usage increment").await?;
        Ok(u32::try_from(daily).unwrap_or(u32::MAX))
    }

    async fn read_summary(
        &self,
        user_id: &str,
        daily_limit: u32,
    ) -> Result<Option<UserUsageSummary>, Error> {
        let mut conn = self.conn().await?;
        let result: Result<Result<HashMap<String, String>, redis::RedisError>, _> =
            timeout(self.op_timeout, conn.hgetall(Self::summary_key(user_id))).await;
        let fields = self.unwrap_op(result, "read usage summary").await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let stored_date = fields
            .get("date")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut summary = UserUsageSummary {
            user_id: user_id.to_string(),
            daily: DailyBucket {
                date: stored_date,
                requests: parse_field(&fields, "daily_requests"),
                cost: parse_field(&fields, "daily_cost"),
            },
            weekly_requests: parse_field(&fields, "weekly_requests"),
            monthly_requests: parse_field(&fields, "monthly_requests"),
            total_requests: parse_field(&fields, "total_requests"),
            total_cost: parse_field(&fields, "total_cost"),
            daily_limit,
            next_reset: crate::usage::next_utc_midnight(),
            limit_exceeded: false,
        };
        summary.reset_daily_if_stale();
        summary.limit_exceeded = summary.daily.requests >= daily_limit;
        Ok(Some(summary))
    }

    /// Collapse the timeout/Redis error nesting into our error type, dropping
    /// the cached connection so the next op reconnects.
    async fn unwrap_op<T>(
        &self,
        result: Result<Result<T, redis::RedisError>, tokio::time::error::Elapsed>,
        op: &str,
    ) -> Result<T, Error> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.drop_conn().await;
                Err(Error::new(ErrorDetails::UsageStore {
                    message: format!("Redis error during {op}: {e}"),
                }))
            }
            Err(_) => {
                self.drop_conn().await;
                Err(Error::new(ErrorDetails::UsageStore {
                    message: format!("Redis timeout during {op}"),
                }))
            }
        }
    }
}

fn parse_field<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
    fields
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::InsightMethod;
    use chrono::Days;
    use uuid::Uuid;

    fn record(user_id: &str, success: bool) -> UsageRecord {
        UsageRecord {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            endpoint: "quick-insight".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 1,
            success,
            error_message: None,
            cache_hit: false,
            method: InsightMethod::Template,
            cost: 0.0,
            user_agent: None,
            forwarded_for: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mock_append_and_read() {
        let store = UsageStore::new_mock(true);
        store.append_record(&record("user_1", true)).await.unwrap();
        store.apply_usage("user_1", true, 0.0).await.unwrap();

        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 1);
        assert_eq!(summary.total_requests, 1);
        assert!(!summary.limit_exceeded);
        assert_eq!(store.as_mock().unwrap().records().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_unhealthy_errors() {
        let store = UsageStore::new_mock(false);
        assert!(store.append_record(&record("user_1", true)).await.is_err());
        assert!(store.read_summary("user_1", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_uncounted_usage_adds_cost_only() {
        let store = UsageStore::new_mock(true);
        store.apply_usage("user_1", false, 0.25).await.unwrap();

        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 0);
        assert!(summary.daily.cost > 0.0);
    }

    #[tokio::test]
    async fn test_mock_read_resets_stale_daily_bucket() {
        let store = UsageStore::new_mock(true);
        let mut stale = UserUsageSummary::empty("user_1", 10);
        stale.daily.date = Utc::now().date_naive() - Days::new(1);
        stale.daily.requests = 10;
        stale.total_requests = 10;
        store.as_mock().unwrap().insert_summary(stale);

        let summary = store.read_summary("user_1", 10).await.unwrap().unwrap();
        assert_eq!(summary.daily.requests, 0);
        assert_eq!(summary.total_requests, 10);
        assert!(!summary.limit_exceeded);
    }

    #[tokio::test]
    async fn test_disabled_store_is_inert() {
        let store = UsageStore::Disabled;
        assert!(!store.is_enabled());
        store.append_record(&record("user_1", true)).await.unwrap();
        assert!(store.read_summary("user_1", 10).await.unwrap().is_none());
    }
}

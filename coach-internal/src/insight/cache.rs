use moka::future::Cache;
use tokio::time::Duration;

use crate::config_parser::InsightCacheConfig;
use crate::insight::QuickInsightParams;
use crate::usage::InsightMethod;

/// Cache key: normalized habit name plus the discrete inputs. Two requests
/// with the same habit (case-insensitively), streak, and whole-percent
/// completion rate share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InsightCacheKey {
    habit: String,
    streak: u32,
    completion_pct: u32,
}

impl InsightCacheKey {
    fn from_params(params: &QuickInsightParams) -> Self {
        Self {
            habit: params.habit_name.trim().to_lowercase(),
            streak: params.streak,
            completion_pct: params.completion_rate.round() as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedInsight {
    pub insight: String,
    pub method: InsightMethod,
}

/// TTL-bounded cache of previously computed insights, so identical requests
/// inside the TTL cost nothing.
pub struct InsightCache {
    cache: Cache<InsightCacheKey, CachedInsight>,
}

impl InsightCache {
    pub fn new(config: &InsightCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_s))
            .build();
        Self { cache }
    }

    pub async fn get(&self, params: &QuickInsightParams) -> Option<CachedInsight> {
        self.cache.get(&InsightCacheKey::from_params(params)).await
    }

    pub async fn insert(&self, params: &QuickInsightParams, insight: String, method: InsightMethod) {
        self.cache
            .insert(
                InsightCacheKey::from_params(params),
                CachedInsight { insight, method },
            )
            .await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

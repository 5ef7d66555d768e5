use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;

use crate::auth::Auth;
use crate::config_parser::{Config, FailPolicy};
use crate::error::{Error, ErrorDetails};
use crate::insight::{AnthropicCoach, InsightCache};
use crate::usage::{GatewayMetrics, QuotaChecker, UsageStore, UsageTracker};

/// Environment variable carrying the Redis connection URL for the usage store.
pub const REDIS_URL_VAR: &str = "COACH_REDIS_URL";
/// Environment variable carrying the Anthropic API key.
pub const ANTHROPIC_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Represents the authentication state of the gateway
#[derive(Clone)]
pub enum AuthenticationInfo {
    Enabled(Auth),
    Disabled,
}

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub usage_store: Arc<UsageStore>,
    pub authentication_info: AuthenticationInfo,
    pub quota: Arc<QuotaChecker>,
    pub tracker: Arc<UsageTracker>,
    pub insight_cache: Arc<InsightCache>,
    pub coach: Option<Arc<AnthropicCoach>>,
    pub metrics: Arc<GatewayMetrics>,
    pub metrics_handle: Option<PrometheusHandle>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let usage_store = Arc::new(setup_usage_store(&config).await?);
        Ok(Self::assemble(config, http_client, usage_store))
    }

    /// State backed by a healthy in-memory store. Used by tests and local
    /// development without Redis.
    pub fn new_with_mock_store(config: Arc<Config>) -> Self {
        Self::new_with_store(config, Arc::new(UsageStore::new_mock(true)))
    }

    /// State backed by a caller-supplied store.
    pub fn new_with_store(config: Arc<Config>, usage_store: Arc<UsageStore>) -> Self {
        // Building the HTTP client only fails on TLS backend misconfiguration;
        // fall back to the default client in the test path.
        let http_client = setup_http_client().unwrap_or_default();
        Self::assemble(config, http_client, usage_store)
    }

    fn assemble(
        config: Arc<Config>,
        http_client: reqwest::Client,
        usage_store: Arc<UsageStore>,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::default());
        let quota = Arc::new(QuotaChecker::new(
            usage_store.clone(),
            config.quota.clone(),
            metrics.clone(),
        ));
        let tracker = Arc::new(UsageTracker::new(
            usage_store.clone(),
            config.quota.clone(),
            config.ai.clone(),
            metrics.clone(),
        ));
        let insight_cache = Arc::new(InsightCache::new(&config.insight_cache));
        let authentication_info = setup_authentication(&config);
        let coach = setup_coach(&config, http_client.clone());

        Self {
            config,
            http_client,
            usage_store,
            authentication_info,
            quota,
            tracker,
            insight_cache,
            coach,
            metrics,
            metrics_handle: None,
        }
    }

    pub fn with_metrics_handle(mut self, metrics_handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(metrics_handle);
        self
    }

    pub fn is_auth_enabled(&self) -> bool {
        matches!(self.authentication_info, AuthenticationInfo::Enabled(_))
    }
}

fn setup_http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder().build().map_err(|e| {
        Error::new(ErrorDetails::AppState {
            message: format!("Failed to build HTTP client: {e}"),
        })
    })
}

fn setup_authentication(config: &Config) -> AuthenticationInfo {
    if config.auth.enabled {
        AuthenticationInfo::Enabled(Auth::from_config(&config.auth))
    } else {
        tracing::warn!(
            "Authentication is disabled; callers must supply their own identity header"
        );
        AuthenticationInfo::Disabled
    }
}

async fn setup_usage_store(config: &Config) -> Result<UsageStore, Error> {
    if !config.usage_store.enabled {
        tracing::warn!("Usage store disabled by config; quota enforcement is off");
        return Ok(UsageStore::Disabled);
    }

    match std::env::var(REDIS_URL_VAR) {
        Ok(url) => match UsageStore::new_production(&url).await {
            Ok(store) => Ok(store),
            Err(e) if config.quota.fail_policy == FailPolicy::FailClosed => Err(e),
            Err(e) => {
                tracing::warn!(
                    "Failed to set up the Redis usage store, continuing without one (fail-open): {e}"
                );
                Ok(UsageStore::Disabled)
            }
        },
        Err(_) if config.quota.fail_policy == FailPolicy::FailClosed => {
            Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "quota.fail_policy is fail_closed but `{REDIS_URL_VAR}` is not set"
                ),
            }))
        }
        Err(_) => {
            tracing::warn!(
                "`{REDIS_URL_VAR}` is not set; usage tracking and quota enforcement are off"
            );
            Ok(UsageStore::Disabled)
        }
    }
}

fn setup_coach(config: &Config, http_client: reqwest::Client) -> Option<Arc<AnthropicCoach>> {
    if !config.ai.enabled {
        return None;
    }
    match std::env::var(ANTHROPIC_API_KEY_VAR) {
        Ok(key) if !key.is_empty() => Some(Arc::new(AnthropicCoach::new(
            http_client,
            &config.ai,
            SecretString::from(key),
        ))),
        _ => {
            tracing::warn!(
                "`{ANTHROPIC_API_KEY_VAR}` is not set; serving fallback insights instead of AI"
            );
            None
        }
    }
}

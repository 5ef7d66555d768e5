use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, ErrorDetails};

/// Top-level gateway configuration, loaded from a TOML file.
///
/// Every section has sensible defaults so the gateway can start with
/// `--default-config` and no file at all.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub usage_store: UsageStoreConfig,
    pub insight_cache: InsightCacheConfig,
    pub ai: AiConfig,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Config, Error> {
        let deserializer = toml::de::Deserializer::new(raw);
        let config: Config = serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if !(0..=100_000).contains(&self.quota.daily_limit) {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "quota.daily_limit must be between 0 and 100000, got {}",
                    self.quota.daily_limit
                ),
            }));
        }
        if self.ai.max_tokens == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "ai.max_tokens must be greater than zero".to_string(),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// Socket address to bind to. Defaults to 0.0.0.0:3000 when unset.
    pub bind_address: Option<SocketAddr>,
    pub debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Map of SHA-256 hashed API key -> user identifier.
    pub keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Allow the request when the usage store cannot be reached.
    FailOpen,
    /// Deny the request when the usage store cannot be reached.
    FailClosed,
}

impl Default for FailPolicy {
    fn default() -> Self {
        Self::FailOpen
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuotaConfig {
    /// Maximum successful requests per user per calendar day.
    pub daily_limit: u32,
    pub fail_policy: FailPolicy,
    /// Whether failed calls count toward the daily quota.
    pub count_failed_requests: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            fail_policy: FailPolicy::default(),
            count_failed_requests: false,
        }
    }
}

fn default_daily_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UsageStoreConfig {
    /// When false, usage tracking and quota enforcement are disabled entirely.
    pub enabled: bool,
}

impl Default for UsageStoreConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InsightCacheConfig {
    /// TTL for cached insights, in seconds.
    pub ttl_s: u64,
    pub max_capacity: u64,
}

impl Default for InsightCacheConfig {
    fn default() -> Self {
        Self {
            ttl_s: 3600,
            max_capacity: 10_000,
        }
    }
}

/// Pricing for one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AiConfig {
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Per-model pricing table. Unknown models cost nothing rather than
    /// failing the request; the gap shows up in cost dashboards instead.
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 300,
            timeout_ms: 10_000,
            pricing: default_pricing(),
        }
    }
}

fn default_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_pricing() -> HashMap<String, ModelPricing> {
    HashMap::from([(
        default_model(),
        ModelPricing {
            input: 1.0,
            output: 5.0,
        },
    )])
}

impl AiConfig {
    /// Compute the USD cost of one call from its token counts.
    pub fn cost_for(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.pricing.get(model) {
            Some(pricing) => {
                (f64::from(input_tokens) * pricing.input
                    + f64::from(output_tokens) * pricing.output)
                    / 1_000_000.0
            }
            None => {
                if input_tokens > 0 || output_tokens > 0 {
                    tracing::warn!("No pricing configured for model `{model}`, recording zero cost");
                }
                0.0
            }
        }
    }
}

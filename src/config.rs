// =============================================================================
// Runtime Configuration — cron, NAV refresh, provider and auth settings
// =============================================================================
//
// All tunables for the NAV refresh engine and quote provider live here so
// the service can be reconfigured without a rebuild. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. Every field
// carries a serde default so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_cron_schedule() -> String {
    "0 0 0 * * *".to_string()
}

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    10
}

fn default_req_delay_ms() -> u64 {
    300
}

fn default_batch_delay_ms() -> u64 {
    2000
}

fn default_retry_max() -> u32 {
    3
}

fn default_history_cap() -> usize {
    30
}

fn default_provider_base_url() -> String {
    "https://api.mfapi.in".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    15_000
}

fn default_token_secret() -> String {
    "change-me-in-production".to_string()
}

fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// NAV refresh engine tunables (`nav.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_req_delay_ms")]
    pub req_delay_ms: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            req_delay_ms: default_req_delay_ms(),
            batch_delay_ms: default_batch_delay_ms(),
            retry_max: default_retry_max(),
            history_cap: default_history_cap(),
        }
    }
}

/// External quote provider tunables (`provider.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

/// Bearer-token verification tunables (`auth.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_secret")]
    pub token_secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: default_token_secret(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_cron_schedule")]
    pub cron_schedule: String,
    #[serde(default = "default_timezone")]
    pub cron_timezone: String,

    #[serde(default)]
    pub nav: NavConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cron_schedule: default_cron_schedule(),
            cron_timezone: default_timezone(),
            nav: NavConfig::default(),
            provider: ProviderConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), cron = %config.cron_schedule, "config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cron_schedule, "0 0 0 * * *");
        assert_eq!(cfg.nav.batch_size, 10);
        assert_eq!(cfg.nav.concurrency, 10);
        assert_eq!(cfg.nav.req_delay_ms, 300);
        assert_eq!(cfg.nav.batch_delay_ms, 2000);
        assert_eq!(cfg.nav.retry_max, 3);
        assert_eq!(cfg.nav.history_cap, 30);
        assert_eq!(cfg.auth.token_ttl_secs, 86_400);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.nav.batch_size, 10);
        assert_eq!(cfg.provider.timeout_ms, 15_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "nav": { "batchSize": 5 } }"#;
        // field names are snake_case on the wire for this config (no rename),
        // so a camelCase key here is simply ignored and defaults apply.
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.nav.batch_size, 10);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.cron_schedule, cfg2.cron_schedule);
        assert_eq!(cfg.nav.batch_size, cfg2.nav.batch_size);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("navfolio-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = AppConfig::default();
        cfg.nav.batch_size = 25;
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.nav.batch_size, 25);

        std::fs::remove_dir_all(&dir).ok();
    }
}

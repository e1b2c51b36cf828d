use std::time::Duration;

use crate::PoolError;

/// Service configuration, loaded once at startup from the environment.
///
/// `min_size`/`max_size` are accepted and carried but never consulted by
/// the pool manager — they are reserved for a future floor/ceiling policy,
/// mirroring the upstream service this was distilled from.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pve_api_url: String,
    pub pve_api_token: String,
    pub pve_node: Option<String>,
    pub pve_verify_tls: bool,

    pub pool_min_size: usize,
    pub pool_max_size: usize,
    pub target_size: usize,

    pub replenish_interval: Duration,
    pub replenish_batch_size: usize,

    pub hostname_prefix: String,
    pub container_vmid_start: u32,

    pub clone_max_retries: u32,
    pub clone_retry_delay: Duration,
    pub clone_retry_jitter: Duration,
}

impl PoolConfig {
    /// Load configuration from the process environment. Fatal (returns
    /// `PoolError::Config`) if `PVE_API_URL` or `PVE_API_TOKEN` are unset.
    pub fn from_env() -> crate::Result<Self> {
        let pve_api_url = require_env("PVE_API_URL")?;
        let pve_api_token = require_env("PVE_API_TOKEN")?;

        Ok(Self {
            pve_api_url,
            pve_api_token,
            pve_node: std::env::var("PVE_NODE").ok(),
            pve_verify_tls: env_bool("PVE_VERIFY_TLS", false),

            pool_min_size: env_parsed("POOL_MIN_SIZE", 3),
            pool_max_size: env_parsed("POOL_MAX_SIZE", 10),
            target_size: env_parsed("POOL_TARGET_SIZE", 5),

            replenish_interval: Duration::from_secs(env_parsed(
                "REPLENISH_INTERVAL_SECONDS",
                30,
            )),
            replenish_batch_size: env_parsed("REPLENISH_BATCH_SIZE", 1),

            hostname_prefix: std::env::var("CONTAINER_HOSTNAME_PREFIX")
                .unwrap_or_else(|_| "pool-".to_string()),
            container_vmid_start: env_parsed("CONTAINER_VMID_START", 200),

            clone_max_retries: env_parsed("CLONE_MAX_RETRIES", 3),
            clone_retry_delay: Duration::from_secs(env_parsed(
                "CLONE_RETRY_DELAY_SECONDS",
                5,
            )),
            clone_retry_jitter: Duration::from_secs(env_parsed(
                "CLONE_RETRY_JITTER_SECONDS",
                2,
            )),
        })
    }
}

fn require_env(name: &str) -> crate::Result<String> {
    std::env::var(name)
        .map_err(|_| PoolError::Config(format!("missing required environment variable {name}")))
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "PVE_API_URL",
            "PVE_API_TOKEN",
            "PVE_NODE",
            "PVE_VERIFY_TLS",
            "POOL_TARGET_SIZE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn from_env_fails_without_required_vars() {
        clear_env();
        let err = PoolConfig::from_env().unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    #[serial]
    fn from_env_applies_defaults() {
        clear_env();
        std::env::set_var("PVE_API_URL", "https://pve.local:8006");
        std::env::set_var("PVE_API_TOKEN", "user@pve!tok=secret");
        let cfg = PoolConfig::from_env().unwrap();
        assert_eq!(cfg.target_size, 5);
        assert_eq!(cfg.hostname_prefix, "pool-");
        assert_eq!(cfg.container_vmid_start, 200);
        std::env::remove_var("PVE_API_URL");
        std::env::remove_var("PVE_API_TOKEN");
    }
}

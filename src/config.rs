use std::time::Duration;

use serde::Deserialize;

/// Application settings, extracted from Rocket's figment (`Rocket.toml` and
/// `ROCKET_*` environment variables).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Token lifetime in seconds.
    #[serde(default = "default_jwt_expires_in")]
    pub jwt_expires_in: u64,
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_jwt_expires_in() -> u64 {
    60 * 60 * 24
}

fn default_storage_timeout_ms() -> u64 {
    5_000
}

fn default_pool_size() -> u32 {
    10
}

impl AppConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_secret_is_required() {
        let config: AppConfig = serde_json::from_str(r#"{"jwt_secret": "s3cret"}"#).unwrap();
        assert_eq!(config.jwt_expires_in, 86_400);
        assert_eq!(config.storage_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool_size, 10);

        assert!(serde_json::from_str::<AppConfig>("{}").is_err());
    }
}

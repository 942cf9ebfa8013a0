use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Enforcement settings shared by both compilers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallConfig {
    /// Compile and apply the IPv6 table and IPv6 filter parameters
    #[serde(default = "default_true")]
    pub use_ipv6: bool,
    /// Accept traffic from the instance's own project networks
    #[serde(default = "default_true")]
    pub allow_same_net_traffic: bool,
    /// Prefix of every chain vmfw owns (`<prefix>-inst-1`)
    #[serde(default = "default_prefix")]
    pub chain_prefix: String,
    /// Prefix of every filter vmfw owns (`<prefix>-base`)
    #[serde(default = "default_prefix")]
    pub filter_prefix: String,
    /// Attempts at undefining a filter the hypervisor still reports in use
    #[serde(default = "default_unfilter_retry_count")]
    pub unfilter_retry_count: u32,
    /// Pause between those attempts
    #[serde(default = "default_unfilter_retry_interval_ms")]
    pub unfilter_retry_interval_ms: u64,
    /// Write the JSON-lines audit log in the state directory
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    /// Save the live dump before every restore
    #[serde(default = "default_true")]
    pub snapshot_before_apply: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            use_ipv6: true,
            allow_same_net_traffic: true,
            chain_prefix: default_prefix(),
            filter_prefix: default_prefix(),
            unfilter_retry_count: default_unfilter_retry_count(),
            unfilter_retry_interval_ms: default_unfilter_retry_interval_ms(),
            audit_enabled: true,
            snapshot_before_apply: true,
        }
    }
}

impl FirewallConfig {
    pub fn unfilter_retry_interval(&self) -> Duration {
        Duration::from_millis(self.unfilter_retry_interval_ms)
    }

    /// Checks both prefixes.
    ///
    /// # Errors
    ///
    /// Returns the first invalid prefix with the reason.
    pub fn validate(&self) -> Result<(), String> {
        crate::validators::validate_prefix(&self.chain_prefix)
            .map_err(|e| format!("chain_prefix: {e}"))?;
        crate::validators::validate_prefix(&self.filter_prefix)
            .map_err(|e| format!("filter_prefix: {e}"))
    }
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    "vmfw".to_string()
}

fn default_unfilter_retry_count() -> u32 {
    30
}

fn default_unfilter_retry_interval_ms() -> u64 {
    1000
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config_to(config: &FirewallConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?; // Ensure data is flushed to physical media
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    // Atomic rename
    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Saves the config to `<data dir>/config.json`.
pub async fn save_config(config: &FirewallConfig) -> std::io::Result<()> {
    if let Some(mut path) = get_data_dir() {
        crate::utils::ensure_dirs()?;
        path.push("config.json");
        save_config_to(config, &path).await?;
    }
    Ok(())
}

/// Loads the config from an explicit file.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or is not valid JSON.
pub async fn load_config_from(path: &Path) -> crate::Result<FirewallConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}

/// Loads the config from `<data dir>/config.json`, or returns the default
/// if it is missing or unreadable.
pub async fn load_config() -> FirewallConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(json) = tokio::fs::read_to_string(&path).await
            && let Ok(config) = serde_json::from_str::<FirewallConfig>(&json)
        {
            return config;
        }
    }
    FirewallConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FirewallConfig::default();
        assert!(config.use_ipv6);
        assert!(config.allow_same_net_traffic);
        assert_eq!(config.chain_prefix, "vmfw");
        assert_eq!(config.unfilter_retry_count, 30);
        assert_eq!(config.unfilter_retry_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: FirewallConfig = serde_json::from_str(r#"{"use_ipv6": false}"#).unwrap();
        assert!(!config.use_ipv6);
        assert_eq!(config.filter_prefix, "vmfw");
        assert!(config.snapshot_before_apply);
    }

    #[test]
    fn test_invalid_prefix_reported() {
        let config = FirewallConfig {
            chain_prefix: "bad prefix".into(),
            ..FirewallConfig::default()
        };
        assert!(config.validate().unwrap_err().starts_with("chain_prefix"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = FirewallConfig {
            use_ipv6: false,
            unfilter_retry_count: 3,
            ..FirewallConfig::default()
        };

        save_config_to(&config, &path).await.unwrap();
        assert_eq!(load_config_from(&path).await.unwrap(), config);
        assert!(!path.with_extension("json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}

//! Transfer settings persisted as JSON in the user's config directory.
//!
//! Stored at `<config dir>/s3tool/transfer.json`:
//! - Linux:   `$HOME/.config/s3tool/transfer.json`
//! - Windows: `%APPDATA%\s3tool\transfer.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use s3tool_transfer::{EngineConfig, ErrorCategory, RetryPolicy};

/// On-disk form of the engine configuration.
///
/// Every field is optional in the file; missing ones take the engine
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferSettings {
    pub max_concurrent_transfers: usize,
    pub part_size_bytes: u64,
    pub multipart_threshold_bytes: u64,
    pub request_timeout_ms: u64,
    pub max_task_retries: u32,
    pub retry: RetrySettings,
}

/// On-disk form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_engine_config(&EngineConfig::default())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from_policy(&RetryPolicy::default())
    }
}

impl RetrySettings {
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        let mut categories: Vec<_> = policy.retryable_categories.iter().copied().collect();
        categories.sort_by_key(|c| c.to_string());
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: millis(policy.base_delay),
            max_delay_ms: millis(policy.max_delay),
            backoff_factor: policy.backoff_factor,
            retryable_categories: categories,
        }
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            retryable_categories: self.retryable_categories.iter().copied().collect(),
        }
    }
}

impl TransferSettings {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            max_concurrent_transfers: config.max_concurrent_transfers,
            part_size_bytes: config.part_size_bytes,
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            request_timeout_ms: millis(config.request_timeout),
            max_task_retries: config.max_task_retries,
            retry: RetrySettings::from_policy(&config.retry_policy),
        }
    }

    /// Resolves to a validated [`EngineConfig`].
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = EngineConfig {
            max_concurrent_transfers: self.max_concurrent_transfers,
            part_size_bytes: self.part_size_bytes,
            multipart_threshold_bytes: self.multipart_threshold_bytes,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry_policy: self.retry.to_policy(),
            max_task_retries: self.max_task_retries,
        };
        config.validate().context("invalid transfer settings")?;
        Ok(config)
    }

    /// Loads settings from the default location.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&settings_path()?)
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable as JSON.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Self>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer settings, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Saves settings to the default location.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
        set_permissions_0600(path);

        tracing::debug!(path = %path.display(), "transfer settings saved");
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Default settings file location.
pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("s3tool").join("transfer.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_engine() {
        let settings = TransferSettings::default();
        assert_eq!(settings.to_engine_config().unwrap(), EngineConfig::default());
        assert_eq!(settings.request_timeout_ms, 30_000);
        assert_eq!(settings.retry.retryable_categories, vec![ErrorCategory::Network]);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = TransferSettings::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, TransferSettings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s3tool").join("transfer.json");

        let mut settings = TransferSettings::default();
        settings.max_concurrent_transfers = 8;
        settings.retry.max_attempts = 5;
        settings.retry.retryable_categories =
            vec![ErrorCategory::Network, ErrorCategory::StorageService];
        settings.save_to(&path).unwrap();

        let loaded = TransferSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);

        let config = loaded.to_engine_config().unwrap();
        assert_eq!(config.max_concurrent_transfers, 8);
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert!(
            config
                .retry_policy
                .retryable_categories
                .contains(&ErrorCategory::StorageService)
        );
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transfer.json");
        TransferSettings::default().save_to(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(&path, r#"{"partSizeBytes": 5242880, "retry": {"maxAttempts": 4}}"#).unwrap();

        let loaded = TransferSettings::load_from(&path).unwrap();
        assert_eq!(loaded.part_size_bytes, 5 * 1024 * 1024);
        assert_eq!(loaded.retry.max_attempts, 4);
        assert_eq!(loaded.retry.base_delay_ms, 1000);
        assert_eq!(loaded.max_concurrent_transfers, 3);
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(
            TransferSettings::load_from(&path).unwrap(),
            TransferSettings::default()
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut settings = TransferSettings::default();
        settings.part_size_bytes = 0;
        assert!(settings.to_engine_config().is_err());

        let mut settings = TransferSettings::default();
        settings.retry.base_delay_ms = 60_000;
        assert!(settings.to_engine_config().is_err());
    }

    #[test]
    fn path_ends_with_app_dir() {
        let path = settings_path().unwrap();
        assert!(path.ends_with("s3tool/transfer.json"));
    }
}

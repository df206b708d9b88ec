use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::TransferError;
use crate::retry::RetryPolicy;

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on transfers (and upload parts) in flight at once.
    pub max_concurrent_transfers: usize,
    pub part_size_bytes: u64,
    /// Uploads strictly larger than this go through multipart.
    pub multipart_threshold_bytes: u64,
    /// Applied to every store call and to every read of a download stream.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Retries one task may spend across all of its operations.
    pub max_task_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: crate::DEFAULT_MAX_CONCURRENT_TRANSFERS,
            part_size_bytes: crate::DEFAULT_PART_SIZE,
            multipart_threshold_bytes: crate::DEFAULT_MULTIPART_THRESHOLD,
            request_timeout: crate::DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            max_task_retries: crate::DEFAULT_MAX_TASK_RETRIES,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.part_size_bytes == 0 {
            return Err(TransferError::InvalidConfig("part size must be positive".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(TransferError::InvalidConfig(
                "max concurrent transfers must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "request timeout must be positive".into(),
            ));
        }
        self.retry_policy.validate()
    }
}

/// Engine configuration shared between the engines of one manager.
///
/// Operations take a [`snapshot`](Self::snapshot) when they start, so a
/// change never affects a retry sequence already underway.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<EngineConfig>>,
}

impl SharedConfig {
    pub fn new(config: EngineConfig) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    pub fn snapshot(&self) -> EngineConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), TransferError> {
        policy.validate()?;
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retry_policy = policy;
        Ok(())
    }
}

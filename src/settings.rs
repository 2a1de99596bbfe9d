use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::FlagError;
use crate::notices::AdminNotices;

pub const MIN_THRESHOLD: i64 = 1;
pub const MAX_THRESHOLD: i64 = 100;
pub const THRESHOLD_NOTICE: &str =
    "Please revise your flagging threshold and enter a number between 1 and 100";

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn is_enabled(&self) -> Result<bool>;
    async fn threshold(&self) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
    pub threshold: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
        }
    }
}

pub fn check_threshold(value: i64) -> Result<i64, FlagError> {
    if (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value) {
        Ok(value)
    } else {
        Err(FlagError::Configuration(format!(
            "threshold {value} outside {MIN_THRESHOLD}..={MAX_THRESHOLD}"
        )))
    }
}

pub struct SettingsStore {
    inner: Mutex<Settings>,
    notices: Arc<AdminNotices>,
}

impl SettingsStore {
    pub fn new(settings: Settings, notices: Arc<AdminNotices>) -> Self {
        Self {
            inner: Mutex::new(settings),
            notices,
        }
    }

    pub async fn snapshot(&self) -> Settings {
        *self.inner.lock().await
    }

    /// Out-of-range values leave a notice for the administrator but are
    /// stored anyway, so a save never gets blocked.
    pub async fn save_threshold(&self, value: i64) -> i64 {
        if let Err(err) = check_threshold(value) {
            info!(error = %err, "storing out-of-range threshold");
            self.notices.push(THRESHOLD_NOTICE).await;
        }
        self.inner.lock().await.threshold = value;
        value
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.lock().await.enabled = enabled;
        info!(enabled, "comment flagging toggled");
    }
}

#[async_trait]
impl SettingsProvider for SettingsStore {
    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.inner.lock().await.enabled)
    }

    async fn threshold(&self) -> Result<i64> {
        Ok(self.inner.lock().await.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store() -> (Arc<AdminNotices>, SettingsStore) {
        let notices = Arc::new(AdminNotices::new(Arc::new(SystemClock)));
        let store = SettingsStore::new(Settings::default(), notices.clone());
        (notices, store)
    }

    #[test]
    fn checks_threshold_bounds() {
        assert!(check_threshold(1).is_ok());
        assert!(check_threshold(100).is_ok());
        assert!(matches!(check_threshold(0), Err(FlagError::Configuration(_))));
        assert!(matches!(check_threshold(101), Err(FlagError::Configuration(_))));
    }

    #[tokio::test]
    async fn out_of_range_threshold_is_stored_with_notice() {
        let (notices, store) = store();
        assert_eq!(store.save_threshold(250).await, 250);
        assert_eq!(store.threshold().await.unwrap(), 250);
        assert_eq!(notices.pending().await, vec![THRESHOLD_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn valid_threshold_leaves_no_notice() {
        let (notices, store) = store();
        store.save_threshold(3).await;
        store.set_enabled(false).await;
        assert_eq!(
            store.snapshot().await,
            Settings {
                enabled: false,
                threshold: 3
            }
        );
        assert!(notices.pending().await.is_empty());
    }
}

// ABOUTME: Capacity ledger gating how many sandboxes may exist at once
// ABOUTME: Admission is a single conditional increment on the persisted counter; release floors at zero

use crate::storage::{CapacityUsage, SandboxStorage, StorageError};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CapacityLedger {
    storage: Arc<SandboxStorage>,
}

impl CapacityLedger {
    pub fn new(storage: Arc<SandboxStorage>) -> Self {
        Self { storage }
    }

    /// Apply the configured ceiling. The current count is left untouched.
    pub async fn set_maximum(&self, max: i64) -> Result<(), StorageError> {
        self.storage.set_max_usage(max).await?;
        info!(max_sandboxes = max, "Sandbox capacity configured");
        Ok(())
    }

    /// Take a slot if one is free. `false` means the ceiling is reached.
    pub async fn acquire_slot(&self) -> Result<bool, StorageError> {
        let granted = self.storage.try_increment_usage().await?;
        debug!(granted, "Capacity slot requested");
        Ok(granted)
    }

    /// Give a slot back. Never fails the caller; persistence errors become a warning.
    pub async fn release_slot(&self) -> Option<String> {
        match self.storage.decrement_usage().await {
            Ok(()) => {
                debug!("Capacity slot released");
                None
            }
            Err(e) => {
                let msg = format!("Failed to release capacity slot: {}", e);
                warn!("{}", msg);
                Some(msg)
            }
        }
    }

    pub async fn usage(&self) -> Result<CapacityUsage, StorageError> {
        self.storage.get_usage().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_ledger(max: i64) -> CapacityLedger {
        let storage = SandboxStorage::connect("sqlite::memory:").await.unwrap();
        let ledger = CapacityLedger::new(Arc::new(storage));
        ledger.set_maximum(max).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_acquire_until_full() {
        let ledger = setup_ledger(3).await;

        for _ in 0..3 {
            assert!(ledger.acquire_slot().await.unwrap());
        }
        assert!(!ledger.acquire_slot().await.unwrap());

        let usage = ledger.usage().await.unwrap();
        assert_eq!(usage.current, 3);
        assert!(!usage.has_room());
    }

    #[tokio::test]
    async fn test_extra_releases_never_go_negative() {
        let ledger = setup_ledger(3).await;

        assert!(ledger.acquire_slot().await.unwrap());
        for _ in 0..5 {
            assert!(ledger.release_slot().await.is_none());
        }

        assert_eq!(ledger.usage().await.unwrap().current, 0);
        assert!(ledger.acquire_slot().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_max() {
        let ledger = Arc::new(setup_ledger(3).await);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.acquire_slot().await.unwrap() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(ledger.usage().await.unwrap().current, 3);
    }

    #[tokio::test]
    async fn test_lowering_maximum_keeps_current() {
        let ledger = setup_ledger(3).await;
        assert!(ledger.acquire_slot().await.unwrap());
        assert!(ledger.acquire_slot().await.unwrap());

        ledger.set_maximum(1).await.unwrap();

        let usage = ledger.usage().await.unwrap();
        assert_eq!(usage, CapacityUsage { current: 2, max: 1 });
        assert_eq!(usage.remaining(), 0);
        assert!(!ledger.acquire_slot().await.unwrap());
    }
}

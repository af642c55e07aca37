//! `SecretStore`: SSM/secret-manager credential fetch and envelope private-key storage.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// The secret-store surface the engine depends on.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the current value for `reference` (an SSM path or secret-manager path).
    async fn get_value(&self, reference: &str) -> Result<String, StoreError>;
    /// Store `value` at `path`, optionally with an auto-expiration after `expire_in`.
    async fn put_value(&self, path: &str, value: &str, expire_in: Option<Duration>) -> Result<(), StoreError>;
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// An in-memory reference implementation of [`SecretStore`] with lazy
/// expiry checked on read — sufficient to exercise the envelope
/// private-key auto-expiration path without a real TTL sweeper.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl InMemorySecretStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value directly, bypassing `put_value`'s async signature —
    /// convenient for tests that need credentials present before the
    /// repackager runs.
    pub fn seed(&self, path: impl Into<String>, value: impl Into<String>) {
        let mut entries = self.entries.write().expect("secret store lock poisoned");
        entries.insert(
            path.into(),
            Entry {
                value: value.into(),
                expires_at: None,
            },
        );
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_value(&self, reference: &str) -> Result<String, StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Internal("secret store lock poisoned".into()))?;
        let expired = entries
            .get(reference)
            .and_then(|e| e.expires_at)
            .is_some_and(|exp| Utc::now() > exp);
        if expired {
            entries.remove(reference);
        }
        entries
            .get(reference)
            .map(|e| e.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("secret {reference}")))
    }

    async fn put_value(&self, path: &str, value: &str, expire_in: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Internal("secret store lock poisoned".into()))?;
        let expires_at = expire_in.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        entries.insert(
            path.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_value_is_readable() {
        let store = InMemorySecretStore::new();
        store.seed("/ssm/token", "secret-value");
        assert_eq!(store.get_value("/ssm/token").await.unwrap(), "secret-value");
    }

    #[tokio::test]
    async fn missing_reference_is_not_found() {
        let store = InMemorySecretStore::new();
        let err = store.get_value("/ssm/missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn put_then_get_roundtrip_without_expiry() {
        let store = InMemorySecretStore::new();
        store.put_value("/secret/path", "value", None).await.unwrap();
        assert_eq!(store.get_value("/secret/path").await.unwrap(), "value");
    }

    #[tokio::test]
    async fn expired_value_is_not_found_on_read() {
        let store = InMemorySecretStore::new();
        store
            .put_value("/sops-keys/run-1/0001", "priv-key", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = store.get_value("/sops-keys/run-1/0001").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unexpired_value_with_ttl_is_readable() {
        let store = InMemorySecretStore::new();
        store
            .put_value("/sops-keys/run-1/0001", "priv-key", Some(Duration::from_secs(7200)))
            .await
            .unwrap();
        assert_eq!(store.get_value("/sops-keys/run-1/0001").await.unwrap(), "priv-key");
    }
}

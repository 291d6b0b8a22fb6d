//! `KeyValueStore` trait: the single persistence seam of the bridge.

use async_trait::async_trait;

use crate::error::DatabaseError;

/// Minimal async key/value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    /// Insert or overwrite the value stored under `key`.
    async fn put(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}

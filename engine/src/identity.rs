//! Client identity - a stable random token for this installation.
//!
//! The backend uses it to attribute requests without a login step.

use crate::error::Result;
use crate::keys;
use crate::store::JsonStore;
use tokio::sync::OnceCell;

/// Header carrying the client identity on every outgoing request.
pub const CLIENT_ID_HEADER: &str = "x-user-id";

/// Lazily creates and persists the installation identifier.
#[derive(Debug)]
pub struct ClientIdentity {
    store: JsonStore,
    cached: OnceCell<String>,
}

impl ClientIdentity {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            cached: OnceCell::new(),
        }
    }

    /// Return the persisted identifier, creating it on first use.
    pub async fn get_or_create(&self) -> Result<String> {
        let id = self.cached.get_or_try_init(|| self.load_or_create()).await?;
        Ok(id.clone())
    }

    async fn load_or_create(&self) -> Result<String> {
        if let Some(existing) = self.store.get_raw(keys::CLIENT_ID).await? {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        self.store.put_raw(keys::CLIENT_ID, id.clone()).await?;
        tracing::info!(client_id = %id, "Created client identity");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn created_once_and_persisted() {
        let raw = MemoryStore::new_shared();
        let identity = ClientIdentity::new(JsonStore::new(raw.clone()));

        let first = identity.get_or_create().await.unwrap();
        let second = identity.get_or_create().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(raw.get(keys::CLIENT_ID).await.unwrap(), Some(first.clone()));

        // A new provider over the same store (app restart) sees the same id
        let restarted = ClientIdentity::new(JsonStore::new(raw as Arc<dyn KeyValueStore>));
        assert_eq!(restarted.get_or_create().await.unwrap(), first);
    }

    #[tokio::test]
    async fn blank_value_is_replaced() {
        let raw = MemoryStore::new_shared();
        raw.set(keys::CLIENT_ID, "  ".into()).await.unwrap();

        let identity = ClientIdentity::new(JsonStore::new(raw));
        let id = identity.get_or_create().await.unwrap();
        assert_eq!(id.len(), 32);
    }
}

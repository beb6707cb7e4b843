//! Mutation queue - durable, ordered list of writes awaiting the server.
//!
//! The whole queue lives under one key as a JSON array. Every
//! read-modify-write of that key goes through the queue's mutex, so an
//! enqueue that lands while a sync pass is running is never overwritten by
//! the pass's write-back.

use crate::error::{Error, Result};
use crate::keys;
use crate::remote::{Method, Request};
use crate::store::JsonStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Local bookkeeping id of a queued operation. Never sent to the server.
pub type QueueId = i64;

/// A mutation that has not been confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Local id (millisecond timestamp, bumped to stay strictly increasing)
    pub id: QueueId,
    /// Resource path, e.g. `/api/harvest/`
    pub endpoint: String,
    /// HTTP verb
    #[serde(default)]
    pub method: Method,
    /// Request body
    pub payload: Value,
    /// Placeholder id of the entity this operation creates, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<i64>,
    /// Creation time, RFC 3339
    pub timestamp: String,
    /// Server rejections seen so far
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedOperation {
    /// The request this operation replays.
    pub fn to_request(&self) -> Request {
        Request::write(self.method, self.endpoint.clone(), self.payload.clone())
    }
}

/// The durable mutation queue.
#[derive(Debug)]
pub struct MutationQueue {
    store: JsonStore,
    lock: Mutex<()>,
}

impl MutationQueue {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Append an operation. Existing order is preserved.
    pub async fn enqueue(
        &self,
        endpoint: impl Into<String>,
        payload: Value,
        method: Method,
        temp_id: Option<i64>,
    ) -> Result<QueuedOperation> {
        if !payload.is_object() {
            return Err(Error::InvalidPayload(
                "queued payload must be a JSON object".into(),
            ));
        }

        let _guard = self.lock.lock().await;
        let mut queue = self.load(keys::QUEUE).await?;

        let now = Utc::now();
        let id = match queue.last() {
            Some(last) => now.timestamp_millis().max(last.id + 1),
            None => now.timestamp_millis(),
        };

        let op = QueuedOperation {
            id,
            endpoint: endpoint.into(),
            method,
            payload,
            temp_id,
            timestamp: now.to_rfc3339(),
            attempts: 0,
        };
        queue.push(op.clone());
        self.store.put_json(keys::QUEUE, &queue).await?;

        tracing::info!(
            id = op.id,
            endpoint = %op.endpoint,
            method = %op.method,
            temp_id = ?op.temp_id,
            pending = queue.len(),
            "Queued offline action"
        );

        Ok(op)
    }

    /// All pending operations in enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<QueuedOperation>> {
        let _guard = self.lock.lock().await;
        self.load(keys::QUEUE).await
    }

    /// Number of pending operations.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.list_pending().await?.len())
    }

    /// Check if nothing is pending.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Discard every pending operation.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(keys::QUEUE).await?;
        tracing::warn!("Offline action queue discarded");
        Ok(())
    }

    /// Replace the operations a sync pass processed with its survivors.
    ///
    /// `processed` are the ids of the snapshot the pass loaded. Operations
    /// enqueued after that snapshot are kept, behind the survivors.
    pub(crate) async fn replace_pending(
        &self,
        processed: &HashSet<QueueId>,
        survivors: Vec<QueuedOperation>,
    ) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let current = self.load(keys::QUEUE).await?;

        let mut next = survivors;
        next.extend(current.into_iter().filter(|op| !processed.contains(&op.id)));

        if next.is_empty() {
            self.store.remove(keys::QUEUE).await?;
        } else {
            self.store.put_json(keys::QUEUE, &next).await?;
        }
        Ok(next.len())
    }

    /// Park operations the server keeps rejecting.
    pub(crate) async fn push_dead_letters(&self, ops: Vec<QueuedOperation>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut dead = self.load(keys::DEAD_LETTER).await?;
        dead.extend(ops);
        self.store.put_json(keys::DEAD_LETTER, &dead).await
    }

    /// Operations parked after too many rejections.
    pub async fn list_dead_letters(&self) -> Result<Vec<QueuedOperation>> {
        let _guard = self.lock.lock().await;
        self.load(keys::DEAD_LETTER).await
    }

    /// Drop all parked operations.
    pub async fn clear_dead_letters(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(keys::DEAD_LETTER).await
    }

    /// Move parked operations back to the tail of the queue with a fresh
    /// attempt budget. Returns how many were moved.
    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let dead = self.load(keys::DEAD_LETTER).await?;
        if dead.is_empty() {
            return Ok(0);
        }

        let mut queue = self.load(keys::QUEUE).await?;
        let moved = dead.len();
        for mut op in dead {
            op.attempts = 0;
            if let Some(last) = queue.last() {
                op.id = op.id.max(last.id + 1);
            }
            queue.push(op);
        }

        self.store.put_json(keys::QUEUE, &queue).await?;
        self.store.remove(keys::DEAD_LETTER).await?;
        tracing::info!(moved, "Requeued dead-lettered actions");
        Ok(moved)
    }

    /// Entries set aside because they could not be decoded.
    pub async fn list_unreadable(&self) -> Result<Vec<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .store
            .get_json(keys::UNREADABLE_ACTIONS)
            .await?
            .unwrap_or_default())
    }

    /// Decode the list under `key`.
    ///
    /// Entries that do not decode are moved to `UNREADABLE_ACTIONS` before
    /// the list is written back, so a later write never drops them.
    async fn load(&self, key: &str) -> Result<Vec<QueuedOperation>> {
        let Some(raw) = self.store.get_raw(key).await? else {
            return Ok(Vec::new());
        };

        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(Value::Null) => Vec::new(),
            _ => {
                tracing::error!(key = %key, "Queue is unreadable, setting it aside");
                self.set_aside(vec![Value::String(raw)]).await?;
                self.store.remove(key).await?;
                return Ok(Vec::new());
            }
        };

        let mut ops = Vec::with_capacity(entries.len());
        let mut unreadable = Vec::new();
        for entry in entries {
            match QueuedOperation::deserialize(&entry) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Setting aside unreadable queued action");
                    unreadable.push(entry);
                }
            }
        }

        if !unreadable.is_empty() {
            self.set_aside(unreadable).await?;
            self.store.put_json(key, &ops).await?;
        }
        Ok(ops)
    }

    async fn set_aside(&self, entries: Vec<Value>) -> Result<()> {
        let mut kept: Vec<Value> = self
            .store
            .get_json(keys::UNREADABLE_ACTIONS)
            .await?
            .unwrap_or_default();
        kept.extend(entries);
        self.store.put_json(keys::UNREADABLE_ACTIONS, &kept).await
    }
}

/// Mints placeholder ids for entities created offline.
///
/// Ids are negative and strictly decreasing across every entity type, so a
/// single placeholder never stands for two different records.
#[derive(Debug)]
pub struct TempIds {
    store: JsonStore,
    lock: Mutex<()>,
}

impl TempIds {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Allocate the next placeholder id.
    pub async fn next(&self) -> Result<i64> {
        let _guard = self.lock.lock().await;
        let last: i64 = self.store.get_json(keys::TEMP_ID_SEQ).await?.unwrap_or(0);
        let id = last.min(0) - 1;
        self.store.put_json(keys::TEMP_ID_SEQ, &id).await?;
        Ok(id)
    }

    /// Whether `id` is in the reserved placeholder range.
    pub fn is_temp(id: i64) -> bool {
        id < 0
    }
}

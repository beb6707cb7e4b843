//! Sync engine - replays the mutation queue against the server.
//!
//! # Algorithm
//!
//! 1. Bail out if offline or if another pass is running
//! 2. Load the queue snapshot, in enqueue order
//! 3. For each operation:
//!    - rewrite references to temp ids resolved earlier in this pass
//!    - hold back operations that depend on a temp id whose creator failed
//!    - run payload enrichers (placeholders kept on failure)
//!    - send with a per-request timeout, one attempt
//!    - on success record `temp_id -> server id`
//! 4. Persist the failed subset; park operations rejected too often
//! 5. Rename cached records created offline to their server ids
//!
//! The identifier map lives for one pass only. Survivors are stored with
//! their rewritten payloads, so a resolved id is never lost with the map.

use crate::aggregate::lenient_i64;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::invalidate::invalidate;
use crate::keys;
use crate::queue::{MutationQueue, QueueId, QueuedOperation};
use crate::remap::apply_resolved_ids;
use crate::remote::{Remote, RemoteError};
use crate::store::JsonStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Temp id → server-assigned id, built fresh on every pass.
pub type IdentifierMap = HashMap<i64, i64>;

/// Placeholder written when a pond was mapped without a location name.
pub const PENDING_LOCATION: &str = "Pending location";

/// Default location the backend fills in when none was given.
pub const UNKNOWN_LOCATION: &str = "Unknown Location";

/// Tunables for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Upper bound on each replayed request
    pub request_timeout: Duration,
    /// Server rejections before an operation is parked; 0 retries forever
    pub max_attempts: u32,
    /// Payload fields that may hold a temp id
    pub reference_fields: Vec<String>,
    /// Caches dropped after a pass that confirmed anything
    pub invalidate_after_sync: Vec<String>,
    /// How long a server copy of a pond detail is trusted
    pub pond_fresh_for: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 5,
            reference_fields: vec!["stocking_id".into(), "pond_id".into()],
            invalidate_after_sync: vec![keys::ACTIVE_STOCK.into(), keys::ANALYTICS.into()],
            pond_fresh_for: Duration::from_secs(300),
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// False only when the pass could not run at all
    pub success: bool,
    /// Human readable summary
    pub message: String,
    pub succeeded: usize,
    /// Includes held-back and parked operations
    pub failed: usize,
    /// Operations moved to the dead-letter list during this pass
    pub dead_lettered: usize,
}

impl SyncReport {
    fn not_run(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
        }
    }

    fn nothing_to_sync() -> Self {
        Self {
            success: true,
            message: "Nothing to sync".to_string(),
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
        }
    }

    fn completed(succeeded: usize, failed: usize, dead_lettered: usize) -> Self {
        let mut message = format!("Synced {succeeded} items, {failed} failed");
        if dead_lettered > 0 {
            message.push_str(&format!(
                " ({dead_lettered} set aside after repeated rejection)"
            ));
        }
        Self {
            success: true,
            message,
            succeeded,
            failed,
            dead_lettered,
        }
    }
}

/// Pre-send repair of a queued payload that needs the network.
#[async_trait]
pub trait PayloadEnricher: Send + Sync {
    /// Resolve placeholders in `payload`. Returns true if anything changed.
    async fn enrich(&self, endpoint: &str, payload: &mut Value)
        -> std::result::Result<bool, RemoteError>;
}

/// Reverse geocoding capability.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> std::result::Result<String, RemoteError>;
}

/// Replaces a placeholder `location_desc` with a geocoded label, using the
/// centroid of the pond's `coordinates` (`[[lat, lon], ...]`).
pub struct LocationEnricher {
    geocoder: Arc<dyn Geocoder>,
}

impl LocationEnricher {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }

    fn is_placeholder(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => {
                let s = s.trim();
                s.is_empty()
                    || s.eq_ignore_ascii_case(PENDING_LOCATION)
                    || s.eq_ignore_ascii_case(UNKNOWN_LOCATION)
            }
            _ => false,
        }
    }

    fn centroid(coordinates: &Value) -> Option<(f64, f64)> {
        let points: Vec<(f64, f64)> = coordinates
            .as_array()?
            .iter()
            .filter_map(|p| {
                let p = p.as_array()?;
                Some((p.first()?.as_f64()?, p.get(1)?.as_f64()?))
            })
            .collect();

        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let (lat, lon) = points
            .iter()
            .fold((0.0, 0.0), |(a, b), (lat, lon)| (a + lat, b + lon));
        Some((lat / n, lon / n))
    }
}

#[async_trait]
impl PayloadEnricher for LocationEnricher {
    async fn enrich(
        &self,
        _endpoint: &str,
        payload: &mut Value,
    ) -> std::result::Result<bool, RemoteError> {
        let Some(fields) = payload.as_object_mut() else {
            return Ok(false);
        };
        if !fields.contains_key("coordinates") || !Self::is_placeholder(fields.get("location_desc"))
        {
            return Ok(false);
        }
        let Some((lat, lon)) = fields.get("coordinates").and_then(Self::centroid) else {
            return Ok(false);
        };

        let label = self.geocoder.reverse_geocode(lat, lon).await?;
        fields.insert("location_desc".into(), Value::from(label));
        Ok(true)
    }
}

/// Drains the mutation queue.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    store: JsonStore,
    connectivity: Arc<dyn Connectivity>,
    remote: Arc<dyn Remote>,
    enrichers: Vec<Arc<dyn PayloadEnricher>>,
    config: SyncConfig,
    running: Mutex<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("enrichers", &self.enrichers.len())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        queue: Arc<MutationQueue>,
        store: JsonStore,
        connectivity: Arc<dyn Connectivity>,
        remote: Arc<dyn Remote>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            store,
            connectivity,
            remote,
            enrichers: Vec::new(),
            config,
            running: Mutex::new(()),
        }
    }

    /// Add a payload enricher; enrichers run in registration order.
    pub fn with_enricher(mut self, enricher: Arc<dyn PayloadEnricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    /// Run one pass over the queue.
    ///
    /// Per-item failures never fail the pass; `Err` is reserved for the
    /// durable store itself failing.
    pub async fn sync(&self) -> Result<SyncReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Sync requested while a pass is running");
            return Ok(SyncReport::not_run("Sync already in progress"));
        };

        if !self.connectivity.is_online().await {
            return Ok(SyncReport::not_run(
                "Offline. Connect to the internet to sync.",
            ));
        }

        let pending = self.queue.list_pending().await?;
        if pending.is_empty() {
            return Ok(SyncReport::nothing_to_sync());
        }

        tracing::info!(pending = pending.len(), "Starting sync pass");

        let processed: HashSet<QueueId> = pending.iter().map(|op| op.id).collect();
        let mut resolved = IdentifierMap::new();
        let mut unresolved: HashSet<i64> = HashSet::new();
        let mut survivors = Vec::new();
        let mut dead = Vec::new();
        let mut touched_ponds: HashSet<i64> = HashSet::new();
        let mut succeeded = 0;
        let mut failed = 0;

        for mut op in pending {
            rewrite_references(&mut op, &resolved, &self.config.reference_fields);
            if let Some(pond_id) = op.payload.get("pond_id").and_then(lenient_i64) {
                touched_ponds.insert(pond_id);
            }

            if let Some(blocking) =
                find_reference(&op.payload, &unresolved, &self.config.reference_fields)
            {
                tracing::info!(
                    id = op.id,
                    endpoint = %op.endpoint,
                    temp_id = blocking,
                    "Holding back action until the record it references syncs"
                );
                if let Some(temp_id) = op.temp_id {
                    unresolved.insert(temp_id);
                }
                failed += 1;
                survivors.push(op);
                continue;
            }

            self.enrich(&mut op).await;

            match self.send(&op).await {
                Ok(response) => {
                    succeeded += 1;
                    if let Some(temp_id) = op.temp_id {
                        match response.get("id").and_then(lenient_i64) {
                            Some(server_id) => {
                                tracing::debug!(temp_id, server_id, "Resolved temp id");
                                resolved.insert(temp_id, server_id);
                            }
                            None => {
                                tracing::warn!(
                                    id = op.id,
                                    temp_id,
                                    "Server response carried no id for a temp-id action"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    if e.is_rejection() {
                        op.attempts += 1;
                    }
                    if let Some(temp_id) = op.temp_id {
                        unresolved.insert(temp_id);
                    }

                    if self.config.max_attempts > 0 && op.attempts >= self.config.max_attempts {
                        tracing::error!(
                            id = op.id,
                            endpoint = %op.endpoint,
                            attempts = op.attempts,
                            error = %e,
                            "Action set aside after repeated rejection"
                        );
                        dead.push(op);
                    } else {
                        tracing::warn!(
                            id = op.id,
                            endpoint = %op.endpoint,
                            attempts = op.attempts,
                            error = %e,
                            "Action failed, keeping it for the next sync"
                        );
                        survivors.push(op);
                    }
                }
            }
        }

        let dead_lettered = dead.len();
        let remaining = self.queue.replace_pending(&processed, survivors).await?;
        self.queue.push_dead_letters(dead).await?;
        apply_resolved_ids(&self.store, &resolved, &touched_ponds).await?;

        if succeeded > 0 {
            self.store
                .put_json(keys::LAST_SYNC_TIME, &Utc::now().to_rfc3339())
                .await?;
            invalidate(&self.store, &self.config.invalidate_after_sync).await?;
        }

        let report = SyncReport::completed(succeeded, failed, dead_lettered);
        tracing::info!(
            succeeded,
            failed,
            dead_lettered,
            remaining,
            "Sync pass finished"
        );
        Ok(report)
    }

    /// Time of the last pass that confirmed at least one action.
    pub async fn last_sync_time(&self) -> Result<Option<String>> {
        self.store.get_json(keys::LAST_SYNC_TIME).await
    }

    async fn enrich(&self, op: &mut QueuedOperation) {
        for enricher in &self.enrichers {
            let mut candidate = op.payload.clone();
            match enricher.enrich(&op.endpoint, &mut candidate).await {
                Ok(true) => op.payload = candidate,
                Ok(false) => {}
                Err(e) => {
                    tracing::info!(id = op.id, error = %e, "Enrichment failed, sending placeholder");
                }
            }
        }
    }

    async fn send(&self, op: &QueuedOperation) -> std::result::Result<Value, RemoteError> {
        let request = op.to_request();
        match tokio::time::timeout(self.config.request_timeout, self.remote.execute(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

/// Replace temp ids in reference fields (and path segments) with resolved
/// server ids.
fn rewrite_references(op: &mut QueuedOperation, resolved: &IdentifierMap, fields: &[String]) {
    if resolved.is_empty() {
        return;
    }

    if let Some(payload) = op.payload.as_object_mut() {
        rewrite_fields(payload, resolved, fields);
    }

    let rewritten: Vec<String> = op
        .endpoint
        .split('/')
        .map(|segment| match segment.parse::<i64>() {
            Ok(id) => resolved
                .get(&id)
                .map(|real| real.to_string())
                .unwrap_or_else(|| segment.to_string()),
            Err(_) => segment.to_string(),
        })
        .collect();
    op.endpoint = rewritten.join("/");
}

fn rewrite_fields(payload: &mut Map<String, Value>, resolved: &IdentifierMap, fields: &[String]) {
    for field in fields {
        if let Some(value) = payload.get_mut(field.as_str()) {
            if let Some(real) = value.as_i64().and_then(|id| resolved.get(&id)) {
                *value = Value::from(*real);
            }
        }
    }
}

/// First reference field whose value is one of `ids`.
fn find_reference(payload: &Value, ids: &HashSet<i64>, fields: &[String]) -> Option<i64> {
    if ids.is_empty() {
        return None;
    }
    fields
        .iter()
        .filter_map(|field| payload.get(field.as_str()).and_then(Value::as_i64))
        .find(|id| ids.contains(id))
}

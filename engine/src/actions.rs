//! Field actions - the write path screens call.
//!
//! Each action either reaches the server now or lands in the mutation queue,
//! and in both cases leaves the local caches agreeing with what the operator
//! just recorded. Callers never branch on network-vs-cache themselves.
//!
//! # Flow
//!
//! 1. Validate the input
//! 2. Online and not referencing an unsynced record: send it
//!    - rejection is returned to the caller as [`ActionError::Rejected`]
//!    - transport failure falls through to the queue
//! 3. Otherwise enqueue, minting a temp id for records that create entities
//! 4. Apply the change to the cached stock lists and recompute the pond aggregate

use crate::aggregate::{decode_batches, lenient_i64, same_id, AggregateReconciler, StockBatch};
use crate::connectivity::Connectivity;
use crate::error::Error;
use crate::invalidate::invalidate;
use crate::keys;
use crate::queue::{MutationQueue, TempIds};
use crate::remote::{Method, Remote, RemoteError, Request};
use crate::store::JsonStore;
use crate::sync::PENDING_LOCATION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const STOCKING_ENDPOINT: &str = "/api/stocking/";
pub const HARVEST_ENDPOINT: &str = "/api/harvest/";
pub const MORTALITY_ENDPOINT: &str = "/api/mortality/";
pub const PONDS_ENDPOINT: &str = "/api/ponds/";

/// A new stocking batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStocking {
    pub pond_id: i64,
    pub stocking_date: String,
    pub fry_type: String,
    pub fry_quantity: i64,
}

/// A harvest closing a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHarvest {
    pub stocking_id: i64,
    pub harvest_date: String,
    pub total_weight_kg: f64,
    #[serde(default)]
    pub market_price_per_kg: f64,
    #[serde(default = "default_fish_size")]
    pub fish_size: String,
}

fn default_fish_size() -> String {
    "Standard".to_string()
}

/// Fish lost from a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMortality {
    pub stocking_id: i64,
    pub loss_date: String,
    pub quantity_lost: i64,
    pub weight_lost_kg: f64,
    pub cause: String,
    pub action_taken: String,
}

/// A pond outline mapped in the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPond {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_desc: Option<String>,
    /// Polygon corners as `[latitude, longitude]`
    pub coordinates: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

/// Why an action was queued instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// The connectivity oracle reported offline
    Offline,
    /// Believed online, but the request never got an answer
    ServerUnreachable,
    /// References a record that only exists locally so far
    DependsOnPending,
}

/// What happened to an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Accepted by the server; carries its response body
    Sent(Value),
    /// Stored for the next sync pass
    Queued {
        temp_id: Option<i64>,
        reason: QueueReason,
    },
}

impl ActionOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, ActionOutcome::Queued { .. })
    }
}

/// Why an action was refused outright.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The server saw the request and refused it
    #[error("server error: {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Engine(#[from] Error),
}

pub type ActionResult = std::result::Result<ActionOutcome, ActionError>;

/// Records field events against the server or the offline queue.
#[derive(Clone)]
pub struct FieldActions {
    store: JsonStore,
    queue: Arc<MutationQueue>,
    temp_ids: Arc<TempIds>,
    connectivity: Arc<dyn Connectivity>,
    remote: Arc<dyn Remote>,
    reconciler: AggregateReconciler,
}

impl std::fmt::Debug for FieldActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldActions").finish_non_exhaustive()
    }
}

impl FieldActions {
    pub fn new(
        store: JsonStore,
        queue: Arc<MutationQueue>,
        temp_ids: Arc<TempIds>,
        connectivity: Arc<dyn Connectivity>,
        remote: Arc<dyn Remote>,
        reconciler: AggregateReconciler,
    ) -> Self {
        Self {
            store,
            queue,
            temp_ids,
            connectivity,
            remote,
            reconciler,
        }
    }

    /// Stock a pond with a new batch of fry.
    pub async fn record_stocking(&self, input: NewStocking) -> ActionResult {
        require(input.fry_quantity > 0, "fry quantity must be positive")?;
        require(!input.fry_type.trim().is_empty(), "fry type is required")?;
        require(!input.stocking_date.trim().is_empty(), "stocking date is required")?;

        let payload = to_payload(&input)?;
        let depends = TempIds::is_temp(input.pond_id);

        let outcome = self
            .submit(STOCKING_ENDPOINT, payload, depends, true)
            .await?;

        let batch_id = match &outcome {
            ActionOutcome::Sent(body) => body.get("id").and_then(lenient_i64),
            ActionOutcome::Queued { temp_id, .. } => *temp_id,
        };
        let batch = StockBatch {
            id: batch_id,
            pond_id: Some(input.pond_id),
            fry_type: Some(input.fry_type.clone()),
            current_quantity: Some(input.fry_quantity),
            fry_quantity: Some(input.fry_quantity),
            stocking_date: Some(input.stocking_date.clone()),
            active: Some(true),
            ..Default::default()
        };
        self.add_batch(input.pond_id, batch).await?;

        self.settle(input.pond_id, &outcome, &[keys::ANALYTICS.to_string()])
            .await?;
        Ok(outcome)
    }

    /// Harvest a batch, closing its cycle.
    pub async fn record_harvest(&self, input: NewHarvest) -> ActionResult {
        require(input.total_weight_kg > 0.0, "harvest weight must be positive")?;
        require(input.market_price_per_kg >= 0.0, "market price cannot be negative")?;

        let payload = to_payload(&input)?;
        let depends = TempIds::is_temp(input.stocking_id);
        let outcome = self
            .submit(HARVEST_ENDPOINT, payload, depends, false)
            .await?;

        let pond_id = self
            .update_batch(input.stocking_id, StockBatch::close)
            .await?;

        if let Some(pond_id) = pond_id {
            self.settle(
                pond_id,
                &outcome,
                &[keys::ANALYTICS.to_string(), keys::history(pond_id)],
            )
            .await?;
        } else {
            invalidate(&self.store, [keys::ANALYTICS]).await?;
        }
        Ok(outcome)
    }

    /// Report fish lost from a batch.
    pub async fn record_mortality(&self, input: NewMortality) -> ActionResult {
        require(input.quantity_lost > 0, "quantity lost must be positive")?;
        require(input.weight_lost_kg > 0.0, "weight lost must be positive")?;
        require(!input.cause.trim().is_empty(), "cause is required")?;

        let payload = to_payload(&input)?;
        let depends = TempIds::is_temp(input.stocking_id);
        let outcome = self
            .submit(MORTALITY_ENDPOINT, payload, depends, false)
            .await?;

        let lost = input.quantity_lost;
        let pond_id = self
            .update_batch(input.stocking_id, |batch| batch.deplete(lost))
            .await?;

        if let Some(pond_id) = pond_id {
            self.settle(
                pond_id,
                &outcome,
                &[keys::ANALYTICS.to_string(), keys::history(pond_id)],
            )
            .await?;
        } else {
            invalidate(&self.store, [keys::ANALYTICS]).await?;
        }
        Ok(outcome)
    }

    /// Register a pond from its mapped outline.
    pub async fn create_pond(&self, mut input: NewPond) -> ActionResult {
        require(!input.name.trim().is_empty(), "pond name is required")?;
        require(input.coordinates.len() >= 3, "a pond needs at least 3 points")?;

        let online_payload = to_payload(&input)?;
        let outcome = self
            .submit(PONDS_ENDPOINT, online_payload, false, true)
            .await?;

        let record = match &outcome {
            ActionOutcome::Sent(Value::Object(body)) => body.clone(),
            ActionOutcome::Sent(_) => return Ok(outcome),
            ActionOutcome::Queued { temp_id, .. } => {
                if input.location_desc.is_none() {
                    input.location_desc = Some(PENDING_LOCATION.to_string());
                }
                let mut record = match to_payload(&input)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                if let Some(temp_id) = temp_id {
                    record.insert("id".into(), Value::from(*temp_id));
                }
                record.insert("total_fish".into(), Value::from(0));
                record.insert("current_fish_type".into(), Value::from(""));
                record.insert("last_stocked_at".into(), Value::Null);
                record
            }
        };

        if let Some(pond_id) = record.get("id").and_then(lenient_i64) {
            self.store
                .put_json(&keys::pond_detail(pond_id), &record)
                .await?;
            self.upsert_pond_list(pond_id, record).await?;
        }
        invalidate(&self.store, [keys::ANALYTICS]).await?;
        Ok(outcome)
    }

    /// Send now if possible, else enqueue.
    async fn submit(
        &self,
        endpoint: &str,
        payload: Value,
        depends_on_pending: bool,
        creates_entity: bool,
    ) -> ActionResult {
        let reason = if depends_on_pending {
            QueueReason::DependsOnPending
        } else if !self.connectivity.is_online().await {
            QueueReason::Offline
        } else {
            let request = Request::write(Method::Post, endpoint, payload.clone());
            match self.remote.execute(&request).await {
                Ok(body) => {
                    tracing::info!(endpoint = %endpoint, "Action sent");
                    return Ok(ActionOutcome::Sent(body));
                }
                Err(RemoteError::Rejected { status, message }) => {
                    tracing::warn!(endpoint = %endpoint, status, message = %message, "Action rejected");
                    return Err(ActionError::Rejected { status, message });
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Server unreachable, queueing action");
                    QueueReason::ServerUnreachable
                }
            }
        };

        let mut payload = payload;
        if endpoint == PONDS_ENDPOINT {
            if let Some(fields) = payload.as_object_mut() {
                fields
                    .entry("location_desc")
                    .or_insert_with(|| Value::from(PENDING_LOCATION));
            }
        }

        let temp_id = if creates_entity {
            Some(self.temp_ids.next().await?)
        } else {
            None
        };
        self.queue
            .enqueue(endpoint, payload, Method::Post, temp_id)
            .await?;

        Ok(ActionOutcome::Queued { temp_id, reason })
    }

    /// After the caches are updated: drop derived caches and refresh the
    /// pond aggregate.
    async fn settle(
        &self,
        pond_id: i64,
        outcome: &ActionOutcome,
        stale: &[String],
    ) -> Result<(), ActionError> {
        if let ActionOutcome::Sent(_) = outcome {
            invalidate(&self.store, stale).await?;
        } else {
            invalidate(&self.store, [keys::ANALYTICS]).await?;
        }
        self.reconciler.reconcile_pond_aggregates(pond_id).await?;
        Ok(())
    }

    /// Append a batch to the pond's cached list and the global list.
    async fn add_batch(&self, pond_id: i64, batch: StockBatch) -> Result<(), Error> {
        let pond_key = keys::pond_active_stock(pond_id);
        let mut pond_batches = self.reconciler.local_batches(pond_id).await?;
        pond_batches.push(batch.clone());
        self.store.put_json(&pond_key, &pond_batches).await?;

        if let Some(list) = self.store.get_json::<Vec<Value>>(keys::ACTIVE_STOCK).await? {
            let mut global = decode_batches(list);
            global.push(batch);
            self.store.put_json(keys::ACTIVE_STOCK, &global).await?;
        }
        Ok(())
    }

    /// Apply `change` to a cached batch wherever it is cached. Returns the
    /// batch's pond when it was found.
    async fn update_batch<F>(&self, stocking_id: i64, change: F) -> Result<Option<i64>, Error>
    where
        F: Fn(&mut StockBatch),
    {
        let mut pond_id = None;

        if let Some(list) = self.store.get_json::<Vec<Value>>(keys::ACTIVE_STOCK).await? {
            let mut global = decode_batches(list);
            if let Some(batch) = global.iter_mut().find(|b| b.id == Some(stocking_id)) {
                change(batch);
                pond_id = batch.pond_id;
                self.store.put_json(keys::ACTIVE_STOCK, &global).await?;
            }
        }

        let candidates = match pond_id {
            Some(id) => vec![id],
            None => self.cached_pond_ids().await?,
        };

        for candidate in candidates {
            let key = keys::pond_active_stock(candidate);
            let Some(list) = self.store.get_json::<Vec<Value>>(&key).await? else {
                continue;
            };
            let mut batches = decode_batches(list);
            if let Some(batch) = batches.iter_mut().find(|b| b.id == Some(stocking_id)) {
                change(batch);
                self.store.put_json(&key, &batches).await?;
                pond_id = Some(candidate);
                break;
            }
        }

        if pond_id.is_none() {
            tracing::debug!(stocking_id, "Batch not in any local cache");
        }
        Ok(pond_id)
    }

    async fn cached_pond_ids(&self) -> Result<Vec<i64>, Error> {
        let list = self
            .store
            .get_json::<Vec<Value>>(keys::PONDS_LIST)
            .await?
            .unwrap_or_default();
        Ok(list
            .iter()
            .filter_map(|p| p.get("id").and_then(lenient_i64))
            .collect())
    }

    async fn upsert_pond_list(&self, pond_id: i64, record: Map<String, Value>) -> Result<(), Error> {
        let mut list = self
            .store
            .get_json::<Vec<Value>>(keys::PONDS_LIST)
            .await?
            .unwrap_or_default();

        match list.iter_mut().find(|p| same_id(p.get("id"), pond_id)) {
            Some(entry) => *entry = Value::Object(record),
            None => list.push(Value::Object(record)),
        }
        self.store.put_json(keys::PONDS_LIST, &list).await
    }
}

fn require(condition: bool, message: &str) -> Result<(), ActionError> {
    if condition {
        Ok(())
    } else {
        Err(ActionError::Invalid(message.to_string()))
    }
}

fn to_payload<T: Serialize>(input: &T) -> Result<Value, ActionError> {
    serde_json::to_value(input).map_err(|e| ActionError::Invalid(e.to_string()))
}

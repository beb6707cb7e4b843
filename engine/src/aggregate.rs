//! Aggregate reconciliation for pond records.
//!
//! A pond record carries three derived fields: `total_fish`,
//! `current_fish_type` and `last_stocked_at`. They are copied into every
//! cache that holds the pond (detail, legacy detail, pond list), so each
//! recomputation rewrites all of them, one after another.
//!
//! # Algorithm
//!
//! 1. Ask the server for the pond (forced refresh)
//! 2. If it answered, take its aggregate and stamp `_source: "server"`
//! 3. Otherwise recompute from the locally cached active stock batches
//! 4. Write the merged record to every pond cache

use crate::error::Result;
use crate::fetcher::{CacheAside, FetchOptions, Fetched, Origin, SOURCE_FIELD, UPDATED_AT_FIELD};
use crate::keys;
use crate::queue::TempIds;
use crate::remote::{Remote, RemoteError, Request};
use crate::store::JsonStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Where an aggregate was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateSource {
    /// Taken from the server's pond record
    Server,
    /// Recomputed from cached stock batches
    LocalCache,
    /// No active batches were cached
    LocalCacheEmpty,
}

/// Derived per-pond stock summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PondAggregate {
    pub total_fish: i64,
    pub current_fish_type: String,
    pub last_stocked_at: Option<String>,
    #[serde(rename = "_source")]
    pub source: AggregateSource,
    #[serde(rename = "_local_updated_at")]
    pub updated_at: String,
}

impl PondAggregate {
    /// Aggregate for a pond with no active batches.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total_fish: 0,
            current_fish_type: String::new(),
            last_stocked_at: None,
            source: AggregateSource::LocalCacheEmpty,
            updated_at: now.to_rfc3339(),
        }
    }

    /// Read the aggregate the server put on a pond record.
    pub fn from_server_record(record: &Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            total_fish: record.get("total_fish").and_then(lenient_i64).unwrap_or(0),
            current_fish_type: record
                .get("current_fish_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            last_stocked_at: record
                .get("last_stocked_at")
                .and_then(Value::as_str)
                .map(str::to_string),
            source: AggregateSource::Server,
            updated_at: now.to_rfc3339(),
        }
    }

    /// Compute the aggregate from cached batches.
    ///
    /// Only active batches count. Species names are de-duplicated
    /// case-insensitively, keeping the first spelling seen.
    pub fn from_batches(batches: &[StockBatch], now: DateTime<Utc>) -> Self {
        let active: Vec<&StockBatch> = batches.iter().filter(|b| b.is_active()).collect();
        if active.is_empty() {
            return Self::empty(now);
        }

        let total_fish = active
            .iter()
            .fold(0i64, |total, b| total.saturating_add(b.remaining()));

        let mut seen = HashSet::new();
        let mut species = Vec::new();
        for name in active.iter().filter_map(|b| b.fry_type.as_deref()) {
            let name = name.trim();
            if !name.is_empty() && seen.insert(name.to_lowercase()) {
                species.push(name);
            }
        }

        let last_stocked_at = active
            .iter()
            .filter_map(|b| b.stocking_date.as_deref())
            .max_by_key(|d| (parse_stock_date(d), d.to_string()))
            .map(str::to_string);

        Self {
            total_fish,
            current_fish_type: species.join(", "),
            last_stocked_at,
            source: AggregateSource::LocalCache,
            updated_at: now.to_rfc3339(),
        }
    }

    /// Copy the aggregate fields onto a pond record.
    pub fn apply_to(&self, record: &mut Map<String, Value>) {
        record.insert("total_fish".into(), Value::from(self.total_fish));
        record.insert(
            "current_fish_type".into(),
            Value::from(self.current_fish_type.clone()),
        );
        record.insert(
            "last_stocked_at".into(),
            self.last_stocked_at
                .clone()
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        record.insert(
            SOURCE_FIELD.into(),
            serde_json::to_value(self.source).unwrap_or(Value::Null),
        );
        record.insert(UPDATED_AT_FIELD.into(), Value::from(self.updated_at.clone()));
    }
}

/// One cached stocking batch.
///
/// Cached batches come from several screens and server versions, so field
/// names and number encodings vary; unknown fields are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockBatch {
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub pond_id: Option<i64>,
    #[serde(default, alias = "species", skip_serializing_if = "Option::is_none")]
    pub fry_type: Option<String>,
    #[serde(
        default,
        alias = "qty",
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_quantity: Option<i64>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub fry_quantity: Option<i64>,
    #[serde(default, alias = "date", skip_serializing_if = "Option::is_none")]
    pub stocking_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_depleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StockBatch {
    /// Fish still in the pond from this batch.
    pub fn remaining(&self) -> i64 {
        self.current_quantity.or(self.fry_quantity).unwrap_or(0)
    }

    /// Whether the batch still counts toward the pond's stock.
    pub fn is_active(&self) -> bool {
        let closed_status = self.status.as_deref().is_some_and(|s| {
            matches!(
                s.to_ascii_lowercase().as_str(),
                "depleted" | "harvested" | "closed"
            )
        });

        self.remaining() > 0
            && self.active != Some(false)
            && self.is_depleted != Some(true)
            && !closed_status
    }

    /// Mark the batch as fully harvested.
    pub fn close(&mut self) {
        self.current_quantity = Some(0);
        self.is_depleted = Some(true);
        self.active = Some(false);
    }

    /// Remove `lost` fish; closes the batch when nothing remains.
    pub fn deplete(&mut self, lost: i64) {
        let left = (self.remaining() - lost).max(0);
        self.current_quantity = Some(left);
        if left == 0 {
            self.close();
        }
    }

    fn from_cached(value: Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(batch) => Some(batch),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable stock batch");
                None
            }
        }
    }
}

/// Decode a cached list of batches, skipping unreadable entries.
pub fn decode_batches(list: Vec<Value>) -> Vec<StockBatch> {
    list.into_iter().filter_map(StockBatch::from_cached).collect()
}

/// Accept integers, floats and numeric strings as ids and counts.
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(lenient_i64))
}

/// Read an integer from a JSON number or numeric string.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering key for stocking dates in any of the formats the app has written.
fn parse_stock_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Keeps pond aggregates consistent across every cache that holds them.
#[derive(Clone)]
pub struct AggregateReconciler {
    fetcher: CacheAside,
    remote: Arc<dyn Remote>,
    pond_fresh_for: Duration,
}

impl std::fmt::Debug for AggregateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateReconciler")
            .field("pond_fresh_for", &self.pond_fresh_for)
            .finish_non_exhaustive()
    }
}

impl AggregateReconciler {
    pub fn new(fetcher: CacheAside, remote: Arc<dyn Remote>, pond_fresh_for: Duration) -> Self {
        Self {
            fetcher,
            remote,
            pond_fresh_for,
        }
    }

    fn store(&self) -> &JsonStore {
        self.fetcher.store()
    }

    /// Recompute the aggregate for `pond_id` and write it everywhere.
    ///
    /// Returns the merged pond record, or `None` when the pond is unknown to
    /// both the server and every local cache.
    pub async fn reconcile_pond_aggregates(&self, pond_id: i64) -> Result<Option<Value>> {
        let detail_key = keys::pond_detail(pond_id);

        // Placeholder ponds only exist locally
        let cached_detail = if TempIds::is_temp(pond_id) {
            self.store().get_json::<Value>(&detail_key).await?
        } else {
            let fetched = self
                .fetcher
                .fetch(&detail_key, || self.fetch_pond(pond_id), FetchOptions::force())
                .await?;

            match fetched {
                Fetched {
                    origin: Origin::Network,
                    value: Some(Value::Object(record)),
                } => {
                    let aggregate = PondAggregate::from_server_record(&record, Utc::now());
                    tracing::debug!(
                        pond_id,
                        total_fish = aggregate.total_fish,
                        "Pond aggregate from server"
                    );
                    return Ok(Some(self.write_everywhere(pond_id, record, &aggregate).await?));
                }
                Fetched { value, .. } => value,
            }
        };

        let batches = self.local_batches(pond_id).await?;
        let base = match cached_detail {
            Some(Value::Object(record)) => Some(record),
            _ => self.list_entry(pond_id).await?,
        };

        if base.is_none() && batches.is_empty() {
            tracing::debug!(pond_id, "Nothing cached for pond, skipping reconciliation");
            return Ok(None);
        }

        let aggregate = PondAggregate::from_batches(&batches, Utc::now());
        let mut record = base.unwrap_or_default();
        record.entry("id").or_insert(Value::from(pond_id));
        let merged = self.write_everywhere(pond_id, record, &aggregate).await?;

        tracing::info!(
            pond_id,
            total_fish = aggregate.total_fish,
            source = ?aggregate.source,
            "Pond aggregate recomputed locally"
        );
        Ok(Some(merged))
    }

    /// Read a pond's detail record, trusting a recent server copy.
    pub async fn load_pond(&self, pond_id: i64) -> Result<Option<Value>> {
        let detail_key = keys::pond_detail(pond_id);
        let fetched = self
            .fetcher
            .fetch(
                &detail_key,
                || self.fetch_pond(pond_id),
                FetchOptions::fresh_for(self.pond_fresh_for),
            )
            .await?;

        match (fetched.origin, fetched.value) {
            (Origin::Network, Some(Value::Object(record))) => {
                let aggregate = PondAggregate::from_server_record(&record, Utc::now());
                Ok(Some(self.write_everywhere(pond_id, record, &aggregate).await?))
            }
            (_, value) => Ok(value),
        }
    }

    /// Active stock batches cached for `pond_id`.
    ///
    /// The per-pond list wins; the global active list filtered by pond is
    /// the fallback.
    pub async fn local_batches(&self, pond_id: i64) -> Result<Vec<StockBatch>> {
        if let Some(list) = self
            .store()
            .get_json::<Vec<Value>>(&keys::pond_active_stock(pond_id))
            .await?
        {
            return Ok(decode_batches(list));
        }

        let global = self
            .store()
            .get_json::<Vec<Value>>(keys::ACTIVE_STOCK)
            .await?
            .unwrap_or_default();
        Ok(decode_batches(global)
            .into_iter()
            .filter(|b| b.pond_id == Some(pond_id))
            .collect())
    }

    async fn fetch_pond(&self, pond_id: i64) -> std::result::Result<Value, RemoteError> {
        self.remote
            .execute(&Request::get(format!("/api/ponds/{pond_id}")))
            .await
    }

    async fn list_entry(&self, pond_id: i64) -> Result<Option<Map<String, Value>>> {
        let list = self
            .store()
            .get_json::<Vec<Value>>(keys::PONDS_LIST)
            .await?
            .unwrap_or_default();

        Ok(list.into_iter().find_map(|entry| match entry {
            Value::Object(map) if same_id(map.get("id"), pond_id) => Some(map),
            _ => None,
        }))
    }

    /// Stamp `record` and write it to the detail key, the legacy detail key
    /// (only if an older release left one) and the pond list entry.
    async fn write_everywhere(
        &self,
        pond_id: i64,
        mut record: Map<String, Value>,
        aggregate: &PondAggregate,
    ) -> Result<Value> {
        aggregate.apply_to(&mut record);
        let merged = Value::Object(record);

        self.store()
            .put_json(&keys::pond_detail(pond_id), &merged)
            .await?;

        let legacy_key = keys::legacy_pond_detail(pond_id);
        if self.store().get_raw(&legacy_key).await?.is_some() {
            self.store().put_json(&legacy_key, &merged).await?;
        }

        if let Some(mut list) = self.store().get_json::<Vec<Value>>(keys::PONDS_LIST).await? {
            let mut touched = false;
            for entry in list.iter_mut() {
                if let Value::Object(map) = entry {
                    if same_id(map.get("id"), pond_id) {
                        aggregate.apply_to(map);
                        touched = true;
                    }
                }
            }
            if touched {
                self.store().put_json(keys::PONDS_LIST, &list).await?;
            }
        }

        Ok(merged)
    }
}

/// Compare a cached id (number or numeric string) with `pond_id`.
pub(crate) fn same_id(value: Option<&Value>, pond_id: i64) -> bool {
    value.and_then(lenient_i64) == Some(pond_id)
}

//! End-to-end tests for aquapin-engine
//!
//! These drive the assembled [`Engine`] through offline sessions, reconnects
//! and sync passes against an in-memory backend.

use aquapin_engine::{
    invalidate, ActionOutcome, Engine, JsonStore, KeyValueStore, ManualConnectivity,
    MemoryStore, Method, NewHarvest, NewPond, NewStocking, PondAggregate, Remote, RemoteError,
    Request, StockBatch, SyncConfig,
};
use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Backend double: canned replies per path, every request recorded.
#[derive(Default)]
struct Backend {
    replies: Mutex<HashMap<String, Result<Value, RemoteError>>>,
    log: Mutex<Vec<Request>>,
}

impl Backend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn reply(&self, path: &str, reply: Result<Value, RemoteError>) {
        self.replies.lock().unwrap().insert(path.to_string(), reply);
    }

    fn log(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Remote for Backend {
    async fn execute(&self, request: &Request) -> Result<Value, RemoteError> {
        self.log.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .get(&request.path)
            .cloned()
            .unwrap_or_else(|| Err(RemoteError::Transport("connection refused".into())))
    }
}

fn setup(online: bool) -> (Arc<MemoryStore>, Arc<ManualConnectivity>, Arc<Backend>, Engine) {
    let raw = MemoryStore::new_shared();
    let conn = ManualConnectivity::new_shared(online);
    let backend = Backend::new();
    let engine = Engine::new(raw.clone(), conn.clone(), backend.clone(), SyncConfig::default());
    (raw, conn, backend, engine)
}

// ============================================================================
// Cache-aside
// ============================================================================

#[tokio::test]
async fn fetched_payload_survives_going_offline() {
    let (_, conn, backend, engine) = setup(true);
    let ponds = json!([{"id": 1, "name": "North"}, {"id": 2, "name": "South"}]);
    backend.reply("/api/ponds/", Ok(ponds.clone()));

    assert_eq!(engine.ponds().await.unwrap(), Some(ponds.clone()));

    conn.set_online(false);
    backend.reply("/api/ponds/", Err(RemoteError::Timeout));
    assert_eq!(engine.ponds().await.unwrap(), Some(ponds));
}

#[tokio::test]
async fn corrupt_cache_entry_is_a_miss() {
    let (raw, _, _, engine) = setup(false);
    raw.set("ACTIVE_STOCK_CACHE", "[{\"id\": 1,".into()).await.unwrap();

    assert_eq!(engine.active_stock().await.unwrap(), None);
}

// ============================================================================
// Queue replay
// ============================================================================

#[tokio::test]
async fn replay_preserves_enqueue_order() {
    let (_, _, backend, engine) = setup(true);
    for path in ["/api/stocking/", "/api/mortality/", "/api/harvest/"] {
        backend.reply(path, Ok(json!({"id": 1})));
        engine
            .queue()
            .enqueue(path, json!({"stocking_id": 1}), Method::Post, None)
            .await
            .unwrap();
    }

    engine.sync().await.unwrap();

    let order: Vec<String> = backend.log().into_iter().map(|r| r.path).collect();
    assert_eq!(order, ["/api/stocking/", "/api/mortality/", "/api/harvest/"]);
}

#[tokio::test]
async fn temp_id_resolved_for_later_operation() {
    let (_, _, backend, engine) = setup(true);
    backend.reply("/api/stocking/", Ok(json!({"id": 42})));
    backend.reply("/api/harvest/", Ok(json!({"id": 9, "revenue": 16800.0})));

    engine
        .queue()
        .enqueue(
            "/api/stocking/",
            json!({"pond_id": 7, "fry_type": "Tilapia", "fry_quantity": 100}),
            Method::Post,
            Some(-1),
        )
        .await
        .unwrap();
    engine
        .queue()
        .enqueue(
            "/api/harvest/",
            json!({"stocking_id": -1, "total_weight_kg": 120}),
            Method::Post,
            None,
        )
        .await
        .unwrap();

    engine.sync().await.unwrap();

    let harvest = backend
        .log()
        .into_iter()
        .find(|r| r.path == "/api/harvest/")
        .unwrap();
    assert_eq!(harvest.body.unwrap()["stocking_id"], 42);
}

#[tokio::test]
async fn only_failures_remain_after_sync() {
    let (_, _, backend, engine) = setup(true);
    backend.reply("/a", Ok(json!({})));
    backend.reply("/b", Err(RemoteError::Transport("reset by peer".into())));
    for path in ["/a", "/b"] {
        engine
            .queue()
            .enqueue(path, json!({}), Method::Post, None)
            .await
            .unwrap();
    }

    let report = engine.sync().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(report.message.contains("Synced 1 items, 1 failed"));

    let pending = engine.queue().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/b");
}

#[tokio::test]
async fn offline_harvest_round_trip() {
    let (_, conn, backend, engine) = setup(false);

    let outcome = engine
        .actions()
        .record_harvest(NewHarvest {
            stocking_id: 5,
            harvest_date: "2026-05-20".into(),
            total_weight_kg: 120.0,
            market_price_per_kg: 140.0,
            fish_size: "Standard".into(),
        })
        .await
        .unwrap();
    assert!(outcome.is_queued());

    let report = engine.sync().await.unwrap();
    assert!(!report.success);

    let pending = engine.queue().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/api/harvest/");
    assert_eq!(pending[0].payload["stocking_id"], 5);
    assert_eq!(pending[0].payload["total_weight_kg"], 120.0);
    let payload = pending[0].payload.clone();

    conn.set_online(true);
    backend.reply("/api/harvest/", Ok(json!({"id": 1, "revenue": 16800.0})));
    let report = engine.sync().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let sent = backend.log();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].path, "/api/harvest/");
    assert_eq!(sent[0].body, Some(payload));
    assert!(engine.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn queue_survives_engine_restart() {
    let raw = MemoryStore::new_shared();
    let conn = ManualConnectivity::new_shared(false);
    let backend = Backend::new();

    {
        let engine = Engine::new(raw.clone(), conn.clone(), backend.clone(), SyncConfig::default());
        engine
            .queue()
            .enqueue("/api/mortality/", json!({"stocking_id": 3}), Method::Post, None)
            .await
            .unwrap();
    }

    let engine = Engine::new(raw, conn, backend, SyncConfig::default());
    assert_eq!(engine.queue().len().await.unwrap(), 1);
}

#[tokio::test]
async fn client_id_is_stable_across_instances() {
    let raw = MemoryStore::new_shared();
    let conn = ManualConnectivity::new_shared(false);
    let backend = Backend::new();

    let first = Engine::new(raw.clone(), conn.clone(), backend.clone(), SyncConfig::default());
    let id = first.identity().get_or_create().await.unwrap();

    let second = Engine::new(raw, conn, backend, SyncConfig::default());
    assert_eq!(second.identity().get_or_create().await.unwrap(), id);
}

// ============================================================================
// Placeholder ids in local caches
// ============================================================================

#[tokio::test]
async fn synced_batch_is_harvestable_under_server_id() {
    let (_, conn, backend, engine) = setup(false);

    let stocked = engine
        .actions()
        .record_stocking(NewStocking {
            pond_id: 2,
            stocking_date: "2026-03-01".into(),
            fry_type: "Tilapia".into(),
            fry_quantity: 300,
        })
        .await
        .unwrap();
    assert!(stocked.is_queued());

    conn.set_online(true);
    backend.reply("/api/stocking/", Ok(json!({"id": 51})));
    assert_eq!(engine.sync().await.unwrap().succeeded, 1);

    let cached: Value = engine
        .store()
        .get_json("ACTIVE_STOCK_POND_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached[0]["id"], 51);

    backend.reply(
        "/api/stocking/active",
        Ok(json!([{
            "id": 51,
            "pond_id": 2,
            "fry_type": "Tilapia",
            "current_quantity": 300,
            "active": true
        }])),
    );
    engine.active_stock().await.unwrap();

    conn.set_online(false);
    let harvested = engine
        .actions()
        .record_harvest(NewHarvest {
            stocking_id: 51,
            harvest_date: "2026-06-01".into(),
            total_weight_kg: 150.0,
            market_price_per_kg: 120.0,
            fish_size: "Standard".into(),
        })
        .await
        .unwrap();
    assert!(harvested.is_queued());

    let pond = engine
        .reconciler()
        .reconcile_pond_aggregates(2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pond["total_fish"], 0);
}

#[tokio::test]
async fn pond_created_offline_moves_to_server_id() {
    let (_, conn, backend, engine) = setup(false);

    let created = engine
        .actions()
        .create_pond(NewPond {
            name: "East".into(),
            location_desc: Some("Barangay 4".into()),
            coordinates: vec![[14.1, 121.0], [14.1, 121.1], [14.2, 121.1]],
            image_base64: None,
        })
        .await
        .unwrap();
    let ActionOutcome::Queued {
        temp_id: Some(pond), ..
    } = created
    else {
        panic!("expected queued pond, got {created:?}");
    };

    engine
        .actions()
        .record_stocking(NewStocking {
            pond_id: pond,
            stocking_date: "2026-03-01".into(),
            fry_type: "Bangus".into(),
            fry_quantity: 100,
        })
        .await
        .unwrap();

    conn.set_online(true);
    backend.reply("/api/ponds/", Ok(json!({"id": 12, "name": "East"})));
    backend.reply("/api/stocking/", Ok(json!({"id": 60})));
    assert_eq!(engine.sync().await.unwrap().succeeded, 2);

    let store = engine.store();
    assert_eq!(store.get_raw(&format!("POND_v2_{pond}")).await.unwrap(), None);
    assert_eq!(
        store
            .get_raw(&format!("ACTIVE_STOCK_POND_{pond}"))
            .await
            .unwrap(),
        None
    );

    let detail: Value = store.get_json("POND_v2_12").await.unwrap().unwrap();
    assert_eq!(detail["id"], 12);

    let ponds: Value = store.get_json("PONDS_LIST").await.unwrap().unwrap();
    assert_eq!(ponds[0]["id"], 12);

    let stock: Value = store.get_json("ACTIVE_STOCK_POND_12").await.unwrap().unwrap();
    assert_eq!(stock[0]["id"], 60);
    assert_eq!(stock[0]["pond_id"], 12);
}

// ============================================================================
// Invalidation and aggregates
// ============================================================================

#[tokio::test]
async fn invalidation_tolerates_missing_keys() {
    let raw = MemoryStore::new_shared();
    raw.set("HISTORY_7", "[]".into()).await.unwrap();
    let store = JsonStore::new(raw.clone());

    invalidate(&store, ["HISTORY_6", "HISTORY_7"]).await.unwrap();
    assert!(raw.is_empty());
}

#[tokio::test]
async fn local_fallback_aggregate_for_pond() {
    let (_, _, _, engine) = setup(false);
    engine
        .store()
        .put_json(
            "ACTIVE_STOCK_POND_7",
            &json!([
                {"species": "Tilapia", "qty": 100, "active": true},
                {"species": "tilapia", "qty": 50, "active": true},
                {"species": "Bangus", "qty": 0, "active": true},
            ]),
        )
        .await
        .unwrap();

    let merged = engine
        .reconciler()
        .reconcile_pond_aggregates(7)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(merged["total_fish"], 150);
    assert_eq!(merged["current_fish_type"], "Tilapia");
    assert_eq!(merged["_source"], "local_cache");
}

#[tokio::test]
async fn history_pages_cached_for_offline_reading() {
    let (_, conn, backend, engine) = setup(true);
    backend.reply(
        "/api/history/4?page=1&limit=10",
        Ok(json!({"data": [{"stocking_id": 1, "revenue": 5000.0}]})),
    );

    let history = engine.history(4);
    let page = history
        .refresh(|page, size| engine.fetch_history_page(4, page, size))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(!page.has_more);

    conn.set_online(false);
    let offline = engine.history(4);
    let page = offline
        .refresh(|page, size| engine.fetch_history_page(4, page, size))
        .await
        .unwrap();
    assert_eq!(page.items[0]["revenue"], 5000.0);
}

proptest! {
    #[test]
    fn prop_aggregate_counts_only_active_fish(
        batches in proptest::collection::vec((0i64..500, any::<bool>(), 0usize..3), 0..12)
    ) {
        let species = ["Tilapia", "tilapia", "Bangus"];
        let list: Vec<StockBatch> = batches
            .iter()
            .map(|(qty, active, s)| StockBatch {
                fry_type: Some(species[*s].to_string()),
                current_quantity: Some(*qty),
                active: Some(*active),
                ..Default::default()
            })
            .collect();

        let agg = PondAggregate::from_batches(&list, Utc::now());
        let expected: i64 = batches
            .iter()
            .filter(|(qty, active, _)| *active && *qty > 0)
            .map(|(qty, _, _)| qty)
            .sum();

        prop_assert_eq!(agg.total_fish, expected);

        let names: Vec<String> = agg
            .current_fish_type
            .split(", ")
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect();
        let unique: HashSet<&String> = names.iter().collect();
        prop_assert_eq!(names.len(), unique.len());
        prop_assert!(names.len() <= 2);
    }
}

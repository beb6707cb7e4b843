//! Carry resolved placeholder ids into the local caches.
//!
//! Records created offline are cached under their temp id. Once a sync pass
//! learns the server ids, every cached copy is renamed so later actions and
//! reconciliation find those records under their real ids.

use crate::aggregate::lenient_i64;
use crate::error::Result;
use crate::keys;
use crate::store::JsonStore;
use crate::sync::IdentifierMap;
use serde_json::Value;
use std::collections::HashSet;

/// Fields of cached records that may hold a temp id.
const ID_FIELDS: [&str; 3] = ["id", "pond_id", "stocking_id"];

/// Rewrite every cached reference to a resolved temp id.
///
/// Pond-keyed entries (`POND_v2_<temp>`, `ACTIVE_STOCK_POND_<temp>`, ...)
/// move to the real id. An entry already cached under the real id wins over
/// the placeholder copy. `ponds` names the ponds whose stock lists may hold
/// placeholder batches; the ponds in `PONDS_LIST` are always scanned too.
pub async fn apply_resolved_ids(
    store: &JsonStore,
    resolved: &IdentifierMap,
    ponds: &HashSet<i64>,
) -> Result<()> {
    if resolved.is_empty() {
        return Ok(());
    }

    for (&temp, &real) in resolved {
        move_entry(store, &keys::pond_detail(temp), &keys::pond_detail(real), resolved).await?;
        move_entry(
            store,
            &keys::legacy_pond_detail(temp),
            &keys::legacy_pond_detail(real),
            resolved,
        )
        .await?;
        move_entry(
            store,
            &keys::pond_active_stock(temp),
            &keys::pond_active_stock(real),
            resolved,
        )
        .await?;
        store.remove(&keys::history(temp)).await?;
    }

    rewrite_entry(store, keys::PONDS_LIST, resolved).await?;
    rewrite_entry(store, keys::ACTIVE_STOCK, resolved).await?;

    let mut scan: HashSet<i64> = ponds
        .iter()
        .map(|id| resolved.get(id).copied().unwrap_or(*id))
        .collect();
    if let Some(Value::Array(list)) = store.get_json::<Value>(keys::PONDS_LIST).await? {
        scan.extend(list.iter().filter_map(|p| p.get("id").and_then(lenient_i64)));
    }
    for pond_id in scan {
        rewrite_entry(store, &keys::pond_active_stock(pond_id), resolved).await?;
    }

    tracing::debug!(resolved = resolved.len(), "Renamed placeholder ids in local caches");
    Ok(())
}

/// Move `from` to `to` with its ids rewritten, unless `to` already exists.
async fn move_entry(store: &JsonStore, from: &str, to: &str, resolved: &IdentifierMap) -> Result<()> {
    let Some(mut value) = store.get_json::<Value>(from).await? else {
        return Ok(());
    };

    if store.get_raw(to).await?.is_none() {
        rewrite_value(&mut value, resolved);
        store.put_json(to, &value).await?;
    }
    store.remove(from).await?;
    tracing::debug!(from = %from, to = %to, "Moved placeholder cache entry");
    Ok(())
}

/// Rewrite ids in place under `key`, writing back only on change.
async fn rewrite_entry(store: &JsonStore, key: &str, resolved: &IdentifierMap) -> Result<()> {
    let Some(mut value) = store.get_json::<Value>(key).await? else {
        return Ok(());
    };
    if rewrite_value(&mut value, resolved) {
        store.put_json(key, &value).await?;
    }
    Ok(())
}

/// Rewrite a record, or each record of a list. Returns whether anything
/// changed.
fn rewrite_value(value: &mut Value, resolved: &IdentifierMap) -> bool {
    match value {
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rewrite_record(item, resolved) || changed),
        record => rewrite_record(record, resolved),
    }
}

fn rewrite_record(record: &mut Value, resolved: &IdentifierMap) -> bool {
    let Some(fields) = record.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    for field in ID_FIELDS {
        if let Some(value) = fields.get_mut(field) {
            if let Some(real) = lenient_i64(value).and_then(|id| resolved.get(&id)) {
                *value = Value::from(*real);
                changed = true;
            }
        }
    }
    changed
}

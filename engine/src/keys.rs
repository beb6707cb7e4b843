//! Durable store key layout.
//!
//! These names are the on-disk format of the app's local state and must stay
//! stable across upgrades.

/// Pending mutations, in enqueue order.
pub const QUEUE: &str = "OFFLINE_ACTION_QUEUE";

/// Mutations the server kept rejecting, parked for manual review.
pub const DEAD_LETTER: &str = "OFFLINE_ACTION_DEAD_LETTER";

/// Queue entries that could not be decoded, kept verbatim for recovery.
pub const UNREADABLE_ACTIONS: &str = "OFFLINE_ACTION_UNREADABLE";

/// Last temp id handed out (a negative integer).
pub const TEMP_ID_SEQ: &str = "TEMP_ID_SEQ";

/// Per-installation identifier sent with every request.
pub const CLIENT_ID: &str = "AQUAPIN_CLIENT_ID";

/// RFC 3339 time of the last sync pass that confirmed at least one item.
pub const LAST_SYNC_TIME: &str = "LAST_SYNC_TIME";

/// User override for the backend host.
pub const SERVER_IP: &str = "SERVER_IP";

/// All ponds, as shown on the pond list screen.
pub const PONDS_LIST: &str = "PONDS_LIST";

/// Every active stocking batch across all ponds.
pub const ACTIVE_STOCK: &str = "ACTIVE_STOCK_CACHE";

/// Dashboard analytics snapshot.
pub const ANALYTICS: &str = "ANALYTICS_CACHE";

/// Per-pond detail record.
pub fn pond_detail(pond_id: i64) -> String {
    format!("POND_v2_{pond_id}")
}

/// Detail key written by older releases; refreshed only when present.
pub fn legacy_pond_detail(pond_id: i64) -> String {
    format!("POND_{pond_id}")
}

/// Active stocking batches of one pond.
pub fn pond_active_stock(pond_id: i64) -> String {
    format!("ACTIVE_STOCK_POND_{pond_id}")
}

/// Closed-cycle history pages of one pond.
pub fn history(pond_id: i64) -> String {
    format!("HISTORY_{pond_id}")
}

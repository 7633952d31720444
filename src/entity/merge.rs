//! Recency and sub-element merge rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::Call;

/// Decides whether an update may supersede the stored record.
///
/// An update without `recorded_at` can never prove it is fresher, so it is
/// rejected even when the stored record has no timestamp either. A stored
/// record without a timestamp yields to any timestamped update.
#[must_use]
pub fn accepts(stored: Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) -> bool {
    match (stored, incoming) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(stored), Some(incoming)) => incoming > stored,
    }
}

/// Merges two call sequences by `order`, letting incoming calls win.
///
/// The result is sorted by `order` and contains each order once. Orders only
/// present in `stored` survive untouched.
#[must_use]
pub fn merge_by_order(stored: Vec<Call>, incoming: Vec<Call>) -> Vec<Call> {
    let mut by_order: BTreeMap<u32, Call> = stored.into_iter().map(|c| (c.order, c)).collect();
    for call in incoming {
        by_order.insert(call.order, call);
    }
    by_order.into_values().collect()
}

/// Sorts calls by `order`, keeping the last occurrence of a duplicated order.
#[must_use]
pub fn normalize_calls(calls: Vec<Call>) -> Vec<Call> {
    merge_by_order(Vec::new(), calls)
}

//! Minimal timestamp helper — epoch seconds, no external date crate.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ts() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

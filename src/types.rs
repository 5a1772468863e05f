//! Shared primitive helpers

use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::net::types::{InstanceKind, NodeId};

/// Current UNIX time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::time::Duration;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Execution identifier (also the process instance id for the root).
pub type ExecutionId = Uuid;

/// Process instance identifier, which is the id of the root execution.
pub type ProcessInstanceId = Uuid;

pub type JobId = Uuid;

pub type VariableId = Uuid;

/// Optimistic-lock version counter. New entities start at 0 in memory and
/// are written with revision 1.
pub type Revision = u32;

/// Wall-clock instant (UTC).
pub type Timestamp = DateTime<Utc>;

/// Time-ordered ids, so store listings come back in creation order.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// `ts + d`, saturating at the far end of the representable range.
pub fn add_duration(ts: Timestamp, d: Duration) -> Timestamp {
    let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    ts.checked_add_signed(TimeDelta::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

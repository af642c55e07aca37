//! The per-run concurrency primitive (`locks` table).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default lock TTL, in seconds, used when acquiring.
pub const DEFAULT_LOCK_TTL_SECONDS: i64 = 3600;

/// Lifecycle status of a [`Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Completed,
}

/// The per-run concurrency primitive. Exactly one controller invocation
/// may hold an `active` lock for a given `run_id` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub run_id: String,
    pub orchestrator_id: String,
    pub status: LockStatus,
    pub acquired_at: DateTime<Utc>,
    pub ttl: i64,
    pub flow_id: String,
    pub trace_id: String,
}

impl Lock {
    /// Build a fresh `active` lock for `run_id`, with a newly generated `orchestrator_id`.
    pub fn acquire(run_id: &str, flow_id: &str, trace_id: &str, now: DateTime<Utc>) -> Self {
        Lock {
            run_id: run_id.to_string(),
            orchestrator_id: uuid::Uuid::new_v4().to_string(),
            status: LockStatus::Active,
            acquired_at: now,
            ttl: now.timestamp() + DEFAULT_LOCK_TTL_SECONDS,
            flow_id: flow_id.to_string(),
            trace_id: trace_id.to_string(),
        }
    }

    /// `true` iff a fresh acquire attempt against the current lock state would succeed.
    ///
    /// Per the conditional-write semantics of invariant 4: succeeds iff no
    /// lock exists yet, or the existing lock's status is `completed`.
    /// Deliberately does **not** consider `ttl` — an expired but still
    /// `active` lock is not takeable; a stuck holder must release it
    /// explicitly or an operator must intervene.
    pub fn acquirable(existing: Option<&Lock>) -> bool {
        match existing {
            None => true,
            Some(lock) => lock.status == LockStatus::Completed,
        }
    }

    /// Mark this lock `completed`, releasing it.
    pub fn release(&mut self) {
        self.status = LockStatus::Completed;
    }
}

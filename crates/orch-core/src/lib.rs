// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! orch-core

pub mod event;
pub mod ids;
pub mod job;
pub mod lock;
pub mod record;

pub use event::{EventType, OrderEvent, JOB_ORDER_NAME};
pub use job::{ExecutionTarget, Job, JobCodecError, Order, SsmTargets};
pub use lock::{Lock, LockStatus, DEFAULT_LOCK_TTL_SECONDS};
pub use record::{
    resolve_job_status, status_update_fields, JobStatus, OrderRecord, OrderStatus, StatusSummary,
    ORDER_RECORD_TTL_SECONDS,
};

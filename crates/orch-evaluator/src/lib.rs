// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-evaluator
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

use orch_core::{OrderRecord, OrderStatus};

/// The outcome of evaluating a run's queued orders against the current
/// status of their dependencies.
#[derive(Debug, Clone, Default)]
pub struct Evaluation<'a> {
    /// Orders whose dependencies are all satisfied; dispatch these next.
    pub ready: Vec<&'a OrderRecord>,
    /// Orders that must be transitioned to `failed` with
    /// `failure_reason = "dependency_failed"`.
    pub cascade_failed: Vec<&'a OrderRecord>,
    /// Orders still blocked on an in-flight dependency.
    pub waiting: Vec<&'a OrderRecord>,
}

/// Classify every `queued` record in `records` against the dependency
/// states visible in the same snapshot.
///
/// Non-`queued` records are ignored: they are already dispatched or
/// terminal and no longer subject to evaluation. An unresolved `queue_id`
/// in a dependency list is treated as `queued` (unresolved, causes
/// waiting) — deliberately, so the evaluator stays monotonic even if a
/// malformed dependency slipped past validation.
pub fn evaluate(records: &[OrderRecord]) -> Evaluation<'_> {
    let index: BTreeMap<&str, &OrderRecord> = records
        .iter()
        .map(|r| (r.queue_id.as_str(), r))
        .collect();

    let mut eval = Evaluation::default();
    for record in records {
        if record.status != OrderStatus::Queued {
            continue;
        }
        match classify(record, &index) {
            Classification::Ready => eval.ready.push(record),
            Classification::CascadeFailed => eval.cascade_failed.push(record),
            Classification::Waiting => eval.waiting.push(record),
        }
    }
    eval
}

enum Classification {
    Ready,
    CascadeFailed,
    Waiting,
}

fn dependency_status(queue_id: &str, index: &BTreeMap<&str, &OrderRecord>) -> OrderStatus {
    index
        .get(queue_id)
        .map(|r| r.status)
        .unwrap_or(OrderStatus::Queued)
}

fn classify(record: &OrderRecord, index: &BTreeMap<&str, &OrderRecord>) -> Classification {
    if record.dependencies.is_empty() {
        return Classification::Ready;
    }

    let states: Vec<OrderStatus> = record
        .dependencies
        .iter()
        .map(|dep| dependency_status(dep, index))
        .collect();

    let all_succeeded = states.iter().all(|s| *s == OrderStatus::Succeeded);
    if all_succeeded {
        return Classification::Ready;
    }

    let any_unsatisfied = states
        .iter()
        .any(|s| matches!(s, OrderStatus::Failed | OrderStatus::TimedOut));
    let any_in_flight = states
        .iter()
        .any(|s| matches!(s, OrderStatus::Queued | OrderStatus::Running));

    if any_unsatisfied && record.must_succeed {
        return Classification::CascadeFailed;
    }
    if any_unsatisfied && !record.must_succeed && !any_in_flight {
        return Classification::Ready;
    }
    Classification::Waiting
}

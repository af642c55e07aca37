//! `KeyValueStore`: the `orders`, `order_events`, and `locks` tables.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use orch_core::{Lock, OrderEvent, OrderRecord, OrderStatus};

use crate::error::StoreError;

/// Outcome of a conditional lock-acquire attempt.
#[derive(Debug, Clone)]
pub enum LockAcquireOutcome {
    /// No lock existed, or the existing lock was `completed`; this caller
    /// now holds it.
    Acquired(Lock),
    /// Another `active` lock already exists; the caller must not act.
    Contended,
}

/// The three durable tables the engine depends on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Insert or overwrite an order record.
    async fn put_order(&self, record: OrderRecord) -> Result<(), StoreError>;
    /// Fetch a single order record by its composite primary key.
    async fn get_order(&self, pk: &str) -> Result<Option<OrderRecord>, StoreError>;
    /// Fetch every order record belonging to `run_id`.
    async fn get_all_orders(&self, run_id: &str) -> Result<Vec<OrderRecord>, StoreError>;
    /// Apply a partial field update to an order record (status transition).
    async fn update_order_status(
        &self,
        pk: &str,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError>;
    /// Append a progress event. Events are additive; never updated or deleted.
    async fn put_event(&self, event: OrderEvent) -> Result<(), StoreError>;
    /// Fetch every event for `trace_id`, ordered causally.
    async fn get_events(&self, trace_id: &str) -> Result<Vec<OrderEvent>, StoreError>;
    /// Fetch the most recent event for `(trace_id, order_name)`, if any.
    async fn get_latest_event(
        &self,
        trace_id: &str,
        order_name: &str,
    ) -> Result<Option<OrderEvent>, StoreError>;
    /// Attempt to acquire the per-run lock via conditional write.
    async fn acquire_lock(
        &self,
        run_id: &str,
        flow_id: &str,
        trace_id: &str,
    ) -> Result<LockAcquireOutcome, StoreError>;
    /// Release a lock this caller holds, identified by `orchestrator_id`.
    async fn release_lock(&self, run_id: &str, orchestrator_id: &str) -> Result<(), StoreError>;
    /// Fetch the current lock state for `run_id`, if any.
    async fn get_lock(&self, run_id: &str) -> Result<Option<Lock>, StoreError>;
}

#[derive(Default)]
struct Tables {
    orders: BTreeMap<String, OrderRecord>,
    /// `run_id -> [pk]` secondary index.
    run_index: BTreeMap<String, Vec<String>>,
    /// `(event, tie-breaker counter)`; the counter disambiguates events
    /// landing in the same whole-second `epoch` without redefining the
    /// documented `<order_name>:<epoch>` sort-key shape.
    events: BTreeMap<String, Vec<(OrderEvent, u64)>>,
    locks: BTreeMap<String, Lock>,
}

/// An in-process, `RwLock`-guarded reference implementation of
/// [`KeyValueStore`], grounded entirely in memory (no file persistence —
/// see `orch-store::object` for the file-backed object store).
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    tables: RwLock<Tables>,
    next_event_seq: AtomicU64,
}

impl InMemoryKeyValueStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn put_order(&self, record: OrderRecord) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("orders table lock poisoned".into()))?;
        let pk = record.pk();
        tables
            .run_index
            .entry(record.run_id.clone())
            .or_default()
            .push(pk.clone());
        tables.orders.insert(pk, record);
        Ok(())
    }

    async fn get_order(&self, pk: &str) -> Result<Option<OrderRecord>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Internal("orders table lock poisoned".into()))?;
        Ok(tables.orders.get(pk).cloned())
    }

    async fn get_all_orders(&self, run_id: &str) -> Result<Vec<OrderRecord>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Internal("orders table lock poisoned".into()))?;
        let pks = tables.run_index.get(run_id).cloned().unwrap_or_default();
        Ok(pks
            .into_iter()
            .filter_map(|pk| tables.orders.get(&pk).cloned())
            .collect())
    }

    async fn update_order_status(
        &self,
        pk: &str,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("orders table lock poisoned".into()))?;
        let record = tables
            .orders
            .get_mut(pk)
            .ok_or_else(|| StoreError::NotFound(format!("order {pk}")))?;
        apply_status_fields(record, &fields)?;
        Ok(())
    }

    async fn put_event(&self, event: OrderEvent) -> Result<(), StoreError> {
        let seq = self.next_event_seq.fetch_add(1, Ordering::SeqCst);
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("events table lock poisoned".into()))?;
        tables.events.entry(event.trace_id.clone()).or_default().push((event, seq));
        Ok(())
    }

    async fn get_events(&self, trace_id: &str) -> Result<Vec<OrderEvent>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Internal("events table lock poisoned".into()))?;
        let mut events = tables.events.get(trace_id).cloned().unwrap_or_default();
        // Sort key is `(epoch, counter)`: the counter is an appended
        // tie-breaker disambiguating same-second writes without changing
        // the documented `<order_name>:<epoch>` key shape.
        events.sort_by_key(|(e, seq)| (e.epoch, *seq));
        Ok(events.into_iter().map(|(e, _)| e).collect())
    }

    async fn get_latest_event(
        &self,
        trace_id: &str,
        order_name: &str,
    ) -> Result<Option<OrderEvent>, StoreError> {
        let events = self.get_events(trace_id).await?;
        Ok(events.into_iter().filter(|e| e.order_name == order_name).next_back())
    }

    async fn acquire_lock(
        &self,
        run_id: &str,
        flow_id: &str,
        trace_id: &str,
    ) -> Result<LockAcquireOutcome, StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("locks table lock poisoned".into()))?;
        let existing = tables.locks.get(run_id);
        if Lock::acquirable(existing) {
            let lock = Lock::acquire(run_id, flow_id, trace_id, Utc::now());
            tables.locks.insert(run_id.to_string(), lock.clone());
            Ok(LockAcquireOutcome::Acquired(lock))
        } else {
            Ok(LockAcquireOutcome::Contended)
        }
    }

    async fn release_lock(&self, run_id: &str, orchestrator_id: &str) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("locks table lock poisoned".into()))?;
        if let Some(lock) = tables.locks.get_mut(run_id) {
            if lock.orchestrator_id == orchestrator_id {
                lock.release();
            }
        }
        Ok(())
    }

    async fn get_lock(&self, run_id: &str) -> Result<Option<Lock>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Internal("locks table lock poisoned".into()))?;
        Ok(tables.locks.get(run_id).cloned())
    }
}

fn apply_status_fields(
    record: &mut OrderRecord,
    fields: &BTreeMap<String, serde_json::Value>,
) -> Result<(), StoreError> {
    if let Some(v) = fields.get("status") {
        record.status = serde_json::from_value::<OrderStatus>(v.clone())
            .map_err(|e| StoreError::Internal(format!("bad status field: {e}")))?;
    }
    if let Some(v) = fields.get("last_update") {
        record.last_update = serde_json::from_value(v.clone())
            .map_err(|e| StoreError::Internal(format!("bad last_update field: {e}")))?;
    }
    if let Some(v) = fields.get("log") {
        record.log = v.as_str().map(str::to_string);
    }
    if let Some(v) = fields.get("failure_reason") {
        record.failure_reason = v.as_str().map(str::to_string);
    }
    Ok(())
}

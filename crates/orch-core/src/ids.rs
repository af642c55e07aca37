//! Identifier generation and structured-string helpers.
//!
//! `trace_id`, `run_id`, and `flow_id` are the correlation keys threaded
//! through every durable record and event; `order_num` is the zero-padded
//! ordinal used in composite keys. See the engine's data model for the
//! exact encoding of each.

use rand::RngCore;

/// Generate an 8-hex-character trace id from cryptographic randomness.
///
/// Mirrors `secrets.token_hex(4)`: 4 random bytes, hex-encoded.
pub fn generate_trace_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a fresh run id (UUIDv4, lowercase hyphenated form).
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an 8-hex-character search tag, used as the PR-comment search
/// string when the caller does not supply one.
pub fn generate_search_tag() -> String {
    generate_trace_id()
}

/// Build `flow_id = "<username>:<trace_id>-<flow_label>"`.
pub fn generate_flow_id(username: &str, trace_id: &str, flow_label: &str) -> String {
    format!("{username}:{trace_id}-{flow_label}")
}

/// Split a `flow_id` back into `(username, trace_id, flow_label)`.
///
/// Splits on the first `:` to separate the username, then on the *last*
/// `-` in the remainder to separate the trace id from the flow label.
/// Trace ids are mandated to be lowercase hex and therefore `-`-free, so
/// the last-`-` split is unambiguous.
pub fn parse_flow_id(flow_id: &str) -> Option<(String, String, String)> {
    let (username, rest) = flow_id.split_once(':')?;
    let (trace_id, flow_label) = rest.rsplit_once('-')?;
    Some((username.to_string(), trace_id.to_string(), flow_label.to_string()))
}

/// Zero-pad an order's 1-based ordinal to the fixed `order_num` width.
///
/// `index` is the order's 0-based position in the job's order list.
pub fn order_num(index: usize) -> String {
    format!("{:04}", index + 1)
}

/// Build the composite `OrderRecord` primary key `"<run_id>:<order_num>"`.
pub fn order_pk(run_id: &str, order_num: &str) -> String {
    format!("{run_id}:{order_num}")
}

/// Create a "leg" token scoping a single sub-operation within a trace.
///
/// Legs are a supplemental correlation mechanism, not part of the
/// required data model: a leg lets a long operation (e.g. one git clone
/// shared by several orders) log under a stable sub-identifier without
/// polluting the primary `trace_id` dimension.
pub fn create_leg(trace_id: &str, leg_name: &str) -> String {
    format!("{trace_id}/{leg_name}")
}

/// Split a leg token back into `(trace_id, leg_name)`.
pub fn parse_leg(leg: &str) -> Option<(String, String)> {
    let (trace_id, leg_name) = leg.split_once('/')?;
    Some((trace_id.to_string(), leg_name.to_string()))
}

// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod kv;
mod object;
mod retry;
mod secret;

pub use error::StoreError;
pub use kv::{InMemoryKeyValueStore, KeyValueStore, LockAcquireOutcome};
pub use object::{presigned_path, presigned_url_is_valid, parse_presigned_expiry, FileObjectStore, ObjectStore};
pub use retry::with_retry;
pub use secret::{InMemorySecretStore, SecretStore};

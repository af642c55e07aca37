//! Unified error taxonomy with stable error codes for the job orchestrator.
//!
//! Every engine error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use the builder returned by
//! [`OrchError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed job submission, rejected before a run is created.
    Validation,
    /// Key-value/object-store errors expected to clear on retry.
    StoreTransient,
    /// Key-value/object-store errors that never clear (permission, not-found).
    StoreHard,
    /// Back-end dispatch failures.
    Dispatch,
    /// Lock acquisition / contention.
    Lock,
    /// Envelope-encryption failures.
    Crypto,
    /// Git resolution / clone / checkout failures.
    Git,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::StoreTransient => "store_transient",
            Self::StoreHard => "store_hard",
            Self::Dispatch => "dispatch",
            Self::Lock => "lock",
            Self::Crypto => "crypto",
            Self::Git => "git",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string guaranteed not
/// to change across patch releases, so callers can match on stable codes
/// rather than message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Job has no orders.
    ValidationEmptyOrders,
    /// An order has no commands.
    ValidationEmptyCmds,
    /// An order's timeout is not positive.
    ValidationBadTimeout,
    /// An order's `execution_target` did not resolve to a known back-end.
    ValidationUnknownTarget,
    /// `execution_target = agent` but `ssm_targets` names no instance or tag.
    ValidationMissingSsmTargets,
    /// Neither an `s3_location` nor a resolvable git source was supplied.
    ValidationMissingCodeSource,
    /// The submitted job payload failed to decode.
    ValidationMalformedPayload,

    // -- Store (transient) --
    /// The underlying store reported throttling; retries exhausted.
    StoreThrottled,

    // -- Store (hard) --
    /// Caller lacks permission for the requested store operation.
    StorePermissionDenied,
    /// The requested key/object does not exist.
    StoreNotFound,

    // -- Dispatch --
    /// The selected back-end rejected or failed the dispatch call.
    DispatchFailed,

    // -- Lock --
    /// A conditional lock-acquire attempt lost to a concurrent holder.
    LockContended,

    // -- Crypto --
    /// Envelope encryption of the assembled environment failed.
    CryptoEncryptFailed,
    /// Envelope decryption failed (bad key or corrupt ciphertext).
    CryptoDecryptFailed,

    // -- Git --
    /// All resolution strategies (token HTTPS, SSH, anonymous HTTPS) failed.
    GitCloneFailed,
    /// The requested commit or sub-folder does not exist in the clone.
    GitCheckoutFailed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationEmptyOrders
            | Self::ValidationEmptyCmds
            | Self::ValidationBadTimeout
            | Self::ValidationUnknownTarget
            | Self::ValidationMissingSsmTargets
            | Self::ValidationMissingCodeSource
            | Self::ValidationMalformedPayload => ErrorCategory::Validation,

            Self::StoreThrottled => ErrorCategory::StoreTransient,

            Self::StorePermissionDenied | Self::StoreNotFound => ErrorCategory::StoreHard,

            Self::DispatchFailed => ErrorCategory::Dispatch,

            Self::LockContended => ErrorCategory::Lock,

            Self::CryptoEncryptFailed | Self::CryptoDecryptFailed => ErrorCategory::Crypto,

            Self::GitCloneFailed | Self::GitCheckoutFailed => ErrorCategory::Git,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"VALIDATION_EMPTY_ORDERS"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationEmptyOrders => "VALIDATION_EMPTY_ORDERS",
            Self::ValidationEmptyCmds => "VALIDATION_EMPTY_CMDS",
            Self::ValidationBadTimeout => "VALIDATION_BAD_TIMEOUT",
            Self::ValidationUnknownTarget => "VALIDATION_UNKNOWN_TARGET",
            Self::ValidationMissingSsmTargets => "VALIDATION_MISSING_SSM_TARGETS",
            Self::ValidationMissingCodeSource => "VALIDATION_MISSING_CODE_SOURCE",
            Self::ValidationMalformedPayload => "VALIDATION_MALFORMED_PAYLOAD",
            Self::StoreThrottled => "STORE_TRANSIENT_THROTTLED",
            Self::StorePermissionDenied => "STORE_HARD_PERMISSION_DENIED",
            Self::StoreNotFound => "STORE_HARD_NOT_FOUND",
            Self::DispatchFailed => "DISPATCH_FAILED",
            Self::LockContended => "LOCK_CONTENDED",
            Self::CryptoEncryptFailed => "CRYPTO_ENCRYPT_FAILED",
            Self::CryptoDecryptFailed => "CRYPTO_DECRYPT_FAILED",
            Self::GitCloneFailed => "GIT_CLONE_FAILED",
            Self::GitCheckoutFailed => "GIT_CHECKOUT_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrchError
// ---------------------------------------------------------------------------

/// Unified orchestrator error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use orch_error::{ErrorCode, OrchError};
///
/// let err = OrchError::new(ErrorCode::DispatchFailed, "build service rejected request")
///     .with_context("order_num", "0003")
///     .with_context("execution_target", "build");
/// ```
pub struct OrchError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl OrchError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// `true` iff this error's category is one the caller should retry
    /// (a throttled store call, safe to retry with backoff).
    pub fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::StoreTransient)
    }
}

impl fmt::Debug for OrchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("OrchError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for OrchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for OrchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serializable snapshot of an [`OrchError`] (without the opaque source),
/// the shape surfaced to submitters and HTTP-gateway callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&OrchError> for OrchErrorDto {
    fn from(err: &OrchError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<OrchErrorDto> for OrchError {
    fn from(dto: OrchErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

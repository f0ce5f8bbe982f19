//! Error types for the Loupe domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

use crate::item::ContextItemType;
use crate::session::SessionId;

/// The top-level error type for all Loupe operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Context selection errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Generation provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Message persistence errors ---
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    // --- Storage backend errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors from context selection and hydration.
///
/// `AlreadySelected`, `LimitExceeded`, and `ItemNotFound` are surfaced to the
/// caller with actionable detail and are never retried.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("Item already selected: {item_type} {item_id}")]
    AlreadySelected {
        item_type: ContextItemType,
        item_id: String,
    },

    #[error("Selection limit exceeded for {scope}: limit {limit}, attempted {attempted}")]
    LimitExceeded {
        scope: String,
        limit: usize,
        attempted: usize,
    },

    #[error("Item not found in knowledge store: {item_type} {item_id}")]
    ItemNotFound {
        item_type: ContextItemType,
        item_id: String,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors from the message persistence pipeline.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl PersistError {
    /// Whether the caller may retry the operation unchanged.
    ///
    /// Validation and not-found failures are terminal; storage failures
    /// are transient and retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Errors from a generation provider.
///
/// These are retried with backoff, then trigger the fallback generation
/// path — they are never surfaced raw to the caller.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Malformed provider output: {0}")]
    MalformedOutput(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Errors from a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

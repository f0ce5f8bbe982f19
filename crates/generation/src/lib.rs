//! Generation providers for Loupe.
//!
//! Three pieces, composed by the orchestrator:
//! - [`HttpProvider`] — a `reqwest` client for a structured generation
//!   endpoint (the primary path).
//! - [`RetryingProvider`] — wraps any provider with per-attempt timeouts,
//!   bounded retries, and exponential backoff.
//! - [`FallbackGenerator`] — the locally-executed path used when the
//!   structured provider is exhausted: its own prompt construction,
//!   free-text parsing into a tagged [`ParseOutcome`], lexical confidence
//!   scoring, relevance-based attribute assignment, and placeholder
//!   padding so the requested result count is always met.

pub mod fallback;
pub mod http;
pub mod retry;

pub use fallback::{FallbackGenerator, ParseOutcome, REQUIRED_QUESTION_PREFIX};
pub use http::HttpProvider;
pub use retry::RetryingProvider;

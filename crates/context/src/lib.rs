//! Per-session context state management.
//!
//! The [`ContextStateManager`] owns the set of knowledge items selected for
//! each session: add/remove/clear with ceiling enforcement, hydration of
//! full content from the knowledge store, reference validation, best-effort
//! usage tracking, and a typed publish/subscribe channel with per-subscriber
//! failure isolation.
//!
//! Concurrency model: mutations are serialized per session (single writer
//! at a time), reads are served from a short-lived versioned cache, and
//! event delivery never blocks the mutating operation. Sessions are fully
//! independent — there are no cross-session locks.

mod cache;
mod events;
mod manager;

pub use cache::SessionCache;
pub use events::{EventHandler, SubscriberRegistry, SubscriptionId};
pub use manager::{
    ContextStateManager, HydrateOptions, HydratedContext, SortOrder, ValidationReport,
};

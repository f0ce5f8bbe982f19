//! The streaming orchestration layer for Loupe.
//!
//! Wires the classifier, context state manager, budget manager, generation
//! providers, and persistence pipeline into one request loop:
//!
//! ```text
//! request → persist user turn → classify intent → hydrate context
//!         → budget gate → dispatch handler → stream chunks
//!         → persist assistant turn → done
//! ```
//!
//! Transports (HTTP, WebSocket, CLI) sit on top of
//! [`Orchestrator::handle`], which returns an ordered chunk stream per
//! request.

mod chunk;
mod handlers;
mod orchestrator;
mod pipeline;

pub use chunk::{ContextStatus, ItemPreview, PickerEntry, ResponseChunk};
pub use orchestrator::{ChatRequest, Orchestrator, RequestPhase};
pub use pipeline::{AssistantDraft, AssistantReceipt, MessagePipeline, UserReceipt};

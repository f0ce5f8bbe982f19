//! The streaming orchestration loop.
//!
//! One request per session runs concurrently with others. Each request
//! walks the phases `received → intent_detected → context_loaded →
//! dispatched → streaming → persisted → complete`; the `error` phase is
//! reachable from any step, emits a terminal error chunk, and still
//! best-effort persists a failure-tagged assistant turn so the audit log
//! is complete even for failed exchanges.
//!
//! Cancellation: chunk sends fail once the caller drops the receiver; the
//! handler stops emitting and whatever partial assistant content existed
//! is persisted with `error_code = "cancelled"`.

use std::sync::Arc;
use std::time::Instant;

use loupe_budget::{BudgetLevel, TokenBudgetManager};
use loupe_config::ChatConfig;
use loupe_context::{ContextStateManager, HydrateOptions, SortOrder};
use loupe_core::error::{ContextError, PersistError};
use loupe_core::generation::GenerationProvider;
use loupe_core::intent::Intent;
use loupe_core::item::ItemRef;
use loupe_core::knowledge::KnowledgeStore;
use loupe_core::message::MessageQuery;
use loupe_core::session::{Session, SessionId};
use loupe_core::store::{MessageStore, SessionStore};
use loupe_core::usage::{ItemUtilization, UsageEvent};
use loupe_generation::FallbackGenerator;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunk::ResponseChunk;
use crate::pipeline::{AssistantDraft, MessagePipeline};

/// A chat request from the transport layer.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// The raw user utterance
    pub message: String,
    /// Existing session, or `None` to start one
    pub session_id: Option<SessionId>,
    /// The requesting user
    pub user_id: String,
    /// Explicit context references attached to this message
    pub context_refs: Vec<ItemRef>,
}

/// Phase of a request, recorded in logs for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    IntentDetected,
    ContextLoaded,
    Dispatched,
    Streaming,
    Persisted,
    Complete,
    Error,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::IntentDetected => "intent_detected",
            Self::ContextLoaded => "context_loaded",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::Persisted => "persisted",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// The receiver dropped mid-stream; carries whatever content was emitted.
pub(crate) struct Cancelled(pub String);

/// A terminal request failure, mapped onto a wire error code.
pub(crate) struct RequestFailure {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl RequestFailure {
    fn from_context(e: ContextError) -> Self {
        match e {
            ContextError::SessionNotFound(_) => Self {
                code: "not_found",
                message: e.to_string(),
                retryable: false,
            },
            ContextError::Storage(_) => Self {
                code: "persistence_error",
                message: e.to_string(),
                retryable: true,
            },
            ContextError::LimitExceeded { .. } => Self {
                code: "limit_exceeded",
                message: e.to_string(),
                retryable: false,
            },
            _ => Self {
                code: "validation_error",
                message: e.to_string(),
                retryable: false,
            },
        }
    }

    fn from_persist(e: PersistError) -> Self {
        let retryable = e.is_retryable();
        let code = match e {
            PersistError::SessionNotFound(_) => "not_found",
            PersistError::Validation(_) => "validation_error",
            PersistError::Storage(_) => "persistence_error",
        };
        Self {
            code,
            message: e.to_string(),
            retryable,
        }
    }
}

/// What a dispatch handler produced.
pub(crate) struct HandlerOutput {
    pub text: String,
    pub refs_used: Vec<ItemRef>,
    pub model: Option<String>,
    pub utilizations: Vec<ItemUtilization>,
}

/// How a dispatch handler can end early.
pub(crate) enum HandlerError {
    Cancelled { partial: String },
}

/// Send one chunk, detecting caller cancellation.
pub(crate) async fn send_chunk(
    tx: &mpsc::Sender<ResponseChunk>,
    chunk: ResponseChunk,
) -> Result<(), Cancelled> {
    tx.send(chunk).await.map_err(|_| Cancelled(String::new()))
}

/// Stream text as word-grouped incremental message chunks.
///
/// On cancellation, returns the prefix that was actually delivered.
pub(crate) async fn stream_text(
    tx: &mpsc::Sender<ResponseChunk>,
    text: &str,
) -> Result<(), Cancelled> {
    const WORDS_PER_CHUNK: usize = 8;

    let words: Vec<&str> = text.split(' ').collect();
    debug!(
        words = words.len(),
        phase = RequestPhase::Streaming.as_str(),
        "Streaming response text"
    );
    let mut sent = String::new();
    for group in words.chunks(WORDS_PER_CHUNK) {
        let mut piece = group.join(" ");
        if sent.len() + piece.len() < text.len() {
            piece.push(' ');
        }
        if tx
            .send(ResponseChunk::Message {
                content: piece.clone(),
            })
            .await
            .is_err()
        {
            return Err(Cancelled(sent));
        }
        sent.push_str(&piece);
    }
    Ok(())
}

/// The top-level control loop: detect intent → load context → dispatch →
/// stream → persist.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) context: Arc<ContextStateManager>,
    pub(crate) budget: Arc<TokenBudgetManager>,
    pub(crate) pipeline: Arc<MessagePipeline>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) messages: Arc<dyn MessageStore>,
    pub(crate) knowledge: Arc<dyn KnowledgeStore>,
    pub(crate) structured: Option<Arc<dyn GenerationProvider>>,
    pub(crate) fallback: Arc<FallbackGenerator>,
    pub(crate) chat: ChatConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<ContextStateManager>,
        budget: Arc<TokenBudgetManager>,
        pipeline: Arc<MessagePipeline>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        structured: Option<Arc<dyn GenerationProvider>>,
        fallback: Arc<FallbackGenerator>,
        chat: ChatConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                budget,
                pipeline,
                sessions,
                messages,
                knowledge,
                structured,
                fallback,
                chat,
            }),
        }
    }

    /// Handle one request, returning the chunk stream immediately.
    pub fn handle(&self, request: ChatRequest) -> mpsc::Receiver<ResponseChunk> {
        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(request, tx).await;
        });
        rx
    }
}

impl Inner {
    async fn run(self: Arc<Self>, request: ChatRequest, tx: mpsc::Sender<ResponseChunk>) {
        let started = Instant::now();
        debug!(user_id = %request.user_id, phase = RequestPhase::Received.as_str(), "Chat request received");

        // ── Session ───────────────────────────────────────────────────────
        let session = match self.ensure_session(&request).await {
            Ok(session) => session,
            Err(failure) => {
                self.fail(&tx, None, Intent::default(), "", started, failure).await;
                return;
            }
        };
        let session_id = session.id.clone();

        // ── Persist the user turn (classifies intent on the way in) ───────
        let receipt = match self
            .pipeline
            .persist_user(&session_id, &request.message, request.context_refs.clone())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                let failure = RequestFailure::from_persist(e);
                self.fail(&tx, Some(&session_id), Intent::default(), "", started, failure)
                    .await;
                return;
            }
        };
        let intent = receipt.classification.intent;
        debug!(
            session_id = %session_id,
            intent = %intent,
            confidence = receipt.classification.confidence,
            phase = RequestPhase::IntentDetected.as_str(),
            "Intent detected"
        );

        if send_chunk(
            &tx,
            ResponseChunk::Metadata {
                session_id: session_id.clone(),
                message_id: receipt.message_id.clone(),
                intent,
                confidence: receipt.classification.confidence,
            },
        )
        .await
        .is_err()
        {
            self.persist_cancelled(&session_id, intent, "", started).await;
            return;
        }

        // ── Load and hydrate context ──────────────────────────────────────
        let hydrated = match self
            .context
            .hydrate(
                &session_id,
                HydrateOptions {
                    include_usage: true,
                    sort: Some(SortOrder::Recency),
                },
            )
            .await
        {
            Ok(hydrated) => hydrated,
            Err(e) => {
                let failure = RequestFailure::from_context(e);
                self.fail(&tx, Some(&session_id), intent, "", started, failure).await;
                return;
            }
        };
        if !hydrated.missing.is_empty() {
            warn!(
                session_id = %session_id,
                missing = hydrated.missing.len(),
                "Some selected items no longer resolve"
            );
        }
        debug!(
            session_id = %session_id,
            items = hydrated.items.len(),
            phase = RequestPhase::ContextLoaded.as_str(),
            "Context loaded"
        );

        // ── Budget gate before any generation call ────────────────────────
        let history = self
            .messages
            .list(
                &session_id,
                &MessageQuery {
                    limit: 500,
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_default();
        let mut items = hydrated.items;
        let status = self.budget.status(&history, &items);
        if status.level == BudgetLevel::Exceeded {
            let outcome = self.budget.truncate_to_fit(history, items, None);
            info!(
                session_id = %session_id,
                removed_items = outcome.removed_items,
                removed_messages = outcome.removed_messages,
                removed_tokens = outcome.removed_tokens,
                "Budget exceeded, truncated working set"
            );
            items = outcome.items;
        }

        // ── Dispatch ──────────────────────────────────────────────────────
        debug!(session_id = %session_id, intent = %intent, phase = RequestPhase::Dispatched.as_str(), "Dispatching handler");
        let result = self
            .dispatch(&tx, &session_id, intent, &request.message, &items)
            .await;

        match result {
            Ok(output) => {
                // ── Persist the assistant turn ────────────────────────────
                let mut draft = AssistantDraft::new(
                    output.text.clone(),
                    intent,
                    started.elapsed().as_millis() as u64,
                );
                draft.context_refs = output.refs_used;
                draft.model = output.model;
                draft.temperature = Some(self.chat.temperature);

                match self.pipeline.persist_assistant(&session_id, draft).await {
                    Ok(assistant_receipt) => {
                        debug!(
                            session_id = %session_id,
                            message_id = %assistant_receipt.message_id,
                            phase = RequestPhase::Persisted.as_str(),
                            "Assistant turn persisted"
                        );

                        if !output.utilizations.is_empty() {
                            self.context
                                .record_usage(UsageEvent::new(
                                    session_id.clone(),
                                    assistant_receipt.message_id.clone(),
                                    intent,
                                    output.utilizations,
                                ))
                                .await;
                        }

                        let _ = send_chunk(
                            &tx,
                            ResponseChunk::Done {
                                session_id: session_id.clone(),
                                message_id: assistant_receipt.message_id,
                                tokens_used: receipt.tokens + assistant_receipt.tokens,
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        )
                        .await;
                        debug!(session_id = %session_id, phase = RequestPhase::Complete.as_str(), "Request complete");
                    }
                    Err(e) => {
                        let failure = RequestFailure::from_persist(e);
                        self.fail(&tx, Some(&session_id), intent, &output.text, started, failure)
                            .await;
                    }
                }
            }
            Err(HandlerError::Cancelled { partial }) => {
                self.persist_cancelled(&session_id, intent, &partial, started).await;
            }
        }
    }

    async fn ensure_session(&self, request: &ChatRequest) -> Result<Session, RequestFailure> {
        match &request.session_id {
            Some(id) => match self.sessions.get(id).await {
                Ok(Some(session)) => Ok(session),
                Ok(None) => Err(RequestFailure {
                    code: "not_found",
                    message: format!("session {id} not found"),
                    retryable: false,
                }),
                Err(e) => Err(RequestFailure {
                    code: "persistence_error",
                    message: e.to_string(),
                    retryable: true,
                }),
            },
            None => {
                let session = Session::new(&request.user_id);
                self.sessions
                    .create(session.clone())
                    .await
                    .map_err(|e| RequestFailure {
                        code: "persistence_error",
                        message: e.to_string(),
                        retryable: true,
                    })?;
                info!(session_id = %session.id, user_id = %request.user_id, "Session created");
                Ok(session)
            }
        }
    }

    /// Emit a terminal error chunk and write the best-effort audit record.
    async fn fail(
        &self,
        tx: &mpsc::Sender<ResponseChunk>,
        session_id: Option<&SessionId>,
        intent: Intent,
        partial: &str,
        started: Instant,
        failure: RequestFailure,
    ) {
        warn!(
            code = failure.code,
            message = %failure.message,
            phase = RequestPhase::Error.as_str(),
            "Request failed"
        );
        let _ = send_chunk(
            tx,
            ResponseChunk::Error {
                code: failure.code.to_string(),
                message: failure.message.clone(),
                retryable: failure.retryable,
            },
        )
        .await;

        if let Some(session_id) = session_id {
            let mut draft =
                AssistantDraft::new(partial, intent, started.elapsed().as_millis() as u64);
            draft.error_code = Some(failure.code.to_string());
            draft.error_message = Some(failure.message);
            if let Err(e) = self.pipeline.persist_assistant(session_id, draft).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist failure audit record");
            }
        }
    }

    /// Best-effort persistence of a cancelled turn's partial content.
    async fn persist_cancelled(
        &self,
        session_id: &SessionId,
        intent: Intent,
        partial: &str,
        started: Instant,
    ) {
        info!(session_id = %session_id, partial_len = partial.len(), "Request cancelled by caller");
        let mut draft = AssistantDraft::new(partial, intent, started.elapsed().as_millis() as u64);
        draft.error_code = Some("cancelled".to_string());
        draft.error_message = Some("stream receiver dropped before completion".to_string());
        if let Err(e) = self.pipeline.persist_assistant(session_id, draft).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist cancelled turn");
        }
    }
}

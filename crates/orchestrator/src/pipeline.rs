//! The message persistence pipeline.
//!
//! Validates and durably appends user/assistant turns with their full
//! processing metadata. Every storage failure is caught, logged with
//! context, and converted into a typed [`PersistError`] — a storage
//! exception never escapes uncaught into the orchestration loop.

use std::sync::Arc;

use loupe_core::error::PersistError;
use loupe_core::intent::{Intent, IntentClassification};
use loupe_core::item::ItemRef;
use loupe_core::message::ChatMessage;
use loupe_core::session::SessionId;
use loupe_core::store::{MessageStore, SessionStore};
use loupe_intent::IntentClassifier;
use loupe_tokens::TokenCounter;
use tracing::{debug, error};

/// Receipt for a persisted user turn.
#[derive(Debug, Clone)]
pub struct UserReceipt {
    pub message_id: String,
    pub tokens: u32,
    pub classification: IntentClassification,
}

/// Receipt for a persisted assistant turn.
#[derive(Debug, Clone)]
pub struct AssistantReceipt {
    pub message_id: String,
    pub tokens: u32,
}

/// Everything an assistant turn must carry. Intent is a required field —
/// an assistant message without the intent that produced it is rejected by
/// construction.
#[derive(Debug, Clone)]
pub struct AssistantDraft {
    pub content: String,
    pub intent: Intent,
    pub processing_ms: u64,
    pub context_refs: Vec<ItemRef>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl AssistantDraft {
    pub fn new(content: impl Into<String>, intent: Intent, processing_ms: u64) -> Self {
        Self {
            content: content.into(),
            intent,
            processing_ms,
            context_refs: Vec::new(),
            model: None,
            temperature: None,
            error_code: None,
            error_message: None,
        }
    }
}

/// Validates, classifies, counts, and appends chat turns.
pub struct MessagePipeline {
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    classifier: Arc<IntentClassifier>,
    counter: Arc<TokenCounter>,
    max_content_chars: usize,
}

impl MessagePipeline {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        classifier: Arc<IntentClassifier>,
        counter: Arc<TokenCounter>,
        max_content_chars: usize,
    ) -> Self {
        Self {
            sessions,
            messages,
            classifier,
            counter,
            max_content_chars,
        }
    }

    /// Persist a user turn: validate, classify intent, count tokens,
    /// append, and accumulate session token usage.
    pub async fn persist_user(
        &self,
        session_id: &SessionId,
        content: &str,
        context_refs: Vec<ItemRef>,
    ) -> Result<UserReceipt, PersistError> {
        self.validate_content(content)?;
        Self::validate_refs(&context_refs)?;
        self.ensure_session(session_id).await?;

        let classification = self.classifier.classify(content);
        let tokens = self.counter.count(content) as u32;

        let mut message = ChatMessage::user(session_id.clone(), content);
        message.intent = Some(classification.intent);
        message.token_count = tokens;
        message.context_refs = context_refs;

        let message_id = self
            .messages
            .append(message)
            .await
            .map_err(|e| {
                error!(session_id = %session_id, error = %e, "Failed to persist user message");
                PersistError::Storage(e.to_string())
            })?;
        self.accumulate_tokens(session_id, tokens).await;

        debug!(
            session_id = %session_id,
            message_id = %message_id,
            intent = %classification.intent,
            tokens,
            "User turn persisted"
        );
        Ok(UserReceipt {
            message_id,
            tokens,
            classification,
        })
    }

    /// Persist an assistant turn with its processing metadata.
    pub async fn persist_assistant(
        &self,
        session_id: &SessionId,
        draft: AssistantDraft,
    ) -> Result<AssistantReceipt, PersistError> {
        // Empty content is only acceptable on a failed turn.
        if draft.content.trim().is_empty() && draft.error_code.is_none() {
            return Err(PersistError::Validation(
                "assistant content must not be empty".into(),
            ));
        }
        Self::validate_refs(&draft.context_refs)?;
        self.ensure_session(session_id).await?;

        let tokens = self.counter.count(&draft.content) as u32;

        let mut message = ChatMessage::assistant(session_id.clone(), &draft.content, draft.intent);
        message.processing_ms = Some(draft.processing_ms);
        message.token_count = tokens;
        message.context_refs = draft.context_refs;
        message.model = draft.model;
        message.temperature = draft.temperature;
        message.error_code = draft.error_code;
        message.error_message = draft.error_message;

        let message_id = self
            .messages
            .append(message)
            .await
            .map_err(|e| {
                error!(session_id = %session_id, error = %e, "Failed to persist assistant message");
                PersistError::Storage(e.to_string())
            })?;
        self.accumulate_tokens(session_id, tokens).await;

        debug!(
            session_id = %session_id,
            message_id = %message_id,
            intent = %draft.intent,
            tokens,
            "Assistant turn persisted"
        );
        Ok(AssistantReceipt { message_id, tokens })
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn validate_content(&self, content: &str) -> Result<(), PersistError> {
        if content.trim().is_empty() {
            return Err(PersistError::Validation("message content is empty".into()));
        }
        if content.chars().count() > self.max_content_chars {
            return Err(PersistError::Validation(format!(
                "message content exceeds {} characters",
                self.max_content_chars
            )));
        }
        Ok(())
    }

    fn validate_refs(refs: &[ItemRef]) -> Result<(), PersistError> {
        for item_ref in refs {
            if item_ref.item_id.trim().is_empty() {
                return Err(PersistError::Validation(format!(
                    "context reference of type {} has an empty id",
                    item_ref.item_type
                )));
            }
        }
        Ok(())
    }

    async fn ensure_session(&self, session_id: &SessionId) -> Result<(), PersistError> {
        match self.sessions.get(session_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(PersistError::SessionNotFound(session_id.clone())),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session lookup failed");
                Err(PersistError::Storage(e.to_string()))
            }
        }
    }

    /// Token accounting is bookkeeping, not part of the persistence
    /// contract — failures are logged and swallowed.
    async fn accumulate_tokens(&self, session_id: &SessionId, tokens: u32) {
        if let Err(e) = self.sessions.add_token_usage(session_id, tokens as u64).await {
            error!(session_id = %session_id, error = %e, "Failed to accumulate session token usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::item::ContextItemType;
    use loupe_core::message::MessageQuery;
    use loupe_core::session::Session;
    use loupe_store::InMemoryStore;

    struct Fixture {
        pipeline: MessagePipeline,
        store: Arc<InMemoryStore>,
        session_id: SessionId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let session = Session::new("user-1");
        let session_id = session.id.clone();
        SessionStore::create(store.as_ref(), session).await.unwrap();

        let pipeline = MessagePipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(IntentClassifier::default()),
            Arc::new(TokenCounter::default()),
            100,
        );
        Fixture {
            pipeline,
            store,
            session_id,
        }
    }

    #[tokio::test]
    async fn user_turn_round_trip() {
        let fx = fixture().await;
        let receipt = fx
            .pipeline
            .persist_user(&fx.session_id, "What insights do we have?", vec![])
            .await
            .unwrap();

        assert!(receipt.tokens > 0);
        assert_eq!(
            receipt.classification.intent,
            loupe_core::intent::Intent::RetrieveInsights
        );

        let messages = MessageStore::list(
            fx.store.as_ref(),
            &fx.session_id,
            &MessageQuery::default(),
        )
        .await
        .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, receipt.message_id);
        assert_eq!(messages[0].content, "What insights do we have?");
        assert_eq!(messages[0].intent, Some(receipt.classification.intent));
        assert_eq!(messages[0].token_count, receipt.tokens);
    }

    #[tokio::test]
    async fn assistant_turn_carries_metadata() {
        let fx = fixture().await;
        let mut draft = AssistantDraft::new(
            "Here are the strongest insights.",
            loupe_core::intent::Intent::RetrieveInsights,
            420,
        );
        draft.model = Some("research-gen-1".into());
        draft.temperature = Some(0.7);
        draft.context_refs = vec![ItemRef::new(ContextItemType::Insight, "i1")];

        let receipt = fx
            .pipeline
            .persist_assistant(&fx.session_id, draft)
            .await
            .unwrap();

        let messages = MessageStore::list(
            fx.store.as_ref(),
            &fx.session_id,
            &MessageQuery::default(),
        )
        .await
        .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, receipt.message_id);
        assert_eq!(messages[0].processing_ms, Some(420));
        assert_eq!(messages[0].model.as_deref(), Some("research-gen-1"));
        assert_eq!(messages[0].context_refs.len(), 1);
    }

    #[tokio::test]
    async fn empty_content_rejected() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .persist_user(&fx.session_id, "   ", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_content_rejected() {
        let fx = fixture().await;
        let long = "x".repeat(101); // fixture limit is 100 chars
        let err = fx
            .pipeline
            .persist_user(&fx.session_id, &long, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Validation(_)));
    }

    #[tokio::test]
    async fn malformed_refs_rejected() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .persist_user(
                &fx.session_id,
                "hello",
                vec![ItemRef::new(ContextItemType::Insight, "  ")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .persist_user(&SessionId::from("ghost"), "hello", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn failed_turn_may_have_empty_content() {
        let fx = fixture().await;
        let mut draft = AssistantDraft::new("", loupe_core::intent::Intent::GeneralExploration, 10);
        draft.error_code = Some("cancelled".into());
        draft.error_message = Some("client disconnected".into());

        let receipt = fx
            .pipeline
            .persist_assistant(&fx.session_id, draft)
            .await
            .unwrap();
        assert_eq!(receipt.tokens, 0);

        let messages = MessageStore::list(
            fx.store.as_ref(),
            &fx.session_id,
            &MessageQuery::default(),
        )
        .await
        .unwrap();
        assert_eq!(messages[0].error_code.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn session_usage_accumulates() {
        let fx = fixture().await;
        fx.pipeline
            .persist_user(&fx.session_id, "first message", vec![])
            .await
            .unwrap();
        fx.pipeline
            .persist_assistant(
                &fx.session_id,
                AssistantDraft::new(
                    "a response",
                    loupe_core::intent::Intent::GeneralExploration,
                    5,
                ),
            )
            .await
            .unwrap();

        let session = SessionStore::get(fx.store.as_ref(), &fx.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.total_tokens_used > 0);
    }
}

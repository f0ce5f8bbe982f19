//! Intent-specific dispatch handlers.
//!
//! Every handler follows the same chunk discipline: a `loading` context
//! chunk first, the matching `loaded` (or `error`) chunk under the same
//! correlation id, a `picker` chunk when the results are selectable, then
//! incremental message text. Generation-heavy handlers try the structured
//! provider and fall back to local generation on any provider failure —
//! a provider error never reaches the caller raw.

use loupe_core::generation::{GenerationProvider, GenerationRequest};
use loupe_core::intent::Intent;
use loupe_core::item::{ContextItem, ContextItemType};
use loupe_core::knowledge::{KnowledgeStore, SearchQuery};
use loupe_core::session::SessionId;
use loupe_core::usage::ItemUtilization;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::chunk::{ContextStatus, ItemPreview, PickerEntry, ResponseChunk};
use crate::orchestrator::{
    Cancelled, HandlerError, HandlerOutput, Inner, send_chunk, stream_text,
};

/// Longest generated-item title before truncation.
const TITLE_CHARS: usize = 80;

impl Inner {
    pub(crate) async fn dispatch(
        &self,
        tx: &mpsc::Sender<ResponseChunk>,
        session_id: &SessionId,
        intent: Intent,
        utterance: &str,
        items: &[ContextItem],
    ) -> Result<HandlerOutput, HandlerError> {
        match intent {
            Intent::RetrieveInsights => {
                self.handle_retrieval(tx, utterance, ContextItemType::Insight, "insights")
                    .await
            }
            Intent::RetrieveMetrics => {
                self.handle_retrieval(tx, utterance, ContextItemType::Metric, "metrics")
                    .await
            }
            Intent::RetrieveJobs => {
                self.handle_retrieval(tx, utterance, ContextItemType::JobToBeDone, "jobs-to-be-done")
                    .await
            }
            Intent::GenerateQuestions | Intent::CreateSolutions => {
                self.handle_generation(tx, session_id, intent, items).await
            }
            Intent::GeneralExploration => self.handle_general(tx, utterance, items).await,
        }
    }

    /// Retrieval: ranked knowledge search scoped to one item type.
    async fn handle_retrieval(
        &self,
        tx: &mpsc::Sender<ResponseChunk>,
        utterance: &str,
        item_type: ContextItemType,
        label: &str,
    ) -> Result<HandlerOutput, HandlerError> {
        let correlation_id = Uuid::new_v4().to_string();
        send_chunk(
            tx,
            ResponseChunk::Context {
                id: correlation_id.clone(),
                status: ContextStatus::Loading,
                title: format!("Searching {label}"),
                items: vec![],
                error: None,
            },
        )
        .await
        .map_err(cancelled)?;

        let query = SearchQuery::new(utterance)
            .with_type(item_type)
            .with_limit(self.chat.search_limit);
        let hits = match self.knowledge.search(query).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Knowledge search failed");
                send_chunk(
                    tx,
                    ResponseChunk::Context {
                        id: correlation_id,
                        status: ContextStatus::Error,
                        title: format!("Searching {label}"),
                        items: vec![],
                        error: Some(e.to_string()),
                    },
                )
                .await
                .map_err(cancelled)?;
                let text = format!(
                    "I couldn't reach the knowledge store to search {label} — try again in a moment."
                );
                stream_text(tx, &text).await.map_err(cancelled)?;
                return Ok(HandlerOutput {
                    text,
                    refs_used: vec![],
                    model: None,
                    utilizations: vec![],
                });
            }
        };

        let previews: Vec<ItemPreview> = hits.iter().map(|h| ItemPreview::from(&h.item)).collect();
        send_chunk(
            tx,
            ResponseChunk::Context {
                id: correlation_id,
                status: ContextStatus::Loaded,
                title: format!("Searching {label}"),
                items: previews.clone(),
                error: None,
            },
        )
        .await
        .map_err(cancelled)?;

        send_chunk(
            tx,
            ResponseChunk::Picker {
                id: Uuid::new_v4().to_string(),
                items: previews
                    .iter()
                    .map(|preview| PickerEntry {
                        item: preview.clone(),
                        selected: false,
                    })
                    .collect(),
                actions: vec!["add_to_context".into(), "refine_search".into()],
                max_selectable: self.chat.max_selectable,
            },
        )
        .await
        .map_err(cancelled)?;

        let text = if hits.is_empty() {
            format!("I didn't find any {label} matching that — try different wording or broaden the question.")
        } else {
            let titles: Vec<String> = hits
                .iter()
                .take(3)
                .map(|h| format!("\"{}\"", h.item.title))
                .collect();
            format!(
                "Found {} {label} — the strongest matches are {}. Pick the ones to keep in context.",
                hits.len(),
                titles.join(", ")
            )
        };
        stream_text(tx, &text).await.map_err(cancelled)?;

        Ok(HandlerOutput {
            text,
            refs_used: hits.iter().map(|h| h.item.item_ref()).collect(),
            model: None,
            utilizations: hits
                .iter()
                .map(|h| ItemUtilization::new(h.item.item_ref(), h.similarity))
                .collect(),
        })
    }

    /// Question/solution generation: structured provider first, local
    /// fallback on any failure.
    async fn handle_generation(
        &self,
        tx: &mpsc::Sender<ResponseChunk>,
        _session_id: &SessionId,
        intent: Intent,
        items: &[ContextItem],
    ) -> Result<HandlerOutput, HandlerError> {
        let (label, derived_type) = match intent {
            Intent::CreateSolutions => ("solutions", ContextItemType::Solution),
            _ => ("questions", ContextItemType::HowMightWe),
        };

        let correlation_id = Uuid::new_v4().to_string();
        send_chunk(
            tx,
            ResponseChunk::Context {
                id: correlation_id.clone(),
                status: ContextStatus::Loading,
                title: format!("Generating {label}"),
                items: vec![],
                error: None,
            },
        )
        .await
        .map_err(cancelled)?;

        let count = self.chat.result_count;
        let response = match &self.structured {
            Some(provider) => {
                let request = GenerationRequest {
                    intent,
                    context: render_items(items),
                    count,
                    temperature: self.chat.temperature,
                };
                match provider.generate(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Structured generation exhausted, using fallback path");
                        self.fallback.generate(intent, items, count).await
                    }
                }
            }
            None => self.fallback.generate(intent, items, count).await,
        };

        let generated: Vec<ContextItem> = response
            .results
            .iter()
            .map(|result| {
                let mut item = ContextItem::new(
                    derived_type,
                    Uuid::new_v4().to_string(),
                    truncate_title(&result.content),
                )
                .with_content(result.content.clone());
                item.metadata = result.attributes.clone();
                item.metadata
                    .insert("confidence".into(), serde_json::json!(result.confidence));
                item
            })
            .collect();

        let previews: Vec<ItemPreview> = generated.iter().map(ItemPreview::from).collect();
        send_chunk(
            tx,
            ResponseChunk::Context {
                id: correlation_id,
                status: ContextStatus::Loaded,
                title: format!("Generating {label}"),
                items: previews.clone(),
                error: None,
            },
        )
        .await
        .map_err(cancelled)?;

        send_chunk(
            tx,
            ResponseChunk::Picker {
                id: Uuid::new_v4().to_string(),
                items: previews
                    .iter()
                    .map(|preview| PickerEntry {
                        item: preview.clone(),
                        selected: false,
                    })
                    .collect(),
                actions: vec!["add_to_context".into(), "regenerate".into()],
                max_selectable: self.chat.max_selectable,
            },
        )
        .await
        .map_err(cancelled)?;

        let listing: Vec<String> = response
            .results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}", i + 1, r.content))
            .collect();
        let text = format!(
            "Here are {} {label} grounded in your selected context:\n{}",
            response.results.len(),
            listing.join("\n")
        );
        stream_text(tx, &text).await.map_err(cancelled)?;

        // Average result confidence is the utilization signal for the
        // grounding items.
        let avg_confidence = if response.results.is_empty() {
            0.0
        } else {
            response.results.iter().map(|r| r.confidence).sum::<f32>()
                / response.results.len() as f32
        };

        Ok(HandlerOutput {
            text,
            refs_used: items.iter().map(ContextItem::item_ref).collect(),
            model: Some(response.metadata.model_used.clone()),
            utilizations: items
                .iter()
                .map(|item| ItemUtilization::new(item.item_ref(), avg_confidence))
                .collect(),
        })
    }

    /// Open dialogue: the direct free-text path with a context-grounded
    /// canned reply when no provider can be reached.
    async fn handle_general(
        &self,
        tx: &mpsc::Sender<ResponseChunk>,
        utterance: &str,
        items: &[ContextItem],
    ) -> Result<HandlerOutput, HandlerError> {
        let text = self.fallback.conversational_reply(utterance, items).await;
        stream_text(tx, &text).await.map_err(cancelled)?;

        Ok(HandlerOutput {
            text,
            refs_used: items.iter().map(ContextItem::item_ref).collect(),
            model: None,
            utilizations: vec![],
        })
    }
}

fn cancelled(c: Cancelled) -> HandlerError {
    HandlerError::Cancelled { partial: c.0 }
}

fn render_items(items: &[ContextItem]) -> String {
    items
        .iter()
        .map(|item| {
            format!(
                "[{}] {}: {}",
                item.item_type,
                item.title,
                item.content.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_title(content: &str) -> String {
    if content.chars().count() <= TITLE_CHARS {
        return content.to_string();
    }
    let prefix: String = content.chars().take(TITLE_CHARS - 1).collect();
    format!("{}…", prefix.trim_end())
}

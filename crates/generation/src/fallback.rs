//! The locally-executed fallback generation path.
//!
//! Runs when the structured provider is unavailable or exhausted its
//! retries. Builds its own prompt, parses free text into a tagged
//! [`ParseOutcome`] (partial or malformed output is an expected case, not
//! an error), scores confidence by lexical overlap with the context,
//! attaches the most relevant metric to generated solutions, and pads with
//! context-keyed placeholders so the requested count is always met.
//!
//! This path never fails — with no provider and no context it still
//! returns `count` generic results.

use std::sync::Arc;
use std::time::Instant;

use loupe_core::error::ProviderError;
use loupe_core::generation::{
    GeneratedResult, GenerationMetadata, GenerationMethod, GenerationProvider, GenerationResponse,
};
use loupe_core::intent::Intent;
use loupe_core::item::{ContextItem, ContextItemType};
use tracing::{debug, warn};

/// Every generated question starts with this phrase.
pub const REQUIRED_QUESTION_PREFIX: &str = "How might we";

/// Minimum word length considered for lexical overlap scoring.
const OVERLAP_WORD_LEN: usize = 4;

const GENERIC_QUESTION_TOPICS: [&str; 3] = [
    "better understand our users' needs",
    "remove the biggest obstacle our users face",
    "turn our research into an actionable next step",
];

const GENERIC_SOLUTION_TOPICS: [&str; 3] = [
    "Run a focused discovery interview round to close the biggest knowledge gap.",
    "Prototype the smallest change that addresses the strongest insight.",
    "Instrument the flow so the next decision is backed by a metric.",
];

/// The outcome of parsing free-text provider output.
///
/// A tagged variant rather than an error: malformed output is common and
/// expected, and callers decide how much of a partial parse to use.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed { items: Vec<String> },
    Failed { reason: String },
}

/// Parse free-form provider output into candidate result lines.
///
/// Strips bullet markers and list numbering, drops blank lines.
pub fn parse_free_text(text: &str) -> ParseOutcome {
    let items: Vec<String> = text
        .lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if items.is_empty() {
        ParseOutcome::Failed {
            reason: "no usable lines in provider output".into(),
        }
    } else {
        ParseOutcome::Parsed { items }
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
        .unwrap_or(line);
    // Numbered lists: "1. ", "2) ", "12. "
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    line.trim()
}

/// The fallback generator.
pub struct FallbackGenerator {
    /// Optional direct free-text provider; pure local synthesis without it.
    provider: Option<Arc<dyn GenerationProvider>>,
}

impl FallbackGenerator {
    pub fn new(provider: Option<Arc<dyn GenerationProvider>>) -> Self {
        Self { provider }
    }

    /// Generate at least `count` results for a generation intent.
    ///
    /// Infallible: provider failure or under-production degrades to
    /// placeholder synthesis keyed off the available context.
    pub async fn generate(
        &self,
        intent: Intent,
        items: &[ContextItem],
        count: usize,
    ) -> GenerationResponse {
        let started = Instant::now();
        let context_text = render_context(items);

        let mut parsed: Vec<String> = Vec::new();
        let mut model_used = "local-synthesis".to_string();

        if let Some(provider) = &self.provider {
            let prompt = build_prompt(intent, &context_text, count);
            match provider.complete_text(&prompt).await {
                Ok(text) => match parse_free_text(&text) {
                    ParseOutcome::Parsed { items } => {
                        model_used = provider.name().to_string();
                        parsed = items;
                    }
                    ParseOutcome::Failed { reason } => {
                        warn!(provider = provider.name(), %reason, "Fallback parse failed, synthesizing");
                    }
                },
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Direct provider failed, synthesizing");
                }
            }
        }

        let mut results: Vec<GeneratedResult> = parsed
            .iter()
            .take(count)
            .map(|raw| self.shape_result(intent, raw, &context_text, items))
            .collect();

        // Pad to the requested count with placeholders.
        let mut index = 0;
        while results.len() < count {
            let content = match intent {
                Intent::CreateSolutions => placeholder_solution(index, items),
                _ => placeholder_question(index, items),
            };
            let mut result = GeneratedResult::new(content, 0.2);
            if intent == Intent::CreateSolutions {
                attach_related_metric(&mut result, items);
            }
            results.push(result);
            index += 1;
        }

        debug!(
            intent = %intent,
            produced = results.len(),
            requested = count,
            "Fallback generation complete"
        );

        GenerationResponse {
            results,
            metadata: GenerationMetadata {
                duration_ms: started.elapsed().as_millis() as u64,
                retries: 0,
                model_used,
                generation_method: GenerationMethod::Fallback,
            },
        }
    }

    /// A conversational reply for the open-dialogue path when the provider
    /// is unreachable — grounded in the selected context titles.
    pub async fn conversational_reply(&self, utterance: &str, items: &[ContextItem]) -> String {
        if let Some(provider) = &self.provider {
            let prompt = format!(
                "You are a product research assistant. Context:\n{}\n\nUser: {}\nAssistant:",
                render_context(items),
                utterance
            );
            match provider.complete_text(&prompt).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Conversational provider failed, using canned reply"),
            }
        }

        if items.is_empty() {
            "I couldn't reach the generation service just now. Add some research context \
             (insights, metrics, or jobs-to-be-done) and I can still search and organize it for you."
                .to_string()
        } else {
            let titles: Vec<&str> = items.iter().take(3).map(|i| i.title.as_str()).collect();
            format!(
                "I couldn't reach the generation service just now, but your selected context \
                 covers: {}. Ask me to retrieve insights, metrics, or jobs, or try generating again.",
                titles.join(", ")
            )
        }
    }

    /// Normalize one parsed line into a scored, attributed result.
    fn shape_result(
        &self,
        intent: Intent,
        raw: &str,
        context_text: &str,
        items: &[ContextItem],
    ) -> GeneratedResult {
        let content = match intent {
            Intent::CreateSolutions => normalize_solution(raw),
            _ => normalize_question(raw),
        };
        let confidence = score_confidence(&content, context_text);
        let mut result = GeneratedResult::new(content, confidence);
        if intent == Intent::CreateSolutions {
            attach_related_metric(&mut result, items);
        }
        result
    }
}

// ── Normalization ─────────────────────────────────────────────────────────

/// Force the required question shape: starts with the fixed phrase, ends
/// with a question mark.
fn normalize_question(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches(['?', '.', '!']).trim_end();
    if trimmed.is_empty() {
        return format!("{REQUIRED_QUESTION_PREFIX} {}?", GENERIC_QUESTION_TOPICS[0]);
    }

    let lower = trimmed.to_lowercase();
    let prefix_lower = REQUIRED_QUESTION_PREFIX.to_lowercase();
    if lower.starts_with(&prefix_lower) {
        // Keep the original text after the phrase, re-anchored to the
        // canonical capitalization.
        let rest_original = trimmed.get(REQUIRED_QUESTION_PREFIX.len()..).unwrap_or("");
        format!("{REQUIRED_QUESTION_PREFIX}{rest_original}?")
    } else {
        let mut chars = trimmed.chars();
        let decapitalized = match chars.next() {
            Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        };
        format!("{REQUIRED_QUESTION_PREFIX} {decapitalized}?")
    }
}

/// Solutions are declarative: trimmed, ending in a period.
fn normalize_solution(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches(['?', '!']).trim_end();
    if trimmed.ends_with('.') {
        trimmed.to_string()
    } else {
        format!("{trimmed}.")
    }
}

// ── Scoring & attribution ─────────────────────────────────────────────────

/// Confidence from lexical overlap between a result and the context.
fn score_confidence(content: &str, context_text: &str) -> f32 {
    let context_words: Vec<String> = significant_words(context_text);
    if context_words.is_empty() {
        return 0.3;
    }
    let result_words = significant_words(content);
    if result_words.is_empty() {
        return 0.2;
    }
    let overlap = result_words
        .iter()
        .filter(|w| context_words.contains(w))
        .count();
    (0.3 + 0.6 * overlap as f32 / result_words.len() as f32).clamp(0.2, 0.9)
}

fn significant_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= OVERLAP_WORD_LEN)
        .map(str::to_string)
        .collect()
}

/// Attach the most lexically relevant metric item, when any is in context.
fn attach_related_metric(result: &mut GeneratedResult, items: &[ContextItem]) {
    let solution_words = significant_words(&result.content);

    let best = items
        .iter()
        .filter(|i| i.item_type == ContextItemType::Metric)
        .map(|metric| {
            let metric_text = format!("{} {}", metric.title, metric.content.as_deref().unwrap_or(""));
            let metric_words = significant_words(&metric_text);
            let overlap = solution_words
                .iter()
                .filter(|w| metric_words.contains(w))
                .count();
            (overlap, metric)
        })
        .max_by_key(|(overlap, _)| *overlap);

    // Fall back to the first metric when nothing overlaps — a solution
    // should still be traceable to a measure of success.
    if let Some((overlap, metric)) = best {
        let chosen = if overlap > 0 {
            metric
        } else {
            match items.iter().find(|i| i.item_type == ContextItemType::Metric) {
                Some(first) => first,
                None => return,
            }
        };
        result.attributes.insert(
            "related_metric".into(),
            serde_json::json!({ "id": chosen.id, "title": chosen.title }),
        );
    }
}

// ── Synthesis ─────────────────────────────────────────────────────────────

fn render_context(items: &[ContextItem]) -> String {
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

fn build_prompt(intent: Intent, context_text: &str, count: usize) -> String {
    let instruction = match intent {
        Intent::CreateSolutions => format!(
            "Propose {count} concrete solution ideas grounded in the research context. One per line."
        ),
        _ => format!(
            "Write {count} \"{REQUIRED_QUESTION_PREFIX}\" questions grounded in the research context. One per line."
        ),
    };
    format!("Research context:\n{context_text}\n\n{instruction}")
}

fn placeholder_question(index: usize, items: &[ContextItem]) -> String {
    match items.get(index % items.len().max(1)) {
        Some(item) if !items.is_empty() => format!(
            "{REQUIRED_QUESTION_PREFIX} make progress on \"{}\"?",
            item.title.trim()
        ),
        _ => format!(
            "{REQUIRED_QUESTION_PREFIX} {}?",
            GENERIC_QUESTION_TOPICS[index % GENERIC_QUESTION_TOPICS.len()]
        ),
    }
}

fn placeholder_solution(index: usize, items: &[ContextItem]) -> String {
    match items.get(index % items.len().max(1)) {
        Some(item) if !items.is_empty() => format!(
            "Address \"{}\" with a scoped experiment and measure the outcome.",
            item.title.trim()
        ),
        _ => GENERIC_SOLUTION_TOPICS[index % GENERIC_SOLUTION_TOPICS.len()].to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

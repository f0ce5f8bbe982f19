//! The keyword-weight intent classifier.

use loupe_core::intent::{Intent, IntentAlternative, IntentClassification};
use loupe_core::policy::IntentPolicy;
use tracing::debug;

use crate::keywords::{WeightedKeyword, keyword_table};

/// Minimum shared-prefix length for a partial (sub-word) match.
const PARTIAL_PREFIX_LEN: usize = 4;

/// Classifies utterances by weighted keyword scoring.
///
/// Stateless and infallible: identical input always produces an identical
/// classification, and no input can make classification fail.
pub struct IntentClassifier {
    policy: IntentPolicy,
}

/// Per-intent scoring outcome, before confidence normalization.
struct IntentScore {
    intent: Intent,
    score: f32,
    matched: Vec<String>,
    any_exact: bool,
}

impl IntentClassifier {
    pub fn new(policy: IntentPolicy) -> Self {
        Self { policy }
    }

    /// Classify one utterance.
    ///
    /// # Algorithm
    ///
    /// 1. Normalize: lowercase, punctuation → spaces, collapsed whitespace.
    /// 2. Per intent, sum keyword weights: exact substring matches score the
    ///    full weight plus a positional bonus near the start; keywords with
    ///    no exact match may still score a reduced-weight partial match.
    /// 3. Boost intents with more than one matching keyword.
    /// 4. Normalize the winning score into a confidence, discounting
    ///    partial-only evidence and near-ties, floored at the policy minimum.
    pub fn classify(&self, utterance: &str) -> IntentClassification {
        let normalized = normalize(utterance);
        if normalized.is_empty() {
            return IntentClassification::fallback(self.policy.min_confidence);
        }
        let words: Vec<&str> = normalized.split(' ').collect();

        let mut scores: Vec<IntentScore> = keyword_table()
            .iter()
            .map(|(intent, keywords)| self.score_intent(*intent, keywords, &normalized, &words))
            .collect();

        // Highest score wins; ties break on declaration order, which the
        // stable sort preserves.
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let winner = &scores[0];
        if winner.score <= 0.0 {
            debug!(utterance_len = utterance.len(), "No keyword evidence, falling back");
            return IntentClassification::fallback(self.policy.min_confidence);
        }

        let runner_up_score = scores.get(1).map_or(0.0, |s| s.score);
        let mut confidence = (winner.score / self.policy.full_score).min(1.0);
        if !winner.any_exact {
            confidence *= self.policy.partial_only_discount;
        }
        if runner_up_score >= self.policy.ambiguity_ratio * winner.score {
            confidence *= self.policy.ambiguity_discount;
        }
        confidence = confidence.max(self.policy.min_confidence);

        let alternatives = scores[1..]
            .iter()
            .filter(|s| s.score > 0.0)
            .take(2)
            .map(|s| IntentAlternative {
                intent: s.intent,
                confidence: (s.score / self.policy.full_score).min(1.0)
                    * self.policy.alternative_damping,
            })
            .collect();

        IntentClassification {
            intent: winner.intent,
            confidence,
            matched_keywords: winner.matched.clone(),
            alternatives,
        }
    }

    fn score_intent(
        &self,
        intent: Intent,
        keywords: &[WeightedKeyword],
        normalized: &str,
        words: &[&str],
    ) -> IntentScore {
        let mut score = 0.0;
        let mut matched = Vec::new();
        let mut any_exact = false;

        for (keyword, weight) in keywords {
            if let Some(pos) = normalized.find(keyword) {
                score += weight;
                if pos < self.policy.position_window {
                    score += self.policy.position_bonus;
                }
                matched.push((*keyword).to_string());
                any_exact = true;
            } else if partial_match(keyword, words) {
                score += weight * self.policy.partial_weight_factor;
                matched.push((*keyword).to_string());
            }
        }

        if matched.len() > 1 {
            score *= self.policy.multi_match_boost;
        }

        IntentScore {
            intent,
            score,
            matched,
            any_exact,
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(IntentPolicy::default())
    }
}

/// Lowercase, punctuation stripped to spaces, whitespace collapsed.
fn normalize(utterance: &str) -> String {
    let lowered = utterance.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A sub-word match: some utterance word shares a prefix of at least
/// [`PARTIAL_PREFIX_LEN`] characters with some word of the keyword.
fn partial_match(keyword: &str, words: &[&str]) -> bool {
    keyword.split(' ').any(|kw_word| {
        kw_word.len() >= PARTIAL_PREFIX_LEN
            && words.iter().any(|w| {
                w.len() >= PARTIAL_PREFIX_LEN
                    && common_prefix_len(w, kw_word) >= PARTIAL_PREFIX_LEN
            })
    })
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(
            normalize("What  Insights—do we have?!"),
            "what insights do we have"
        );
    }

    #[test]
    fn insights_utterance_classified() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("What insights do we have about onboarding drop-off?");

        assert_eq!(result.intent, Intent::RetrieveInsights);
        assert!(result.confidence >= IntentPolicy::default().min_confidence);
        assert!(!result.matched_keywords.is_empty());
    }

    #[test]
    fn metrics_utterance_classified() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("Show me the conversion metrics for checkout");
        assert_eq!(result.intent, Intent::RetrieveMetrics);
        assert!(result.matched_keywords.contains(&"metric".to_string()));
    }

    #[test]
    fn jobs_utterance_classified() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("What jobs are customers trying to get done?");
        assert_eq!(result.intent, Intent::RetrieveJobs);
    }

    #[test]
    fn question_generation_classified() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("Brainstorm some how might we questions for retention");
        assert_eq!(result.intent, Intent::GenerateQuestions);
        // Multiple keywords matched → boost applied, evidence reported
        assert!(result.matched_keywords.len() > 1);
    }

    #[test]
    fn solutions_utterance_classified() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("Propose solutions to reduce signup friction");
        assert_eq!(result.intent, Intent::CreateSolutions);
    }

    #[test]
    fn no_match_falls_back_with_floor_confidence() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("zzz qqq xxx");

        assert_eq!(result.intent, Intent::GeneralExploration);
        assert!(
            (result.confidence - IntentPolicy::default().min_confidence).abs() < f32::EPSILON
        );
        assert!(result.matched_keywords.is_empty());
        assert!(result.alternatives.is_empty());
    }

    #[test]
    fn empty_utterance_falls_back() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("   \t  ");
        assert_eq!(result.intent, Intent::GeneralExploration);
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = IntentClassifier::default();
        let a = classifier.classify("What insights do we have about churn?");
        let b = classifier.classify("What insights do we have about churn?");
        assert_eq!(a, b);
    }

    #[test]
    fn positional_bonus_rewards_early_matches() {
        let classifier = IntentClassifier::default();
        let early = classifier.classify("insights about the beta program");
        let late = classifier.classify("tell me everything you know from our collected insights");
        assert_eq!(early.intent, Intent::RetrieveInsights);
        assert_eq!(late.intent, Intent::RetrieveInsights);
        assert!(early.confidence > late.confidence);
    }

    #[test]
    fn partial_match_scores_reduced() {
        let classifier = IntentClassifier::default();
        // "measuring" shares the prefix "meas" with "measure" but never
        // contains it, so only the partial path can score.
        let partial = classifier.classify("measuring activation");
        assert_eq!(partial.intent, Intent::RetrieveMetrics);
        let exact = classifier.classify("measure activation");
        assert!(partial.confidence < exact.confidence);
    }

    #[test]
    fn ambiguity_discount_applied_on_near_tie() {
        let classifier = IntentClassifier::default();
        // Both keywords land inside the position window → equal scores.
        let ambiguous = classifier.classify("insight metric overlap");
        let clear = classifier.classify("insight please");
        assert!(ambiguous.confidence < clear.confidence);
        assert!(!ambiguous.alternatives.is_empty());
    }

    #[test]
    fn alternatives_capped_at_two_and_damped() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("insight metric job question solution");
        assert!(result.alternatives.len() <= 2);
        for alt in &result.alternatives {
            assert!(alt.confidence < result.confidence);
        }
    }
}

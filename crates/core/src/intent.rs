//! Intent types — the classified purpose of a user utterance.
//!
//! The intent drives which handler processes a request. Classification
//! itself lives in `loupe-intent`; these are the value objects that flow
//! through messages, usage events, and the dispatch table.

use serde::{Deserialize, Serialize};

/// The fixed set of intents the assistant understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    RetrieveInsights,
    RetrieveMetrics,
    RetrieveJobs,
    GenerateQuestions,
    CreateSolutions,
    /// Open dialogue — the default / fallback intent.
    #[default]
    GeneralExploration,
}

impl Intent {
    /// All intents, in scoring/tie-break order.
    pub const ALL: [Intent; 6] = [
        Intent::RetrieveInsights,
        Intent::RetrieveMetrics,
        Intent::RetrieveJobs,
        Intent::GenerateQuestions,
        Intent::CreateSolutions,
        Intent::GeneralExploration,
    ];

    /// The kebab-case tag used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrieveInsights => "retrieve-insights",
            Self::RetrieveMetrics => "retrieve-metrics",
            Self::RetrieveJobs => "retrieve-jobs",
            Self::GenerateQuestions => "generate-questions",
            Self::CreateSolutions => "create-solutions",
            Self::GeneralExploration => "general-exploration",
        }
    }

    /// Parse a storage/wire tag back into an intent.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.as_str() == s)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A runner-up intent reported for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAlternative {
    pub intent: Intent,
    pub confidence: f32,
}

/// The full classification result for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    /// The winning intent
    pub intent: Intent,

    /// Confidence in [min_confidence, 1.0] — never zero
    pub confidence: f32,

    /// Keywords that contributed to the winning score
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_keywords: Vec<String>,

    /// Up to two runner-up intents with damped confidence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<IntentAlternative>,
}

impl IntentClassification {
    /// The low-confidence fallback classification.
    pub fn fallback(min_confidence: f32) -> Self {
        Self {
            intent: Intent::GeneralExploration,
            confidence: min_confidence,
            matched_keywords: Vec::new(),
            alternatives: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tag_roundtrip() {
        for i in Intent::ALL {
            assert_eq!(Intent::parse(i.as_str()), Some(i));
        }
        assert_eq!(Intent::parse("unknown"), None);
    }

    #[test]
    fn intent_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Intent::GenerateQuestions).unwrap();
        assert_eq!(json, r#""generate-questions""#);
    }

    #[test]
    fn default_is_general_exploration() {
        assert_eq!(Intent::default(), Intent::GeneralExploration);
    }

    #[test]
    fn fallback_classification_shape() {
        let c = IntentClassification::fallback(0.1);
        assert_eq!(c.intent, Intent::GeneralExploration);
        assert!((c.confidence - 0.1).abs() < f32::EPSILON);
        assert!(c.matched_keywords.is_empty());
        assert!(c.alternatives.is_empty());
    }
}

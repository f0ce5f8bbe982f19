//! Per-intent keyword tables.
//!
//! Weights reflect how strongly a keyword signals its intent on its own.
//! Multi-word keywords are matched against the normalized utterance as a
//! whole phrase. `GeneralExploration` carries no keywords — it is the
//! fallback when nothing else scores.

use loupe_core::intent::Intent;

/// A keyword and the score it contributes on an exact match.
pub type WeightedKeyword = (&'static str, f32);

/// The keyword table for every non-fallback intent.
pub fn keyword_table() -> &'static [(Intent, &'static [WeightedKeyword])] {
    &[
        (
            Intent::RetrieveInsights,
            &[
                ("insight", 1.0),
                ("finding", 0.8),
                ("interview", 0.7),
                ("learned", 0.7),
                ("discovered", 0.7),
                ("takeaway", 0.6),
                ("research", 0.6),
            ],
        ),
        (
            Intent::RetrieveMetrics,
            &[
                ("metric", 1.0),
                ("kpi", 0.9),
                ("conversion", 0.7),
                ("retention", 0.7),
                ("churn", 0.7),
                ("measure", 0.7),
                ("benchmark", 0.6),
            ],
        ),
        (
            Intent::RetrieveJobs,
            &[
                ("job to be done", 1.2),
                ("jtbd", 1.0),
                ("job", 1.0),
                ("struggle", 0.7),
                ("motivation", 0.7),
                ("trying to", 0.6),
            ],
        ),
        (
            Intent::GenerateQuestions,
            &[
                ("how might we", 1.2),
                ("hmw", 1.0),
                ("question", 1.0),
                ("brainstorm", 0.8),
                ("ideate", 0.8),
                ("reframe", 0.6),
            ],
        ),
        (
            Intent::CreateSolutions,
            &[
                ("solution", 1.0),
                ("solve", 0.8),
                ("prototype", 0.7),
                ("feature", 0.6),
                ("idea", 0.6),
                ("build", 0.5),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_retrieval_and_generation_intent_has_keywords() {
        let covered: Vec<Intent> = keyword_table().iter().map(|(i, _)| *i).collect();
        for intent in Intent::ALL {
            if intent == Intent::GeneralExploration {
                assert!(!covered.contains(&intent));
            } else {
                assert!(covered.contains(&intent), "{intent} missing keywords");
            }
        }
    }

    #[test]
    fn keywords_are_lowercase() {
        for (_, keywords) in keyword_table() {
            for (kw, _) in *keywords {
                assert_eq!(*kw, kw.to_lowercase());
            }
        }
    }
}

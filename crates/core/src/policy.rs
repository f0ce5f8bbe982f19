//! Tunable policy types.
//!
//! The eviction priorities, confidence discounts, cache bounds, and retry
//! settings used across the workspace are data, not constants: every number
//! here can be overridden from configuration. Defaults mirror the observed
//! production behavior without assuming it is optimal.

use serde::{Deserialize, Serialize};

use crate::item::ContextItemType;

/// Ceilings on a session's selected-item sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SelectionLimits {
    /// Total selected items across all types
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Selected items per type
    #[serde(default = "default_max_per_type")]
    pub max_per_type: usize,
}

fn default_max_total() -> usize {
    100
}

fn default_max_per_type() -> usize {
    50
}

impl Default for SelectionLimits {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_per_type: default_max_per_type(),
        }
    }
}

/// Token budget ceiling and status thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Hard ceiling on combined message + context token cost
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,

    /// Utilization at which status becomes `Warning`
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f32,

    /// Utilization at which status becomes `Critical`
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f32,

    /// How many of the most recent messages truncation must never remove
    #[serde(default = "default_protected_recent")]
    pub protected_recent_messages: usize,
}

fn default_token_limit() -> usize {
    8192
}

fn default_warning_threshold() -> f32 {
    0.80
}

fn default_critical_threshold() -> f32 {
    0.95
}

fn default_protected_recent() -> usize {
    2
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            protected_recent_messages: default_protected_recent(),
        }
    }
}

/// Which context item types truncation evicts first.
///
/// Types in `low_priority` form the first eviction tier; everything else is
/// the high tier. Within a tier, eviction is least-recently-used first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    #[serde(default = "default_low_priority")]
    pub low_priority: Vec<ContextItemType>,
}

fn default_low_priority() -> Vec<ContextItemType> {
    vec![ContextItemType::HowMightWe, ContextItemType::Solution]
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            low_priority: default_low_priority(),
        }
    }
}

impl EvictionPolicy {
    /// Eviction rank for a type: lower ranks are evicted first.
    pub fn rank(&self, item_type: ContextItemType) -> usize {
        if self.low_priority.contains(&item_type) { 0 } else { 1 }
    }
}

/// Scoring and confidence knobs for the intent classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntentPolicy {
    /// Characters from the start of the utterance that earn a position bonus
    #[serde(default = "default_position_window")]
    pub position_window: usize,

    /// Additive bonus for a keyword matched inside the position window
    #[serde(default = "default_position_bonus")]
    pub position_bonus: f32,

    /// Weight multiplier for partial (sub-word) matches
    #[serde(default = "default_partial_weight_factor")]
    pub partial_weight_factor: f32,

    /// Multiplicative boost when more than one keyword matches an intent
    #[serde(default = "default_multi_match_boost")]
    pub multi_match_boost: f32,

    /// Confidence discount when only partial matches contributed
    #[serde(default = "default_partial_only_discount")]
    pub partial_only_discount: f32,

    /// Runner-up / winner score ratio that triggers the ambiguity discount
    #[serde(default = "default_ambiguity_ratio")]
    pub ambiguity_ratio: f32,

    /// Confidence discount applied on ambiguity
    #[serde(default = "default_ambiguity_discount")]
    pub ambiguity_discount: f32,

    /// Confidence floor — never report below this
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Score treated as fully confident when normalizing
    #[serde(default = "default_full_score")]
    pub full_score: f32,

    /// Damping applied to alternative intents' confidence
    #[serde(default = "default_alternative_damping")]
    pub alternative_damping: f32,
}

fn default_position_window() -> usize {
    10
}
fn default_position_bonus() -> f32 {
    0.5
}
fn default_partial_weight_factor() -> f32 {
    0.5
}
fn default_multi_match_boost() -> f32 {
    1.15
}
fn default_partial_only_discount() -> f32 {
    0.8
}
fn default_ambiguity_ratio() -> f32 {
    0.7
}
fn default_ambiguity_discount() -> f32 {
    0.9
}
fn default_min_confidence() -> f32 {
    0.1
}
fn default_full_score() -> f32 {
    3.0
}
fn default_alternative_damping() -> f32 {
    0.5
}

impl Default for IntentPolicy {
    fn default() -> Self {
        Self {
            position_window: default_position_window(),
            position_bonus: default_position_bonus(),
            partial_weight_factor: default_partial_weight_factor(),
            multi_match_boost: default_multi_match_boost(),
            partial_only_discount: default_partial_only_discount(),
            ambiguity_ratio: default_ambiguity_ratio(),
            ambiguity_discount: default_ambiguity_discount(),
            min_confidence: default_min_confidence(),
            full_score: default_full_score(),
            alternative_damping: default_alternative_damping(),
        }
    }
}

/// Bounds for the session-state cache and the token-counter cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Session-state cache time-to-live, in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Maximum cached session states
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum token-counter cache entries
    #[serde(default = "default_token_cache_entries")]
    pub token_cache_entries: usize,
}

fn default_session_ttl_secs() -> u64 {
    300
}
fn default_max_sessions() -> usize {
    256
}
fn default_token_cache_entries() -> usize {
    1024
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            max_sessions: default_max_sessions(),
            token_cache_entries: default_token_cache_entries(),
        }
    }
}

/// Timeout, retry count, and backoff for provider calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Per-attempt timeout, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay; attempt `n` waits `base · 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << attempt.min(16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_limit_defaults() {
        let limits = SelectionLimits::default();
        assert_eq!(limits.max_total, 100);
        assert_eq!(limits.max_per_type, 50);
    }

    #[test]
    fn eviction_ranks_derived_types_lowest() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.rank(ContextItemType::HowMightWe), 0);
        assert_eq!(policy.rank(ContextItemType::Solution), 0);
        assert_eq!(policy.rank(ContextItemType::Insight), 1);
        assert_eq!(policy.rank(ContextItemType::Metric), 1);
    }

    #[test]
    fn backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0).as_millis(), 250);
        assert_eq!(policy.backoff(1).as_millis(), 500);
        assert_eq!(policy.backoff(2).as_millis(), 1000);
    }

    #[test]
    fn partial_policies_fall_back_to_defaults() {
        let policy: BudgetPolicy = serde_json::from_str(r#"{"token_limit": 4096}"#).unwrap();
        assert_eq!(policy.token_limit, 4096);
        assert!((policy.warning_threshold - 0.80).abs() < f32::EPSILON);

        let policy: IntentPolicy = serde_json::from_str("{}").unwrap();
        assert!((policy.min_confidence - 0.1).abs() < f32::EPSILON);
    }
}

//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. This
//! approximation is accurate within ~10% for BPE tokenizers on English
//! text, and keeps budget arithmetic deterministic and fast.
//!
//! Repeated counts of the same text are served from a bounded cache keyed
//! by content hash, evicted oldest-first. The lock around the cache is held
//! only for lookup/insert; concurrent readers are never blocked across an
//! eviction pass.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use loupe_core::message::ChatMessage;

/// Characters per token in the estimation heuristic.
const CHARS_PER_TOKEN: usize = 4;

/// Per-message overhead for role name, delimiters, and wire formatting.
const MESSAGE_OVERHEAD: usize = 4;

/// A token counter with a bounded content cache.
///
/// Pure beyond the cache: identical input always yields an identical count.
pub struct TokenCounter {
    max_entries: usize,
    cache: Mutex<CounterCache>,
}

#[derive(Default)]
struct CounterCache {
    counts: HashMap<u64, usize>,
    // Insertion order for oldest-first eviction.
    order: VecDeque<u64>,
}

impl TokenCounter {
    /// Create a counter whose cache holds at most `max_entries` texts.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            cache: Mutex::new(CounterCache::default()),
        }
    }

    /// Estimate the token count for a string. Empty input is 0.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let key = content_key(text);
        if let Ok(cache) = self.cache.lock()
            && let Some(&cached) = cache.counts.get(&key)
        {
            return cached;
        }

        let tokens = estimate(text);
        if let Ok(mut cache) = self.cache.lock()
            && cache.counts.insert(key, tokens).is_none()
        {
            cache.order.push_back(key);
            while cache.order.len() > self.max_entries {
                if let Some(oldest) = cache.order.pop_front() {
                    cache.counts.remove(&oldest);
                }
            }
        }
        tokens
    }

    /// Estimate tokens for a batch of texts.
    pub fn count_batch<S: AsRef<str>>(&self, texts: &[S]) -> Vec<usize> {
        texts.iter().map(|t| self.count(t.as_ref())).collect()
    }

    /// Estimate tokens for a message including per-message overhead.
    pub fn count_message(&self, message: &ChatMessage) -> usize {
        MESSAGE_OVERHEAD + self.count(&message.content)
    }

    /// Truncate `text` to the longest whitespace-aligned prefix whose
    /// counted cost is ≤ `limit`.
    ///
    /// Binary-searches over prefix length, then backs off to the nearest
    /// whitespace boundary so a word is never split mid-way.
    pub fn truncate_to_limit(&self, text: &str, limit: usize) -> String {
        if limit == 0 {
            return String::new();
        }
        if self.count(text) <= limit {
            return text.to_string();
        }

        // Binary search over char-boundary prefix lengths.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if estimate(&text[..boundaries[mid]]) <= limit {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut end = boundaries[lo];

        // Back off to the last whitespace so the cut is word-aligned.
        if end < text.len() && !text[..end].is_empty() {
            if let Some(ws) = text[..end].rfind(char::is_whitespace) {
                end = ws;
            }
        }

        text[..end].trim_end().to_string()
    }

    /// Current number of cached texts (for tests and diagnostics).
    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.counts.len()).unwrap_or(0)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// The raw heuristic: 1 token ≈ 4 characters, rounded up.
fn estimate(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

fn content_key(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::session::SessionId;

    #[test]
    fn empty_string_is_zero() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count("hello"), 2);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let counter = TokenCounter::default();
        let text = "a".repeat(100);
        assert_eq!(counter.count(&text), 25);
        assert_eq!(counter.count(&text), 25); // cached path
    }

    #[test]
    fn batch_counts() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count_batch(&["test", "hello", ""]), vec![1, 2, 0]);
    }

    #[test]
    fn message_includes_overhead() {
        let counter = TokenCounter::default();
        let msg = ChatMessage::user(SessionId::from("s1"), "test"); // 1 token + 4 overhead
        assert_eq!(counter.count_message(&msg), 5);
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let counter = TokenCounter::new(2);
        counter.count("first text");
        counter.count("second text");
        counter.count("third text");
        assert_eq!(counter.cache_len(), 2);
    }

    #[test]
    fn cache_does_not_duplicate_entries() {
        let counter = TokenCounter::new(8);
        for _ in 0..5 {
            counter.count("same text");
        }
        assert_eq!(counter.cache_len(), 1);
    }

    #[test]
    fn truncate_zero_limit_is_empty() {
        let counter = TokenCounter::default();
        assert_eq!(counter.truncate_to_limit("anything at all", 0), "");
    }

    #[test]
    fn truncate_under_limit_unchanged() {
        let counter = TokenCounter::default();
        assert_eq!(counter.truncate_to_limit("short", 10), "short");
    }

    #[test]
    fn truncate_is_whitespace_aligned() {
        let counter = TokenCounter::default();
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let out = counter.truncate_to_limit(text, 5);

        assert!(counter.count(&out) <= 5);
        assert!(text.starts_with(&out));
        // The cut never splits a word: the output is a prefix of full words.
        let last = out.split_whitespace().last().unwrap();
        assert!(text.split_whitespace().any(|w| w == last));
    }

    #[test]
    fn truncate_result_maximal() {
        let counter = TokenCounter::default();
        let text = "one two three four five six seven eight nine ten";
        let out = counter.truncate_to_limit(text, 6);
        // Adding the next word would exceed the limit.
        let next_len = out.len() + 1 + text[out.len()..].split_whitespace().next().unwrap_or("").len();
        assert!(estimate(&text[..next_len.min(text.len())]) > 6 || next_len >= text.len());
    }
}

//! Context compaction: once a persisted agent history grows past a
//! threshold fraction of its token budget, older turns are collapsed into a
//! running summary that gets folded back into the agent's prompt template
//! instead of being replayed turn-by-turn.
//!
//! Operates on plain text rather than a concrete session type so it can sit
//! in front of any [`crate::agents`] role without depending on
//! [`crate::llm_session::LLMSession`] internals.

/// Rough token estimate: one token per four characters, minimum one.
/// Matches the estimator `llm_session` uses for its own trimming so the two
/// layers agree on when a history is "big".
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Collapses history into a `{CONTEXT_SUMMARY}` placeholder (or an appended
/// heading when the template has no such placeholder), per §4.2/§9.
pub struct SummaryHeadingStrategy {
    /// Fraction of `max_tokens` at which compaction should trigger.
    pub threshold: f64,
}

impl Default for SummaryHeadingStrategy {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

const SUMMARY_HEADING: &str = "## 历史对话总结";

impl SummaryHeadingStrategy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Whether `token_count` of a persisted history against `max_tokens`
    /// warrants folding in a fresh summary before the next turn.
    pub fn should_compact(&self, token_count: usize, max_tokens: usize) -> bool {
        max_tokens > 0 && token_count as f64 >= self.threshold * max_tokens as f64
    }

    /// Fold `new_summary` into `template_text`.
    ///
    /// If the template declares a `{CONTEXT_SUMMARY}` placeholder, substitute
    /// it directly. Otherwise append the summary once under a
    /// `"## 历史对话总结"` heading — calling this again on the result with a
    /// fresh summary replaces the prior heading's content rather than
    /// appending a second heading, so repeated compaction stays idempotent
    /// in the one-heading sense (§8).
    pub fn fold_summary(&self, template_text: &str, new_summary: &str) -> String {
        if template_text.contains("{CONTEXT_SUMMARY}") {
            return template_text.replace("{CONTEXT_SUMMARY}", new_summary);
        }

        match template_text.find(SUMMARY_HEADING) {
            Some(idx) => {
                let mut out = template_text[..idx].to_string();
                out.push_str(SUMMARY_HEADING);
                out.push('\n');
                out.push_str(new_summary);
                out
            }
            None => format!("{}\n\n{}\n{}", template_text, SUMMARY_HEADING, new_summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compact_respects_threshold() {
        let strategy = SummaryHeadingStrategy::new(0.85);
        assert!(!strategy.should_compact(80, 100));
        assert!(strategy.should_compact(85, 100));
    }

    #[test]
    fn placeholder_is_substituted_when_present() {
        let strategy = SummaryHeadingStrategy::default();
        let out = strategy.fold_summary("before {CONTEXT_SUMMARY} after", "SUMMARY");
        assert_eq!(out, "before SUMMARY after");
    }

    #[test]
    fn heading_is_appended_once_and_then_refreshed_in_place() {
        let strategy = SummaryHeadingStrategy::default();
        let base = "You are an assistant.";

        let first = strategy.fold_summary(base, "first summary");
        assert_eq!(first.matches(SUMMARY_HEADING).count(), 1);
        assert!(first.contains("first summary"));

        let second = strategy.fold_summary(&first, "second summary");
        assert_eq!(second.matches(SUMMARY_HEADING).count(), 1);
        assert!(second.contains("second summary"));
        assert!(!second.contains("first summary"));
    }
}

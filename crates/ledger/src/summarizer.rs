//! Rolling conversation summaries.
//!
//! The summarizer runs after every Nth append, fed the most recent messages.
//! A failed summarization never fails the append that triggered it; the old
//! summary simply stays in place.

use async_trait::async_trait;
use attune_core::error::LedgerError;
use attune_core::ledger::{LedgerMessage, LedgerRole};

/// Produces a rolling summary from a window of recent messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages` (oldest first), optionally folding in the
    /// previous summary.
    async fn summarize(
        &self,
        messages: &[LedgerMessage],
        previous: Option<&str>,
    ) -> Result<String, LedgerError>;
}

/// A deterministic extractive summarizer.
///
/// No model calls: it reports message counts per role, the span of the
/// window, and the most recent user message. Good enough to keep prompts
/// short when no external summarization service is wired up.
pub struct NaiveSummarizer;

#[async_trait]
impl Summarizer for NaiveSummarizer {
    async fn summarize(
        &self,
        messages: &[LedgerMessage],
        _previous: Option<&str>,
    ) -> Result<String, LedgerError> {
        if messages.is_empty() {
            return Ok(String::new());
        }

        let user_count = messages
            .iter()
            .filter(|m| m.role == LedgerRole::User)
            .count();
        let agent_count = messages.len() - user_count;

        let first = messages[0].at.format("%Y-%m-%d %H:%M UTC");
        let mut summary = format!(
            "{} messages since {first} ({user_count} from the contact, {agent_count} replies).",
            messages.len()
        );

        if let Some(last_user) = messages
            .iter()
            .rev()
            .find(|m| m.role == LedgerRole::User)
        {
            summary.push_str(" Latest topic: ");
            summary.push_str(truncate(&last_user.body, 160));
        }

        Ok(summary)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(role: LedgerRole, body: &str) -> LedgerMessage {
        LedgerMessage {
            role,
            body: body.into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn summarizes_counts_and_latest_topic() {
        let messages = vec![
            msg(LedgerRole::User, "I need help with my order"),
            msg(LedgerRole::Agent, "Sure, what is the order number?"),
            msg(LedgerRole::User, "Order 4412, it never arrived"),
        ];
        let summary = NaiveSummarizer
            .summarize(&messages, None)
            .await
            .unwrap();
        assert!(summary.contains("3 messages"));
        assert!(summary.contains("2 from the contact"));
        assert!(summary.contains("Order 4412"));
    }

    #[tokio::test]
    async fn empty_window_yields_empty_summary() {
        let summary = NaiveSummarizer.summarize(&[], None).await.unwrap();
        assert!(summary.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 160), "short");
    }
}

//! Suppression policy chain, run before any generation call.
//!
//! Gates are evaluated in a fixed order and the first one that suppresses
//! wins:
//! 1. Human override (operator wrote recently)
//! 2. Escalation/closing silence (bot handed off to a human)
//! 3. Safe mode (operator or bot spoke last and no trigger keyword)
//! 4. Rate limit (minimum interval since the last reply, shorter for HOT leads)
//!
//! A fifth check, duplicate-reply suppression, runs after generation via
//! [`SuppressionChain::is_duplicate`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{LeadIntent, Suppression};
use crate::store::{SafeModeState, StateStore};

/// Default keywords that reopen automation on an operator-managed chat.
pub const DEFAULT_TRIGGER_KEYWORDS: &[&str] = &[
    "price", "rate", "cost", "kitne", "kitna", "available", "size", "delivery", "cod", "order",
    "details", "catalog",
];

/// Minimum-interval rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub hot_interval: Duration,
    pub default_interval: Duration,
}

impl RateLimit {
    pub fn interval_for(&self, intent: LeadIntent) -> Duration {
        match intent {
            LeadIntent::Hot => self.hot_interval,
            _ => self.default_interval,
        }
    }
}

/// Inputs for one evaluation of the chain.
#[derive(Debug, Clone)]
pub struct GateContext<'a> {
    pub participant: &'a str,
    pub text: &'a str,
    pub now: DateTime<Utc>,
    /// Safe-mode state as it was before this turn.
    pub safe_mode: Option<SafeModeState>,
    /// Stored lead intent before this turn.
    pub intent: LeadIntent,
}

/// Ordered, short-circuiting set of suppression gates.
pub struct SuppressionChain {
    store: Arc<dyn StateStore>,
    trigger: Option<Regex>,
    rate_limit: RateLimit,
}

impl SuppressionChain {
    /// Build a chain with the given safe-mode trigger keywords.
    pub fn new(
        store: Arc<dyn StateStore>,
        trigger_keywords: &[&str],
        rate_limit: RateLimit,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            store,
            trigger: keyword_regex(trigger_keywords)?,
            rate_limit,
        })
    }

    /// Evaluate all gates. Returns the first suppression reason, or `None`
    /// if generation may proceed.
    pub async fn evaluate(&self, ctx: &GateContext<'_>) -> Option<Suppression> {
        let reason = if self.override_active(ctx.participant, ctx.now).await {
            Some(Suppression::HumanOverride)
        } else if self.escalation_active(ctx.participant, ctx.now).await {
            Some(Suppression::Escalated)
        } else if !self.safe_mode_allows(ctx) {
            Some(Suppression::SafeMode)
        } else if self.rate_limited(ctx).await {
            Some(Suppression::RateLimited)
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!(participant = ctx.participant, gate = reason.label(), "Turn suppressed");
        }
        reason
    }

    /// Gate 1: active while `now` is before the stored deadline. Expired
    /// entries are removed on the way.
    pub async fn override_active(&self, participant: &str, now: DateTime<Utc>) -> bool {
        match self.store.override_until(participant).await {
            Some(until) if now < until => true,
            Some(_) => {
                self.store.clear_override(participant).await;
                false
            }
            None => false,
        }
    }

    /// Gate 2: unexpired escalation or closing silence.
    pub async fn escalation_active(&self, participant: &str, now: DateTime<Utc>) -> bool {
        match self.store.escalation(participant).await {
            Some(state) if now < state.until => true,
            Some(_) => {
                self.store.clear_escalation(participant).await;
                false
            }
            None => false,
        }
    }

    /// Gate 3: first-ever message, customer spoke last, or trigger keyword.
    pub fn safe_mode_allows(&self, ctx: &GateContext<'_>) -> bool {
        let Some(state) = ctx.safe_mode else {
            return true;
        };
        if state.replied_message_count == 0 || !state.last_sender_was_operator {
            return true;
        }
        self.has_trigger_keyword(ctx.text)
    }

    pub fn has_trigger_keyword(&self, text: &str) -> bool {
        self.trigger.as_ref().is_some_and(|r| r.is_match(text))
    }

    /// Gate 4: too soon since the last reply for this lead's cadence.
    async fn rate_limited(&self, ctx: &GateContext<'_>) -> bool {
        let Some(last) = self.store.last_reply(ctx.participant).await else {
            return false;
        };
        let interval = self.rate_limit.interval_for(ctx.intent);
        let elapsed = ctx.now.signed_duration_since(last.at);
        elapsed.to_std().map(|e| e < interval).unwrap_or(true)
    }

    /// Post-generation check: identical to the immediately previous reply.
    pub async fn is_duplicate(&self, participant: &str, reply: &str) -> bool {
        self.store
            .last_reply(participant)
            .await
            .is_some_and(|last| last.text.trim() == reply.trim())
    }
}

/// Case-insensitive alternation of escaped keywords. `None` for an empty list.
pub fn keyword_regex(keywords: &[&str]) -> Result<Option<Regex>, regex::Error> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!("(?i)({})", alternatives.join("|"))).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::HandoffReason;
    use crate::store::{EscalationState, FileStateStore, LastReply};

    fn rate_limit() -> RateLimit {
        RateLimit {
            hot_interval: Duration::from_secs(5),
            default_interval: Duration::from_secs(60),
        }
    }

    fn chain() -> (SuppressionChain, Arc<FileStateStore>) {
        let store = Arc::new(FileStateStore::in_memory());
        let chain =
            SuppressionChain::new(store.clone(), DEFAULT_TRIGGER_KEYWORDS, rate_limit()).unwrap();
        (chain, store)
    }

    fn ctx<'a>(text: &'a str, safe_mode: Option<SafeModeState>, now: DateTime<Utc>) -> GateContext<'a> {
        GateContext {
            participant: "p1",
            text,
            now,
            safe_mode,
            intent: LeadIntent::Cold,
        }
    }

    fn operator_spoke_last() -> Option<SafeModeState> {
        Some(SafeModeState {
            replied_message_count: 3,
            last_sender_was_operator: true,
        })
    }

    #[tokio::test]
    async fn empty_state_passes() {
        let (chain, _) = chain();
        assert_eq!(chain.evaluate(&ctx("hello", None, Utc::now())).await, None);
    }

    #[tokio::test]
    async fn override_suppresses_even_with_keywords() {
        let (chain, store) = chain();
        let now = Utc::now();
        store.set_override("p1", now + chrono::Duration::minutes(15)).await;
        assert_eq!(
            chain.evaluate(&ctx("price? order now", None, now)).await,
            Some(Suppression::HumanOverride)
        );
    }

    #[tokio::test]
    async fn expired_override_is_cleared() {
        let (chain, store) = chain();
        let now = Utc::now();
        store.set_override("p1", now - chrono::Duration::seconds(1)).await;
        assert_eq!(chain.evaluate(&ctx("hi", None, now)).await, None);
        assert!(store.override_until("p1").await.is_none());
    }

    #[tokio::test]
    async fn override_checked_before_escalation() {
        let (chain, store) = chain();
        let now = Utc::now();
        store.set_override("p1", now + chrono::Duration::minutes(1)).await;
        store
            .set_escalation(
                "p1",
                EscalationState {
                    until: now + chrono::Duration::minutes(1),
                    reason: HandoffReason::Escalation,
                },
            )
            .await;
        assert_eq!(
            chain.evaluate(&ctx("hi", None, now)).await,
            Some(Suppression::HumanOverride)
        );
    }

    #[tokio::test]
    async fn escalation_suppresses_until_deadline() {
        let (chain, store) = chain();
        let now = Utc::now();
        store
            .set_escalation(
                "p1",
                EscalationState {
                    until: now + chrono::Duration::minutes(20),
                    reason: HandoffReason::Closing,
                },
            )
            .await;
        assert_eq!(
            chain.evaluate(&ctx("hi", None, now)).await,
            Some(Suppression::Escalated)
        );
        let later = now + chrono::Duration::minutes(21);
        assert_eq!(chain.evaluate(&ctx("hi", None, later)).await, None);
        assert!(store.escalation("p1").await.is_none());
    }

    #[tokio::test]
    async fn safe_mode_blocks_when_operator_spoke_last() {
        let (chain, _) = chain();
        assert_eq!(
            chain
                .evaluate(&ctx("ok thanks", operator_spoke_last(), Utc::now()))
                .await,
            Some(Suppression::SafeMode)
        );
    }

    #[tokio::test]
    async fn safe_mode_reopened_by_trigger_keyword() {
        let (chain, _) = chain();
        assert_eq!(
            chain
                .evaluate(&ctx("PRICE kya hai", operator_spoke_last(), Utc::now()))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn safe_mode_passes_when_customer_spoke_last() {
        let (chain, _) = chain();
        let state = Some(SafeModeState {
            replied_message_count: 5,
            last_sender_was_operator: false,
        });
        assert_eq!(chain.evaluate(&ctx("ok", state, Utc::now())).await, None);
    }

    #[tokio::test]
    async fn safe_mode_first_message_rule() {
        let (chain, _) = chain();
        let state = Some(SafeModeState {
            replied_message_count: 0,
            last_sender_was_operator: true,
        });
        assert_eq!(chain.evaluate(&ctx("hello", state, Utc::now())).await, None);
    }

    #[tokio::test]
    async fn rate_limit_depends_on_intent() {
        let (chain, store) = chain();
        let now = Utc::now();
        store
            .set_last_reply(
                "p1",
                LastReply {
                    at: now - chrono::Duration::seconds(10),
                    text: "earlier".into(),
                },
            )
            .await;

        let cold = ctx("hi", None, now);
        assert_eq!(chain.evaluate(&cold).await, Some(Suppression::RateLimited));

        let hot = GateContext {
            intent: LeadIntent::Hot,
            ..ctx("hi", None, now)
        };
        assert_eq!(chain.evaluate(&hot).await, None);
    }

    #[tokio::test]
    async fn rate_limit_expires() {
        let (chain, store) = chain();
        let now = Utc::now();
        store
            .set_last_reply(
                "p1",
                LastReply {
                    at: now - chrono::Duration::seconds(61),
                    text: "earlier".into(),
                },
            )
            .await;
        assert_eq!(chain.evaluate(&ctx("hi", None, now)).await, None);
    }

    #[tokio::test]
    async fn duplicate_compares_previous_reply_only() {
        let (chain, store) = chain();
        assert!(!chain.is_duplicate("p1", "Hello!").await);
        store
            .set_last_reply(
                "p1",
                LastReply {
                    at: Utc::now(),
                    text: "Hello!".into(),
                },
            )
            .await;
        assert!(chain.is_duplicate("p1", "Hello! ").await);
        assert!(!chain.is_duplicate("p1", "Hello again").await);
        assert!(!chain.is_duplicate("p2", "Hello!").await);
    }

    #[test]
    fn keyword_regex_escapes_and_ignores_blanks() {
        let re = keyword_regex(&["a.b", " ", "c+"]).unwrap().unwrap();
        assert!(re.is_match("xx A.B yy"));
        assert!(!re.is_match("axb"));
        assert!(re.is_match("c+"));
        assert!(keyword_regex(&[]).unwrap().is_none());
    }
}

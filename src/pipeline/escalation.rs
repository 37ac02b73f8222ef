//! Escalation/handoff controller.
//!
//! Detects phrases that need a human and silences the bot for that
//! participant. Order-confirmation signals (address, pin code, payment done)
//! take priority and produce a long CLOSING silence; discount requests and
//! confusion produce a shorter ESCALATION silence. In both cases the caller
//! sends the returned fixed message instead of generating a reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::info;

use crate::pipeline::types::HandoffReason;
use crate::store::{EscalationState, StateStore};

const CLOSING_MESSAGE: &str = "Thank you! 🙏 Your order details are noted. Our team will \
confirm your order and share the next steps shortly.";

const ESCALATION_MESSAGE: &str = "Let me connect you with our team for this. Someone will \
get back to you here shortly. 🙏";

/// A matched handoff: what to send and how long to stay silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub reason: HandoffReason,
    pub message: String,
    pub until: DateTime<Utc>,
}

/// Pattern sets and messages for the two handoff kinds.
#[derive(Debug, Clone)]
pub struct HandoffRules {
    pub closing_patterns: Vec<Regex>,
    pub escalation_patterns: Vec<Regex>,
    pub closing_message: String,
    pub escalation_message: String,
    pub closing_duration: Duration,
    pub escalation_duration: Duration,
}

impl HandoffRules {
    /// Default patterns with the given silence windows.
    pub fn default_rules(escalation_duration: Duration, closing_duration: Duration) -> Self {
        let closing_patterns = vec![
            // "pin code 560001", "pincode: 400 001"
            Regex::new(r"(?i)\bpin\s*-?\s*code\b").unwrap(),
            Regex::new(r"(?i)\b(my )?(full )?address\s*(is|:|-)").unwrap(),
            Regex::new(r"(?i)\b(house|flat|plot)\s*(no|number)\b").unwrap(),
            Regex::new(
                r"(?i)\b(payment\s*(done|kar\s*di|kar\s*diya|ho\s*gaya|sent|completed)|paid|paise\s*bhej\s*diye)\b",
            )
            .unwrap(),
        ];
        let escalation_patterns = vec![
            Regex::new(r"(?i)\b(discount|kam\s*karo|kam\s*kar\s*do|kuch\s*kam|thoda\s*kam|best\s*price|last\s*price)\b")
                .unwrap(),
            Regex::new(
                r"(?i)(samajh\s*nahi|samjha\s*nahi|confused|don'?t\s*understand|not\s*understand|call\s*me|talk\s*to\s*(a\s*)?(human|person))",
            )
            .unwrap(),
        ];

        Self {
            closing_patterns,
            escalation_patterns,
            closing_message: CLOSING_MESSAGE.to_string(),
            escalation_message: ESCALATION_MESSAGE.to_string(),
            closing_duration,
            escalation_duration,
        }
    }

    /// Which handoff `text` triggers, closing first.
    pub fn detect(&self, text: &str) -> Option<HandoffReason> {
        if self.closing_patterns.iter().any(|r| r.is_match(text)) {
            Some(HandoffReason::Closing)
        } else if self.escalation_patterns.iter().any(|r| r.is_match(text)) {
            Some(HandoffReason::Escalation)
        } else {
            None
        }
    }
}

/// Detects handoff phrases and records the resulting silence.
pub struct EscalationController {
    rules: HandoffRules,
    store: Arc<dyn StateStore>,
}

impl EscalationController {
    pub fn new(rules: HandoffRules, store: Arc<dyn StateStore>) -> Self {
        Self { rules, store }
    }

    /// Check `text` for handoff signals. On a match the participant is
    /// silenced and the message to send is returned.
    pub async fn check_and_handoff(
        &self,
        participant: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Option<Handoff> {
        let reason = self.rules.detect(text)?;
        let (duration, message) = match reason {
            HandoffReason::Closing => (self.rules.closing_duration, &self.rules.closing_message),
            HandoffReason::Escalation => {
                (self.rules.escalation_duration, &self.rules.escalation_message)
            }
        };
        let until = now
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(24));

        self.store
            .set_escalation(participant, EscalationState { until, reason })
            .await;

        info!(
            participant,
            reason = reason.label(),
            until = %until,
            "Conversation handed off to a human"
        );

        Some(Handoff {
            reason,
            message: message.clone(),
            until,
        })
    }
}

//! Single-async-interface store for all per-participant state.
//!
//! The orchestrator, gates, and schedulers only talk to this trait, so the
//! persistence strategy can change without touching business logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{HandoffReason, LeadIntent};

/// Who authored a turn in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of a participant's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Who spoke last, and how many customer turns were seen. Durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeModeState {
    pub replied_message_count: u64,
    pub last_sender_was_operator: bool,
}

/// Stored lead intent. Durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub intent: LeadIntent,
    pub updated_at: DateTime<Utc>,
}

/// Automated silence set by the handoff controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationState {
    pub until: DateTime<Utc>,
    pub reason: HandoffReason,
}

/// The most recent reply delivered to a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastReply {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Backend-agnostic store covering history, safe mode, leads, and silences.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── History ─────────────────────────────────────────────────────

    /// Conversation history in chronological order.
    async fn history(&self, participant: &str) -> Vec<ConversationTurn>;

    /// Append a turn, then drop the oldest turns beyond `max_turns`.
    async fn append_turn(&self, participant: &str, turn: ConversationTurn, max_turns: usize);

    /// Remove and return the newest turn.
    async fn pop_turn(&self, participant: &str) -> Option<ConversationTurn>;

    // ── Safe mode ───────────────────────────────────────────────────

    async fn safe_mode(&self, participant: &str) -> Option<SafeModeState>;

    async fn put_safe_mode(&self, participant: &str, state: SafeModeState);

    // ── Leads ───────────────────────────────────────────────────────

    async fn lead(&self, participant: &str) -> Option<LeadRecord>;

    async fn put_lead(&self, participant: &str, record: LeadRecord);

    // ── Human override ──────────────────────────────────────────────

    async fn override_until(&self, participant: &str) -> Option<DateTime<Utc>>;

    async fn set_override(&self, participant: &str, until: DateTime<Utc>);

    async fn clear_override(&self, participant: &str);

    // ── Escalation ──────────────────────────────────────────────────

    async fn escalation(&self, participant: &str) -> Option<EscalationState>;

    async fn set_escalation(&self, participant: &str, state: EscalationState);

    async fn clear_escalation(&self, participant: &str);

    // ── Rate limit ──────────────────────────────────────────────────

    async fn last_reply(&self, participant: &str) -> Option<LastReply>;

    async fn set_last_reply(&self, participant: &str, reply: LastReply);
}

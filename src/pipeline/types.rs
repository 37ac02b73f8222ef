//! Shared types for the reply pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound event ───────────────────────────────────────────────────

/// What kind of payload a chat event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    /// Image, audio, sticker, location, ... carried as the platform's type label.
    Other(String),
}

/// A chat event normalized from the webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Normalized participant identifier (customer phone number).
    pub participant: String,
    /// Text body. Empty for non-text events.
    pub text: String,
    /// Authored from the business account (operator or bot echo).
    pub from_me: bool,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Customer-authored text event.
    pub fn customer_text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            text: text.into(),
            from_me: false,
            kind: EventKind::Text,
            received_at: Utc::now(),
        }
    }

    /// Business-authored text event.
    pub fn operator_text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from_me: true,
            ..Self::customer_text(participant, text)
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == EventKind::Text && !self.text.trim().is_empty()
    }
}

// ── Lead intent ─────────────────────────────────────────────────────

/// Buying readiness of a participant. Only ever ratchets upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeadIntent {
    Cold,
    Warm,
    Hot,
}

impl LeadIntent {
    pub fn rank(self) -> u8 {
        match self {
            Self::Cold => 1,
            Self::Warm => 2,
            Self::Hot => 3,
        }
    }

    pub fn outranks(self, other: LeadIntent) -> bool {
        self.rank() > other.rank()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cold => "COLD",
            Self::Warm => "WARM",
            Self::Hot => "HOT",
        }
    }
}

// ── Handoff ─────────────────────────────────────────────────────────

/// Why the bot handed a conversation to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    /// Discount request or confusion.
    Escalation,
    /// Order confirmation (address, pin code, payment done).
    Closing,
}

impl HandoffReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Escalation => "escalation",
            Self::Closing => "closing",
        }
    }
}

// ── Turn outcome ────────────────────────────────────────────────────

/// Why a turn produced no generated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    HumanOverride,
    Escalated,
    SafeMode,
    RateLimited,
    DuplicateReply,
}

impl Suppression {
    pub fn label(self) -> &'static str {
        match self {
            Self::HumanOverride => "human_override",
            Self::Escalated => "escalated",
            Self::SafeMode => "safe_mode",
            Self::RateLimited => "rate_limited",
            Self::DuplicateReply => "duplicate_reply",
        }
    }
}

/// Terminal state of one logical turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Suppressed(Suppression),
    HandoffSent(HandoffReason),
    Replied { text: String, delivered: bool },
    GenerationFailed,
}

impl TurnOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Suppressed(reason) => reason.label(),
            Self::HandoffSent(reason) => reason.label(),
            Self::Replied { .. } => "replied",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

/// Per-participant position in the reply state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Batching,
    Evaluating,
    Generating,
}

/// A debounced burst of customer messages ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub participant: String,
    /// All texts of the burst joined with a space, in arrival order.
    pub text: String,
    pub message_count: usize,
}

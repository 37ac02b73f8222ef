//! WhatsApp webhook payload types and participant normalization.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::pipeline::types::{EventKind, InboundEvent};

/// Body of a `POST /webhook` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// A single message of the webhook payload.
///
/// Messages are kept as raw JSON in [`WebhookPayload`] and parsed one by
/// one, so a malformed entry doesn't reject its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    #[serde(default)]
    pub id: Option<String>,
    /// Sender chat address (customer for inbound, business number for `from_me`).
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    /// Chat the message belongs to. Always the customer's chat.
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
}

impl WebhookMessage {
    /// Parse one raw message entry.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, ChannelError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| ChannelError::InvalidMessage(format!("bad webhook message: {e}")))
    }

    /// Convert into a pipeline event.
    ///
    /// The participant is always the customer: for business-authored
    /// messages it comes from `chat_id` (or `to`), otherwise from `from`.
    pub fn into_event(self) -> Result<InboundEvent, ChannelError> {
        let address = if self.from_me {
            self.chat_id
                .as_deref()
                .or(self.to.as_deref())
                .ok_or_else(|| {
                    ChannelError::InvalidMessage("from_me message without chat_id or to".into())
                })?
        } else {
            self.chat_id.as_deref().unwrap_or(&self.from)
        };

        let participant = normalize_participant(address)
            .ok_or_else(|| ChannelError::InvalidMessage(format!("bad chat address: {address}")))?;

        let (kind, text) = if self.kind == "text" {
            let body = self
                .text
                .map(|t| t.body)
                .ok_or_else(|| ChannelError::InvalidMessage("text message without body".into()))?;
            (EventKind::Text, body)
        } else {
            (EventKind::Other(self.kind), String::new())
        };

        Ok(InboundEvent {
            participant,
            text,
            from_me: self.from_me,
            kind,
            received_at: Utc::now(),
        })
    }
}

/// Reduce a chat address to the bare phone number.
///
/// `"+91 98765-43210@s.whatsapp.net"` → `"919876543210"`. Group chats
/// (`@g.us`) and addresses without digits yield `None`.
pub fn normalize_participant(address: &str) -> Option<String> {
    let (local, domain) = match address.split_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (address, None),
    };
    if domain == Some("g.us") {
        return None;
    }
    // Multi-device addresses carry a ":<device>" suffix.
    let local = local.split(':').next().unwrap_or(local);
    let digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

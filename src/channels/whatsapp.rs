//! WhatsApp delivery through a Whapi-style HTTP gateway.
//!
//! `POST {base}/messages/text` with `{"to": "<number>", "body": "<text>"}`
//! and a bearer token.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::channels::MessageSender;
use crate::error::ChannelError;

/// Maximum message length accepted by WhatsApp.
const WHATSAPP_MAX_MESSAGE_LENGTH: usize = 4096;

/// Sends text messages through the WhatsApp gateway.
pub struct WhatsAppSender {
    base_url: String,
    token: SecretString,
    client: reqwest::Client,
}

impl WhatsAppSender {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn send_chunk(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "to": recipient,
            "body": text,
        });

        let resp = self
            .client
            .post(self.api_url("messages/text"))
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            debug!(recipient, "WhatsApp message sent");
            return Ok(());
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChannelError::AuthFailed {
                name: "whatsapp".into(),
            });
        }

        let err = resp.text().await.unwrap_or_default();
        warn!(recipient, status = %status, "WhatsApp send rejected");
        Err(ChannelError::SendFailed {
            name: "whatsapp".into(),
            reason: format!("gateway returned {status}: {err}"),
        })
    }
}

#[async_trait]
impl MessageSender for WhatsAppSender {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, WHATSAPP_MAX_MESSAGE_LENGTH) {
            self.send_chunk(recipient, &chunk).await?;
        }
        Ok(())
    }
}

/// Split a message into chunks of at most `max_len` bytes.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

//! Outbound delivery abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Delivers text to a chat participant. Pure I/O, no business logic.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Channel name (e.g. "whatsapp").
    fn name(&self) -> &str;

    /// Send `text` to `recipient` (a normalized participant identifier).
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), ChannelError>;
}

/// Send through `sender`, failing with [`ChannelError::Timeout`] if the call
/// takes longer than `timeout`.
pub async fn deliver(
    sender: &dyn MessageSender,
    recipient: &str,
    text: &str,
    timeout: Duration,
) -> Result<(), ChannelError> {
    match tokio::time::timeout(timeout, sender.send_text(recipient, text)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout {
            name: sender.name().to_string(),
            timeout,
        }),
    }
}

//! Chat channel I/O: webhook payloads in, text delivery out.

pub mod channel;
pub mod whatsapp;
pub mod whatsapp_types;

pub use channel::*;
pub use whatsapp::WhatsAppSender;
pub use whatsapp_types::{WebhookMessage, WebhookPayload, normalize_participant};

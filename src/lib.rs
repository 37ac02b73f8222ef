//! Lead Assist — WhatsApp sales auto-responder.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod server;
pub mod store;

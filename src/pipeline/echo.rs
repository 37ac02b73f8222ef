//! Outgoing-message log used to tell bot echoes from operator messages.
//!
//! The WhatsApp gateway reports every message sent from the business number
//! as a `from_me` event, including the ones this service delivered. Those
//! echoes must not be mistaken for a human operator taking over.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// How many recent outgoing texts are remembered per participant.
const MAX_REMEMBERED: usize = 8;

#[derive(Default)]
pub struct SentLog {
    sent: Mutex<HashMap<String, VecDeque<String>>>,
}

impl SentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a text the service is about to deliver.
    pub fn remember(&self, participant: &str, text: &str) {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let recent = sent.entry(participant.to_string()).or_default();
        recent.push_back(normalize(text));
        while recent.len() > MAX_REMEMBERED {
            recent.pop_front();
        }
    }

    /// Drop the newest matching entry after a delivery that never went out.
    pub fn forget(&self, participant: &str, text: &str) {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let Some(recent) = sent.get_mut(participant) else {
            return;
        };
        let needle = normalize(text);
        if let Some(idx) = recent.iter().rposition(|t| *t == needle) {
            recent.remove(idx);
        }
    }

    /// If `text` matches something we sent, consume that entry and return true.
    pub fn take_echo(&self, participant: &str, text: &str) -> bool {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let Some(recent) = sent.get_mut(participant) else {
            return false;
        };
        let needle = normalize(text);
        match recent.iter().position(|t| *t == needle) {
            Some(idx) => {
                recent.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

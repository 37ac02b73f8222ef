//! Keyword-based lead classifier with an upward-only ratchet.
//!
//! HOT keywords are checked before WARM; anything else is COLD. The stored
//! intent for a participant is only replaced by a higher-ranked one, so a
//! HOT lead stays HOT for the lifetime of the stored state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::pipeline::types::LeadIntent;
use crate::store::{LeadRecord, StateStore};

/// Keyword sets for each intent level, matched as lowercase substrings.
#[derive(Debug, Clone)]
pub struct LeadKeywords {
    pub hot: Vec<String>,
    pub warm: Vec<String>,
}

impl Default for LeadKeywords {
    fn default() -> Self {
        let hot = [
            "order", "buy", "book", "confirm", "cod", "cash on delivery", "payment", "pay now",
            "address", "pin code", "pincode", "le lunga", "chahiye",
        ];
        let warm = [
            "price", "rate", "cost", "kitne", "kitna", "kya hai", "available", "size", "colour",
            "color", "delivery", "shipping", "details", "catalog",
        ];
        Self {
            hot: hot.iter().map(|s| s.to_string()).collect(),
            warm: warm.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Classifies message text and ratchets the stored intent.
pub struct LeadClassifier {
    keywords: LeadKeywords,
    store: Arc<dyn StateStore>,
}

impl LeadClassifier {
    pub fn new(keywords: LeadKeywords, store: Arc<dyn StateStore>) -> Self {
        Self { keywords, store }
    }

    /// Intent of `text` alone, ignoring stored state.
    pub fn detect(&self, text: &str) -> LeadIntent {
        let lower = text.to_lowercase();
        if self.keywords.hot.iter().any(|k| lower.contains(k.as_str())) {
            LeadIntent::Hot
        } else if self.keywords.warm.iter().any(|k| lower.contains(k.as_str())) {
            LeadIntent::Warm
        } else {
            LeadIntent::Cold
        }
    }

    /// Classify `text` and return the participant's effective intent.
    ///
    /// The stored intent is overwritten only when the new one outranks it.
    pub async fn classify(&self, participant: &str, text: &str) -> LeadIntent {
        let detected = self.detect(text);
        let stored = self.store.lead(participant).await;

        match stored {
            Some(record) if !detected.outranks(record.intent) => {
                debug!(
                    participant,
                    detected = detected.label(),
                    stored = record.intent.label(),
                    "Keeping stored lead intent"
                );
                record.intent
            }
            previous => {
                info!(
                    participant,
                    from = previous.map(|r| r.intent.label()).unwrap_or("none"),
                    to = detected.label(),
                    "Lead intent updated"
                );
                self.store
                    .put_lead(
                        participant,
                        LeadRecord {
                            intent: detected,
                            updated_at: Utc::now(),
                        },
                    )
                    .await;
                detected
            }
        }
    }

    /// Stored intent, COLD if never classified.
    pub async fn current(&self, participant: &str) -> LeadIntent {
        self.store
            .lead(participant)
            .await
            .map(|r| r.intent)
            .unwrap_or(LeadIntent::Cold)
    }
}

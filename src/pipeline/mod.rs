//! Conversational reply pipeline.
//!
//! Customer text flows through:
//! 1. `Debouncer::push()` — bursts become one turn
//! 2. `SuppressionChain::evaluate()` — override, escalation, safe mode, rate limit
//! 3. `LeadClassifier::classify()` — COLD/WARM/HOT ratchet
//! 4. `EscalationController::check_and_handoff()` — fixed handoff message, no generation
//! 5. Generation, duplicate check, delivery
//!
//! `FollowUpScheduler` nudges conversations that went quiet.

pub mod debounce;
pub mod echo;
pub mod escalation;
pub mod followup;
pub mod gates;
pub mod lead;
pub mod processor;
pub mod types;

pub use processor::ReplyOrchestrator;

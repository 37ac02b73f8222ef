//! Persistence layer — per-participant conversation state.

pub mod file;
pub mod traits;

pub use file::{FileStateStore, PersistedState};
pub use traits::{
    ConversationTurn, EscalationState, LastReply, LeadRecord, Role, SafeModeState, StateStore,
};

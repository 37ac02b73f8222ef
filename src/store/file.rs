//! File-backed state store.
//!
//! Everything lives in memory. The durable subset (safe mode + leads) is
//! mirrored to a small JSON file after every change to it:
//!
//! ```json
//! { "safeMode": { "919876543210": { "repliedMessageCount": 3, "lastSenderWasOperator": false } },
//!   "leads":    { "919876543210": { "intent": "HOT", "updatedAt": "2026-01-01T00:00:00Z" } } }
//! ```
//!
//! Persistence is best-effort: read and write failures are logged and the
//! service keeps running from memory.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::traits::{
    ConversationTurn, EscalationState, LastReply, LeadRecord, SafeModeState, StateStore,
};
use crate::error::StoreError;

/// On-disk shape of the durable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub safe_mode: HashMap<String, SafeModeState>,
    #[serde(default)]
    pub leads: HashMap<String, LeadRecord>,
}

/// In-memory state store with JSON mirroring of the durable subset.
pub struct FileStateStore {
    path: Option<PathBuf>,
    durable: RwLock<PersistedState>,
    history: RwLock<HashMap<String, VecDeque<ConversationTurn>>>,
    overrides: RwLock<HashMap<String, DateTime<Utc>>>,
    escalations: RwLock<HashMap<String, EscalationState>>,
    last_replies: RwLock<HashMap<String, LastReply>>,
    /// Serializes file rewrites so an older snapshot never lands last.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    fn with_state(path: Option<PathBuf>, durable: PersistedState) -> Self {
        Self {
            path,
            durable: RwLock::new(durable),
            history: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            escalations: RwLock::new(HashMap::new()),
            last_replies: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_state(None, PersistedState::default())
    }

    /// Load durable state from `path`.
    ///
    /// A missing or corrupt file is not fatal: the store starts empty and
    /// the next mutation rewrites the file.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let durable = match read_state(&path).await {
            Ok(Some(state)) => {
                info!(
                    path = %path.display(),
                    safe_mode = state.safe_mode.len(),
                    leads = state.leads.len(),
                    "Loaded durable state"
                );
                state
            }
            Ok(None) => {
                info!(path = %path.display(), "No state file yet, starting empty");
                PersistedState::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file unreadable, starting empty");
                PersistedState::default()
            }
        };
        Self::with_state(Some(path), durable)
    }

    /// Copy of the durable subset.
    pub async fn snapshot(&self) -> PersistedState {
        self.durable.read().await.clone()
    }

    /// Rewrite the state file from the current in-memory state.
    async fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        let snapshot = self.durable.read().await.clone();
        if let Err(e) = write_state(path, &snapshot).await {
            warn!(path = %path.display(), error = %e, "Failed to persist state, continuing in memory");
        } else {
            debug!(path = %path.display(), "State persisted");
        }
    }
}

async fn read_state(path: &Path) -> Result<Option<PersistedState>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_state(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(state)?;
    // Write-then-rename so a crash mid-write leaves the previous file intact.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn history(&self, participant: &str) -> Vec<ConversationTurn> {
        self.history
            .read()
            .await
            .get(participant)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn append_turn(&self, participant: &str, turn: ConversationTurn, max_turns: usize) {
        let mut history = self.history.write().await;
        let turns = history.entry(participant.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > max_turns {
            turns.pop_front();
        }
    }

    async fn pop_turn(&self, participant: &str) -> Option<ConversationTurn> {
        self.history
            .write()
            .await
            .get_mut(participant)
            .and_then(VecDeque::pop_back)
    }

    async fn safe_mode(&self, participant: &str) -> Option<SafeModeState> {
        self.durable.read().await.safe_mode.get(participant).copied()
    }

    async fn put_safe_mode(&self, participant: &str, state: SafeModeState) {
        self.durable
            .write()
            .await
            .safe_mode
            .insert(participant.to_string(), state);
        self.persist().await;
    }

    async fn lead(&self, participant: &str) -> Option<LeadRecord> {
        self.durable.read().await.leads.get(participant).copied()
    }

    async fn put_lead(&self, participant: &str, record: LeadRecord) {
        self.durable
            .write()
            .await
            .leads
            .insert(participant.to_string(), record);
        self.persist().await;
    }

    async fn override_until(&self, participant: &str) -> Option<DateTime<Utc>> {
        self.overrides.read().await.get(participant).copied()
    }

    async fn set_override(&self, participant: &str, until: DateTime<Utc>) {
        self.overrides
            .write()
            .await
            .insert(participant.to_string(), until);
    }

    async fn clear_override(&self, participant: &str) {
        self.overrides.write().await.remove(participant);
    }

    async fn escalation(&self, participant: &str) -> Option<EscalationState> {
        self.escalations.read().await.get(participant).copied()
    }

    async fn set_escalation(&self, participant: &str, state: EscalationState) {
        self.escalations
            .write()
            .await
            .insert(participant.to_string(), state);
    }

    async fn clear_escalation(&self, participant: &str) {
        self.escalations.write().await.remove(participant);
    }

    async fn last_reply(&self, participant: &str) -> Option<LastReply> {
        self.last_replies.read().await.get(participant).cloned()
    }

    async fn set_last_reply(&self, participant: &str, reply: LastReply) {
        self.last_replies
            .write()
            .await
            .insert(participant.to_string(), reply);
    }
}

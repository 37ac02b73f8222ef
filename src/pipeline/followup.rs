//! Follow-up nudges for conversations that went quiet.
//!
//! Every qualifying inbound event re-arms stage one for that participant.
//! When a stage fires and nothing silenced the conversation in the
//! meantime, a canned nudge is delivered; stage one then arms stage two.
//! At most `max_nudges` are ever sent per conversation. Operator activity
//! cancels the pending timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::{MessageSender, deliver};
use crate::pipeline::echo::SentLog;
use crate::store::{ConversationTurn, LastReply, StateStore};

const FIRST_NUDGE: &str = "Hi! Just checking in, did you get a chance to look at the options? \
Happy to help if you have any questions 😊";

const SECOND_NUDGE: &str = "Hello again! Stock on popular items moves fast. Let me know if you'd \
like me to keep one aside for you.";

/// Which nudge a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    First,
    Second,
}

/// Follow-up cadence and messages.
#[derive(Debug, Clone)]
pub struct FollowUpConfig {
    pub first_delay: Duration,
    pub second_delay: Duration,
    pub max_nudges: u32,
    pub first_message: String,
    pub second_message: String,
    pub delivery_timeout: Duration,
    /// History cap applied when a nudge is recorded.
    pub max_history_turns: usize,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(30 * 60),
            second_delay: Duration::from_secs(120 * 60),
            max_nudges: 2,
            first_message: FIRST_NUDGE.to_string(),
            second_message: SECOND_NUDGE.to_string(),
            delivery_timeout: Duration::from_secs(15),
            max_history_turns: 20,
        }
    }
}

struct ArmedTimer {
    id: u64,
    stage: Stage,
    handle: JoinHandle<()>,
}

struct Inner {
    config: FollowUpConfig,
    store: Arc<dyn StateStore>,
    sender: Arc<dyn MessageSender>,
    sent_log: Arc<SentLog>,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    nudges: Mutex<HashMap<String, u32>>,
    next_id: AtomicU64,
}

/// Per-participant nudge timers.
#[derive(Clone)]
pub struct FollowUpScheduler {
    inner: Arc<Inner>,
}

impl FollowUpScheduler {
    pub fn new(
        config: FollowUpConfig,
        store: Arc<dyn StateStore>,
        sender: Arc<dyn MessageSender>,
        sent_log: Arc<SentLog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                sender,
                sent_log,
                timers: Mutex::new(HashMap::new()),
                nudges: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Cancel any pending timer for `participant` and arm `stage`.
    pub fn arm(&self, participant: &str, stage: Stage) {
        self.inner.arm(participant, stage);
    }

    /// Cancel the pending timer, if any. Returns whether one was armed.
    pub fn cancel(&self, participant: &str) -> bool {
        let removed = lock(&self.inner.timers).remove(participant);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                debug!(participant, "Follow-up cancelled");
                true
            }
            None => false,
        }
    }

    /// Stage of the pending timer, if one is armed.
    pub fn armed_stage(&self, participant: &str) -> Option<Stage> {
        lock(&self.inner.timers).get(participant).map(|t| t.stage)
    }

    pub fn is_armed(&self, participant: &str) -> bool {
        lock(&self.inner.timers).contains_key(participant)
    }

    pub fn nudges_sent(&self, participant: &str) -> u32 {
        lock(&self.inner.nudges).get(participant).copied().unwrap_or(0)
    }
}

impl Inner {
    fn arm(self: &Arc<Self>, participant: &str, stage: Stage) {
        if self.nudge_count(participant) >= self.config.max_nudges {
            debug!(participant, "Nudge limit reached, not arming follow-up");
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = match stage {
            Stage::First => self.config.first_delay,
            Stage::Second => self.config.second_delay,
        };

        let inner = Arc::clone(self);
        let key = participant.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(&key, id, stage).await;
        });

        let previous = lock(&self.timers).insert(
            participant.to_string(),
            ArmedTimer { id, stage, handle },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(participant, ?stage, delay_secs = delay.as_secs(), "Follow-up armed");
    }

    /// Timer body. Removes its own entry first so re-arming from here never
    /// aborts the running task.
    async fn fire(self: &Arc<Self>, participant: &str, id: u64, stage: Stage) {
        {
            let mut timers = lock(&self.timers);
            match timers.get(participant) {
                Some(t) if t.id == id => {
                    timers.remove(participant);
                }
                _ => return,
            }
        }

        if !self.may_nudge(participant).await {
            return;
        }

        let message = match stage {
            Stage::First => &self.config.first_message,
            Stage::Second => &self.config.second_message,
        };

        self.sent_log.remember(participant, message);
        if let Err(e) = deliver(
            self.sender.as_ref(),
            participant,
            message,
            self.config.delivery_timeout,
        )
        .await
        {
            warn!(participant, ?stage, error = %e, "Follow-up delivery failed");
            self.sent_log.forget(participant, message);
            return;
        }

        let sent = {
            let mut nudges = lock(&self.nudges);
            let count = nudges.entry(participant.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.record_outgoing(participant, message).await;
        info!(participant, ?stage, nudges = sent, "Follow-up nudge sent");

        // Only chain to stage two if nothing re-armed us while we were sending.
        if stage == Stage::First && !lock(&self.timers).contains_key(participant) {
            self.arm(participant, Stage::Second);
        }
    }

    async fn may_nudge(&self, participant: &str) -> bool {
        let now = Utc::now();
        if self.nudge_count(participant) >= self.config.max_nudges {
            return false;
        }
        if self
            .store
            .override_until(participant)
            .await
            .is_some_and(|until| now < until)
        {
            debug!(participant, "Human override active, skipping nudge");
            return false;
        }
        if self
            .store
            .escalation(participant)
            .await
            .is_some_and(|e| now < e.until)
        {
            debug!(participant, "Conversation handed off, skipping nudge");
            return false;
        }
        true
    }

    async fn record_outgoing(&self, participant: &str, text: &str) {
        self.store
            .append_turn(
                participant,
                ConversationTurn::assistant(text),
                self.config.max_history_turns,
            )
            .await;
        let mut safe = self.store.safe_mode(participant).await.unwrap_or_default();
        safe.last_sender_was_operator = true;
        self.store.put_safe_mode(participant, safe).await;
        self.store
            .set_last_reply(
                participant,
                LastReply {
                    at: Utc::now(),
                    text: text.to_string(),
                },
            )
            .await;
    }

    fn nudge_count(&self, participant: &str) -> u32 {
        lock(&self.nudges).get(participant).copied().unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::ChannelError;
    use crate::store::FileStateStore;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSender {
        fn texts(&self) -> Vec<String> {
            lock(&self.sent).iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_text(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
            lock(&self.sent).push((recipient.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct OfflineSender;

    #[async_trait]
    impl MessageSender for OfflineSender {
        fn name(&self) -> &str {
            "offline"
        }

        async fn send_text(&self, _recipient: &str, _text: &str) -> Result<(), ChannelError> {
            Err(ChannelError::SendFailed {
                name: "offline".into(),
                reason: "gateway down".into(),
            })
        }
    }

    fn config(max_nudges: u32) -> FollowUpConfig {
        FollowUpConfig {
            first_delay: Duration::from_secs(600),
            second_delay: Duration::from_secs(1800),
            max_nudges,
            ..FollowUpConfig::default()
        }
    }

    fn scheduler(
        max_nudges: u32,
    ) -> (FollowUpScheduler, Arc<RecordingSender>, Arc<FileStateStore>) {
        let store = Arc::new(FileStateStore::in_memory());
        let sender = Arc::new(RecordingSender::default());
        let scheduler = FollowUpScheduler::new(
            config(max_nudges),
            store.clone(),
            sender.clone(),
            Arc::new(SentLog::new()),
        );
        (scheduler, sender, store)
    }

    #[tokio::test(start_paused = true)]
    async fn two_stage_nudges() {
        let (scheduler, sender, store) = scheduler(2);
        scheduler.arm("p1", Stage::First);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(sender.texts(), vec![FIRST_NUDGE.to_string()]);
        assert_eq!(scheduler.nudges_sent("p1"), 1);
        assert_eq!(scheduler.armed_stage("p1"), Some(Stage::Second));

        tokio::time::sleep(Duration::from_secs(1801)).await;
        assert_eq!(sender.texts().len(), 2);
        assert_eq!(sender.texts()[1], SECOND_NUDGE);
        assert_eq!(scheduler.nudges_sent("p1"), 2);
        assert_eq!(scheduler.armed_stage("p1"), None);

        // The nudges are part of the conversation now.
        assert_eq!(store.history("p1").await.len(), 2);
        assert!(store.safe_mode("p1").await.unwrap().last_sender_was_operator);
    }

    #[tokio::test(start_paused = true)]
    async fn max_nudges_is_respected() {
        let (scheduler, sender, _) = scheduler(1);
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(sender.texts().len(), 1);
        assert_eq!(scheduler.armed_stage("p1"), None);

        // Re-arming after the limit is a no-op.
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(5000)).await;
        assert_eq!(sender.texts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_restarts_the_delay() {
        let (scheduler, sender, _) = scheduler(2);
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(500)).await;
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert!(sender.texts().is_empty());
        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(sender.texts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_nudge() {
        let (scheduler, sender, _) = scheduler(2);
        scheduler.arm("p1", Stage::First);
        assert!(scheduler.cancel("p1"));
        tokio::time::sleep(Duration::from_secs(5000)).await;
        assert!(sender.texts().is_empty());
        assert!(!scheduler.cancel("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn override_skips_nudge() {
        let (scheduler, sender, store) = scheduler(2);
        store
            .set_override("p1", Utc::now() + chrono::Duration::hours(5))
            .await;
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(sender.texts().is_empty());
        assert_eq!(scheduler.nudges_sent("p1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn participants_have_independent_timers() {
        let (scheduler, sender, _) = scheduler(2);
        scheduler.arm("p1", Stage::First);
        scheduler.arm("p2", Stage::First);
        scheduler.cancel("p1");
        tokio::time::sleep(Duration::from_secs(601)).await;
        let sent = lock(&sender.sent).clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "p2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_nudge_is_not_remembered_as_ours() {
        let store = Arc::new(FileStateStore::in_memory());
        let sent_log = Arc::new(SentLog::new());
        let scheduler = FollowUpScheduler::new(
            config(2),
            store.clone(),
            Arc::new(OfflineSender),
            sent_log.clone(),
        );
        scheduler.arm("p1", Stage::First);
        tokio::time::sleep(Duration::from_secs(601)).await;

        assert_eq!(scheduler.nudges_sent("p1"), 0);
        assert!(store.history("p1").await.is_empty());
        assert!(!sent_log.take_echo("p1", FIRST_NUDGE));
    }
}

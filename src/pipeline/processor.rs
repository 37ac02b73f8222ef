//! Reply orchestrator — drives one conversation turn end to end.
//!
//! Flow per participant:
//! 1. Customer text is debounced into a single turn (BATCHING)
//! 2. Suppression gates run on the pre-turn state (EVALUATING)
//! 3. Lead classification, then the handoff check; a handoff sends its
//!    fixed message and skips generation
//! 4. Otherwise generate (GENERATING), dedupe, record and deliver
//!
//! Operator-authored events only update state: they start a human override
//! and cancel the pending follow-up. Echoes of our own deliveries are
//! recognized through [`SentLog`] and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::channels::{MessageSender, deliver};
use crate::config::PolicyConfig;
use crate::error::PipelineError;
use crate::llm::ReplyGenerator;
use crate::pipeline::debounce::Debouncer;
use crate::pipeline::echo::SentLog;
use crate::pipeline::escalation::{EscalationController, HandoffRules};
use crate::pipeline::followup::{FollowUpConfig, FollowUpScheduler, Stage};
use crate::pipeline::gates::{DEFAULT_TRIGGER_KEYWORDS, GateContext, RateLimit, SuppressionChain};
use crate::pipeline::lead::{LeadClassifier, LeadKeywords};
use crate::pipeline::types::{
    FlushedBatch, InboundEvent, Suppression, TurnOutcome, TurnState,
};
use crate::store::{ConversationTurn, LastReply, StateStore};

/// Owns every per-participant mechanism and runs turns through them.
pub struct ReplyOrchestrator {
    store: Arc<dyn StateStore>,
    sender: Arc<dyn MessageSender>,
    generator: ReplyGenerator,
    chain: SuppressionChain,
    classifier: LeadClassifier,
    escalation: EscalationController,
    debouncer: Debouncer,
    followup: FollowUpScheduler,
    sent_log: Arc<SentLog>,
    policy: PolicyConfig,
    /// One lock per participant; a turn holds it from gates to delivery.
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    turn_states: Mutex<HashMap<String, TurnState>>,
}

impl ReplyOrchestrator {
    /// Wire up the pipeline. Flushed batches arrive on the returned
    /// receiver; hand it to [`ReplyOrchestrator::spawn_dispatcher`].
    pub fn new(
        policy: PolicyConfig,
        store: Arc<dyn StateStore>,
        sender: Arc<dyn MessageSender>,
        generator: ReplyGenerator,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FlushedBatch>), PipelineError> {
        let chain = SuppressionChain::new(
            Arc::clone(&store),
            DEFAULT_TRIGGER_KEYWORDS,
            RateLimit {
                hot_interval: policy.hot_reply_interval,
                default_interval: policy.reply_interval,
            },
        )?;
        let classifier = LeadClassifier::new(LeadKeywords::default(), Arc::clone(&store));
        let escalation = EscalationController::new(
            HandoffRules::default_rules(policy.escalation_duration, policy.closing_duration),
            Arc::clone(&store),
        );
        let (debouncer, batches) = Debouncer::new(policy.debounce_wait);

        let sent_log = Arc::new(SentLog::new());
        let followup = FollowUpScheduler::new(
            FollowUpConfig {
                first_delay: policy.followup_first_delay,
                second_delay: policy.followup_second_delay,
                max_nudges: policy.followup_max_nudges,
                delivery_timeout: policy.delivery_timeout,
                max_history_turns: policy.max_history_pairs * 2,
                ..FollowUpConfig::default()
            },
            Arc::clone(&store),
            Arc::clone(&sender),
            Arc::clone(&sent_log),
        );

        let orchestrator = Self {
            store,
            sender,
            generator,
            chain,
            classifier,
            escalation,
            debouncer,
            followup,
            sent_log,
            policy,
            turn_locks: Mutex::new(HashMap::new()),
            turn_states: Mutex::new(HashMap::new()),
        };
        Ok((orchestrator, batches))
    }

    /// Route one normalized webhook event.
    pub async fn handle_event(&self, event: InboundEvent) {
        if !event.is_text() {
            debug!(participant = %event.participant, kind = ?event.kind, "Ignoring non-text event");
            return;
        }

        if event.from_me {
            if self.sent_log.take_echo(&event.participant, &event.text) {
                debug!(participant = %event.participant, "Echo of our own message");
                return;
            }
            self.observe_operator(&event.participant).await;
            return;
        }

        self.followup.arm(&event.participant, Stage::First);
        self.set_state(&event.participant, TurnState::Batching);
        self.debouncer.push(&event.participant, &event.text);
    }

    /// A human wrote from the business account: back off.
    pub async fn observe_operator(&self, participant: &str) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.policy.override_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        self.store.set_override(participant, until).await;

        let mut safe = self.store.safe_mode(participant).await.unwrap_or_default();
        safe.last_sender_was_operator = true;
        self.store.put_safe_mode(participant, safe).await;

        self.followup.cancel(participant);
        info!(participant, until = %until, "Operator active, automation paused");
    }

    /// Run one debounced turn. Turns for the same participant never overlap.
    pub async fn process_turn(&self, participant: &str, text: &str) -> TurnOutcome {
        let turn_lock = self.turn_lock(participant);
        let _guard = turn_lock.lock().await;

        self.set_state(participant, TurnState::Evaluating);
        let outcome = self.run_turn(participant, text).await;

        let next = if self.debouncer.is_pending(participant) {
            TurnState::Batching
        } else {
            TurnState::Idle
        };
        self.set_state(participant, next);

        info!(participant, outcome = outcome.label(), "Turn finished");
        outcome
    }

    /// Consume flushed batches, one isolated task per batch.
    pub fn spawn_dispatcher(
        self: Arc<Self>,
        mut batches: mpsc::UnboundedReceiver<FlushedBatch>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                debug!(
                    participant = %batch.participant,
                    messages = batch.message_count,
                    "Dispatching flushed batch"
                );
                let span = info_span!("turn", id = %Uuid::new_v4(), participant = %batch.participant);
                let orchestrator = Arc::clone(&self);
                tokio::spawn(
                    async move {
                        orchestrator
                            .process_turn(&batch.participant, &batch.text)
                            .await;
                    }
                    .instrument(span),
                );
            }
            info!("Flush channel closed, dispatcher stopped");
        })
    }

    /// Where `participant` currently is in the turn state machine.
    pub fn turn_state(&self, participant: &str) -> TurnState {
        lock(&self.turn_states)
            .get(participant)
            .copied()
            .unwrap_or(TurnState::Idle)
    }

    pub fn followup(&self) -> &FollowUpScheduler {
        &self.followup
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    async fn run_turn(&self, participant: &str, text: &str) -> TurnOutcome {
        let now = Utc::now();
        let safe_mode = self.store.safe_mode(participant).await;
        let ctx = GateContext {
            participant,
            text,
            now,
            safe_mode,
            intent: self.classifier.current(participant).await,
        };
        let suppression = self.chain.evaluate(&ctx).await;

        // Every processed customer turn counts, suppressed or not.
        let mut observed = safe_mode.unwrap_or_default();
        observed.replied_message_count += 1;
        observed.last_sender_was_operator = false;
        self.store.put_safe_mode(participant, observed).await;

        if let Some(reason) = suppression {
            return TurnOutcome::Suppressed(reason);
        }

        let intent = self.classifier.classify(participant, text).await;

        if let Some(handoff) = self
            .escalation
            .check_and_handoff(participant, text, now)
            .await
        {
            self.followup.cancel(participant);
            self.store
                .append_turn(participant, ConversationTurn::user(text), self.max_turns())
                .await;
            self.record_reply(participant, &handoff.message).await;
            self.send(participant, &handoff.message).await;
            return TurnOutcome::HandoffSent(handoff.reason);
        }

        self.set_state(participant, TurnState::Generating);
        self.store
            .append_turn(participant, ConversationTurn::user(text), self.max_turns())
            .await;
        let history = self.store.history(participant).await;

        let reply = match self.generator.generate(&history, intent).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(participant, error = %e, "Generation failed, rolling back turn");
                self.store.pop_turn(participant).await;
                return TurnOutcome::GenerationFailed;
            }
        };

        if self.chain.is_duplicate(participant, &reply).await {
            info!(participant, "Generated reply repeats the previous one, not sending");
            return TurnOutcome::Suppressed(Suppression::DuplicateReply);
        }

        self.record_reply(participant, &reply).await;
        let delivered = self.send(participant, &reply).await;
        TurnOutcome::Replied {
            text: reply,
            delivered,
        }
    }

    /// Record an outgoing message before it is delivered.
    async fn record_reply(&self, participant: &str, text: &str) {
        self.store
            .append_turn(participant, ConversationTurn::assistant(text), self.max_turns())
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
        self.sent_log.remember(participant, text);
    }

    /// Deliver once. Failures are logged and the text is no longer treated
    /// as ours; the rest of the recorded state stays as is.
    async fn send(&self, participant: &str, text: &str) -> bool {
        match deliver(
            self.sender.as_ref(),
            participant,
            text,
            self.policy.delivery_timeout,
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(participant, error = %e, "Delivery failed");
                self.sent_log.forget(participant, text);
                false
            }
        }
    }

    fn max_turns(&self) -> usize {
        self.policy.max_history_pairs * 2
    }

    fn turn_lock(&self, participant: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            lock(&self.turn_locks)
                .entry(participant.to_string())
                .or_default(),
        )
    }

    fn set_state(&self, participant: &str, state: TurnState) {
        lock(&self.turn_states).insert(participant.to_string(), state);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ChannelError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::pipeline::types::{EventKind, HandoffReason, LeadIntent};
    use crate::store::{FileStateStore, Role, SafeModeState};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_text(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "recording".into(),
                    reason: "offline".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Replies "reply N", a fixed text, or fails.
    #[derive(Default)]
    struct FakeLlm {
        calls: AtomicUsize,
        fixed: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for FakeLlm {
        fn model_name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "fake".into(),
                    reason: "boom".into(),
                });
            }
            Ok(CompletionResponse {
                content: self.fixed.clone().unwrap_or_else(|| format!("reply {n}")),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    struct Harness {
        orchestrator: Arc<ReplyOrchestrator>,
        batches: Option<mpsc::UnboundedReceiver<FlushedBatch>>,
        store: Arc<FileStateStore>,
        sender: Arc<RecordingSender>,
        llm: Arc<FakeLlm>,
    }

    fn no_rate_limit() -> PolicyConfig {
        PolicyConfig {
            hot_reply_interval: Duration::ZERO,
            reply_interval: Duration::ZERO,
            ..PolicyConfig::default()
        }
    }

    fn harness_with(policy: PolicyConfig, llm: FakeLlm, sender: RecordingSender) -> Harness {
        let store = Arc::new(FileStateStore::in_memory());
        let sender = Arc::new(sender);
        let llm = Arc::new(llm);
        let generator = ReplyGenerator::new(llm.clone(), "Test prompt.", Duration::from_secs(5));
        let (orchestrator, batches) =
            ReplyOrchestrator::new(policy, store.clone(), sender.clone(), generator).unwrap();
        Harness {
            orchestrator: Arc::new(orchestrator),
            batches: Some(batches),
            store,
            sender,
            llm,
        }
    }

    fn harness() -> Harness {
        harness_with(no_rate_limit(), FakeLlm::default(), RecordingSender::default())
    }

    impl Harness {
        fn llm_calls(&self) -> usize {
            self.llm.calls.load(Ordering::SeqCst)
        }

        async fn safe_mode(&self, participant: &str) -> SafeModeState {
            self.store.safe_mode(participant).await.unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn first_message_gets_a_reply() {
        let h = harness();
        let outcome = h.orchestrator.process_turn("p1", "hello").await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                text: "reply 1".into(),
                delivered: true
            }
        );
        assert_eq!(h.sender.sent(), vec![("p1".to_string(), "reply 1".to_string())]);

        let history = h.store.history("p1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "hello");
        assert_eq!(history[1].role, Role::Assistant);

        let safe = h.safe_mode("p1").await;
        assert_eq!(safe.replied_message_count, 1);
        assert!(safe.last_sender_was_operator);
        assert_eq!(h.orchestrator.turn_state("p1"), TurnState::Idle);
    }

    #[tokio::test]
    async fn safe_mode_counts_every_turn() {
        let h = harness();

        h.orchestrator.process_turn("p1", "hello").await;
        // Bot spoke last and no trigger keyword.
        let outcome = h.orchestrator.process_turn("p1", "ok thanks").await;
        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::SafeMode));
        assert_eq!(h.safe_mode("p1").await.replied_message_count, 2);

        // The suppressed turn made the customer the last speaker.
        let outcome = h.orchestrator.process_turn("p1", "hmm").await;
        assert!(matches!(outcome, TurnOutcome::Replied { .. }));
        assert_eq!(h.safe_mode("p1").await.replied_message_count, 3);
        assert_eq!(h.llm_calls(), 2);
    }

    #[tokio::test]
    async fn operator_message_suppresses_any_text() {
        let h = harness();
        h.orchestrator
            .handle_event(InboundEvent::operator_text("p1", "I'll take this one"))
            .await;

        assert!(h.store.override_until("p1").await.is_some());
        assert!(h.safe_mode("p1").await.last_sender_was_operator);

        let outcome = h.orchestrator.process_turn("p1", "price? order now").await;
        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::HumanOverride));
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.llm_calls(), 0);
    }

    #[tokio::test]
    async fn operator_message_cancels_followup() {
        let h = harness();
        h.orchestrator
            .handle_event(InboundEvent::customer_text("p1", "hi"))
            .await;
        assert!(h.orchestrator.followup().is_armed("p1"));

        h.orchestrator
            .handle_event(InboundEvent::operator_text("p1", "hello, how can I help?"))
            .await;
        assert!(!h.orchestrator.followup().is_armed("p1"));
    }

    #[tokio::test]
    async fn bot_echo_is_not_an_operator() {
        let h = harness();
        h.orchestrator.process_turn("p1", "hello").await;

        h.orchestrator
            .handle_event(InboundEvent::operator_text("p1", "reply 1"))
            .await;
        assert!(h.store.override_until("p1").await.is_none());

        // A second identical echo was never sent by us twice, so it is a human.
        h.orchestrator
            .handle_event(InboundEvent::operator_text("p1", "reply 1"))
            .await;
        assert!(h.store.override_until("p1").await.is_some());
    }

    #[tokio::test]
    async fn trigger_keyword_reopens_after_operator() {
        let h = harness();
        h.store
            .put_safe_mode(
                "p1",
                SafeModeState {
                    replied_message_count: 3,
                    last_sender_was_operator: true,
                },
            )
            .await;

        let outcome = h.orchestrator.process_turn("p1", "ok").await;
        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::SafeMode));
        assert_eq!(h.llm_calls(), 0);

        h.store
            .put_safe_mode(
                "p1",
                SafeModeState {
                    replied_message_count: 4,
                    last_sender_was_operator: true,
                },
            )
            .await;
        let outcome = h.orchestrator.process_turn("p1", "price?").await;
        assert!(matches!(outcome, TurnOutcome::Replied { .. }));
        assert_eq!(h.llm_calls(), 1);
    }

    #[tokio::test]
    async fn closing_wins_over_escalation() {
        let h = harness();
        let outcome = h
            .orchestrator
            .process_turn("p1", "pin code 123456, kam karo")
            .await;

        assert_eq!(outcome, TurnOutcome::HandoffSent(HandoffReason::Closing));
        assert_eq!(h.llm_calls(), 0);

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("order"));

        let state = h.store.escalation("p1").await.unwrap();
        assert_eq!(state.reason, HandoffReason::Closing);

        // Silenced from now on.
        let outcome = h.orchestrator.process_turn("p1", "hello?").await;
        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::Escalated));
    }

    #[tokio::test]
    async fn discount_request_escalates() {
        let h = harness();
        h.orchestrator
            .handle_event(InboundEvent::customer_text("p1", "any discount?"))
            .await;
        assert!(h.orchestrator.followup().is_armed("p1"));

        let outcome = h.orchestrator.process_turn("p1", "any discount?").await;
        assert_eq!(outcome, TurnOutcome::HandoffSent(HandoffReason::Escalation));
        assert!(!h.orchestrator.followup().is_armed("p1"));
    }

    #[tokio::test]
    async fn duplicate_reply_is_not_delivered() {
        let llm = FakeLlm {
            fixed: Some("It costs Rs 499.".into()),
            ..FakeLlm::default()
        };
        let h = harness_with(no_rate_limit(), llm, RecordingSender::default());

        h.orchestrator.process_turn("p1", "price?").await;
        let outcome = h.orchestrator.process_turn("p1", "price please").await;

        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::DuplicateReply));
        assert_eq!(h.llm_calls(), 2);
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_applies_between_replies() {
        let h = harness_with(
            PolicyConfig::default(),
            FakeLlm::default(),
            RecordingSender::default(),
        );
        h.orchestrator.process_turn("p1", "hello").await;
        let outcome = h.orchestrator.process_turn("p1", "price?").await;
        assert_eq!(outcome, TurnOutcome::Suppressed(Suppression::RateLimited));
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_rolls_back_history() {
        let llm = FakeLlm {
            fail: true,
            ..FakeLlm::default()
        };
        let h = harness_with(no_rate_limit(), llm, RecordingSender::default());

        let outcome = h.orchestrator.process_turn("p1", "hello").await;
        assert_eq!(outcome, TurnOutcome::GenerationFailed);
        assert!(h.store.history("p1").await.is_empty());
        assert!(h.store.last_reply("p1").await.is_none());
        assert!(h.sender.sent().is_empty());

        let safe = h.safe_mode("p1").await;
        assert_eq!(safe.replied_message_count, 1);
        assert!(!safe.last_sender_was_operator);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_recorded_reply() {
        let sender = RecordingSender {
            fail: true,
            ..RecordingSender::default()
        };
        let h = harness_with(no_rate_limit(), FakeLlm::default(), sender);

        let outcome = h.orchestrator.process_turn("p1", "hello").await;
        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                text: "reply 1".into(),
                delivered: false
            }
        );
        assert_eq!(h.store.history("p1").await.len(), 2);
        assert_eq!(h.store.last_reply("p1").await.unwrap().text, "reply 1");

        // The reply never went out, so an operator typing it is a human.
        h.orchestrator
            .handle_event(InboundEvent::operator_text("p1", "reply 1"))
            .await;
        assert!(h.store.override_until("p1").await.is_some());
    }

    #[tokio::test]
    async fn lead_intent_ratchets_across_turns() {
        let h = harness();
        h.orchestrator.process_turn("p1", "I want to order").await;
        assert_eq!(h.store.lead("p1").await.unwrap().intent, LeadIntent::Hot);

        h.orchestrator.process_turn("p1", "what is the price").await;
        assert_eq!(h.llm_calls(), 2);
        assert_eq!(h.store.lead("p1").await.unwrap().intent, LeadIntent::Hot);
    }

    #[tokio::test]
    async fn non_text_event_is_ignored() {
        let h = harness();
        let event = InboundEvent {
            kind: EventKind::Other("image".into()),
            text: String::new(),
            ..InboundEvent::customer_text("p1", "")
        };
        h.orchestrator.handle_event(event).await;

        assert_eq!(h.orchestrator.debouncer().pending_count(), 0);
        assert!(!h.orchestrator.followup().is_armed("p1"));
        assert!(h.store.safe_mode("p1").await.is_none());
        assert!(h.store.history("p1").await.is_empty());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_becomes_one_turn() {
        let mut h = harness();
        let batches = h.batches.take().unwrap();
        Arc::clone(&h.orchestrator).spawn_dispatcher(batches);

        for text in ["hi", "is this", "available?"] {
            h.orchestrator
                .handle_event(InboundEvent::customer_text("p1", text))
                .await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(h.orchestrator.turn_state("p1"), TurnState::Batching);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.llm_calls(), 1);
        assert_eq!(h.sender.sent().len(), 1);
        let history = h.store.history("p1").await;
        assert_eq!(history[0].text, "hi is this available?");
        assert_eq!(h.safe_mode("p1").await.replied_message_count, 1);
        assert_eq!(h.orchestrator.turn_state("p1"), TurnState::Idle);
    }
}

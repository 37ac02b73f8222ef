//! Reply generation: prompt assembly plus a bounded provider call.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::error::LlmError;
use crate::pipeline::types::LeadIntent;
use crate::store::{ConversationTurn, Role};

const REPLY_TEMPERATURE: f32 = 0.6;
const REPLY_MAX_TOKENS: u32 = 300;

/// Turns conversation history into a reply via an [`LlmProvider`].
pub struct ReplyGenerator {
    llm: Arc<dyn LlmProvider>,
    base_prompt: String,
    knowledge: Option<String>,
    timeout: Duration,
}

impl ReplyGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, base_prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            base_prompt: base_prompt.into(),
            knowledge: None,
            timeout,
        }
    }

    /// Business notes appended to the system instruction.
    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        let knowledge = knowledge.into();
        self.knowledge = (!knowledge.trim().is_empty()).then_some(knowledge);
        self
    }

    /// Generate a reply. `history` must already end with the customer turn.
    pub async fn generate(
        &self,
        history: &[ConversationTurn],
        intent: LeadIntent,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt(intent)));
        messages.extend(history.iter().map(|turn| match turn.role {
            Role::User => ChatMessage::user(&turn.text),
            Role::Assistant => ChatMessage::assistant(&turn.text),
        }));

        let request = CompletionRequest::new(messages)
            .with_temperature(REPLY_TEMPERATURE)
            .with_max_tokens(REPLY_MAX_TOKENS);

        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.timeout,
            })??;

        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Reply generated"
        );
        Ok(response.content)
    }

    fn system_prompt(&self, intent: LeadIntent) -> String {
        let mut prompt = self.base_prompt.clone();
        if let Some(ref knowledge) = self.knowledge {
            prompt.push_str("\n\nBusiness information:\n");
            prompt.push_str(knowledge.trim());
        }
        prompt.push_str(&format!("\n\nCustomer intent: {}.", intent.label()));
        if intent == LeadIntent::Hot {
            prompt.push_str(" The customer is ready to buy; help them complete the order.");
        }
        prompt
    }
}

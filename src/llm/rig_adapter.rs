//! Bridge from rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};
use rig::one_or_many::OneOrMany;

use super::provider::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use crate::error::LlmError;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let Some((preamble, prompt, history)) = split_conversation(request.messages) else {
            return Err(LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: "no user or assistant message to send".to_string(),
            });
        };

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content = collect_text(&response.choice);
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text in completion".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// System messages become the preamble, the last message is the prompt and
/// the rest is chat history. `None` when there is nothing but system text.
fn split_conversation(
    messages: Vec<ChatMessage>,
) -> Option<(Option<String>, Message, Vec<Message>)> {
    let mut system = Vec::new();
    let mut history = Vec::new();
    for message in messages {
        match message.role {
            ChatRole::System => system.push(message.content),
            ChatRole::User => history.push(Message::user(message.content)),
            ChatRole::Assistant => history.push(Message::assistant(message.content)),
        }
    }

    let prompt = history.pop()?;
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));
    Some((preamble, prompt, history))
}

fn collect_text(choice: &OneOrMany<AssistantContent>) -> String {
    choice
        .iter()
        .filter_map(|content| match content {
            AssistantContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string()
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::LlmBackend;

/// Default system prompt used when no knowledge file is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly sales assistant replying to customers \
on WhatsApp for a small online store. Keep replies short (1-3 sentences), answer in the \
customer's language, and never invent prices or policies you were not given.";

const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_WHAPI_BASE_URL: &str = "https://gate.whapi.cloud";

/// Timing and capacity knobs for the reply pipeline.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Quiet period before a burst of messages is flushed as one turn.
    pub debounce_wait: Duration,
    /// Minimum gap between replies for HOT leads.
    pub hot_reply_interval: Duration,
    /// Minimum gap between replies for everyone else.
    pub reply_interval: Duration,
    /// Silence window after an operator-authored message.
    pub override_duration: Duration,
    /// Silence window after a discount/confusion handoff.
    pub escalation_duration: Duration,
    /// Silence window after an order-confirmation handoff.
    pub closing_duration: Duration,
    /// Number of user/assistant pairs kept in history.
    pub max_history_pairs: usize,
    /// Delay before the first follow-up nudge.
    pub followup_first_delay: Duration,
    /// Delay between the first and second nudge.
    pub followup_second_delay: Duration,
    /// Nudges ever sent per conversation.
    pub followup_max_nudges: u32,
    /// Upper bound on a generation call.
    pub generation_timeout: Duration,
    /// Upper bound on a delivery call.
    pub delivery_timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            debounce_wait: Duration::from_millis(4000),
            hot_reply_interval: Duration::from_secs(5),
            reply_interval: Duration::from_secs(60),
            override_duration: Duration::from_secs(15 * 60),
            escalation_duration: Duration::from_secs(20 * 60),
            closing_duration: Duration::from_secs(24 * 3600),
            max_history_pairs: 10,
            followup_first_delay: Duration::from_secs(30 * 60),
            followup_second_delay: Duration::from_secs(120 * 60),
            followup_max_nudges: 2,
            generation_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(15),
        }
    }
}

impl PolicyConfig {
    /// Build policy from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            debounce_wait: Duration::from_millis(env_or(
                "DEBOUNCE_MS",
                d.debounce_wait.as_millis() as u64,
            )),
            hot_reply_interval: secs("HOT_REPLY_INTERVAL_SECS", d.hot_reply_interval),
            reply_interval: secs("REPLY_INTERVAL_SECS", d.reply_interval),
            override_duration: minutes("OVERRIDE_MINUTES", d.override_duration),
            escalation_duration: minutes("ESCALATION_MINUTES", d.escalation_duration),
            closing_duration: Duration::from_secs(
                env_or("CLOSING_HOURS", d.closing_duration.as_secs() / 3600) * 3600,
            ),
            max_history_pairs: env_or("MAX_HISTORY_PAIRS", d.max_history_pairs),
            followup_first_delay: minutes("FOLLOWUP_FIRST_MINUTES", d.followup_first_delay),
            followup_second_delay: minutes("FOLLOWUP_SECOND_MINUTES", d.followup_second_delay),
            followup_max_nudges: env_or("FOLLOWUP_MAX_NUDGES", d.followup_max_nudges),
            generation_timeout: secs("GENERATION_TIMEOUT_SECS", d.generation_timeout),
            delivery_timeout: secs("DELIVERY_TIMEOUT_SECS", d.delivery_timeout),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// API key for the text-generation provider.
    pub llm_api_key: SecretString,
    /// Which provider serves completions.
    pub llm_backend: LlmBackend,
    /// Model identifier.
    pub llm_model: String,
    /// Bearer token for the WhatsApp gateway.
    pub whapi_token: SecretString,
    /// Base URL of the WhatsApp gateway.
    pub whapi_base_url: String,
    /// HTTP listen port.
    pub port: u16,
    /// Where safe-mode and lead state is persisted.
    pub state_path: PathBuf,
    /// Optional business notes appended to the system prompt.
    pub knowledge_path: Option<PathBuf>,
    pub policy: PolicyConfig,
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// Both collaborator secrets are required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_api_key = required("LLM_API_KEY")?;
        let whapi_token = required("WHAPI_TOKEN")?;

        Ok(Self {
            llm_api_key,
            llm_backend: env_or("LLM_BACKEND", LlmBackend::Groq),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            whapi_token,
            whapi_base_url: std::env::var("WHAPI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_WHAPI_BASE_URL.to_string()),
            port: env_or("PORT", 3000),
            state_path: std::env::var("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/state.json")),
            knowledge_path: std::env::var("KNOWLEDGE_PATH").ok().map(PathBuf::from),
            policy: PolicyConfig::from_env(),
        })
    }
}

fn required(key: &str) -> Result<SecretString, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Read and parse an optional variable. Unparseable values fall back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

fn minutes(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs() / 60) * 60)
}

use std::sync::Arc;

use anyhow::Context;

use lead_assist::channels::{MessageSender, WhatsAppSender};
use lead_assist::config::{AppConfig, DEFAULT_SYSTEM_PROMPT};
use lead_assist::llm::{LlmConfig, ReplyGenerator, create_provider};
use lead_assist::pipeline::ReplyOrchestrator;
use lead_assist::server::webhook_routes;
use lead_assist::store::{FileStateStore, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LLM_API_KEY=... WHAPI_TOKEN=...");
        std::process::exit(1);
    });

    eprintln!("📱 Lead Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({})", config.llm_model, config.llm_backend.label());
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   State: {}", config.state_path.display());

    // ── State ───────────────────────────────────────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::load(config.state_path.clone()).await);

    // ── Generation ──────────────────────────────────────────────────────
    let llm = create_provider(&LlmConfig {
        backend: config.llm_backend,
        api_key: config.llm_api_key.clone(),
        model: config.llm_model.clone(),
    })?;

    let mut generator =
        ReplyGenerator::new(llm, DEFAULT_SYSTEM_PROMPT, config.policy.generation_timeout);
    if let Some(ref path) = config.knowledge_path {
        match tokio::fs::read_to_string(path).await {
            Ok(knowledge) => {
                eprintln!("   Knowledge: {}", path.display());
                generator = generator.with_knowledge(knowledge);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Knowledge file unreadable, using base prompt");
            }
        }
    }

    // ── Delivery ────────────────────────────────────────────────────────
    let sender: Arc<dyn MessageSender> = Arc::new(WhatsAppSender::new(
        config.whapi_base_url.clone(),
        config.whapi_token.clone(),
    ));

    // ── Pipeline ────────────────────────────────────────────────────────
    let (orchestrator, batches) =
        ReplyOrchestrator::new(config.policy.clone(), store, sender, generator)?;
    let orchestrator = Arc::new(orchestrator);
    let _dispatcher = Arc::clone(&orchestrator).spawn_dispatcher(batches);

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = webhook_routes(orchestrator);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

//! Server binary: wires the backend stack and serves the voice API.

use loanvoice::asr::WsRecognizer;
use loanvoice::config::AgentConfig;
use loanvoice::dialogue::DialogueController;
use loanvoice::llm::OpenAiGenerator;
use loanvoice::pipeline::SessionSupervisor;
use loanvoice::scoring::RuleBasedScorer;
use loanvoice::server::{app, AppState};
use loanvoice::session::SessionRegistry;
use loanvoice::store::InMemoryStore;
use loanvoice::tts::HttpSynthesizer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loanvoice=info,tower=warn,hyper=warn")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::from_file(&PathBuf::from(path))?,
        None => AgentConfig::default(),
    };

    let recognizer = Arc::new(WsRecognizer::new(&config.asr));
    let generator = Arc::new(OpenAiGenerator::new(&config.llm));
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.tts)?);
    let scorer = Arc::new(RuleBasedScorer::default());
    let store = Arc::new(InMemoryStore::default());
    let controller = Arc::new(DialogueController::new(
        config.dialogue.clone(),
        config.llm.payload_delimiter.clone(),
        scorer,
        store,
    ));
    let registry = Arc::new(SessionRegistry::default());

    let supervisor = Arc::new(SessionSupervisor::new(
        config.clone(),
        recognizer,
        generator,
        synthesizer,
        controller,
        Arc::clone(&registry),
    ));

    let addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("loanvoice v{} listening on {addr}", env!("CARGO_PKG_VERSION"));

    let router = app(AppState { supervisor });
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, closing sessions");
            registry.shutdown_all();
        })
        .await?;

    Ok(())
}

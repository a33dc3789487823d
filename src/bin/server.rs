//! Voice orchestrator server binary.
//!
//! Loads configuration (TOML path from the first argument or
//! `VOXLOOP_CONFIG`, credentials from the environment), then serves the
//! WebSocket voice endpoint until interrupted.

use std::path::PathBuf;
use voxloop::OrchestratorConfig;
use voxloop::server::VoiceServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOXLOOP_CONFIG").ok())
        .map(PathBuf::from);

    let config = match config_path {
        Some(path) => OrchestratorConfig::load(&path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
        None => {
            let mut config = OrchestratorConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    tracing::info!("voxloop server starting");
    tracing::info!("LLM model: {}", config.llm.model);
    tracing::info!(
        "silence debounce: {}ms (bounds {}..{}ms)",
        config.turn.initial_silence_debounce_ms,
        config.turn.min_silence_debounce_ms,
        config.turn.max_silence_debounce_ms
    );
    tracing::info!(
        "cancellation threshold: {}",
        config.turn.cancellation_rate_threshold
    );

    let server = VoiceServer::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start server: {e}"))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}

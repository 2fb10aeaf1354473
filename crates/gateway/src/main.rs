//! The `switchboard` binary: load config, wire the core, serve the
//! control plane.  Transport connectors and model providers are external
//! adapters; without them the gateway still serves its control plane and
//! session stores.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sb_domain::config::Config;
use sb_gateway::runtime::agent::{NoTools, ProviderSet};
use sb_gateway::runtime::HookRegistry;
use sb_gateway::state::AppState;
use sb_providers::ScriptedProvider;

#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Messaging gateway for LLM agents")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "switchboard.toml")]
    config: PathBuf,

    /// Host:port override for the control plane.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config: Config = if cli.config.exists() {
        let raw = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading {}", cli.config.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", cli.config.display()))?
    } else {
        tracing::warn!(path = %cli.config.display(), "config not found, using defaults");
        Config::default()
    };

    let listen = cli
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Model providers are external adapters registered by the embedder; a
    // bare binary runs with an empty scripted backend so the control plane
    // and stores stay usable.
    let providers = ProviderSet::new(Arc::new(ScriptedProvider::new(Vec::new())));
    tracing::warn!("no model provider adapter registered; runs will produce empty replies");

    let state = AppState::build(
        config,
        providers,
        Arc::new(NoTools),
        HookRegistry::default(),
        Vec::new(),
    );
    state.spawn_drivers();

    let app = sb_gateway::api::router(state);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "control plane listening");
    axum::serve(listener, app).await.context("serving control plane")?;

    Ok(())
}

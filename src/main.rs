//! napier: local control plane for an LLM runtime and its tool servers.
//!
//! Single binary: control API plus interactive menu. Config: `config/napier_config.json`,
//! `--config` or `NAPIER_CONFIG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use napier::config::{ConfigStore, DEFAULT_CONFIG_PATH, DocumentStore};
use napier::control::ControlPlane;
use napier::llm::OllamaClient;
use napier::menu;
use napier::server::Server;
use napier::tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(name = "napier", version, about)]
struct Cli {
    /// Path of the configuration document.
    #[arg(long, env = "NAPIER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Control API address; overrides `mcp_host` from the document.
    #[arg(long)]
    bind: Option<String>,

    /// LLM backend URL for this run; overrides `ollama.url` without saving it.
    #[arg(long, env = "NAPIER_OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Serve the control API only, until Ctrl-C.
    #[arg(long)]
    no_menu: bool,

    /// Do not try to start the LLM backend process.
    #[arg(long)]
    skip_backend: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("napier=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "napier starting");

    let store: Arc<dyn DocumentStore> = Arc::new(ConfigStore::new(&cli.config));
    let registry = Arc::new(ToolRegistry::new(store));
    let count = registry.initialize();
    info!(tools = count, "tool registry initialized");

    let document = registry.document();
    let llm_url = cli
        .ollama_url
        .clone()
        .unwrap_or_else(|| document.ollama_url().to_string());
    let llm = OllamaClient::new(&llm_url).context("LLM backend client")?;
    let plane = Arc::new(ControlPlane::new(registry, llm));

    if cli.skip_backend {
        info!("skipping LLM backend startup");
    } else {
        match plane.start_backend().await {
            Ok(true) => {}
            Ok(false) => warn!("LLM backend started but not answering yet"),
            Err(e) => error!(error = %e, "could not start LLM backend"),
        }
    }

    let bind = cli.bind.clone().unwrap_or_else(|| document.host_addr());
    let mut server = Server::start(Arc::clone(&plane), bind.as_str())
        .await
        .with_context(|| format!("binding control API on {bind}"))?;
    println!("NAPIER MCP Host API running at http://{}", server.addr());

    for (tool, result) in plane.ensure_all().await {
        match result {
            Ok(outcome) => info!(tool = %tool.display_name(), ?outcome, "tool ready"),
            Err(e) => warn!(tool = %tool.display_name(), error = %e, "tool not started"),
        }
    }

    let session = if cli.no_menu {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
    } else {
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            res = menu::run(&plane, stdin, std::io::stdout()) => res.context("interactive session"),
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                Ok(())
            }
        }
    };

    server.shutdown();
    plane.stop_backend().await;
    info!("napier stopped");
    session
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use lab_gateway::{
    http::{serve, AppState},
    manager::ManagerConfig,
    monitor::MonitorDeps,
    AgentSessionManager, MonitorHub, SessionEventBus,
};
use lab_store::{CheckpointStore, Db, EventLog, MetadataStore, SessionDirectory, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            let config = lab_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Serve { bind }) => run_serve(cli.config.as_deref(), bind).await,
        None => run_serve(cli.config.as_deref(), None).await,
    }
}

async fn run_serve(
    config_path: Option<&std::path::Path>,
    bind_override: Option<String>,
) -> anyhow::Result<()> {
    let mut config = lab_config::load(config_path)?;
    if let Some(bind) = bind_override {
        config.http.bind = bind;
    }
    let config = Arc::new(config);

    let agent = config
        .default_agent()
        .context("no agents configured — add an `agents:` section to gateway.yaml")?
        .clone();
    tracing::info!(agent = %agent.id, command = %agent.command, "using agent");

    // ── Storage ───────────────────────────────────────────────────────────────
    let db_path = config.storage.resolved_db_path();
    let db = Db::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    let log = EventLog::new(db.clone());
    let metadata = MetadataStore::new(db.clone());
    let tasks = TaskStore::new(db.clone());
    let checkpoints = CheckpointStore::new(db.clone());
    let directory = SessionDirectory::new(db);

    // ── Manager / monitors ────────────────────────────────────────────────────
    let bus = Arc::new(SessionEventBus::new());
    let manager = AgentSessionManager::new(
        ManagerConfig {
            agent,
            workspace_root: config.resolved_workspace_root(),
            mcp_server_url: config.acp.mcp_server_url.clone(),
            request_timeout: Duration::from_secs(config.acp.request_timeout_secs),
            term_grace: Duration::from_secs(config.acp.term_grace_secs),
            prompt_race: Duration::from_millis(config.acp.prompt_start_race_ms),
            event_buffer_cap: config.acp.event_buffer_cap,
        },
        directory.clone(),
    );
    let hub = MonitorHub::new(
        MonitorDeps {
            log: log.clone(),
            metadata: metadata.clone(),
            tasks,
            bus: bus.clone(),
            completion_grace: Duration::from_millis(config.acp.completion_grace_ms),
        },
        manager.clone(),
        directory.clone(),
        Duration::from_secs(config.acp.reconcile_interval_secs),
    );
    tokio::spawn(hub.clone().run());

    // ── HTTP server (blocks until shutdown) ───────────────────────────────────
    serve(AppState {
        manager,
        hub,
        bus,
        log,
        metadata,
        checkpoints,
        directory,
        config,
    })
    .await
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lab={level},lab_gateway={level},lab_acp={level},lab_store={level},warn")));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

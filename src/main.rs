// =============================================================================
// bbsbot — autonomous Trade Wars 2002 bot swarm
// =============================================================================
//
// Subcommands:
//   serve            MCP tool server (registry + prefix filtering)
//   manager          swarm manager HTTP/WebSocket server
//   tw2002 check     TCP + telnet negotiation sanity probe
//   tw2002 bot       run one bot in the foreground
//
// Exit codes: 0 normal, 2 configuration error, 3 connection failure,
// 4 runtime error.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounts;
mod bot_runtime;
mod config;
mod detect;
mod errors;
mod game_state;
mod goals;
mod intervention;
mod llm;
mod manager;
mod names;
mod session;
mod strategy;
mod telemetry;
mod telnet;
mod terminal;
mod tools;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::accounts::{AccountPool, ReleaseOutcome};
use crate::bot_runtime::{
    BotRuntime, BotRuntimeParams, ExitReason, HijackControl, StatusSink,
};
use crate::config::BotConfig;
use crate::detect::rules::RuleSet;
use crate::errors::BotError;
use crate::llm::{HttpLlmProvider, LlmProvider};
use crate::session::{Session, SessionParams};
use crate::worker::{ManagerReporter, WorkerChannel};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "bbsbot", version, about = "Autonomous TW2002 bot swarm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP tool server.
    Serve {
        /// Namespace prefixes to register (e.g. bbs_,tw2002_). Core tools
        /// require the bbs_ prefix to be listed.
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },
    /// Start the swarm manager HTTP/WebSocket server.
    Manager {
        /// Config file with the swarm_manager option group.
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Trade Wars 2002 operations.
    Tw2002 {
        #[command(subcommand)]
        command: Tw2002Commands,
    },
}

#[derive(Subcommand)]
enum Tw2002Commands {
    /// TCP + telnet negotiation sanity check.
    Check {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 23)]
        port: u16,
    },
    /// Run one bot in the foreground.
    Bot {
        #[arg(short = 'c', long)]
        config: String,
        #[arg(long)]
        bot_id: Option<String>,
        /// Manager base URL for status reports and the terminal channel.
        #[arg(long)]
        manager_url: Option<String>,
    },
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { tools } => run_serve(tools).await,
        Commands::Manager { config } => run_manager(config).await,
        Commands::Tw2002 { command } => match command {
            Tw2002Commands::Check { host, port } => run_check(&host, port).await,
            Tw2002Commands::Bot {
                config,
                bot_id,
                manager_url,
            } => run_bot(&config, bot_id, manager_url).await,
        },
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "fatal");
            let code = match &e {
                BotError::Config(_) | BotError::NotFound(_) => 2,
                BotError::Transport(_) | BotError::Disconnected(_) | BotError::Protocol(_) => 3,
                _ => 4,
            };
            std::process::exit(code);
        }
    }
}

// =============================================================================
// serve
// =============================================================================

async fn run_serve(prefixes: Vec<String>) -> Result<(), BotError> {
    let registered = tools::filter_tools(&prefixes);
    if !prefixes.iter().any(|p| p == "bbs_") && !prefixes.is_empty() {
        info!("bbs_ prefix not requested; core session tools not registered");
    }
    for tool in &registered {
        info!(tool = %tool.name, "tool registered");
    }

    // Sessions opened through the tool surface all live in this registry.
    let max_sessions = BotConfig::default().session.max_sessions as usize;
    let sessions = Arc::new(session::SessionManager::new(max_sessions));
    info!(count = registered.len(), max_sessions, "tool server ready");

    // The MCP wire protocol is handled by the external tool host; this
    // process only owns the registry until shut down.
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BotError::Other(e.into()))?;
    for id in sessions.session_ids() {
        sessions.close_session(&id).await;
    }
    info!("tool server shut down");
    Ok(())
}

// =============================================================================
// manager
// =============================================================================

async fn run_manager(config_path: Option<String>) -> Result<(), BotError> {
    let config = match config_path {
        Some(path) => BotConfig::load(&path).map_err(|e| BotError::Config(e.to_string()))?,
        None => BotConfig::default(),
    };

    let state = Arc::new(manager::SwarmState::new(
        config.swarm_manager.clone(),
        config.character.clone(),
    ));
    state.restore_state();

    tokio::spawn(manager::supervise::health_check_loop(Arc::clone(&state)));

    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let app = manager::rest::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| BotError::Config(format!("cannot bind {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "swarm manager listening");

    let server_state = Arc::clone(&state);
    tokio::select! {
        result = axum::serve(listener, app) => {
            result.map_err(|e| BotError::Other(anyhow::anyhow!("server failed: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
            manager::supervise::kill_all(&server_state);
            let _ = server_state.flush_state();
        }
    }
    info!("swarm manager shut down");
    Ok(())
}

// =============================================================================
// tw2002 check
// =============================================================================

async fn run_check(host: &str, port: u16) -> Result<(), BotError> {
    info!(host, port, "probing telnet endpoint");
    let mut transport = crate::telnet::TelnetTransport::connect(
        host,
        port,
        Duration::from_secs(10),
        "ansi",
        80,
        25,
    )
    .await?;

    // One read lets the negotiation round-trip complete.
    let banner = transport.receive(4096, Duration::from_secs(3)).await?;
    transport.close().await;

    info!(
        bytes = banner.len(),
        "connection and negotiation OK{}",
        if banner.is_empty() { " (no banner yet)" } else { "" }
    );
    Ok(())
}

// =============================================================================
// tw2002 bot
// =============================================================================

async fn run_bot(
    config_path: &str,
    bot_id: Option<String>,
    manager_url: Option<String>,
) -> Result<(), BotError> {
    let mut config =
        BotConfig::load(config_path).map_err(|e| BotError::Config(e.to_string()))?;
    config.apply_env_overrides();

    let bot_id = bot_id.unwrap_or_else(|| format!("bot-{}", std::process::id()));

    // Rules are mandatory for a playing bot.
    let rules_path = config.rules_file();
    let rules = RuleSet::load(&rules_path).map_err(|e| BotError::Config(e.to_string()))?;

    // One local pool per worker process; the swarm-level pool lives in the
    // manager and is reflected through its API.
    let pool = AccountPool::new(config.character.clone(), true);
    let records_path = AccountPool::records_path(&config.persist_root, &config.namespace);
    pool.load_records(&records_path);
    let leased = pool.acquire(&bot_id)?;
    info!(
        bot_id = %bot_id,
        character = %leased.identity.name,
        ship = %leased.identity.ship_name,
        "identity ready"
    );

    let log_path = PathBuf::from(&config.persist_root)
        .join(&config.namespace)
        .join("semantic")
        .join(format!(
            "{}_semantic.jsonl",
            leased.identity.name.replace(' ', "_")
        ));

    let mut session_params = SessionParams::new(
        config.connection.host.clone(),
        config.connection.port,
    );
    session_params.term_name = config.connection.term_name.clone();
    session_params.cols = config.connection.cols;
    session_params.rows = config.connection.rows;
    session_params.log_path = Some(log_path);
    session_params.rules = rules;

    let session = Session::connect(session_params).await?;

    // LLM provider: required by ai_strategy, useful to interventions.
    let llm: Option<Arc<dyn LlmProvider>> = if config.trading.ai_strategy.enabled
        || config.llm.api_key.is_some()
        || config.llm.base_url.is_some()
    {
        Some(Arc::new(HttpLlmProvider::new(&config.llm)))
    } else {
        None
    };

    let strategy = strategy::build_strategy(&config.trading, llm.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let hijack = Arc::new(HijackControl::new(Duration::from_secs(
        config.swarm_manager.hijack_heartbeat_timeout,
    )));

    // Ctrl+C requests a clean stop at the next cycle boundary.
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("stop requested");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    // Manager-side channels when supervised.
    let status_sink: Option<Arc<dyn StatusSink>> = manager_url
        .as_deref()
        .map(|url| Arc::new(ManagerReporter::new(url)) as Arc<dyn StatusSink>);
    if let Some(url) = manager_url.as_deref() {
        let channel = WorkerChannel::new(url, &bot_id);
        tokio::spawn(channel.run(
            Arc::clone(&session),
            Arc::clone(&hijack),
            Arc::clone(&stop),
        ));
    }

    let mut runtime = BotRuntime::new(BotRuntimeParams {
        bot_id: bot_id.clone(),
        config,
        session: Arc::clone(&session),
        strategy,
        llm,
        account: leased,
        status_sink,
        stop: Arc::clone(&stop),
        hijack,
    });

    let outcome = runtime.run().await;
    stop.store(true, Ordering::SeqCst);
    session.close().await;

    let release = match outcome.reason {
        ExitReason::Completed => ReleaseOutcome::Completed,
        ExitReason::Stopped => ReleaseOutcome::Stopped,
        ExitReason::Disconnected => ReleaseOutcome::Disconnected,
        ExitReason::Error => ReleaseOutcome::Error,
    };
    pool.release(&bot_id, release);
    if let Err(e) = pool.save_records(&records_path) {
        warn!(error = %e, "character records save failed");
    }

    info!(bot_id = %bot_id, reason = ?outcome.reason, detail = %outcome.detail, "bot exited");
    match outcome.reason {
        ExitReason::Completed | ExitReason::Stopped => Ok(()),
        ExitReason::Disconnected => Err(BotError::Disconnected(outcome.detail)),
        ExitReason::Error => Err(BotError::Other(anyhow::anyhow!(outcome.detail))),
    }
}

// =============================================================================
// Process supervision — spawning, reaping, and health-checking workers
// =============================================================================
//
// Every bot runs as its own OS process (the same binary with the
// `tw2002 bot` subcommand) so no two workers can ever share transport or
// emulator state.  A watcher task per child reaps the exit and maps it to a
// lifecycle transition; a kill switch lets the API terminate a child without
// fighting the watcher for ownership of the handle.
//
// Batch spawns launch in groups with a delay between them to avoid a
// thundering herd of telnet connects against the BBS.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{BotState, SwarmState};
use crate::errors::BotError;

/// Spawn one worker process for `config_path`.
pub async fn spawn_bot(
    state: &Arc<SwarmState>,
    config_path: &str,
    bot_id: Option<String>,
) -> Result<String, BotError> {
    let bot_id = bot_id.unwrap_or_else(|| format!("bot-{}", &Uuid::new_v4().to_string()[..8]));

    {
        let bots = state.bots.read();
        let active = bots.values().filter(|b| !b.state.is_terminal()).count();
        if active >= state.config.max_bots as usize {
            return Err(BotError::Supervision(format!(
                "max_bots limit of {} reached",
                state.config.max_bots
            )));
        }
        if bots
            .get(&bot_id)
            .map(|b| !b.state.is_terminal())
            .unwrap_or(false)
        {
            return Err(BotError::Supervision(format!("bot {bot_id} already active")));
        }
    }

    // A re-spawn replaces any terminal record for the same id.
    state
        .bots
        .write()
        .insert(bot_id.clone(), super::BotRecord::new(&bot_id, config_path));

    let exe = std::env::current_exe()
        .map_err(|e| BotError::Supervision(format!("current_exe failed: {e}")))?;
    let manager_url = format!("http://{}:{}", state.config.host, state.config.port);

    let mut child = tokio::process::Command::new(exe)
        .arg("tw2002")
        .arg("bot")
        .arg("-c")
        .arg(config_path)
        .arg("--bot-id")
        .arg(&bot_id)
        .arg("--manager-url")
        .arg(&manager_url)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            state.set_error(&bot_id, "supervision", &format!("spawn failed: {e}"));
            BotError::Supervision(format!("spawn failed: {e}"))
        })?;

    let pid = child.id();
    {
        let mut bots = state.bots.write();
        if let Some(record) = bots.get_mut(&bot_id) {
            record.pid = pid;
        }
    }
    state.transition(&bot_id, BotState::Running, None);
    info!(bot_id = %bot_id, pid = ?pid, config = config_path, "worker spawned");

    // Kill switch + watcher own the child handle together.
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    state
        .kill_switches
        .write()
        .insert(bot_id.clone(), kill_tx);

    let watch_state = Arc::clone(state);
    let watch_id = bot_id.clone();
    tokio::spawn(async move {
        enum First {
            Exited(std::io::Result<std::process::ExitStatus>),
            Kill,
        }

        // Child::wait is cancel-safe, so racing it against the kill switch
        // and resuming afterwards loses nothing.
        let first = tokio::select! {
            status = child.wait() => First::Exited(status),
            _ = kill_rx.recv() => First::Kill,
        };

        let exit = match first {
            First::Kill => {
                let _ = child.kill().await;
                watch_state.transition(&watch_id, BotState::Stopped, Some("operator kill".into()));
                cleanup(&watch_state, &watch_id);
                return;
            }
            First::Exited(status) => status,
        };

        match exit {
            Ok(status) if status.success() => {
                // A clean exit from a still-running record means the worker
                // finished without reporting; call it completed.
                watch_state.transition(
                    &watch_id,
                    BotState::Completed,
                    Some("process exited cleanly".into()),
                );
            }
            Ok(status) => {
                watch_state.set_error(
                    &watch_id,
                    "supervision",
                    &format!("process exited with {status}"),
                );
            }
            Err(e) => {
                watch_state.set_error(&watch_id, "supervision", &format!("wait failed: {e}"));
            }
        }
        cleanup(&watch_state, &watch_id);
    });

    Ok(bot_id)
}

fn cleanup(state: &Arc<SwarmState>, bot_id: &str) {
    state.kill_switches.write().remove(bot_id);
    state.drop_worker_link(bot_id);
    let _ = state.flush_state();
}

/// Result of a batch spawn request.
pub fn batch_plan(total_bots: usize, group_size: usize, group_delay_secs: u64) -> Value {
    let group_size = group_size.max(1);
    let total_groups = total_bots.div_ceil(group_size);
    json!({
        "total_bots": total_bots,
        "total_groups": total_groups,
        "estimated_time_seconds": total_groups.saturating_sub(1) as u64 * group_delay_secs,
    })
}

/// Launch a batch of configs in groups, pausing `group_delay` between
/// groups.  Runs in the background; the HTTP handler returns the plan
/// immediately.
pub fn spawn_batch(
    state: Arc<SwarmState>,
    config_paths: Vec<String>,
    group_size: usize,
    group_delay: Duration,
) {
    tokio::spawn(async move {
        let group_size = group_size.max(1);
        for (index, group) in config_paths.chunks(group_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(group_delay).await;
            }
            for config_path in group {
                match spawn_bot(&state, config_path, None).await {
                    Ok(bot_id) => info!(bot_id = %bot_id, group = index, "batch spawn"),
                    Err(e) => warn!(config = %config_path, error = %e, "batch spawn failed"),
                }
            }
        }
    });
}

/// Kill one bot. Returns false when it is unknown or already terminal.
pub fn kill_bot(state: &Arc<SwarmState>, bot_id: &str) -> bool {
    let switch = state.kill_switches.read().get(bot_id).cloned();
    match switch {
        Some(tx) => tx.send(()).is_ok(),
        None => {
            // No live process; mark a stale record stopped for consistency.
            state.transition(bot_id, BotState::Stopped, Some("operator kill".into()))
        }
    }
}

pub fn kill_all(state: &Arc<SwarmState>) -> usize {
    let ids: Vec<String> = state
        .bots
        .read()
        .values()
        .filter(|b| !b.state.is_terminal())
        .map(|b| b.bot_id.clone())
        .collect();
    let mut killed = 0;
    for id in &ids {
        if kill_bot(state, id) {
            killed += 1;
        }
    }
    killed
}

/// Kill everything and drop all registry entries.
pub fn clear(state: &Arc<SwarmState>) -> usize {
    kill_all(state);
    let mut bots = state.bots.write();
    let dropped = bots.len();
    for id in bots.keys() {
        state.telemetry.forget(id);
    }
    bots.clear();
    drop(bots);
    let _ = state.flush_state();
    dropped
}

/// Restart a bot from its last spawn config.
pub async fn restart_bot(state: &Arc<SwarmState>, bot_id: &str) -> Result<String, BotError> {
    let config_path = state
        .bots
        .read()
        .get(bot_id)
        .map(|b| b.spawn_config.clone())
        .ok_or_else(|| BotError::NotFound(format!("bot {bot_id}")))?;

    // Stop the old process if it is still alive, then wait for its watcher
    // to finish (the kill switch disappears on cleanup) so the old exit
    // cannot clobber the fresh record.
    if kill_bot(state, bot_id) {
        for _ in 0..50 {
            if !state.kill_switches.read().contains_key(bot_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    {
        let mut bots = state.bots.write();
        if let Some(record) = bots.get_mut(bot_id) {
            if !record.state.is_terminal() {
                record.state = BotState::Stopped;
                record.exit_reason = Some("restart".into());
            }
        }
    }
    spawn_bot(state, &config_path, Some(bot_id.to_string())).await
}

/// Periodic sweep marking live-but-silent workers as blocked.
pub async fn health_check_loop(state: Arc<SwarmState>) {
    let interval = Duration::from_secs(state.config.health_check_interval.max(1));
    let timeout = state.config.bot_timeout as f64;
    loop {
        tokio::time::sleep(interval).await;

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let stuck: Vec<String> = state
            .bots
            .read()
            .values()
            .filter(|b| b.state == BotState::Running)
            .filter(|b| now - b.last_action_time > timeout)
            .map(|b| b.bot_id.clone())
            .collect();

        for bot_id in stuck {
            // The process is alive (the watcher has not reaped it) but the
            // worker stopped reporting.
            warn!(bot_id = %bot_id, timeout, "worker silent beyond bot_timeout; marking blocked");
            state.transition(&bot_id, BotState::Blocked, None);
        }

        state.account_pool.reap_expired();
        if let Err(e) = state.flush_state() {
            warn!(error = %e, "swarm state flush failed");
        }
    }
}

//! Top-level wiring: watchers → fan-in → applier, plus the supervisor

use crate::daemon::applier::ChangeApplier;
use crate::daemon::fan_in::fan_in;
use crate::daemon::supervisor::{ProcessSupervisor, SupervisorSettings, SupervisorState, process_slot};
use crate::daemon::task::ResumableTask;
use crate::daemon::watcher::{KvWatcher, WatchState, WatcherSettings};
use anyhow::{Context, Result};
use mct_core::config::Settings;
use mct_core::consul::KvClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffered events per watcher and on the merged stream
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long stopped tasks get to finish after the applier and supervisor are done
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the daemon until `cancel` is raised or a fatal error occurs.
///
/// This function:
/// 1. Creates every pair's local directory
/// 2. Starts the renderer supervisor
/// 3. Starts one KV watcher per pair and merges their event streams
/// 4. Starts the change applier on the merged stream
/// 5. Waits for the applier (fatal errors end the daemon) or the supervisor
/// 6. On shutdown, stops everything and waits briefly for watchers
///
/// Fatal errors are returned as soon as they happen, without waiting for
/// the remaining tasks.
pub async fn run(
    settings: Settings,
    client: Arc<dyn KvClient>,
    cancel: CancellationToken,
) -> Result<()> {
    for dir in settings.directories() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create template directory {}", dir.display()))?;
    }

    let (slot, reload_target) = process_slot();
    let supervisor = ResumableTask::spawn(
        "renderer-supervisor",
        ProcessSupervisor::new(SupervisorSettings::from(&settings), slot, cancel.clone()),
        SupervisorState::Starting,
        cancel.clone(),
    );

    let watcher_settings = WatcherSettings {
        wait: settings.wait,
        retry_delay: settings.retry_delay,
    };
    let mut receivers = Vec::with_capacity(settings.pairs.len());
    let mut watchers = Vec::with_capacity(settings.pairs.len());
    for pair in &settings.pairs {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        receivers.push(rx);
        let watcher = KvWatcher::new(
            Arc::clone(&client),
            pair.clone(),
            tx,
            watcher_settings,
            cancel.clone(),
        );
        info!(
            "Watching {} -> {}",
            watcher.pair().prefix,
            watcher.pair().directory.display()
        );
        watchers.push(ResumableTask::spawn(
            format!("watch {pair}"),
            watcher,
            WatchState::default(),
            cancel.clone(),
        ));
    }

    let events = fan_in(receivers, EVENT_CHANNEL_CAPACITY);
    let applier = ResumableTask::spawn(
        "change-applier",
        ChangeApplier::new(
            events,
            settings.renderer_config.clone(),
            reload_target,
            cancel.clone(),
        ),
        Vec::new(),
        cancel.clone(),
    );

    info!(
        "Daemon running with {} watch pair(s); renderer config {}",
        settings.pairs.len(),
        settings.renderer_config.display()
    );

    let applier_done = applier.join();
    let supervisor_done = supervisor.join();
    tokio::pin!(applier_done, supervisor_done);

    let result = tokio::select! {
        res = &mut applier_done => {
            cancel.cancel();
            match res {
                Ok(outcome) => {
                    info!("Change applier stopped with {} template(s) materialized", outcome.into_state().len());
                    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut supervisor_done).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Renderer supervisor failed: {}", e),
                        Err(_) => warn!("Renderer supervisor did not stop in time"),
                    }
                    Ok(())
                }
                Err(e) => Err(anyhow::Error::new(e).context("Change applier failed")),
            }
        }
        res = &mut supervisor_done => {
            if cancel.is_cancelled() {
                // Shutdown: the applier finishes once every watcher has let go
                match res {
                    Ok(_) => applier_done.await.map(|_| ()).context("Change applier failed"),
                    Err(e) => Err(anyhow::Error::new(e).context("Renderer supervisor failed")),
                }
            } else {
                cancel.cancel();
                match res {
                    Ok(_) => Err(anyhow::anyhow!("Renderer supervisor stopped unexpectedly")),
                    Err(e) => Err(anyhow::Error::new(e).context("Renderer supervisor failed")),
                }
            }
        }
    };

    // Fatal errors end the process right away; the renderer dies with the runtime
    result?;

    for watcher in watchers {
        let name = watcher.name().to_string();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, watcher.join()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Watcher {} failed: {}", name, e),
            Err(_) => warn!("Watcher {} did not stop in time", name),
        }
    }

    info!("Daemon event loop shutdown complete");
    Ok(())
}

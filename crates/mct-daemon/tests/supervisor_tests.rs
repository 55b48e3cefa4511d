//! Integration tests for renderer supervision, driven by small shell scripts

#![cfg(unix)]

use mct_daemon::daemon::{
    Outcome, ProcessSupervisor, ReloadOutcome, ReloadSignal, ReloadTarget, ResumableTask,
    SupervisorSettings, SupervisorState, process_slot,
};
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn settings(bin: PathBuf, config: PathBuf) -> SupervisorSettings {
    SupervisorSettings {
        bin,
        config,
        spawn_retry_delay: Duration::from_millis(50),
        reload_grace: Duration::from_millis(200),
    }
}

fn spawn_supervisor(
    settings: SupervisorSettings,
    cancel: &CancellationToken,
) -> (
    ResumableTask<SupervisorState, std::convert::Infallible>,
    ReloadTarget,
) {
    let (slot, target) = process_slot();
    let task = ResumableTask::spawn(
        "renderer-supervisor",
        ProcessSupervisor::new(settings, slot, cancel.clone()),
        SupervisorState::Starting,
        cancel.clone(),
    );
    (task, target)
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

async fn wait_for_lines(path: &Path, at_least: usize) {
    for _ in 0..250 {
        if line_count(path) >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{} has {} line(s), expected at least {}",
        path.display(),
        line_count(path),
        at_least
    );
}

#[tokio::test]
async fn test_exited_renderer_is_respawned() {
    let temp_dir = TempDir::new().unwrap();
    let runs = temp_dir.path().join("runs");
    let bin = write_script(
        temp_dir.path(),
        "renderer",
        &format!("echo run >> \"{}\"\nexit 0\n", runs.display()),
    );

    let cancel = CancellationToken::new();
    let (task, _target) = spawn_supervisor(settings(bin, temp_dir.path().join("c.hcl")), &cancel);

    wait_for_lines(&runs, 3).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_renderer_receives_config_and_reloads() {
    let temp_dir = TempDir::new().unwrap();
    let args = temp_dir.path().join("args");
    let hups = temp_dir.path().join("hups");
    let config = temp_dir.path().join("config.hcl");
    let bin = write_script(
        temp_dir.path(),
        "renderer",
        &format!(
            "trap 'echo hup >> \"{hups}\"' HUP\n\
             echo \"$@\" > \"{args}\"\n\
             while true; do sleep 0.05; done\n",
            hups = hups.display(),
            args = args.display()
        ),
    );

    let cancel = CancellationToken::new();
    let (task, mut target) = spawn_supervisor(settings(bin, config.clone()), &cancel);

    let pid = tokio::time::timeout(Duration::from_secs(5), target.wait_for_process())
        .await
        .unwrap()
        .unwrap();

    // The supervisor sends the first hang-up once the grace period is over
    wait_for_lines(&hups, 1).await;
    assert_eq!(
        std::fs::read_to_string(&args).unwrap().trim(),
        format!("-config {}", config.display())
    );

    assert_eq!(target.reload(), ReloadOutcome::Sent(pid));
    wait_for_lines(&hups, 2).await;

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), task.join())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Outcome::Completed(SupervisorState::Stopped)));
    assert_eq!(target.current(), None);
    assert_eq!(target.reload(), ReloadOutcome::NoProcess);
}

#[tokio::test]
async fn test_spawn_failure_is_retried() {
    let temp_dir = TempDir::new().unwrap();
    let bin = temp_dir.path().join("late-renderer");
    let started = temp_dir.path().join("started");

    let cancel = CancellationToken::new();
    let (task, mut target) =
        spawn_supervisor(settings(bin.clone(), temp_dir.path().join("c.hcl")), &cancel);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(target.current(), None);

    write_script(
        temp_dir.path(),
        "late-renderer",
        &format!(
            "echo up >> \"{}\"\nwhile true; do sleep 0.05; done\n",
            started.display()
        ),
    );

    tokio::time::timeout(Duration::from_secs(5), target.wait_for_process())
        .await
        .unwrap()
        .unwrap();
    wait_for_lines(&started, 1).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task.join())
        .await
        .unwrap()
        .unwrap();
}

fn pids(path: &Path, tag: &str) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.strip_prefix(tag))
        .map(|pid| pid.trim().to_string())
        .collect()
}

#[tokio::test]
async fn test_every_respawn_gets_one_grace_reload() {
    let temp_dir = TempDir::new().unwrap();
    let log = temp_dir.path().join("log");
    // Outlives the grace period, then exits on its own
    let bin = write_script(
        temp_dir.path(),
        "renderer",
        &format!(
            "trap 'echo \"hup $$\" >> \"{log}\"' HUP\n\
             echo \"run $$\" >> \"{log}\"\n\
             sleep 0.4\n",
            log = log.display()
        ),
    );

    let cancel = CancellationToken::new();
    let mut settings = settings(bin, temp_dir.path().join("c.hcl"));
    settings.reload_grace = Duration::from_millis(150);
    let (task, _target) = spawn_supervisor(settings, &cancel);

    // Four starts means at least three renderers ran to completion
    for _ in 0..250 {
        if pids(&log, "run ").len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task.join())
        .await
        .unwrap()
        .unwrap();

    let runs = pids(&log, "run ");
    let hups = pids(&log, "hup ");
    assert!(runs.len() >= 4, "only {} renderer start(s)", runs.len());

    let unique: HashSet<&String> = hups.iter().collect();
    assert_eq!(unique.len(), hups.len(), "a renderer was hung up twice: {hups:?}");
    assert!(hups.iter().all(|pid| runs.contains(pid)));
    // Only the renderer stopped by the shutdown may have missed its reload
    assert!(
        hups.len() + 1 >= runs.len(),
        "{} reload(s) for {} start(s)",
        hups.len(),
        runs.len()
    );
}

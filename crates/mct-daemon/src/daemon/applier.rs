//! Change applier: the single writer for templates and the renderer config
//!
//! Consumes the merged event stream one event at a time, so template files
//! and the generated config block are never written concurrently. Every
//! applied event ends with exactly one reload attempt against whatever
//! renderer is current at that moment.

use super::generated_config::{self, rendered_destination};
use super::supervisor::ReloadSignal;
use super::task::{Resumable, Step};
use super::watcher::ChangeEvent;
use mct_core::io::{self, IoError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Template files currently on disk, most recently created first
pub type MaterializedTemplates = Vec<PathBuf>;

/// Fatal change-application errors
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Every watcher is gone while no shutdown was requested
    #[error("change event stream closed unexpectedly")]
    StreamClosed,

    #[error("failed to write template: {0}")]
    WriteTemplate(#[source] IoError),

    #[error("failed to remove template: {0}")]
    RemoveTemplate(#[source] IoError),

    #[error("failed to regenerate renderer config: {0}")]
    Regenerate(#[source] IoError),
}

/// Applies [`ChangeEvent`]s to disk and signals the renderer.
pub struct ChangeApplier<R> {
    events: mpsc::Receiver<ChangeEvent>,
    config_path: PathBuf,
    reload: R,
    shutdown: CancellationToken,
}

impl<R: ReloadSignal> ChangeApplier<R> {
    /// `shutdown` distinguishes an orderly end of the stream from a fatal one.
    pub fn new(
        events: mpsc::Receiver<ChangeEvent>,
        config_path: PathBuf,
        reload: R,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            events,
            config_path,
            reload,
            shutdown,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Apply one event to disk and `templates`, then request a reload.
    pub fn apply(
        &self,
        templates: &mut MaterializedTemplates,
        event: ChangeEvent,
    ) -> Result<(), ApplyError> {
        match event {
            ChangeEvent::Created { path, content } => {
                io::write_durable(&path, &content).map_err(ApplyError::WriteTemplate)?;
                // Two pairs can map the same basename into one directory; keep one stanza
                templates.retain(|p| p != &path);
                templates.insert(0, path.clone());
                self.regenerate(templates)?;
                info!("Created template {}", path.display());
                self.reload.reload();
            }
            ChangeEvent::Updated { path, content } => {
                io::write_durable(&path, &content).map_err(ApplyError::WriteTemplate)?;
                info!("Updated template {}", path.display());
                self.reload.reload();
            }
            ChangeEvent::Removed { path } => {
                io::remove_file(&path).map_err(ApplyError::RemoveTemplate)?;
                templates.retain(|p| p != &path);
                self.regenerate(templates)?;
                info!("Removed template {}", path.display());
                self.reload.reload();
                io::remove_file_best_effort(&rendered_destination(&path));
            }
        }
        Ok(())
    }

    fn regenerate(&self, templates: &[PathBuf]) -> Result<(), ApplyError> {
        generated_config::regenerate(&self.config_path, templates).map_err(ApplyError::Regenerate)
    }
}

impl<R: ReloadSignal> Resumable for ChangeApplier<R> {
    type State = MaterializedTemplates;
    type Error = ApplyError;

    async fn step(
        &mut self,
        mut templates: MaterializedTemplates,
    ) -> Result<Step<MaterializedTemplates>, ApplyError> {
        match self.events.recv().await {
            Some(event) => {
                self.apply(&mut templates, event)?;
                Ok(Step::Continue(templates))
            }
            None if self.shutdown.is_cancelled() => {
                info!("Change event stream drained; applier stopping");
                Ok(Step::Complete(templates))
            }
            None => {
                error!("Change event stream closed while the daemon is still running");
                Err(ApplyError::StreamClosed)
            }
        }
    }
}

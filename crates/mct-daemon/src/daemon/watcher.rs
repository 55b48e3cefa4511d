//! KV prefix watcher
//!
//! One [`KvWatcher`] per [`WatchPair`]. Each step issues a blocking listing
//! of the pair's prefix, diffs it against the template keys seen so far and
//! publishes the resulting [`ChangeEvent`]s, already rewritten to local
//! paths under the pair's directory.

use super::task::{Resumable, Step};
use mct_core::config::WatchPair;
use mct_core::consul::{KvClient, KvEntry};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Filename extension marking a key as a template
pub const TEMPLATE_EXTENSION: &str = "ctmpl";

/// A change to apply on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Template appeared under the prefix
    Created { path: PathBuf, content: Vec<u8> },
    /// Template content changed (new modify index)
    Updated { path: PathBuf, content: Vec<u8> },
    /// Template disappeared from the prefix
    Removed { path: PathBuf },
}

impl ChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path, .. } | Self::Updated { path, .. } | Self::Removed { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
        }
    }
}

/// A change keyed by the remote key, before path rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    Created { key: String, value: Vec<u8> },
    Updated { key: String, value: Vec<u8> },
    Removed { key: String },
}

impl KeyChange {
    /// Rewrite the remote key to `pair.directory / basename(key)`.
    pub fn localize(self, pair: &WatchPair) -> ChangeEvent {
        match self {
            Self::Created { key, value } => ChangeEvent::Created {
                path: pair.local_path(&key),
                content: value,
            },
            Self::Updated { key, value } => ChangeEvent::Updated {
                path: pair.local_path(&key),
                content: value,
            },
            Self::Removed { key } => ChangeEvent::Removed {
                path: pair.local_path(&key),
            },
        }
    }
}

/// Per-watcher state carried between steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchState {
    /// Blocking-query cursor; 0 means "do not block"
    pub cursor: u64,
    /// Template key → modify index as of the last successful listing
    pub known: HashMap<String, u64>,
}

/// True if the key's filename extension is exactly [`TEMPLATE_EXTENSION`].
pub fn is_template_key(key: &str) -> bool {
    Path::new(key)
        .extension()
        .is_some_and(|ext| ext == TEMPLATE_EXTENSION)
}

/// Diff a full listing against the previously known template keys.
///
/// Returns the changes (all removals first, sorted by key, then creates and
/// updates in listing order) and the replacement `known` map. Removal is by
/// absence from the *unfiltered* listing; the new map holds template keys only.
pub fn diff_listing(
    known: &HashMap<String, u64>,
    entries: &[KvEntry],
) -> (Vec<KeyChange>, HashMap<String, u64>) {
    let present: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();

    let mut removed: Vec<&String> = known
        .keys()
        .filter(|key| !present.contains(key.as_str()))
        .collect();
    removed.sort();

    let mut changes: Vec<KeyChange> = removed
        .into_iter()
        .map(|key| KeyChange::Removed { key: key.clone() })
        .collect();

    let mut next_known = HashMap::new();
    for entry in entries.iter().filter(|e| is_template_key(&e.key)) {
        match known.get(&entry.key) {
            None => changes.push(KeyChange::Created {
                key: entry.key.clone(),
                value: entry.value.clone(),
            }),
            Some(&index) if index != entry.modify_index => changes.push(KeyChange::Updated {
                key: entry.key.clone(),
                value: entry.value.clone(),
            }),
            Some(_) => {}
        }
        next_known.insert(entry.key.clone(), entry.modify_index);
    }

    (changes, next_known)
}

/// Timing knobs for a watcher
#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    /// Long-poll wait sent with each listing
    pub wait: Duration,
    /// Fixed pause after a failed listing
    pub retry_delay: Duration,
}

/// Watches one prefix and publishes local change events.
pub struct KvWatcher {
    client: Arc<dyn KvClient>,
    pair: WatchPair,
    events: mpsc::Sender<ChangeEvent>,
    settings: WatcherSettings,
    cancel: CancellationToken,
}

impl KvWatcher {
    pub fn new(
        client: Arc<dyn KvClient>,
        pair: WatchPair,
        events: mpsc::Sender<ChangeEvent>,
        settings: WatcherSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pair,
            events,
            settings,
            cancel,
        }
    }

    pub fn pair(&self) -> &WatchPair {
        &self.pair
    }
}

impl Resumable for KvWatcher {
    type State = WatchState;
    type Error = Infallible;

    async fn step(&mut self, mut state: WatchState) -> Result<Step<WatchState>, Infallible> {
        let request = self
            .client
            .list(&self.pair.prefix, state.cursor, self.settings.wait);
        let result = tokio::select! {
            result = request => result,
            _ = self.cancel.cancelled() => {
                debug!(prefix = %self.pair.prefix, "Watcher cancelled during listing");
                return Ok(Step::Complete(state));
            }
        };

        let listing = match result {
            Ok(listing) => listing,
            Err(e) => {
                error!(
                    prefix = %self.pair.prefix,
                    "KV listing failed: {}; retrying in {:?}",
                    e,
                    self.settings.retry_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
                return Ok(Step::Continue(state));
            }
        };

        let (changes, known) = diff_listing(&state.known, &listing.entries);
        for change in changes {
            let event = change.localize(&self.pair);
            debug!(
                prefix = %self.pair.prefix,
                "Template {} {}",
                event.path().display(),
                event.kind()
            );
            if self.events.send(event).await.is_err() {
                info!(
                    "Change event channel closed; stopping watcher for {}",
                    self.pair
                );
                return Ok(Step::Complete(state));
            }
        }

        state.known = known;
        if let Some(index) = listing.index {
            state.cursor = index;
        }
        Ok(Step::Continue(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, i)| (k.to_string(), *i)).collect()
    }

    #[test]
    fn test_is_template_key() {
        assert!(is_template_key("service/web/nginx.conf.ctmpl"));
        assert!(is_template_key("a.ctmpl"));
        assert!(!is_template_key("a.ctmpl.bak"));
        assert!(!is_template_key("c.txt"));
        assert!(!is_template_key("service/web/"));
        assert!(!is_template_key("ctmpl"));
    }

    #[test]
    fn test_created_from_empty_state() {
        let (changes, next) = diff_listing(&HashMap::new(), &[KvEntry::new("a.ctmpl", "X", 1)]);
        assert_eq!(
            changes,
            vec![KeyChange::Created {
                key: "a.ctmpl".to_string(),
                value: b"X".to_vec()
            }]
        );
        assert_eq!(next, known(&[("a.ctmpl", 1)]));
    }

    #[test]
    fn test_updated_on_new_modify_index() {
        let (changes, next) = diff_listing(
            &known(&[("a.ctmpl", 1)]),
            &[KvEntry::new("a.ctmpl", "Y", 2)],
        );
        assert_eq!(
            changes,
            vec![KeyChange::Updated {
                key: "a.ctmpl".to_string(),
                value: b"Y".to_vec()
            }]
        );
        assert_eq!(next, known(&[("a.ctmpl", 2)]));
    }

    #[test]
    fn test_removed_by_absence() {
        let (changes, next) = diff_listing(
            &known(&[("a.ctmpl", 1), ("b.ctmpl", 2)]),
            &[KvEntry::new("a.ctmpl", "X", 1)],
        );
        assert_eq!(
            changes,
            vec![KeyChange::Removed {
                key: "b.ctmpl".to_string()
            }]
        );
        assert_eq!(next, known(&[("a.ctmpl", 1)]));
    }

    #[test]
    fn test_non_template_ignored() {
        let (changes, next) = diff_listing(&HashMap::new(), &[KvEntry::new("c.txt", "Z", 1)]);
        assert!(changes.is_empty());
        assert!(next.is_empty());
    }

    #[test]
    fn test_removals_precede_creates() {
        let (changes, _) = diff_listing(
            &known(&[("old.ctmpl", 1), ("gone.ctmpl", 3)]),
            &[
                KvEntry::new("new.ctmpl", "N", 5),
                KvEntry::new("notes.md", "ignored", 6),
            ],
        );
        let kinds: Vec<&str> = changes
            .iter()
            .map(|c| match c {
                KeyChange::Created { key, .. } => key.as_str(),
                KeyChange::Updated { key, .. } => key.as_str(),
                KeyChange::Removed { key } => key.as_str(),
            })
            .collect();
        assert_eq!(kinds, vec!["gone.ctmpl", "old.ctmpl", "new.ctmpl"]);
        assert!(matches!(changes[0], KeyChange::Removed { .. }));
        assert!(matches!(changes[2], KeyChange::Created { .. }));
    }

    #[test]
    fn test_unchanged_listing_is_silent() {
        let prior = known(&[("a.ctmpl", 4)]);
        let (changes, next) = diff_listing(
            &prior,
            &[KvEntry::new("a.ctmpl", "X", 4), KvEntry::new("c.txt", "Z", 9)],
        );
        assert!(changes.is_empty());
        assert_eq!(next, prior);
    }

    #[test]
    fn test_localize_uses_pair_directory_and_basename() {
        let pair = WatchPair::new("service/web", "/etc/ct/web");
        let event = KeyChange::Created {
            key: "service/web/deep/nginx.conf.ctmpl".to_string(),
            value: b"X".to_vec(),
        }
        .localize(&pair);
        assert_eq!(event.path(), Path::new("/etc/ct/web/nginx.conf.ctmpl"));
        assert_eq!(event.kind(), "created");
    }
}

//! Filesystem change notifications for transcript directories
//!
//! Debounced notify events are reduced to the set of `.jsonl` paths that
//! changed and forwarded to the tail loop, which maps them to sessions.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Quiet period before a burst of writes is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Keeps the underlying watcher alive; dropping it stops notifications.
pub struct TranscriptWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl TranscriptWatcher {
    /// Watch `dirs` and send each changed transcript path on `tx`.
    pub fn start(dirs: &[PathBuf], recursive: bool, tx: UnboundedSender<PathBuf>) -> Result<Self> {
        let mut debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
            Ok(events) => {
                for path in transcript_paths(events.iter().map(|e| e.path.as_path())) {
                    // Receiver gone means we are shutting down
                    if tx.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = ?e, "File watcher error"),
        })
        .context("failed to create file watcher")?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for dir in dirs {
            debouncer
                .watcher()
                .watch(dir, mode)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), recursive, "Watching for transcript changes");
        }

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Distinct `.jsonl` paths among the changed paths, sorted.
pub fn transcript_paths<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .map(Path::to_path_buf)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Directories to watch for a set of transcript files, deduplicated.
pub fn parent_dirs(files: &[PathBuf]) -> Vec<PathBuf> {
    files
        .iter()
        .filter_map(|f| f.parent())
        .map(|p| {
            if p.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                p.to_path_buf()
            }
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_paths_filters_and_dedups() {
        let changed = [
            Path::new("/p/b.jsonl"),
            Path::new("/p/a.jsonl"),
            Path::new("/p/b.jsonl"),
            Path::new("/p/notes.txt"),
            Path::new("/p/dir"),
        ];
        assert_eq!(
            transcript_paths(changed),
            vec![PathBuf::from("/p/a.jsonl"), PathBuf::from("/p/b.jsonl")]
        );
    }

    #[test]
    fn test_parent_dirs() {
        let files = vec![
            PathBuf::from("/p/one/a.jsonl"),
            PathBuf::from("/p/one/b.jsonl"),
            PathBuf::from("/p/two/c.jsonl"),
        ];
        assert_eq!(
            parent_dirs(&files),
            vec![PathBuf::from("/p/one"), PathBuf::from("/p/two")]
        );
        assert_eq!(
            parent_dirs(&[PathBuf::from("bare.jsonl")]),
            vec![PathBuf::from(".")]
        );
    }
}

//! Filesystem watcher keeping the library in sync with the media root.
//!
//! `notify` events are collected into a pending set and applied once the
//! channel has been quiet for the debounce window.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{select, unbounded, Receiver};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use crate::library::ScanOptions;
use crate::library_service::LibraryService;

/// Watch the media root until `shutdown` fires or is disconnected.
pub fn watch_library(service: &LibraryService, debounce: Duration, shutdown: Receiver<()>) -> Result<()> {
    let (tx, rx) = unbounded();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .context("create filesystem watcher")?;
    watcher
        .watch(service.root(), RecursiveMode::Recursive)
        .with_context(|| format!("watch {:?}", service.root()))?;
    tracing::info!(
        root = %service.root().display(),
        debounce_ms = debounce.as_millis() as u64,
        "watching library"
    );

    let mut pending = BTreeSet::new();
    loop {
        select! {
            recv(shutdown) -> _ => {
                flush_pending(service, &mut pending);
                break;
            }
            recv(rx) -> msg => match msg {
                Ok(Ok(event)) => {
                    pending.extend(relevant_paths(&event, service.root(), service.options()));
                }
                Ok(Err(err)) => tracing::warn!(error = %err, "watch error"),
                Err(_) => break,
            },
            default(debounce) => flush_pending(service, &mut pending),
        }
    }

    tracing::info!("library watcher stopped");
    Ok(())
}

/// Apply and clear the pending paths.
pub fn flush_pending(service: &LibraryService, pending: &mut BTreeSet<PathBuf>) {
    if pending.is_empty() {
        return;
    }
    let paths = collapse_nested(std::mem::take(pending));
    tracing::debug!(count = paths.len(), "applying filesystem changes");
    for path in paths {
        if let Err(err) = service.sync_path(&path) {
            tracing::warn!(path = %path.display(), error = %err, "library sync failed");
        }
    }
}

/// Drop paths whose ancestor is also present; the ancestor's rescan covers them.
pub fn collapse_nested(paths: BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in paths {
        if kept.last().is_some_and(|prev| path.starts_with(prev)) {
            continue;
        }
        kept.push(path);
    }
    kept
}

/// Paths of `event` worth syncing: inside the root, not hidden, and either
/// removed or of a supported type.
pub fn relevant_paths(event: &Event, root: &Path, options: &ScanOptions) -> Vec<PathBuf> {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return Vec::new();
    }
    let removal = matches!(event.kind, EventKind::Remove(_));
    event
        .paths
        .iter()
        .filter(|path| {
            let Ok(relative) = path.strip_prefix(root) else {
                return false;
            };
            if relative.as_os_str().is_empty() {
                return false;
            }
            let hidden = relative.components().any(|component| match component {
                Component::Normal(name) => name.to_str().is_some_and(|n| n.starts_with('.')),
                _ => false,
            });
            if hidden {
                return false;
            }
            removal || path.is_dir() || options.is_supported_path(path)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::library_db::test_support::temp_db;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

    fn root() -> PathBuf {
        PathBuf::from("/music")
    }

    #[test]
    fn relevant_paths_filters_hidden_foreign_and_unsupported() {
        let options = ScanOptions::default();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(root().join("a/song.flac"))
            .add_path(root().join("a/cover.jpg"))
            .add_path(root().join(".medialib/library.sqlite-wal"))
            .add_path(PathBuf::from("/elsewhere/x.flac"))
            .add_path(root());
        assert_eq!(relevant_paths(&event, &root(), &options), vec![root().join("a/song.flac")]);
    }

    #[test]
    fn removals_keep_paths_of_any_type_and_access_is_ignored() {
        let options = ScanOptions::default();
        let removed = Event::new(EventKind::Remove(RemoveKind::Any)).add_path(root().join("Old Album.2001"));
        assert_eq!(relevant_paths(&removed, &root(), &options).len(), 1);

        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path(root().join("a.flac"));
        assert!(relevant_paths(&access, &root(), &options).is_empty());

        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(root().join("b.mp3"));
        assert_eq!(relevant_paths(&modify, &root(), &options), vec![root().join("b.mp3")]);
    }

    #[test]
    fn collapse_nested_keeps_outermost_paths() {
        let paths = BTreeSet::from([
            root().join("a"),
            root().join("a/1.flac"),
            root().join("ab/2.flac"),
            root().join("b/3.flac"),
        ]);
        assert_eq!(
            collapse_nested(paths),
            vec![root().join("a"), root().join("ab/2.flac"), root().join("b/3.flac")]
        );
    }

    #[test]
    fn flush_pending_applies_creates_and_removals() {
        let media = std::env::temp_dir().join(format!(
            "medialib-watch-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&media).expect("media");
        let service = LibraryService::new(temp_db("watch"), &media, ScanOptions::default(), EventBus::new())
            .expect("service");
        let root = service.root().to_path_buf();
        std::fs::write(root.join("new.flac"), b"x").expect("write");

        let mut pending = BTreeSet::from([root.join("new.flac")]);
        flush_pending(&service, &mut pending);
        assert!(pending.is_empty());
        assert_eq!(service.db().stats().expect("stats").tracks, 1);

        std::fs::remove_file(root.join("new.flac")).expect("remove");
        let mut pending = BTreeSet::from([root.join("new.flac")]);
        flush_pending(&service, &mut pending);
        assert_eq!(service.db().stats().expect("stats").tracks, 0);
    }

    #[test]
    fn watcher_stops_on_shutdown() {
        let media = std::env::temp_dir().join(format!(
            "medialib-watch-stop-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&media).expect("media");
        let service = LibraryService::new(temp_db("watch-stop"), &media, ScanOptions::default(), EventBus::new())
            .expect("service");
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).expect("signal");
        watch_library(&service, Duration::from_millis(10), rx).expect("watch");
    }
}

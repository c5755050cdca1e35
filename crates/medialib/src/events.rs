//! In-process event bus for library updates.
//!
//! Subscribers (the watcher, the CLI's `watch` output) receive a copy of
//! every event published after they subscribed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::library_db::MergeReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LibraryEvent {
    LibraryChanged,
    ScanDirStart { path: String },
    ScanDirFinish { path: String, tracks: usize },
    TrackRemoved { id: i64, uri: String },
    PlaylistChanged { id: i64 },
    DuplicatesMerged {
        artists: usize,
        albums: usize,
        tracks: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LibraryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LibraryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn library_changed(&self) {
        self.publish(LibraryEvent::LibraryChanged);
    }

    pub fn track_removed(&self, id: i64, uri: &str) {
        self.publish(LibraryEvent::TrackRemoved {
            id,
            uri: uri.to_string(),
        });
    }

    pub fn playlist_changed(&self, id: i64) {
        self.publish(LibraryEvent::PlaylistChanged { id });
    }

    /// Publish a merge report, skipping reports that merged nothing.
    pub fn duplicates_merged(&self, report: MergeReport) {
        if report.is_empty() {
            return;
        }
        self.publish(LibraryEvent::DuplicatesMerged {
            artists: report.artists_merged,
            albums: report.albums_merged,
            tracks: report.tracks_moved,
        });
    }
}

//! Scan, rescan and import operations over the library store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use medialib_types::MediaSource;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, LibraryEvent};
use crate::library::{probe_track, scan_library_with_meta, DirProgress, ScanOptions, TrackMeta};
use crate::library_db::LibraryDb;
use crate::track_dao::{TrackRecord, UpsertOutcome};

pub const DROPBOX_URI_PREFIX: &str = "dropbox:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    fn count(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted(_) => self.inserted += 1,
            UpsertOutcome::Updated(_) => self.updated += 1,
            UpsertOutcome::Unchanged(_) => self.unchanged += 1,
        }
    }

    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.removed > 0
    }
}

/// One entry of a remote (Dropbox) manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Dropbox path, e.g. `/Music/Album/01.flac`.
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub disc_number: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub modified_ms: i64,
}

impl RemoteTrack {
    pub fn uri(&self) -> String {
        let path = self.path.trim();
        if path.starts_with('/') {
            format!("{DROPBOX_URI_PREFIX}{path}")
        } else {
            format!("{DROPBOX_URI_PREFIX}/{path}")
        }
    }

    fn to_record(&self) -> TrackRecord {
        let file_name = self
            .path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(self.path.as_str())
            .to_string();
        let format = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_uppercase());
        TrackRecord {
            uri: self.uri(),
            source: MediaSource::Dropbox,
            file_name,
            title: self.title.clone(),
            artist: self.artist.clone(),
            album_artist: self.album_artist.clone(),
            album: self.album.clone(),
            genre: self.genre.clone(),
            track_number: self.track_number,
            disc_number: self.disc_number,
            year: self.year,
            duration_ms: self.duration_ms,
            sample_rate: None,
            format,
            mtime_ms: self.modified_ms,
            size_bytes: self.size_bytes,
        }
    }
}

pub fn load_remote_manifest(path: &Path) -> Result<Vec<RemoteTrack>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read remote manifest {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse remote manifest {:?}", path))
}

#[derive(Clone)]
pub struct LibraryService {
    db: LibraryDb,
    root: PathBuf,
    options: ScanOptions,
    events: EventBus,
    covers_dir: Option<PathBuf>,
}

impl LibraryService {
    pub fn new(db: LibraryDb, root: &Path, options: ScanOptions, events: EventBus) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize media root {:?}", root))?;
        Ok(Self {
            db,
            root,
            options,
            events,
            covers_dir: None,
        })
    }

    /// Store embedded cover art of scanned files under `dir`.
    pub fn with_covers_dir(mut self, dir: PathBuf) -> Self {
        self.covers_dir = Some(dir);
        self
    }

    pub fn db(&self) -> &LibraryDb {
        &self.db
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn build_track_record(
        path: &Path,
        file_name: &str,
        meta: &TrackMeta,
        fs_meta: &std::fs::Metadata,
    ) -> TrackRecord {
        TrackRecord {
            uri: path.to_string_lossy().to_string(),
            source: MediaSource::Local,
            file_name: file_name.to_string(),
            title: meta.title.clone(),
            artist: meta.artist.clone(),
            album_artist: meta.album_artist.clone(),
            album: meta.album.clone(),
            genre: meta.genre.clone(),
            track_number: meta.track_number,
            disc_number: meta.disc_number,
            year: meta.year,
            duration_ms: meta.duration_ms,
            sample_rate: meta.sample_rate,
            format: meta.format.clone(),
            mtime_ms: fs_meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            size_bytes: fs_meta.len() as i64,
        }
    }

    /// Full scan of the media root; local rows for files not seen are removed.
    pub fn scan(&self) -> Result<ScanReport> {
        let (mut report, seen) = self.scan_tree(&self.root)?;
        let removed = self.db.delete_tracks_not_in(MediaSource::Local, &seen)?;
        report.removed = removed.len();
        for track in &removed {
            self.events.track_removed(track.id, &track.uri);
        }
        self.finish("scan", report)
    }

    /// Scan one directory below the root; rows under it not seen are removed.
    pub fn rescan_dir(&self, dir: &Path) -> Result<ScanReport> {
        let dir = self.resolve_under_root(dir)?;
        if !dir.is_dir() {
            return Err(anyhow!("not a directory: {:?}", dir));
        }
        let (mut report, seen) = self.scan_tree(&dir)?;
        let prefix = format!("{}/", dir.to_string_lossy().trim_end_matches('/'));
        for uri in self.db.list_uris(MediaSource::Local)? {
            if !uri.starts_with(&prefix) || seen.contains(&uri) {
                continue;
            }
            if let Some(track) = self.db.delete_track_by_uri(&uri)? {
                report.removed += 1;
                self.events.track_removed(track.id, &track.uri);
            }
        }
        self.finish("rescan dir", report)
    }

    fn scan_tree(&self, dir: &Path) -> Result<(ScanReport, HashSet<String>)> {
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();
        let events = &self.events;
        let summary = scan_library_with_meta(
            dir,
            &self.options,
            |path, file_name, meta, fs_meta| {
                let record = Self::build_track_record(path, file_name, meta, fs_meta);
                seen.insert(record.uri.clone());
                match self.db.upsert_track(&record) {
                    Ok(outcome) => {
                        report.count(outcome);
                        if !matches!(outcome, UpsertOutcome::Unchanged(_)) {
                            self.apply_cover(outcome.id(), meta);
                        }
                    }
                    Err(err) => {
                        report.failed += 1;
                        tracing::warn!(error = %err, path = %record.uri, "library upsert failed");
                    }
                }
            },
            |dir, progress| {
                let path = dir.to_string_lossy().to_string();
                match progress {
                    DirProgress::Start => events.publish(LibraryEvent::ScanDirStart { path }),
                    DirProgress::Finish { tracks } => {
                        events.publish(LibraryEvent::ScanDirFinish { path, tracks })
                    }
                }
            },
        )?;
        report.skipped = summary.skipped;
        Ok((report, seen))
    }

    fn finish(&self, label: &str, report: ScanReport) -> Result<ScanReport> {
        let merged = self.db.merge_all_duplicates()?;
        self.events.duplicates_merged(merged);
        if report.changed() || !merged.is_empty() {
            self.events.library_changed();
        }
        tracing::info!(
            label,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            skipped = report.skipped,
            failed = report.failed,
            "library sync finished"
        );
        Ok(report)
    }

    /// Re-read a single file. Returns `None` when the file is filtered out
    /// (any stored row for it is removed).
    pub fn rescan_path(&self, path: &Path) -> Result<Option<UpsertOutcome>> {
        let full_path = self.resolve_track_path(path)?;
        if !self.options.is_supported_path(&full_path) {
            return Err(anyhow!("unsupported file type: {:?}", full_path));
        }
        let meta = probe_track(&full_path)?;
        let uri = full_path.to_string_lossy().to_string();
        if meta
            .duration_ms
            .is_some_and(|duration| duration < self.options.min_duration_ms)
        {
            if let Some(track) = self.db.delete_track_by_uri(&uri)? {
                self.events.track_removed(track.id, &track.uri);
                self.events.library_changed();
            }
            return Ok(None);
        }
        let fs_meta = std::fs::metadata(&full_path)
            .with_context(|| format!("stat {:?}", full_path))?;
        let file_name = full_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("<unknown>");
        let record = Self::build_track_record(&full_path, file_name, &meta, &fs_meta);
        let outcome = self.db.upsert_track(&record)?;
        if !matches!(outcome, UpsertOutcome::Unchanged(_)) {
            self.apply_cover(outcome.id(), &meta);
            self.events.library_changed();
        }
        tracing::debug!(path = %uri, ?outcome, "rescanned track");
        Ok(Some(outcome))
    }

    /// Drop every track stored at `path` or below it. The path itself may
    /// already be gone from disk.
    pub fn remove_path(&self, path: &Path) -> Result<usize> {
        let normalized = self.resolve_under_root(path)?;
        let removed = self
            .db
            .delete_tracks_under(&normalized.to_string_lossy())?;
        for track in &removed {
            self.events.track_removed(track.id, &track.uri);
        }
        if !removed.is_empty() {
            self.events.library_changed();
            tracing::info!(path = %normalized.display(), removed = removed.len(), "removed tracks");
        }
        Ok(removed.len())
    }

    /// Bring the store in line with whatever is at `path` now.
    pub fn sync_path(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            self.rescan_dir(path)?;
        } else if path.is_file() {
            if self.options.is_supported_path(path) {
                self.rescan_path(path)?;
            }
        } else {
            self.remove_path(path)?;
        }
        Ok(())
    }

    /// Add or update tracks hosted on Dropbox. With `prune`, Dropbox rows
    /// absent from `tracks` are deleted.
    pub fn import_remote(&self, tracks: &[RemoteTrack], prune: bool) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();
        for track in tracks {
            if track.path.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            let record = track.to_record();
            seen.insert(record.uri.clone());
            match self.db.upsert_track(&record) {
                Ok(outcome) => report.count(outcome),
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(error = %err, uri = %record.uri, "remote import failed");
                }
            }
        }
        if prune {
            let removed = self.db.delete_tracks_not_in(MediaSource::Dropbox, &seen)?;
            report.removed = removed.len();
            for track in &removed {
                self.events.track_removed(track.id, &track.uri);
            }
        }
        self.finish("import remote", report)
    }

    /// Canonical path of an existing file inside the media root.
    pub fn resolve_track_path(&self, raw_path: &Path) -> Result<PathBuf> {
        let joined = if raw_path.is_absolute() {
            raw_path.to_path_buf()
        } else {
            self.root.join(raw_path)
        };
        let full_path = joined
            .canonicalize()
            .with_context(|| format!("track not found: {:?}", raw_path))?;
        if !full_path.starts_with(&self.root) {
            return Err(anyhow!("path outside library root: {:?}", raw_path));
        }
        if !full_path.is_file() {
            return Err(anyhow!("not a file: {:?}", raw_path));
        }
        Ok(full_path)
    }

    /// Absolute path under the root; falls back to the canonical parent
    /// when `raw_path` no longer exists.
    fn resolve_under_root(&self, raw_path: &Path) -> Result<PathBuf> {
        let joined = if raw_path.is_absolute() {
            raw_path.to_path_buf()
        } else {
            self.root.join(raw_path)
        };
        let normalized = match joined.canonicalize() {
            Ok(path) => path,
            Err(_) => match (joined.parent(), joined.file_name()) {
                (Some(parent), Some(name)) => parent
                    .canonicalize()
                    .map(|parent| parent.join(name))
                    .unwrap_or(joined.clone()),
                _ => joined.clone(),
            },
        };
        if !normalized.starts_with(&self.root) {
            return Err(anyhow!("path outside library root: {:?}", raw_path));
        }
        Ok(normalized)
    }

    fn apply_cover(&self, track_id: i64, meta: &TrackMeta) {
        let (Some(dir), Some(art)) = (self.covers_dir.as_ref(), meta.cover_art.as_ref()) else {
            return;
        };
        if let Err(err) = self.store_cover(dir, track_id, art) {
            tracing::warn!(error = %err, track_id, "cover art store failed");
        }
    }

    fn store_cover(&self, dir: &Path, track_id: i64, art: &crate::library::CoverArt) -> Result<()> {
        let Some(track) = self.db.track_by_id(track_id)? else {
            return Ok(());
        };
        let Some(album) = self.db.album_by_id(track.album_id)? else {
            return Ok(());
        };
        if album.cover_art_path.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(dir).with_context(|| format!("create covers dir {:?}", dir))?;
        let path = dir.join(format!("album-{}.{}", album.id, art.extension()));
        std::fs::write(&path, &art.data).with_context(|| format!("write cover {:?}", path))?;
        self.db
            .set_album_cover(album.id, Some(&path.to_string_lossy()))?;
        tracing::debug!(album_id = album.id, path = %path.display(), "stored cover art");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::test_support::write_pcm_wav;
    use crate::library::CoverArt;
    use crate::library_db::test_support::{assert_consistent, temp_db};
    use crate::library_db::{UNKNOWN_ALBUM, UNKNOWN_ARTIST};

    fn temp_media(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "medialib-media-{label}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&root).expect("create media root");
        root
    }

    fn service(label: &str) -> (LibraryService, PathBuf) {
        let media = temp_media(label);
        let db = temp_db(label);
        let service = LibraryService::new(db, &media, ScanOptions::default(), EventBus::new())
            .expect("service");
        let root = service.root().to_path_buf();
        (service, root)
    }

    #[test]
    fn scan_inserts_then_reports_unchanged_then_removes_missing() {
        let (service, root) = service("svc-scan");
        std::fs::create_dir_all(root.join("album")).expect("album dir");
        std::fs::write(root.join("album/01.flac"), b"one").expect("01");
        std::fs::write(root.join("album/02.flac"), b"two").expect("02");

        let first = service.scan().expect("first scan");
        assert_eq!(first.inserted, 2);
        let tracks = service.db().list_tracks(&Default::default()).expect("tracks");
        assert_eq!(tracks[0].artist, UNKNOWN_ARTIST);
        assert_eq!(tracks[0].album, UNKNOWN_ALBUM);

        let second = service.scan().expect("second scan");
        assert_eq!(second.unchanged, 2);
        assert!(!second.changed());

        std::fs::remove_file(root.join("album/02.flac")).expect("remove 02");
        let third = service.scan().expect("third scan");
        assert_eq!(third.removed, 1);
        assert_eq!(service.db().stats().expect("stats").tracks, 1);
        assert_consistent(service.db());
    }

    #[test]
    fn scan_publishes_dir_and_change_events() {
        let (service, root) = service("svc-events");
        std::fs::write(root.join("a.mp3"), b"x").expect("a");
        let mut rx = service.events().subscribe();
        service.scan().expect("scan");

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event);
        }
        assert!(matches!(kinds.first(), Some(LibraryEvent::ScanDirStart { .. })));
        assert!(kinds.contains(&LibraryEvent::LibraryChanged));
    }

    #[test]
    fn scan_skips_short_files_and_finishes_their_directory() {
        let media = temp_media("svc-short");
        std::fs::create_dir_all(media.join("shorts")).expect("shorts");
        std::fs::create_dir_all(media.join("songs")).expect("songs");
        write_pcm_wav(&media.join("shorts/blip.wav"), 10);
        write_pcm_wav(&media.join("songs/tone.wav"), 1000);
        std::fs::write(media.join("songs/stub.flac"), b"x").expect("stub");
        let options = ScanOptions {
            min_duration_ms: 500,
            ..ScanOptions::default()
        };
        let service = LibraryService::new(temp_db("svc-short"), &media, options, EventBus::new())
            .expect("service");
        let root = service.root().to_path_buf();
        let mut rx = service.events().subscribe();

        let report = service.scan().expect("scan");
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
        let tone = service
            .db()
            .track_by_uri(&root.join("songs/tone.wav").to_string_lossy())
            .expect("lookup")
            .expect("tone kept");
        assert_eq!(tone.duration_ms, 1000);

        let shorts = root.join("shorts").to_string_lossy().to_string();
        let mut dir_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let for_shorts = matches!(
                &event,
                LibraryEvent::ScanDirStart { path } | LibraryEvent::ScanDirFinish { path, .. }
                    if *path == shorts
            );
            if for_shorts {
                dir_events.push(event);
            }
        }
        assert_eq!(
            dir_events,
            vec![
                LibraryEvent::ScanDirStart { path: shorts.clone() },
                LibraryEvent::ScanDirFinish { path: shorts, tracks: 0 },
            ]
        );
    }

    #[test]
    fn rescan_path_detects_modified_file() {
        let (service, root) = service("svc-rescan");
        let file = root.join("song.flac");
        std::fs::write(&file, b"short").expect("write");
        let inserted = service.rescan_path(&file).expect("rescan").expect("kept");
        assert!(matches!(inserted, UpsertOutcome::Inserted(_)));

        std::fs::write(&file, b"a longer body").expect("rewrite");
        let updated = service.rescan_path(&file).expect("rescan").expect("kept");
        assert_eq!(updated, UpsertOutcome::Updated(inserted.id()));
        assert!(service.rescan_path(Path::new("/etc/hostname")).is_err());
    }

    #[test]
    fn remove_path_handles_deleted_directories_and_rejects_outside() {
        let (service, root) = service("svc-remove");
        std::fs::create_dir_all(root.join("gone")).expect("dir");
        std::fs::write(root.join("gone/a.flac"), b"a").expect("a");
        std::fs::write(root.join("keep.flac"), b"k").expect("k");
        service.scan().expect("scan");

        std::fs::remove_dir_all(root.join("gone")).expect("rm dir");
        assert_eq!(service.remove_path(&root.join("gone")).expect("remove"), 1);
        assert_eq!(service.db().stats().expect("stats").tracks, 1);
        assert!(service.remove_path(Path::new("/tmp")).is_err());
        assert_consistent(service.db());
    }

    #[test]
    fn rescan_dir_only_touches_its_subtree() {
        let (service, root) = service("svc-dir");
        std::fs::create_dir_all(root.join("a")).expect("a");
        std::fs::create_dir_all(root.join("b")).expect("b");
        std::fs::write(root.join("a/1.flac"), b"1").expect("a1");
        std::fs::write(root.join("b/1.flac"), b"1").expect("b1");
        service.scan().expect("scan");

        std::fs::remove_file(root.join("a/1.flac")).expect("rm a1");
        std::fs::write(root.join("a/2.flac"), b"2").expect("a2");
        let report = service.rescan_dir(&root.join("a")).expect("rescan a");
        assert_eq!(report.inserted, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(service.db().stats().expect("stats").tracks, 2);
    }

    #[test]
    fn import_remote_is_idempotent_and_prunes() {
        let (service, _root) = service("svc-remote");
        let manifest = vec![
            RemoteTrack {
                path: "/Music/Boards/roygbiv.flac".to_string(),
                artist: Some("Boards of Canada".to_string()),
                album: Some("Music Has the Right".to_string()),
                duration_ms: Some(150_000),
                ..RemoteTrack::default()
            },
            RemoteTrack {
                path: "Music/Boards/turquoise.flac".to_string(),
                artist: Some("boards of canada".to_string()),
                album: Some("Music Has the Right".to_string()),
                duration_ms: Some(300_000),
                ..RemoteTrack::default()
            },
        ];
        let first = service.import_remote(&manifest, false).expect("import");
        assert_eq!(first.inserted, 2);
        let again = service.import_remote(&manifest, false).expect("import again");
        assert_eq!(again.unchanged, 2);

        let artists = service.db().list_artists(None, 10, 0).expect("artists");
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0].total_duration_ms, 450_000);

        let pruned = service.import_remote(&manifest[..1], true).expect("prune");
        assert_eq!(pruned.removed, 1);
        let track = service
            .db()
            .track_by_uri("dropbox:/Music/Boards/roygbiv.flac")
            .expect("lookup")
            .expect("remote track");
        assert_eq!(track.source, MediaSource::Dropbox);
        assert_eq!(track.format.as_deref(), Some("FLAC"));
        assert_consistent(service.db());
    }

    #[test]
    fn remote_manifest_parses_sparse_entries() {
        let dir = temp_media("manifest");
        let path = dir.join("manifest.json");
        std::fs::write(&path, r#"[{"path":"/a.mp3"},{"path":"/b.mp3","year":2001}]"#)
            .expect("write manifest");
        let tracks = load_remote_manifest(&path).expect("load");
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].year, Some(2001));
        assert_eq!(tracks[0].uri(), "dropbox:/a.mp3");
    }

    #[test]
    fn store_cover_writes_file_once_per_album() {
        let (service, root) = service("svc-cover");
        let covers = root.join(".medialib/covers");
        let service = service.with_covers_dir(covers.clone());
        std::fs::write(root.join("a.flac"), b"a").expect("a");
        let id = service
            .rescan_path(&root.join("a.flac"))
            .expect("rescan")
            .expect("kept")
            .id();
        let art = CoverArt {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        };
        service.store_cover(&covers, id, &art).expect("store");

        let track = service.db().track_by_id(id).expect("lookup").expect("track");
        let album = service.db().album_by_id(track.album_id).expect("lookup").expect("album");
        let cover = album.cover_art_path.expect("cover path");
        assert!(cover.ends_with(".png"));
        assert_eq!(std::fs::read(&cover).expect("read cover"), vec![1, 2, 3]);
    }
}

//! Track rows and the aggregate bookkeeping they drive.
//!
//! Every write here keeps `albums`/`artists` `total_duration_ms` and
//! `playback_count` equal to the sums over their tracks by applying deltas:
//! a track is detached (its values subtracted) before it changes and attached
//! (values added) afterwards. Parents left without tracks are deleted
//! bottom-up: track, then album, then artist.

use std::collections::HashSet;

use anyhow::{Context, Result};
use medialib_types::{MediaSource, TrackSummary};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::library_db::{
    display_title, is_blank, like_pattern, now_ms, sort_key, LibraryDb, UNKNOWN_ALBUM,
    UNKNOWN_ARTIST,
};
use crate::{album_dao, artist_dao, genre_dao, playlist_dao};

/// Tag + file data for one track as produced by a scan or an import.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub uri: String,
    pub source: MediaSource,
    pub file_name: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub duration_ms: Option<u64>,
    pub sample_rate: Option<u32>,
    pub format: Option<String>,
    pub mtime_ms: i64,
    pub size_bytes: i64,
}

impl TrackRecord {
    fn artist_title(&self) -> String {
        display_title(self.artist.as_deref(), UNKNOWN_ARTIST)
    }

    fn album_artist_title(&self) -> String {
        if is_blank(self.album_artist.as_deref()) {
            self.artist_title()
        } else {
            display_title(self.album_artist.as_deref(), UNKNOWN_ARTIST)
        }
    }

    fn album_title(&self) -> String {
        display_title(self.album.as_deref(), UNKNOWN_ALBUM)
    }

    fn genre_name(&self) -> Option<&str> {
        self.genre.as_deref().map(str::trim).filter(|g| !g.is_empty())
    }

    fn duration(&self) -> i64 {
        self.duration_ms.map(|v| v as i64).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match *self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => id,
        }
    }
}

/// What a track deletion removed along the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedTrack {
    pub id: i64,
    pub uri: String,
    pub album_removed: bool,
    pub artists_removed: Vec<i64>,
    pub genre_removed: bool,
}

#[derive(Debug, Clone)]
pub struct TrackFilter {
    pub album_id: Option<i64>,
    pub artist_id: Option<i64>,
    pub genre_id: Option<i64>,
    pub search: Option<String>,
    /// Negative means no limit.
    pub limit: i64,
    pub offset: i64,
}

impl Default for TrackFilter {
    fn default() -> Self {
        Self {
            album_id: None,
            artist_id: None,
            genre_id: None,
            search: None,
            limit: -1,
            offset: 0,
        }
    }
}

/// Stored track plus the keys of the parents it hangs off.
#[derive(Debug, Clone)]
struct StoredTrack {
    id: i64,
    uri: String,
    artist_id: i64,
    album_id: i64,
    album_artist_id: i64,
    genre_id: Option<i64>,
    duration_ms: i64,
    playback_count: i64,
    mtime_ms: i64,
    size_bytes: i64,
    title: Option<String>,
    track_number: Option<u32>,
    disc_number: Option<u32>,
    year: Option<i32>,
    artist_key: String,
    album_key: String,
    album_artist_key: String,
    genre_key: Option<String>,
}

impl StoredTrack {
    fn matches(&self, record: &TrackRecord) -> bool {
        self.mtime_ms == record.mtime_ms
            && self.size_bytes == record.size_bytes
            && self.duration_ms == record.duration()
            && self.title == record.title
            && self.track_number == record.track_number
            && self.disc_number == record.disc_number
            && self.year == record.year
            && self.artist_key == sort_key(&record.artist_title())
            && self.album_key == sort_key(&record.album_title())
            && self.album_artist_key == sort_key(&record.album_artist_title())
            && self.genre_key == record.genre_name().map(sort_key)
    }
}

const STORED_SELECT: &str = r#"
    SELECT t.id, t.uri, t.artist_id, t.album_id, al.artist_id, t.genre_id,
           t.duration_ms, t.playback_count, t.mtime_ms, t.size_bytes, t.title,
           t.track_number, t.disc_number, t.year,
           ar.sort_title, al.sort_title, aa.sort_title, g.sort_name
    FROM tracks t
    JOIN artists ar ON ar.id = t.artist_id
    JOIN albums al ON al.id = t.album_id
    JOIN artists aa ON aa.id = al.artist_id
    LEFT JOIN genres g ON g.id = t.genre_id
"#;

fn map_stored_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTrack> {
    Ok(StoredTrack {
        id: row.get(0)?,
        uri: row.get(1)?,
        artist_id: row.get(2)?,
        album_id: row.get(3)?,
        album_artist_id: row.get(4)?,
        genre_id: row.get(5)?,
        duration_ms: row.get(6)?,
        playback_count: row.get(7)?,
        mtime_ms: row.get(8)?,
        size_bytes: row.get(9)?,
        title: row.get(10)?,
        track_number: row.get::<_, Option<i64>>(11)?.map(|v| v as u32),
        disc_number: row.get::<_, Option<i64>>(12)?.map(|v| v as u32),
        year: row.get(13)?,
        artist_key: row.get(14)?,
        album_key: row.get(15)?,
        album_artist_key: row.get(16)?,
        genre_key: row.get(17)?,
    })
}

fn stored_by_uri(conn: &Connection, uri: &str) -> Result<Option<StoredTrack>> {
    conn.query_row(
        &format!("{STORED_SELECT} WHERE t.uri = ?1"),
        params![uri],
        map_stored_row,
    )
    .optional()
    .context("lookup stored track by uri")
}

fn stored_by_id(conn: &Connection, id: i64) -> Result<Option<StoredTrack>> {
    conn.query_row(
        &format!("{STORED_SELECT} WHERE t.id = ?1"),
        params![id],
        map_stored_row,
    )
    .optional()
    .context("lookup stored track by id")
}

const TRACK_SELECT: &str = r#"
    SELECT t.id, t.uri, t.source, t.file_name, t.title,
           t.artist_id, ar.title, t.album_id, al.title, g.name,
           t.track_number, t.disc_number, t.year, t.duration_ms, t.format,
           t.playback_count, t.last_played_ms
    FROM tracks t
    JOIN artists ar ON ar.id = t.artist_id
    JOIN albums al ON al.id = t.album_id
    LEFT JOIN genres g ON g.id = t.genre_id
"#;

fn map_track_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackSummary> {
    let source: String = row.get(2)?;
    Ok(TrackSummary {
        id: row.get(0)?,
        uri: row.get(1)?,
        source: MediaSource::parse(&source).unwrap_or_default(),
        file_name: row.get(3)?,
        title: row.get(4)?,
        artist_id: row.get(5)?,
        artist: row.get(6)?,
        album_id: row.get(7)?,
        album: row.get(8)?,
        genre: row.get(9)?,
        track_number: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
        disc_number: row.get::<_, Option<i64>>(11)?.map(|v| v as u32),
        year: row.get(12)?,
        duration_ms: row.get(13)?,
        format: row.get(14)?,
        playback_count: row.get(15)?,
        last_played_ms: row.get(16)?,
    })
}

impl LibraryDb {
    /// Insert or update a track by uri, keeping every aggregate consistent.
    pub fn upsert_track(&self, record: &TrackRecord) -> Result<UpsertOutcome> {
        self.write("upsert track", |tx| upsert_track(tx, record))
    }

    /// Delete a track and cascade to its album and artists if they empty.
    pub fn delete_track(&self, track_id: i64) -> Result<Option<DeletedTrack>> {
        self.write("delete track", |tx| delete_track(tx, track_id))
    }

    pub fn delete_track_by_uri(&self, uri: &str) -> Result<Option<DeletedTrack>> {
        self.write("delete track", |tx| {
            let id: Option<i64> = tx
                .query_row("SELECT id FROM tracks WHERE uri = ?1", params![uri], |row| row.get(0))
                .optional()
                .context("lookup track id by uri")?;
            match id {
                Some(id) => delete_track(tx, id),
                None => Ok(None),
            }
        })
    }

    /// Delete every track of `source` whose uri is not in `keep`.
    pub fn delete_tracks_not_in(
        &self,
        source: MediaSource,
        keep: &HashSet<String>,
    ) -> Result<Vec<DeletedTrack>> {
        self.write("delete missing tracks", |tx| {
            let mut deleted = Vec::new();
            for (id, uri) in ids_and_uris(tx, source)? {
                if keep.contains(&uri) {
                    continue;
                }
                if let Some(removed) = delete_track(tx, id)? {
                    deleted.push(removed);
                }
            }
            Ok(deleted)
        })
    }

    /// Delete every local track stored at or below `prefix`.
    pub fn delete_tracks_under(&self, prefix: &str) -> Result<Vec<DeletedTrack>> {
        let dir_prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.write("delete tracks under", |tx| {
            let mut deleted = Vec::new();
            for (id, uri) in ids_and_uris(tx, MediaSource::Local)? {
                if uri != prefix && !uri.starts_with(&dir_prefix) {
                    continue;
                }
                if let Some(removed) = delete_track(tx, id)? {
                    deleted.push(removed);
                }
            }
            Ok(deleted)
        })
    }

    /// Count one playback of the track on it, its album and its artist.
    pub fn record_playback(&self, track_id: i64) -> Result<bool> {
        self.write("record playback", |tx| record_playback(tx, track_id, now_ms()))
    }

    pub fn track_by_id(&self, track_id: i64) -> Result<Option<TrackSummary>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{TRACK_SELECT} WHERE t.id = ?1"),
            params![track_id],
            map_track_row,
        )
        .optional()
        .context("select track by id")
    }

    pub fn track_by_uri(&self, uri: &str) -> Result<Option<TrackSummary>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{TRACK_SELECT} WHERE t.uri = ?1"),
            params![uri],
            map_track_row,
        )
        .optional()
        .context("select track by uri")
    }

    pub fn list_tracks(&self, filter: &TrackFilter) -> Result<Vec<TrackSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            {TRACK_SELECT}
            WHERE (?1 IS NULL OR t.album_id = ?1)
              AND (?2 IS NULL OR t.artist_id = ?2)
              AND (?3 IS NULL OR t.genre_id = ?3)
              AND (?4 IS NULL OR LOWER(COALESCE(t.title, t.file_name)) LIKE ?4)
            ORDER BY ar.sort_title, al.sort_title,
                     COALESCE(t.disc_number, 0), COALESCE(t.track_number, 0),
                     t.file_name, t.id
            LIMIT ?5 OFFSET ?6
            "#
        ))?;
        let rows = stmt.query_map(
            params![
                filter.album_id,
                filter.artist_id,
                filter.genre_id,
                like_pattern(filter.search.as_deref()),
                filter.limit,
                filter.offset
            ],
            map_track_row,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list tracks")
    }

    pub fn most_played(&self, limit: i64) -> Result<Vec<TrackSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{TRACK_SELECT} WHERE t.playback_count > 0 ORDER BY t.playback_count DESC, t.last_played_ms DESC, t.id LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], map_track_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list most played tracks")
    }

    pub fn recently_added(&self, limit: i64) -> Result<Vec<TrackSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{TRACK_SELECT} ORDER BY t.created_ms DESC, t.id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], map_track_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list recently added tracks")
    }

    pub fn list_uris(&self, source: MediaSource) -> Result<Vec<String>> {
        let conn = self.conn()?;
        Ok(ids_and_uris(&conn, source)?
            .into_iter()
            .map(|(_, uri)| uri)
            .collect())
    }
}

fn ids_and_uris(conn: &Connection, source: MediaSource) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare("SELECT id, uri FROM tracks WHERE source = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![source.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("list track uris")
}

pub(crate) fn upsert_track(conn: &Connection, record: &TrackRecord) -> Result<UpsertOutcome> {
    let existing = stored_by_uri(conn, &record.uri)?;
    if let Some(stored) = existing.as_ref() {
        if stored.matches(record) {
            return Ok(UpsertOutcome::Unchanged(stored.id));
        }
    }

    let artist_title = record.artist_title();
    let album_artist_title = record.album_artist_title();
    let album_title = record.album_title();
    let duration_ms = record.duration();

    let artist_id = artist_dao::find_or_create(conn, &artist_title)?;
    let album_artist_id = if sort_key(&album_artist_title) == sort_key(&artist_title) {
        artist_id
    } else {
        artist_dao::find_or_create(conn, &album_artist_title)?
    };
    let album_id = album_dao::find_or_create(conn, &album_title, album_artist_id, record.year)?;
    let genre_id = record
        .genre_name()
        .map(|name| genre_dao::find_or_create(conn, name))
        .transpose()?;

    let outcome = match existing {
        Some(stored) => {
            artist_dao::adjust_aggregates(conn, stored.artist_id, -stored.duration_ms, -stored.playback_count)?;
            album_dao::adjust_aggregates(conn, stored.album_id, -stored.duration_ms, -stored.playback_count)?;
            conn.execute(
                r#"
                UPDATE tracks
                SET source = ?1,
                    file_name = ?2,
                    title = ?3,
                    artist_id = ?4,
                    album_id = ?5,
                    genre_id = ?6,
                    track_number = ?7,
                    disc_number = ?8,
                    year = ?9,
                    duration_ms = ?10,
                    sample_rate = ?11,
                    format = ?12,
                    mtime_ms = ?13,
                    size_bytes = ?14
                WHERE id = ?15
                "#,
                params![
                    record.source.as_str(),
                    record.file_name,
                    record.title,
                    artist_id,
                    album_id,
                    genre_id,
                    record.track_number,
                    record.disc_number,
                    record.year,
                    duration_ms,
                    record.sample_rate,
                    record.format,
                    record.mtime_ms,
                    record.size_bytes,
                    stored.id
                ],
            )
            .context("update track")?;
            artist_dao::adjust_aggregates(conn, artist_id, duration_ms, stored.playback_count)?;
            album_dao::adjust_aggregates(conn, album_id, duration_ms, stored.playback_count)?;
            prune_detached(conn, &stored)?;
            UpsertOutcome::Updated(stored.id)
        }
        None => {
            conn.execute(
                r#"
                INSERT INTO tracks (
                    uri, source, file_name, title, artist_id, album_id, genre_id,
                    track_number, disc_number, year, duration_ms, sample_rate, format,
                    mtime_ms, size_bytes, created_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
                params![
                    record.uri,
                    record.source.as_str(),
                    record.file_name,
                    record.title,
                    artist_id,
                    album_id,
                    genre_id,
                    record.track_number,
                    record.disc_number,
                    record.year,
                    duration_ms,
                    record.sample_rate,
                    record.format,
                    record.mtime_ms,
                    record.size_bytes,
                    now_ms()
                ],
            )
            .context("insert track")?;
            let id = conn.last_insert_rowid();
            artist_dao::adjust_aggregates(conn, artist_id, duration_ms, 0)?;
            album_dao::adjust_aggregates(conn, album_id, duration_ms, 0)?;
            UpsertOutcome::Inserted(id)
        }
    };

    // Rows another pass created for the same keys fold into the earliest one.
    artist_dao::merge_duplicates(conn, &artist_title)?;
    if album_artist_id != artist_id {
        artist_dao::merge_duplicates(conn, &album_artist_title)?;
    }
    if let Some(album_artist_id) = artist_dao::find_id(conn, &album_artist_title)? {
        album_dao::merge_duplicates(conn, &album_title, album_artist_id)?;
    }

    Ok(outcome)
}

pub(crate) fn delete_track(conn: &Connection, track_id: i64) -> Result<Option<DeletedTrack>> {
    let Some(stored) = stored_by_id(conn, track_id)? else {
        return Ok(None);
    };

    artist_dao::adjust_aggregates(conn, stored.artist_id, -stored.duration_ms, -stored.playback_count)?;
    album_dao::adjust_aggregates(conn, stored.album_id, -stored.duration_ms, -stored.playback_count)?;

    let mut stmt = conn.prepare("SELECT playlist_id, position FROM playlist_tracks WHERE track_id = ?1")?;
    let slots = stmt
        .query_map(params![track_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("lookup playlist slots")?;
    conn.execute("DELETE FROM tracks WHERE id = ?1", params![track_id])
        .context("delete track")?;
    for (playlist_id, position) in slots {
        playlist_dao::close_gap(conn, playlist_id, position)?;
    }

    let pruned = prune_detached(conn, &stored)?;
    tracing::debug!(
        track_id,
        uri = %stored.uri,
        album_removed = pruned.album_removed,
        artists_removed = pruned.artists_removed.len(),
        "deleted track"
    );
    Ok(Some(DeletedTrack {
        id: stored.id,
        uri: stored.uri,
        album_removed: pruned.album_removed,
        artists_removed: pruned.artists_removed,
        genre_removed: pruned.genre_removed,
    }))
}

pub(crate) fn record_playback(conn: &Connection, track_id: i64, at_ms: i64) -> Result<bool> {
    let parents: Option<(i64, i64)> = conn
        .query_row(
            "SELECT artist_id, album_id FROM tracks WHERE id = ?1",
            params![track_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("lookup track parents")?;
    let Some((artist_id, album_id)) = parents else {
        return Ok(false);
    };
    conn.execute(
        "UPDATE tracks SET playback_count = playback_count + 1, last_played_ms = ?1 WHERE id = ?2",
        params![at_ms, track_id],
    )
    .context("count track playback")?;
    artist_dao::adjust_aggregates(conn, artist_id, 0, 1)?;
    album_dao::adjust_aggregates(conn, album_id, 0, 1)?;
    Ok(true)
}

struct Pruned {
    album_removed: bool,
    artists_removed: Vec<i64>,
    genre_removed: bool,
}

/// Remove the former parents of `stored` that no longer hold anything.
fn prune_detached(conn: &Connection, stored: &StoredTrack) -> Result<Pruned> {
    let album_removed = album_dao::delete_if_empty(conn, stored.album_id)?;
    let mut artists_removed = Vec::new();
    if artist_dao::delete_if_orphaned(conn, stored.artist_id)? {
        artists_removed.push(stored.artist_id);
    }
    if stored.album_artist_id != stored.artist_id
        && artist_dao::delete_if_orphaned(conn, stored.album_artist_id)?
    {
        artists_removed.push(stored.album_artist_id);
    }
    let genre_removed = match stored.genre_id {
        Some(genre_id) => genre_dao::delete_if_unused(conn, genre_id)?,
        None => false,
    };
    Ok(Pruned {
        album_removed,
        artists_removed,
        genre_removed,
    })
}

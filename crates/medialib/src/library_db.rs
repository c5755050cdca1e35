//! SQLite library store for artists/albums/tracks/genres/playlists.
//!
//! Provides pooled connections, schema bootstrap and the write transaction
//! helper the DAO modules run inside. Entity-specific operations live in
//! the `*_dao` modules as further `impl LibraryDb` blocks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use medialib_types::LibraryStats;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::{album_dao, artist_dao, genre_dao};

const SCHEMA_VERSION: i32 = 2;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const VARIOUS_ARTISTS: &str = "Various Artists";

#[derive(Clone)]
pub struct LibraryDb {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

/// Counts of rows folded into survivors by a merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub artists_merged: usize,
    pub albums_merged: usize,
    pub tracks_moved: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.artists_merged += other.artists_merged;
        self.albums_merged += other.albums_merged;
        self.tracks_moved += other.tracks_moved;
    }

    pub fn is_empty(&self) -> bool {
        self.artists_merged == 0 && self.albums_merged == 0
    }
}

/// Inconsistency found by [`LibraryDb::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    AlbumAggregateDrift {
        album_id: i64,
        stored_duration_ms: i64,
        actual_duration_ms: i64,
        stored_playback_count: i64,
        actual_playback_count: i64,
    },
    ArtistAggregateDrift {
        artist_id: i64,
        stored_duration_ms: i64,
        actual_duration_ms: i64,
        stored_playback_count: i64,
        actual_playback_count: i64,
    },
    OrphanedAlbum { album_id: i64 },
    OrphanedArtist { artist_id: i64 },
    DuplicateArtist { title: String, ids: Vec<i64> },
    DuplicateAlbum { title: String, artist_id: i64, ids: Vec<i64> },
}

impl LibraryDb {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create library dir {:?}", parent))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("create library db pool")?;

        {
            let conn = pool.get().context("open library db")?;
            init_schema(&conn)?;
        }

        tracing::debug!(path = %db_path.display(), "library db ready");
        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("open library db")
    }

    /// Run `f` inside an IMMEDIATE transaction and commit it.
    ///
    /// The write lock is taken up front so concurrent scan passes serialize
    /// on the whole find-or-create + aggregate update sequence.
    pub(crate) fn write<T>(
        &self,
        label: &'static str,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("begin {label} tx"))?;
        let value = f(&tx)?;
        tx.commit().with_context(|| format!("commit {label} tx"))?;
        Ok(value)
    }

    pub fn clear_library(&self) -> Result<()> {
        self.write("clear library", |tx| {
            tx.execute("DELETE FROM playlist_tracks", [])
                .context("clear playlist tracks")?;
            tx.execute("DELETE FROM playlists", []).context("clear playlists")?;
            tx.execute("DELETE FROM tracks", []).context("clear tracks")?;
            tx.execute("DELETE FROM albums", []).context("clear albums")?;
            tx.execute("DELETE FROM artists", []).context("clear artists")?;
            tx.execute("DELETE FROM genres", []).context("clear genres")?;
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT (SELECT COUNT(*) FROM artists),
                   (SELECT COUNT(*) FROM albums),
                   (SELECT COUNT(*) FROM tracks),
                   (SELECT COUNT(*) FROM genres),
                   (SELECT COUNT(*) FROM playlists),
                   (SELECT COALESCE(SUM(duration_ms), 0) FROM tracks)
            "#,
            [],
            |row| {
                Ok(LibraryStats {
                    artists: row.get(0)?,
                    albums: row.get(1)?,
                    tracks: row.get(2)?,
                    genres: row.get(3)?,
                    playlists: row.get(4)?,
                    total_duration_ms: row.get(5)?,
                })
            },
        )
        .context("select library stats")
    }

    /// Return the subset of `ids` that still name a track.
    pub fn existing_track_ids(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM tracks WHERE id = ?1")?;
        let mut found = HashSet::new();
        for id in ids {
            if stmt.exists(params![id])? {
                found.insert(*id);
            }
        }
        Ok(found)
    }

    /// Merge every duplicate artist group, then every duplicate album group.
    pub fn merge_all_duplicates(&self) -> Result<MergeReport> {
        let report = self.write("merge duplicates", |tx| {
            let mut report = MergeReport::default();
            for title in duplicate_artist_keys(tx)? {
                report.absorb(artist_dao::merge_duplicates(tx, &title)?);
            }
            for (title, artist_id) in duplicate_album_keys(tx)? {
                report.absorb(album_dao::merge_duplicates(tx, &title, artist_id)?);
            }
            Ok(report)
        })?;
        if !report.is_empty() {
            tracing::info!(
                artists = report.artists_merged,
                albums = report.albums_merged,
                tracks = report.tracks_moved,
                "merged duplicate library rows"
            );
        }
        Ok(report)
    }

    /// Re-sum every album and artist aggregate from its tracks.
    pub fn recompute_aggregates(&self) -> Result<()> {
        self.write("recompute aggregates", |tx| {
            tx.execute(
                r#"
                UPDATE albums
                SET total_duration_ms = (
                        SELECT COALESCE(SUM(duration_ms), 0) FROM tracks WHERE album_id = albums.id
                    ),
                    playback_count = (
                        SELECT COALESCE(SUM(playback_count), 0) FROM tracks WHERE album_id = albums.id
                    )
                "#,
                [],
            )
            .context("recompute album aggregates")?;
            tx.execute(
                r#"
                UPDATE artists
                SET total_duration_ms = (
                        SELECT COALESCE(SUM(duration_ms), 0) FROM tracks WHERE artist_id = artists.id
                    ),
                    playback_count = (
                        SELECT COALESCE(SUM(playback_count), 0) FROM tracks WHERE artist_id = artists.id
                    )
                "#,
                [],
            )
            .context("recompute artist aggregates")?;
            Ok(())
        })
    }

    /// Delete albums without tracks, then artists without tracks or albums,
    /// then unused genres.
    pub fn prune_orphans(&self) -> Result<usize> {
        self.write("prune orphans", |tx| {
            let albums = tx
                .execute(
                    "DELETE FROM albums WHERE id NOT IN (SELECT DISTINCT album_id FROM tracks)",
                    [],
                )
                .context("delete orphaned albums")?;
            let artists = tx
                .execute(
                    r#"
                    DELETE FROM artists
                    WHERE id NOT IN (
                        SELECT DISTINCT artist_id FROM tracks
                        UNION
                        SELECT DISTINCT artist_id FROM albums
                    )
                    "#,
                    [],
                )
                .context("delete orphaned artists")?;
            let genres = genre_dao::delete_all_unused(tx)?;
            Ok(albums + artists + genres)
        })
    }

    pub fn check_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        let conn = self.conn()?;
        let mut issues = Vec::new();

        let mut stmt = conn.prepare(
            r#"
            SELECT al.id, al.total_duration_ms, COALESCE(SUM(t.duration_ms), 0),
                   al.playback_count, COALESCE(SUM(t.playback_count), 0)
            FROM albums al
            LEFT JOIN tracks t ON t.album_id = al.id
            GROUP BY al.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (album_id, stored_duration_ms, actual_duration_ms, stored_playback_count, actual_playback_count) =
                row?;
            if stored_duration_ms != actual_duration_ms || stored_playback_count != actual_playback_count {
                issues.push(IntegrityIssue::AlbumAggregateDrift {
                    album_id,
                    stored_duration_ms,
                    actual_duration_ms,
                    stored_playback_count,
                    actual_playback_count,
                });
            }
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT ar.id, ar.total_duration_ms, COALESCE(SUM(t.duration_ms), 0),
                   ar.playback_count, COALESCE(SUM(t.playback_count), 0)
            FROM artists ar
            LEFT JOIN tracks t ON t.artist_id = ar.id
            GROUP BY ar.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (artist_id, stored_duration_ms, actual_duration_ms, stored_playback_count, actual_playback_count) =
                row?;
            if stored_duration_ms != actual_duration_ms || stored_playback_count != actual_playback_count {
                issues.push(IntegrityIssue::ArtistAggregateDrift {
                    artist_id,
                    stored_duration_ms,
                    actual_duration_ms,
                    stored_playback_count,
                    actual_playback_count,
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id FROM albums WHERE NOT EXISTS (SELECT 1 FROM tracks t WHERE t.album_id = albums.id)",
        )?;
        for album_id in stmt.query_map([], |row| row.get::<_, i64>(0))? {
            issues.push(IntegrityIssue::OrphanedAlbum { album_id: album_id? });
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM artists
            WHERE NOT EXISTS (SELECT 1 FROM tracks t WHERE t.artist_id = artists.id)
              AND NOT EXISTS (SELECT 1 FROM albums al WHERE al.artist_id = artists.id)
            "#,
        )?;
        for artist_id in stmt.query_map([], |row| row.get::<_, i64>(0))? {
            issues.push(IntegrityIssue::OrphanedArtist { artist_id: artist_id? });
        }

        for title in duplicate_artist_keys(&conn)? {
            let ids = artist_dao::ids_for_key(&conn, &title)?;
            issues.push(IntegrityIssue::DuplicateArtist { title, ids });
        }
        for (title, artist_id) in duplicate_album_keys(&conn)? {
            let ids = album_dao::ids_for_key(&conn, &title, artist_id)?;
            issues.push(IntegrityIssue::DuplicateAlbum { title, artist_id, ids });
        }

        Ok(issues)
    }
}

/// Matching key for artist/album/genre titles: trimmed, whitespace-collapsed,
/// lowercased.
pub(crate) fn sort_key(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Display title for an optional tag, falling back to `fallback` when blank.
pub(crate) fn display_title(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => fallback.to_string(),
    }
}

pub(crate) fn is_blank(value: Option<&str>) -> bool {
    value.map(|s| s.trim().is_empty()).unwrap_or(true)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn like_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s.to_lowercase()))
}

fn duplicate_artist_keys(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sort_title FROM artists GROUP BY sort_title HAVING COUNT(*) > 1 ORDER BY sort_title",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<String>>>()
        .context("list duplicate artists")
}

fn duplicate_album_keys(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT sort_title, artist_id FROM albums
        GROUP BY sort_title, artist_id
        HAVING COUNT(*) > 1
        ORDER BY sort_title, artist_id
        "#,
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<rusqlite::Result<Vec<(String, i64)>>>()
        .context("list duplicate albums")
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            sort_title TEXT NOT NULL,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            playback_count INTEGER NOT NULL DEFAULT 0,
            created_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS albums (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            sort_title TEXT NOT NULL,
            artist_id INTEGER NOT NULL,
            year INTEGER,
            cover_art_path TEXT,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            playback_count INTEGER NOT NULL DEFAULT 0,
            created_ms INTEGER NOT NULL,
            FOREIGN KEY(artist_id) REFERENCES artists(id)
        );

        CREATE TABLE IF NOT EXISTS genres (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            sort_name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uri TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL DEFAULT 'local',
            file_name TEXT NOT NULL,
            title TEXT,
            artist_id INTEGER NOT NULL,
            album_id INTEGER NOT NULL,
            genre_id INTEGER,
            track_number INTEGER,
            disc_number INTEGER,
            year INTEGER,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            sample_rate INTEGER,
            format TEXT,
            mtime_ms INTEGER NOT NULL DEFAULT 0,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            playback_count INTEGER NOT NULL DEFAULT 0,
            last_played_ms INTEGER,
            created_ms INTEGER NOT NULL,
            FOREIGN KEY(artist_id) REFERENCES artists(id),
            FOREIGN KEY(album_id) REFERENCES albums(id),
            FOREIGN KEY(genre_id) REFERENCES genres(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_ms INTEGER NOT NULL,
            updated_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist_id INTEGER NOT NULL,
            track_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(playlist_id, track_id),
            FOREIGN KEY(playlist_id) REFERENCES playlists(id) ON DELETE CASCADE,
            FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_artists_sort_title ON artists(sort_title);
        CREATE INDEX IF NOT EXISTS idx_albums_sort_title_artist ON albums(sort_title, artist_id);
        CREATE INDEX IF NOT EXISTS idx_albums_artist_id ON albums(artist_id);
        CREATE INDEX IF NOT EXISTS idx_tracks_album_id ON tracks(album_id);
        CREATE INDEX IF NOT EXISTS idx_tracks_artist_id ON tracks(artist_id);
        CREATE INDEX IF NOT EXISTS idx_tracks_genre_id ON tracks(genre_id);
        CREATE INDEX IF NOT EXISTS idx_playlist_tracks_track_id ON playlist_tracks(track_id);
        "#,
    )
    .context("create library schema")?;

    let version_raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let Some(version) = version_raw
        .as_deref()
        .and_then(|value| value.parse::<i32>().ok())
    else {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .context("insert schema version")?;
        return Ok(());
    };
    if version < 2 {
        conn.execute("ALTER TABLE tracks ADD COLUMN last_played_ms INTEGER", [])
            .context("migrate tracks last_played_ms")?;
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
            params![SCHEMA_VERSION.to_string()],
        )
        .context("update schema version")?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "migrated library schema");
    }

    Ok(())
}

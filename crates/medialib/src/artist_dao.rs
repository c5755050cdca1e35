//! Artist rows: find-or-create, duplicate merge, aggregate bookkeeping.

use anyhow::{Context, Result};
use medialib_types::ArtistSummary;
use rusqlite::{params, Connection, OptionalExtension};

use crate::album_dao;
use crate::library_db::{like_pattern, now_ms, sort_key, LibraryDb, MergeReport};

const ARTIST_SELECT: &str = r#"
    SELECT a.id, a.title,
           (SELECT COUNT(*) FROM albums al WHERE al.artist_id = a.id),
           (SELECT COUNT(*) FROM tracks t WHERE t.artist_id = a.id),
           a.total_duration_ms, a.playback_count
    FROM artists a
"#;

fn map_artist_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtistSummary> {
    Ok(ArtistSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        album_count: row.get(2)?,
        track_count: row.get(3)?,
        total_duration_ms: row.get(4)?,
        playback_count: row.get(5)?,
    })
}

impl LibraryDb {
    pub fn list_artists(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ArtistSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{ARTIST_SELECT} WHERE (?1 IS NULL OR a.sort_title LIKE ?1) ORDER BY a.sort_title, a.id LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![like_pattern(search), limit, offset], map_artist_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list artists")
    }

    pub fn artist_by_id(&self, artist_id: i64) -> Result<Option<ArtistSummary>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{ARTIST_SELECT} WHERE a.id = ?1"),
            params![artist_id],
            map_artist_row,
        )
        .optional()
        .context("select artist by id")
    }
}

/// Ids of every artist whose title matches `title`, earliest first.
pub(crate) fn ids_for_key(conn: &Connection, title: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM artists WHERE sort_title = ?1 ORDER BY created_ms, id",
    )?;
    let rows = stmt.query_map(params![sort_key(title)], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<i64>>>()
        .context("select artist ids")
}

pub(crate) fn find_id(conn: &Connection, title: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM artists WHERE sort_title = ?1 ORDER BY created_ms, id LIMIT 1",
        params![sort_key(title)],
        |row| row.get(0),
    )
    .optional()
    .context("find artist id")
}

/// Return the earliest-created artist matching `title`, inserting one if none.
pub(crate) fn find_or_create(conn: &Connection, title: &str) -> Result<i64> {
    if let Some(id) = find_id(conn, title)? {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO artists (title, sort_title, created_ms) VALUES (?1, ?2, ?3)",
        params![title.trim(), sort_key(title), now_ms()],
    )
    .context("insert artist")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn adjust_aggregates(
    conn: &Connection,
    artist_id: i64,
    duration_delta_ms: i64,
    playback_delta: i64,
) -> Result<()> {
    if duration_delta_ms == 0 && playback_delta == 0 {
        return Ok(());
    }
    conn.execute(
        r#"
        UPDATE artists
        SET total_duration_ms = total_duration_ms + ?1,
            playback_count = playback_count + ?2
        WHERE id = ?3
        "#,
        params![duration_delta_ms, playback_delta, artist_id],
    )
    .context("adjust artist aggregates")?;
    Ok(())
}

fn resum_aggregates(conn: &Connection, artist_id: i64) -> Result<()> {
    conn.execute(
        r#"
        UPDATE artists
        SET total_duration_ms = (
                SELECT COALESCE(SUM(duration_ms), 0) FROM tracks WHERE artist_id = ?1
            ),
            playback_count = (
                SELECT COALESCE(SUM(playback_count), 0) FROM tracks WHERE artist_id = ?1
            )
        WHERE id = ?1
        "#,
        params![artist_id],
    )
    .context("resum artist aggregates")?;
    Ok(())
}

/// Delete the artist when no track and no album refers to it.
pub(crate) fn delete_if_orphaned(conn: &Connection, artist_id: i64) -> Result<bool> {
    let deleted = conn
        .execute(
            r#"
            DELETE FROM artists
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM tracks WHERE artist_id = ?1)
              AND NOT EXISTS (SELECT 1 FROM albums WHERE artist_id = ?1)
            "#,
            params![artist_id],
        )
        .context("delete orphaned artist")?;
    if deleted > 0 {
        tracing::debug!(artist_id, "removed empty artist");
    }
    Ok(deleted > 0)
}

/// Fold every artist matching `title` into the earliest-created one.
///
/// Tracks and albums of the later rows move to the survivor, albums that
/// now collide under the survivor are merged too, and the survivor's
/// aggregates are re-summed from its tracks. Running it again on the same
/// title finds a single row and changes nothing.
pub(crate) fn merge_duplicates(conn: &Connection, title: &str) -> Result<MergeReport> {
    let ids = ids_for_key(conn, title)?;
    let mut report = MergeReport::default();
    let Some((&survivor, duplicates)) = ids.split_first() else {
        return Ok(report);
    };
    if duplicates.is_empty() {
        return Ok(report);
    }

    let mut moved_album_titles = Vec::new();
    for &duplicate in duplicates {
        let moved = conn
            .execute(
                "UPDATE tracks SET artist_id = ?1 WHERE artist_id = ?2",
                params![survivor, duplicate],
            )
            .context("reassign tracks to merged artist")?;
        report.tracks_moved += moved;

        let mut stmt = conn.prepare("SELECT title FROM albums WHERE artist_id = ?1")?;
        let titles = stmt
            .query_map(params![duplicate], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        moved_album_titles.extend(titles);
        conn.execute(
            "UPDATE albums SET artist_id = ?1 WHERE artist_id = ?2",
            params![survivor, duplicate],
        )
        .context("reassign albums to merged artist")?;

        conn.execute("DELETE FROM artists WHERE id = ?1", params![duplicate])
            .context("delete merged artist")?;
        report.artists_merged += 1;
    }

    resum_aggregates(conn, survivor)?;

    moved_album_titles.sort_by_key(|title| sort_key(title));
    moved_album_titles.dedup_by_key(|title| sort_key(title));
    for album_title in moved_album_titles {
        let album_report = album_dao::merge_duplicates(conn, &album_title, survivor)?;
        report.albums_merged += album_report.albums_merged;
    }

    tracing::info!(
        title,
        survivor,
        merged = report.artists_merged,
        "merged duplicate artists"
    );
    Ok(report)
}

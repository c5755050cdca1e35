//! Album rows: find-or-create by (title, album artist), merge, metadata edits.

use anyhow::{Context, Result};
use medialib_types::AlbumSummary;
use rusqlite::{params, Connection, OptionalExtension};

use crate::artist_dao;
use crate::library_db::{like_pattern, now_ms, sort_key, LibraryDb, MergeReport};

const ALBUM_SELECT: &str = r#"
    SELECT al.id, al.title, al.artist_id, ar.title, al.year,
           (SELECT COUNT(*) FROM tracks t WHERE t.album_id = al.id),
           al.total_duration_ms, al.playback_count, al.cover_art_path
    FROM albums al
    JOIN artists ar ON ar.id = al.artist_id
"#;

fn map_album_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlbumSummary> {
    Ok(AlbumSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        artist_id: row.get(2)?,
        artist: row.get(3)?,
        year: row.get(4)?,
        track_count: row.get(5)?,
        total_duration_ms: row.get(6)?,
        playback_count: row.get(7)?,
        cover_art_path: row.get(8)?,
    })
}

impl LibraryDb {
    pub fn list_albums(
        &self,
        artist_id: Option<i64>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AlbumSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            {ALBUM_SELECT}
            WHERE (?1 IS NULL OR al.artist_id = ?1)
              AND (?2 IS NULL OR al.sort_title LIKE ?2)
            ORDER BY ar.sort_title, al.sort_title, al.id
            LIMIT ?3 OFFSET ?4
            "#
        ))?;
        let rows = stmt.query_map(
            params![artist_id, like_pattern(search), limit, offset],
            map_album_row,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list albums")
    }

    pub fn album_by_id(&self, album_id: i64) -> Result<Option<AlbumSummary>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{ALBUM_SELECT} WHERE al.id = ?1"),
            params![album_id],
            map_album_row,
        )
        .optional()
        .context("select album by id")
    }

    pub fn set_album_cover(&self, album_id: i64, cover_art_path: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE albums SET cover_art_path = ?1 WHERE id = ?2",
                params![cover_art_path, album_id],
            )
            .context("update album cover")?;
        Ok(updated > 0)
    }

    /// Retitle an album, move it to another album artist, or set its year.
    ///
    /// When the target (title, artist) already names another album, this
    /// album's tracks are merged into it and the id of that album is
    /// returned. Returns `None` for an unknown album id.
    pub fn update_album(
        &self,
        album_id: i64,
        title: Option<&str>,
        artist: Option<&str>,
        year: Option<i32>,
    ) -> Result<Option<i64>> {
        self.write("update album", |tx| {
            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT title, artist_id FROM albums WHERE id = ?1",
                    params![album_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("lookup current album")?;
            let Some((current_title, current_artist_id)) = current else {
                return Ok(None);
            };

            let desired_title = title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(current_title.as_str())
                .to_string();
            let desired_artist_id = match artist.map(str::trim).filter(|a| !a.is_empty()) {
                Some(name) => artist_dao::find_or_create(tx, name)?,
                None => current_artist_id,
            };

            tx.execute(
                r#"
                UPDATE albums
                SET title = ?1,
                    sort_title = ?2,
                    artist_id = ?3,
                    year = COALESCE(?4, year)
                WHERE id = ?5
                "#,
                params![
                    desired_title,
                    sort_key(&desired_title),
                    desired_artist_id,
                    year,
                    album_id
                ],
            )
            .context("update album metadata")?;

            // The edited row may now collide with an existing album.
            merge_duplicates(tx, &desired_title, desired_artist_id)?;
            let resolved = find_id(tx, &desired_title, desired_artist_id)?.unwrap_or(album_id);

            if desired_artist_id != current_artist_id {
                artist_dao::delete_if_orphaned(tx, current_artist_id)?;
            }
            Ok(Some(resolved))
        })
    }
}

pub(crate) fn ids_for_key(conn: &Connection, title: &str, artist_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM albums WHERE sort_title = ?1 AND artist_id = ?2 ORDER BY created_ms, id",
    )?;
    let rows = stmt.query_map(params![sort_key(title), artist_id], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<i64>>>()
        .context("select album ids")
}

pub(crate) fn find_id(conn: &Connection, title: &str, artist_id: i64) -> Result<Option<i64>> {
    conn.query_row(
        r#"
        SELECT id FROM albums
        WHERE sort_title = ?1 AND artist_id = ?2
        ORDER BY created_ms, id
        LIMIT 1
        "#,
        params![sort_key(title), artist_id],
        |row| row.get(0),
    )
    .optional()
    .context("find album id")
}

/// Return the earliest-created album matching (title, artist), inserting one
/// if none. A known `year` fills a missing one on an existing row.
pub(crate) fn find_or_create(
    conn: &Connection,
    title: &str,
    artist_id: i64,
    year: Option<i32>,
) -> Result<i64> {
    if let Some(id) = find_id(conn, title, artist_id)? {
        if year.is_some() {
            conn.execute(
                "UPDATE albums SET year = ?1 WHERE id = ?2 AND year IS NULL",
                params![year, id],
            )
            .context("fill album year")?;
        }
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO albums (title, sort_title, artist_id, year, created_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![title.trim(), sort_key(title), artist_id, year, now_ms()],
    )
    .context("insert album")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn adjust_aggregates(
    conn: &Connection,
    album_id: i64,
    duration_delta_ms: i64,
    playback_delta: i64,
) -> Result<()> {
    if duration_delta_ms == 0 && playback_delta == 0 {
        return Ok(());
    }
    conn.execute(
        r#"
        UPDATE albums
        SET total_duration_ms = total_duration_ms + ?1,
            playback_count = playback_count + ?2
        WHERE id = ?3
        "#,
        params![duration_delta_ms, playback_delta, album_id],
    )
    .context("adjust album aggregates")?;
    Ok(())
}

fn resum_aggregates(conn: &Connection, album_id: i64) -> Result<()> {
    conn.execute(
        r#"
        UPDATE albums
        SET total_duration_ms = (
                SELECT COALESCE(SUM(duration_ms), 0) FROM tracks WHERE album_id = ?1
            ),
            playback_count = (
                SELECT COALESCE(SUM(playback_count), 0) FROM tracks WHERE album_id = ?1
            )
        WHERE id = ?1
        "#,
        params![album_id],
    )
    .context("resum album aggregates")?;
    Ok(())
}

/// Delete the album when no track refers to it.
pub(crate) fn delete_if_empty(conn: &Connection, album_id: i64) -> Result<bool> {
    let deleted = conn
        .execute(
            "DELETE FROM albums WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM tracks WHERE album_id = ?1)",
            params![album_id],
        )
        .context("delete empty album")?;
    if deleted > 0 {
        tracing::debug!(album_id, "removed empty album");
    }
    Ok(deleted > 0)
}

/// Fold every album matching (title, artist) into the earliest-created one.
///
/// The survivor keeps its own year and cover unless it has none, takes over
/// the duplicates' tracks and gets its aggregates re-summed.
pub(crate) fn merge_duplicates(conn: &Connection, title: &str, artist_id: i64) -> Result<MergeReport> {
    let ids = ids_for_key(conn, title, artist_id)?;
    let mut report = MergeReport::default();
    let Some((&survivor, duplicates)) = ids.split_first() else {
        return Ok(report);
    };
    if duplicates.is_empty() {
        return Ok(report);
    }

    for &duplicate in duplicates {
        conn.execute(
            r#"
            UPDATE albums
            SET year = COALESCE(year, (SELECT year FROM albums WHERE id = ?2)),
                cover_art_path = COALESCE(cover_art_path, (SELECT cover_art_path FROM albums WHERE id = ?2))
            WHERE id = ?1
            "#,
            params![survivor, duplicate],
        )
        .context("fill merged album metadata")?;
        let moved = conn
            .execute(
                "UPDATE tracks SET album_id = ?1 WHERE album_id = ?2",
                params![survivor, duplicate],
            )
            .context("reassign tracks to merged album")?;
        report.tracks_moved += moved;
        conn.execute("DELETE FROM albums WHERE id = ?1", params![duplicate])
            .context("delete merged album")?;
        report.albums_merged += 1;
    }

    resum_aggregates(conn, survivor)?;
    tracing::info!(
        title,
        artist_id,
        survivor,
        merged = report.albums_merged,
        "merged duplicate albums"
    );
    Ok(report)
}

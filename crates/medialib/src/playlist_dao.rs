//! User playlists: ordered, duplicate-free track lists.
//!
//! Positions are dense `0..n` within a playlist. Removing an entry (directly
//! or through a track deletion) shifts the entries after it down by one.

use anyhow::{anyhow, Context, Result};
use medialib_types::{PlaylistSummary, TrackSummary};
use rusqlite::{params, Connection, OptionalExtension};

use crate::library_db::{now_ms, LibraryDb};

const PLAYLIST_SELECT: &str = r#"
    SELECT p.id, p.name,
           (SELECT COUNT(*) FROM playlist_tracks pt WHERE pt.playlist_id = p.id),
           (SELECT COALESCE(SUM(t.duration_ms), 0)
              FROM playlist_tracks pt JOIN tracks t ON t.id = pt.track_id
             WHERE pt.playlist_id = p.id),
           p.created_ms, p.updated_ms
    FROM playlists p
"#;

fn map_playlist_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlaylistSummary> {
    Ok(PlaylistSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        track_count: row.get(2)?,
        total_duration_ms: row.get(3)?,
        created_ms: row.get(4)?,
        updated_ms: row.get(5)?,
    })
}

impl LibraryDb {
    pub fn create_playlist(&self, name: &str) -> Result<i64> {
        let name = playlist_name(name)?;
        self.write("create playlist", |tx| {
            let now = now_ms();
            tx.execute(
                "INSERT INTO playlists (name, created_ms, updated_ms) VALUES (?1, ?2, ?2)",
                params![name, now],
            )
            .context("insert playlist")?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn rename_playlist(&self, playlist_id: i64, name: &str) -> Result<bool> {
        let name = playlist_name(name)?;
        self.write("rename playlist", |tx| {
            let updated = tx
                .execute(
                    "UPDATE playlists SET name = ?1, updated_ms = ?2 WHERE id = ?3",
                    params![name, now_ms(), playlist_id],
                )
                .context("rename playlist")?;
            Ok(updated > 0)
        })
    }

    pub fn delete_playlist(&self, playlist_id: i64) -> Result<bool> {
        self.write("delete playlist", |tx| {
            let deleted = tx
                .execute("DELETE FROM playlists WHERE id = ?1", params![playlist_id])
                .context("delete playlist")?;
            Ok(deleted > 0)
        })
    }

    /// Append tracks to the end of the playlist.
    ///
    /// Ids already in the playlist or naming no track are skipped; returns
    /// how many entries were added.
    pub fn add_tracks_to_playlist(&self, playlist_id: i64, track_ids: &[i64]) -> Result<usize> {
        self.write("add playlist tracks", |tx| {
            ensure_playlist(tx, playlist_id)?;
            let mut next: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM playlist_tracks WHERE playlist_id = ?1",
                    params![playlist_id],
                    |row| row.get(0),
                )
                .context("count playlist entries")?;
            let mut added = 0;
            for &track_id in track_ids {
                let inserted = tx
                    .execute(
                        r#"
                        INSERT OR IGNORE INTO playlist_tracks (playlist_id, track_id, position)
                        SELECT ?1, id, ?3 FROM tracks WHERE id = ?2
                        "#,
                        params![playlist_id, track_id, next],
                    )
                    .context("insert playlist entry")?;
                if inserted > 0 {
                    next += 1;
                    added += 1;
                }
            }
            if added > 0 {
                touch(tx, playlist_id)?;
            }
            Ok(added)
        })
    }

    pub fn remove_track_from_playlist(&self, playlist_id: i64, track_id: i64) -> Result<bool> {
        self.write("remove playlist track", |tx| {
            let position: Option<i64> = tx
                .query_row(
                    "SELECT position FROM playlist_tracks WHERE playlist_id = ?1 AND track_id = ?2",
                    params![playlist_id, track_id],
                    |row| row.get(0),
                )
                .optional()
                .context("lookup playlist entry")?;
            let Some(position) = position else {
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM playlist_tracks WHERE playlist_id = ?1 AND track_id = ?2",
                params![playlist_id, track_id],
            )
            .context("delete playlist entry")?;
            close_gap(tx, playlist_id, position)?;
            touch(tx, playlist_id)?;
            Ok(true)
        })
    }

    /// Move the entry at position `from` to position `to`, shifting the
    /// entries in between.
    pub fn move_playlist_track(&self, playlist_id: i64, from: i64, to: i64) -> Result<bool> {
        self.write("move playlist track", |tx| {
            let len: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM playlist_tracks WHERE playlist_id = ?1",
                    params![playlist_id],
                    |row| row.get(0),
                )
                .context("count playlist entries")?;
            if from < 0 || to < 0 || from >= len || to >= len {
                return Ok(false);
            }
            if from == to {
                return Ok(true);
            }
            let track_id: i64 = tx
                .query_row(
                    "SELECT track_id FROM playlist_tracks WHERE playlist_id = ?1 AND position = ?2",
                    params![playlist_id, from],
                    |row| row.get(0),
                )
                .context("lookup moved entry")?;
            if from < to {
                tx.execute(
                    r#"
                    UPDATE playlist_tracks SET position = position - 1
                    WHERE playlist_id = ?1 AND position > ?2 AND position <= ?3
                    "#,
                    params![playlist_id, from, to],
                )
                .context("shift entries up")?;
            } else {
                tx.execute(
                    r#"
                    UPDATE playlist_tracks SET position = position + 1
                    WHERE playlist_id = ?1 AND position >= ?3 AND position < ?2
                    "#,
                    params![playlist_id, from, to],
                )
                .context("shift entries down")?;
            }
            tx.execute(
                "UPDATE playlist_tracks SET position = ?1 WHERE playlist_id = ?2 AND track_id = ?3",
                params![to, playlist_id, track_id],
            )
            .context("place moved entry")?;
            touch(tx, playlist_id)?;
            Ok(true)
        })
    }

    pub fn playlist_tracks(&self, playlist_id: i64) -> Result<Vec<TrackSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT track_id FROM playlist_tracks WHERE playlist_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![playlist_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list playlist entries")?;
        drop(stmt);
        drop(conn);

        let mut tracks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(track) = self.track_by_id(id)? {
                tracks.push(track);
            }
        }
        Ok(tracks)
    }

    pub fn list_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{PLAYLIST_SELECT} ORDER BY p.name COLLATE NOCASE, p.id"))?;
        let rows = stmt.query_map([], map_playlist_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list playlists")
    }

    pub fn playlist_by_id(&self, playlist_id: i64) -> Result<Option<PlaylistSummary>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{PLAYLIST_SELECT} WHERE p.id = ?1"),
            params![playlist_id],
            map_playlist_row,
        )
        .optional()
        .context("select playlist by id")
    }
}

fn playlist_name(raw: &str) -> Result<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(anyhow!("playlist name is empty"));
    }
    Ok(name)
}

fn ensure_playlist(conn: &Connection, playlist_id: i64) -> Result<()> {
    let exists = conn
        .prepare("SELECT 1 FROM playlists WHERE id = ?1")?
        .exists(params![playlist_id])?;
    if !exists {
        return Err(anyhow!("playlist {playlist_id} not found"));
    }
    Ok(())
}

fn touch(conn: &Connection, playlist_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE playlists SET updated_ms = ?1 WHERE id = ?2",
        params![now_ms(), playlist_id],
    )
    .context("touch playlist")?;
    Ok(())
}

/// Shift entries after a removed `position` down by one.
pub(crate) fn close_gap(conn: &Connection, playlist_id: i64, position: i64) -> Result<()> {
    conn.execute(
        "UPDATE playlist_tracks SET position = position - 1 WHERE playlist_id = ?1 AND position > ?2",
        params![playlist_id, position],
    )
    .context("compact playlist positions")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::library_db::test_support::*;

    fn positions(db: &crate::library_db::LibraryDb, playlist_id: i64) -> Vec<(i64, i64)> {
        let conn = db.conn().expect("conn");
        let mut stmt = conn
            .prepare("SELECT track_id, position FROM playlist_tracks WHERE playlist_id = ?1 ORDER BY position")
            .expect("prepare");
        stmt.query_map([playlist_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("collect")
    }

    #[test]
    fn add_tracks_appends_and_skips_duplicates() {
        let db = temp_db("playlist-add");
        let a = db.upsert_track(&record("/m/a.flac", "A", "X", 100)).expect("a").id();
        let b = db.upsert_track(&record("/m/b.flac", "A", "X", 200)).expect("b").id();
        let playlist = db.create_playlist(" Road Trip ").expect("create");

        assert_eq!(db.add_tracks_to_playlist(playlist, &[a, b, a, 999]).expect("add"), 2);
        assert_eq!(db.add_tracks_to_playlist(playlist, &[b]).expect("add again"), 0);
        assert_eq!(positions(&db, playlist), vec![(a, 0), (b, 1)]);

        let summary = db.playlist_by_id(playlist).expect("lookup").expect("playlist");
        assert_eq!(summary.name, "Road Trip");
        assert_eq!(summary.track_count, 2);
        assert_eq!(summary.total_duration_ms, 300);
    }

    #[test]
    fn deleting_a_track_compacts_playlist_positions() {
        let db = temp_db("playlist-cascade");
        let ids: Vec<i64> = (0..3)
            .map(|n| {
                db.upsert_track(&record(&format!("/m/{n}.flac"), "A", "X", 10))
                    .expect("insert")
                    .id()
            })
            .collect();
        let playlist = db.create_playlist("Mix").expect("create");
        db.add_tracks_to_playlist(playlist, &ids).expect("add");

        db.delete_track(ids[1]).expect("delete");
        assert_eq!(positions(&db, playlist), vec![(ids[0], 0), (ids[2], 1)]);
        assert_consistent(&db);
    }

    #[test]
    fn move_and_remove_keep_positions_dense() {
        let db = temp_db("playlist-move");
        let ids: Vec<i64> = (0..4)
            .map(|n| {
                db.upsert_track(&record(&format!("/m/{n}.flac"), "A", "X", 10))
                    .expect("insert")
                    .id()
            })
            .collect();
        let playlist = db.create_playlist("Order").expect("create");
        db.add_tracks_to_playlist(playlist, &ids).expect("add");

        assert!(db.move_playlist_track(playlist, 0, 2).expect("move down"));
        assert_eq!(
            positions(&db, playlist),
            vec![(ids[1], 0), (ids[2], 1), (ids[0], 2), (ids[3], 3)]
        );
        assert!(db.move_playlist_track(playlist, 3, 0).expect("move up"));
        assert_eq!(
            positions(&db, playlist),
            vec![(ids[3], 0), (ids[1], 1), (ids[2], 2), (ids[0], 3)]
        );
        assert!(!db.move_playlist_track(playlist, 0, 9).expect("out of range"));

        assert!(db.remove_track_from_playlist(playlist, ids[1]).expect("remove"));
        assert!(!db.remove_track_from_playlist(playlist, ids[1]).expect("remove again"));
        let tracks = db.playlist_tracks(playlist).expect("tracks");
        assert_eq!(
            tracks.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![ids[3], ids[2], ids[0]]
        );
    }

    #[test]
    fn rename_delete_and_validation() {
        let db = temp_db("playlist-rename");
        assert!(db.create_playlist("   ").is_err());
        let id = db.create_playlist("b-side").expect("create");
        db.create_playlist("A-side").expect("create other");
        assert!(db.rename_playlist(id, "B-Side").expect("rename"));

        let names: Vec<_> = db
            .list_playlists()
            .expect("list")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["A-side".to_string(), "B-Side".to_string()]);

        assert!(db.delete_playlist(id).expect("delete"));
        assert!(db.playlist_by_id(id).expect("lookup").is_none());
        assert!(db.add_tracks_to_playlist(id, &[1]).is_err());
    }
}

//! Genre rows, shared across tracks by case-insensitive name.

use anyhow::{Context, Result};
use medialib_types::GenreSummary;
use rusqlite::{params, Connection};

use crate::library_db::{sort_key, LibraryDb};

impl LibraryDb {
    pub fn list_genres(&self) -> Result<Vec<GenreSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT g.id, g.name, (SELECT COUNT(*) FROM tracks t WHERE t.genre_id = g.id)
            FROM genres g
            ORDER BY g.sort_name
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GenreSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                track_count: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("list genres")
    }
}

pub(crate) fn find_or_create(conn: &Connection, name: &str) -> Result<i64> {
    let key = sort_key(name);
    conn.execute(
        "INSERT OR IGNORE INTO genres (name, sort_name) VALUES (?1, ?2)",
        params![name.trim(), key],
    )
    .context("upsert genre")?;
    let id: i64 = conn
        .query_row(
            "SELECT id FROM genres WHERE sort_name = ?1",
            params![key],
            |row| row.get(0),
        )
        .context("select genre id")?;
    Ok(id)
}

pub(crate) fn delete_if_unused(conn: &Connection, genre_id: i64) -> Result<bool> {
    let deleted = conn
        .execute(
            "DELETE FROM genres WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM tracks WHERE genre_id = ?1)",
            params![genre_id],
        )
        .context("delete unused genre")?;
    Ok(deleted > 0)
}

pub(crate) fn delete_all_unused(conn: &Connection) -> Result<usize> {
    conn.execute(
        "DELETE FROM genres WHERE id NOT IN (SELECT DISTINCT genre_id FROM tracks WHERE genre_id IS NOT NULL)",
        [],
    )
    .context("delete unused genres")
}

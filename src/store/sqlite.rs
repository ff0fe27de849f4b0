use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::Connection;

use super::{CellRange, Rows, StoreError, TabularStore};

/// Sheets stored cell-by-cell in a local SQLite file. Empty cells are not
/// stored, which keeps reads shaped like the Sheets API (trailing blanks
/// trimmed).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cells (
                sheet      TEXT NOT NULL,
                row        INTEGER NOT NULL,
                col        INTEGER NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (sheet, row, col)
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Malformed("sqlite connection lock poisoned".into()))
    }
}

#[async_trait]
impl TabularStore for SqliteStore {
    async fn verify_access(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM cells", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    async fn get_range(&self, range: &CellRange) -> Result<Rows, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT row, col, value FROM cells
             WHERE sheet = ?1 AND row >= ?2 AND row <= ?3 AND col >= ?4 AND col <= ?5
             ORDER BY row, col",
        )?;
        let end_row = range.end_row.map(i64::from).unwrap_or(i64::MAX);
        let cells = stmt
            .query_map(
                rusqlite::params![
                    range.sheet,
                    range.start_row,
                    end_row,
                    range.start_col,
                    range.end_col
                ],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows: Rows = Vec::new();
        for (r, c, value) in cells {
            let ri = (r - range.start_row) as usize;
            let ci = (c - range.start_col) as usize;
            if rows.len() <= ri {
                rows.resize(ri + 1, Vec::new());
            }
            let row = &mut rows[ri];
            if row.len() <= ci {
                row.resize(ci + 1, String::new());
            }
            row[ci] = value;
        }
        Ok(rows)
    }

    async fn update_range(&self, range: &CellRange, rows: Rows) -> Result<(), StoreError> {
        if rows.iter().any(|r| r.len() > range.width()) {
            return Err(StoreError::Malformed(format!(
                "row wider than range {}",
                range
            )));
        }
        if let Some(end) = range.end_row {
            if rows.len() > (end - range.start_row + 1) as usize {
                return Err(StoreError::Malformed(format!(
                    "more rows than range {}",
                    range
                )));
            }
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT OR REPLACE INTO cells (sheet, row, col, value) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut delete =
                tx.prepare("DELETE FROM cells WHERE sheet = ?1 AND row = ?2 AND col = ?3")?;
            for (ri, row) in rows.iter().enumerate() {
                let r = range.start_row + ri as u32;
                for (ci, value) in row.iter().enumerate() {
                    let c = range.start_col + ci as u32;
                    if value.is_empty() {
                        delete.execute(rusqlite::params![range.sheet, r, c])?;
                    } else {
                        upsert.execute(rusqlite::params![range.sheet, r, c, value])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

pub mod sheets;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use sheets::SheetsStore;
pub use sqlite::SqliteStore;

/// Rows of cell text, as returned by a range read. Trailing empty cells and
/// rows are omitted, so callers must pad before indexing.
pub type Rows = Vec<Vec<String>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("store request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }
}

/// Narrow view of a remote spreadsheet: read and overwrite rectangular ranges.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Cheap call that fails with `Unauthorized` if the credentials are bad.
    async fn verify_access(&self) -> Result<(), StoreError>;

    async fn get_range(&self, range: &CellRange) -> Result<Rows, StoreError>;

    async fn update_range(&self, range: &CellRange, rows: Rows) -> Result<(), StoreError>;
}

/// A rectangular A1 range on one sheet. Columns are zero-based, rows are
/// one-based like the sheet itself. `end_row: None` leaves the range open
/// downwards (`A2:E`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRange {
    pub sheet: String,
    pub start_col: u32,
    pub start_row: u32,
    pub end_col: u32,
    pub end_row: Option<u32>,
}

impl CellRange {
    /// Columns `start_col..=end_col` from `start_row` to the last used row.
    pub fn from_row(sheet: &str, start_col: u32, end_col: u32, start_row: u32) -> Self {
        Self {
            sheet: sheet.to_string(),
            start_col,
            start_row,
            end_col,
            end_row: None,
        }
    }

    /// Columns `start_col..=end_col` of a single row.
    pub fn row(sheet: &str, start_col: u32, end_col: u32, row: u32) -> Self {
        Self {
            sheet: sheet.to_string(),
            start_col,
            start_row: row,
            end_col,
            end_row: Some(row),
        }
    }

    pub fn cell(sheet: &str, col: u32, row: u32) -> Self {
        Self::row(sheet, col, col, row)
    }

    pub fn width(&self) -> usize {
        (self.end_col - self.start_col + 1) as usize
    }

    fn is_single_cell(&self) -> bool {
        self.start_col == self.end_col && self.end_row == Some(self.start_row)
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!", quote_sheet(&self.sheet))?;
        write!(f, "{}{}", column_letters(self.start_col), self.start_row)?;
        if self.is_single_cell() {
            return Ok(());
        }
        write!(f, ":{}", column_letters(self.end_col))?;
        if let Some(end) = self.end_row {
            write!(f, "{}", end)?;
        }
        Ok(())
    }
}

fn quote_sheet(name: &str) -> String {
    let plain = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

/// Zero-based column index to letters: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letters(mut idx: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Column letters to a zero-based index. Case-insensitive; `None` on anything
/// that is not purely ASCII letters.
pub fn column_index(letters: &str) -> Option<u32> {
    let letters = letters.trim();
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut n: u32 = 0;
    for c in letters.chars() {
        let v = (c.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        n = n.checked_mul(26)?.checked_add(v)?;
    }
    Some(n - 1)
}

/// Cell at `idx`, or empty when the row was trimmed short.
pub fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.as_str()).unwrap_or("")
}

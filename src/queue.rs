use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::warn;

use crate::store::{cell, CellRange, StoreError, TabularStore};

/// Queue columns, A..E.
const COL_RECORD_ID: usize = 0;
const COL_URL: usize = 1;
const COL_NAME: usize = 2;
const COL_TIMESTAMP: usize = 3;
const COL_STATUS: usize = 4;
const WIDTH: usize = 5;

const STATUS_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Done,
    Retry,
    Error(String),
    /// Anything a human typed that we do not recognise. Never eligible.
    Other(String),
}

impl TaskStatus {
    /// Empty cells count as pending, matching how rows arrive from upstream.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        let lower = s.to_lowercase();
        match lower.as_str() {
            "" | "pending" => TaskStatus::Pending,
            "done" => TaskStatus::Done,
            "retry" => TaskStatus::Retry,
            "error" => TaskStatus::Error(String::new()),
            _ if lower.starts_with("error:") => {
                TaskStatus::Error(s.get("error:".len()..).unwrap_or("").to_string())
            }
            _ => TaskStatus::Other(s.to_string()),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        TaskStatus::Error(reason.into())
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending".to_string(),
            TaskStatus::Done => "done".to_string(),
            TaskStatus::Retry => "retry".to_string(),
            TaskStatus::Error(reason) if reason.is_empty() => "error".to_string(),
            TaskStatus::Error(reason) => format!("error:{}", reason),
            TaskStatus::Other(s) => s.clone(),
        };
        let capped: String = s.chars().take(STATUS_MAX_CHARS).collect();
        f.write_str(&capped)
    }
}

/// One queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    /// Sheet row number, only used to address the write-back.
    pub row: u32,
    pub record_id: String,
    pub target_url: String,
    pub resolved_name: String,
    pub last_attempt: String,
    pub status: TaskStatus,
}

impl QueueTask {
    pub fn from_cells(row: u32, cells: &[String]) -> Self {
        if cells.len() > WIDTH {
            warn!("queue row {} has {} cells, ignoring extras", row, cells.len());
        }
        QueueTask {
            row,
            record_id: cell(cells, COL_RECORD_ID).trim().to_string(),
            target_url: cell(cells, COL_URL).trim().to_string(),
            resolved_name: cell(cells, COL_NAME).trim().to_string(),
            last_attempt: cell(cells, COL_TIMESTAMP).trim().to_string(),
            status: TaskStatus::parse(cell(cells, COL_STATUS)),
        }
    }

    pub fn is_eligible(&self, include_retry: bool) -> bool {
        let status_ok = match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retry => include_retry,
            _ => false,
        };
        status_ok && !self.record_id.is_empty() && !self.target_url.is_empty()
    }
}

/// Final result of one task, as written to columns C..E.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub resolved_name: String,
    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn done(name: &str) -> Self {
        Self {
            resolved_name: name.to_string(),
            status: TaskStatus::Done,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            resolved_name: String::new(),
            status: TaskStatus::error(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueLayout {
    pub sheet: String,
    pub first_row: u32,
}

pub struct QueueRepository<'a> {
    store: &'a dyn TabularStore,
    layout: &'a QueueLayout,
}

impl<'a> QueueRepository<'a> {
    pub fn new(store: &'a dyn TabularStore, layout: &'a QueueLayout) -> Self {
        Self { store, layout }
    }

    /// Every queue row in sheet order.
    pub async fn read_all(&self) -> Result<Vec<QueueTask>, StoreError> {
        let range = CellRange::from_row(
            &self.layout.sheet,
            COL_RECORD_ID as u32,
            COL_STATUS as u32,
            self.layout.first_row,
        );
        let rows = self.store.get_range(&range).await?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, cells)| QueueTask::from_cells(self.layout.first_row + i as u32, cells))
            .collect())
    }

    /// Up to `limit` eligible tasks in sheet order.
    pub async fn read_pending(
        &self,
        limit: usize,
        include_retry: bool,
    ) -> Result<Vec<QueueTask>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| t.is_eligible(include_retry))
            .take(limit)
            .collect())
    }

    /// Overwrites name, timestamp and status of the task's row.
    pub async fn write_outcome(
        &self,
        task: &QueueTask,
        outcome: &TaskOutcome,
        timestamp: &str,
    ) -> Result<(), StoreError> {
        let range = CellRange::row(&self.layout.sheet, COL_NAME as u32, COL_STATUS as u32, task.row);
        self.store
            .update_range(
                &range,
                vec![vec![
                    outcome.resolved_name.clone(),
                    timestamp.to_string(),
                    outcome.status.to_string(),
                ]],
            )
            .await
    }
}

/// `YYYY-MM-DDTHH:MM:SS` at a fixed offset, no zone suffix.
pub fn timestamp_at(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn now_timestamp(offset: FixedOffset) -> String {
    timestamp_at(Utc::now(), offset)
}

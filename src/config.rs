use std::time::Duration;

use chrono::FixedOffset;
use clap::{Args, ValueEnum};
use thiserror::Error;

use crate::ledger::LedgerLayout;
use crate::queue::QueueLayout;
use crate::render::RenderSettings;
use crate::store::column_index;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required for the {1} backend")]
    Missing(&'static str, &'static str),
    #[error("{name}: {value:?} is not a column letter")]
    BadColumn { name: &'static str, value: String },
    #[error("{0}: rows start at 1")]
    BadRow(&'static str),
    #[error("utc offset {0}h is out of range")]
    BadOffset(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Sheets,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RendererBackend {
    Chromium,
    Spider,
}

/// Startup parameters, from flags or the environment.
#[derive(Debug, Args)]
pub struct Settings {
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value = "sheets", global = true)]
    pub store: StoreBackend,

    #[arg(long, env = "SPREADSHEET_ID", global = true)]
    pub spreadsheet_id: Option<String>,

    /// OAuth bearer token with spreadsheet scope
    #[arg(long, env = "SHEETS_ACCESS_TOKEN", hide_env_values = true, global = true)]
    pub access_token: Option<String>,

    #[arg(long, env = "SQLITE_PATH", default_value = "data/ledger.sqlite", global = true)]
    pub sqlite_path: String,

    #[arg(long, env = "SHEET_QUEUE", default_value = "_Queue", global = true)]
    pub sheet_queue: String,

    #[arg(long, env = "SHEET_MAIN", default_value = "お届け案件管理", global = true)]
    pub sheet_main: String,

    #[arg(long, env = "QUEUE_FIRST_ROW", default_value_t = 2, global = true)]
    pub queue_first_row: u32,

    #[arg(long, env = "LEDGER_ID_COLUMN", default_value = "F", global = true)]
    pub ledger_id_column: String,

    #[arg(long, env = "LEDGER_NAME_COLUMN", default_value = "G", global = true)]
    pub ledger_name_column: String,

    #[arg(long, env = "LEDGER_FIRST_ROW", default_value_t = 2, global = true)]
    pub ledger_first_row: u32,

    #[arg(long, env = "RENDERER", value_enum, default_value = "chromium", global = true)]
    pub renderer: RendererBackend,

    #[arg(long, env = "SPIDER_API_KEY", hide_env_values = true, global = true)]
    pub spider_api_key: Option<String>,

    /// Host suffixes a target URL must belong to (empty disables the check)
    #[arg(long, env = "ALLOWED_HOSTS", value_delimiter = ',', default_value = "tool.readycrew.cloud", global = true)]
    pub allowed_hosts: Vec<String>,

    #[arg(long, env = "RENDER_TIMEOUT_SECS", default_value_t = 45, global = true)]
    pub render_timeout_secs: u64,

    #[arg(long, env = "RENDER_SETTLE_MS", default_value_t = 5000, global = true)]
    pub render_settle_ms: u64,

    #[arg(long, env = "BODY_LIMIT", default_value_t = 4000, global = true)]
    pub body_limit: usize,

    /// Interstitial phrases that mean the page has not rendered yet
    #[arg(long, env = "GATE_PHRASES", value_delimiter = ',', default_values = ["verification in progress", "認証中"], global = true)]
    pub gate_phrases: Vec<String>,

    #[arg(long, env = "UTC_OFFSET_HOURS", default_value_t = 9, allow_hyphen_values = true, global = true)]
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone)]
pub enum StoreConfig {
    Sheets {
        spreadsheet_id: String,
        access_token: String,
    },
    Sqlite {
        path: String,
    },
}

#[derive(Debug, Clone)]
pub enum RendererConfig {
    Chromium,
    Spider { api_key: String },
}

/// Validated configuration, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub queue: QueueLayout,
    pub ledger: LedgerLayout,
    pub renderer: RendererConfig,
    pub render: RenderSettings,
    pub allowed_hosts: Vec<String>,
    pub utc_offset: FixedOffset,
}

impl Config {
    pub fn from_settings(s: &Settings) -> Result<Self, ConfigError> {
        let store = match s.store {
            StoreBackend::Sheets => StoreConfig::Sheets {
                spreadsheet_id: required(&s.spreadsheet_id, "SPREADSHEET_ID", "sheets")?,
                access_token: required(&s.access_token, "SHEETS_ACCESS_TOKEN", "sheets")?,
            },
            StoreBackend::Sqlite => StoreConfig::Sqlite {
                path: s.sqlite_path.clone(),
            },
        };
        let renderer = match s.renderer {
            RendererBackend::Chromium => RendererConfig::Chromium,
            RendererBackend::Spider => RendererConfig::Spider {
                api_key: required(&s.spider_api_key, "SPIDER_API_KEY", "spider")?,
            },
        };

        if s.queue_first_row == 0 {
            return Err(ConfigError::BadRow("QUEUE_FIRST_ROW"));
        }
        if s.ledger_first_row == 0 {
            return Err(ConfigError::BadRow("LEDGER_FIRST_ROW"));
        }

        let utc_offset = s
            .utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::BadOffset(s.utc_offset_hours))?;

        Ok(Config {
            store,
            queue: QueueLayout {
                sheet: s.sheet_queue.clone(),
                first_row: s.queue_first_row,
            },
            ledger: LedgerLayout {
                sheet: s.sheet_main.clone(),
                id_col: column(&s.ledger_id_column, "LEDGER_ID_COLUMN")?,
                name_col: column(&s.ledger_name_column, "LEDGER_NAME_COLUMN")?,
                first_row: s.ledger_first_row,
            },
            renderer,
            render: RenderSettings {
                timeout: Duration::from_secs(s.render_timeout_secs),
                settle: Duration::from_millis(s.render_settle_ms),
                body_limit: s.body_limit,
                gate_phrases: clean(&s.gate_phrases),
            },
            allowed_hosts: clean(&s.allowed_hosts),
            utc_offset,
        })
    }
}

fn required(
    value: &Option<String>,
    name: &'static str,
    backend: &'static str,
) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(name, backend))
}

fn column(letters: &str, name: &'static str) -> Result<u32, ConfigError> {
    column_index(letters).ok_or_else(|| ConfigError::BadColumn {
        name,
        value: letters.to_string(),
    })
}

fn clean(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

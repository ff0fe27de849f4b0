mod config;
mod extract;
mod ledger;
mod queue;
mod render;
mod runner;
mod store;

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use config::{Config, RendererConfig, Settings, StoreConfig};
use extract::{HeadingFirst, TextExtractionStrategy};
use queue::QueueRepository;
use render::{ChromiumRenderer, PageRenderer, SpiderRenderer};
use runner::{BatchOptions, FatalError, TaskRunner, DEFAULT_BATCH_LIMIT};
use store::{SheetsStore, SqliteStore, TabularStore};

#[derive(Parser)]
#[command(name = "corp_resolver", about = "Resolve company names for queued cases and fill the ledger")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local cell table (sqlite store only)
    Init,
    /// Process one bounded batch of pending queue rows
    Run {
        /// Max tasks to take from the queue
        #[arg(short = 'n', long, default_value_t = DEFAULT_BATCH_LIMIT)]
        limit: usize,
        /// Also pick up rows whose status is "retry"
        #[arg(long)]
        include_retry: bool,
    },
    /// Count queue rows by status
    Stats,
    /// Render one page and show what extraction finds, without writing anything
    Probe {
        url: String,
        /// Expected record id
        #[arg(long, default_value = "")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let config = Config::from_settings(&cli.settings).context("invalid configuration")?;

    let result = match cli.command {
        Commands::Init => {
            let StoreConfig::Sqlite { path } = &config.store else {
                bail!("init only applies to the sqlite store");
            };
            if let Some(dir) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(dir)?;
            }
            SqliteStore::open(path)?.init_schema()?;
            println!("Initialized {}", path);
            Ok(())
        }
        Commands::Run { limit, include_retry } => {
            let store = open_store(&config).await?;
            let renderer = build_renderer(&config)?;
            let runner = TaskRunner::new(&config, store.as_ref(), renderer.as_ref(), &HeadingFirst);
            let stats = runner
                .run_batch(BatchOptions { limit, include_retry })
                .await?;
            stats.print();
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let tasks = QueueRepository::new(store.as_ref(), &config.queue)
                .read_all()
                .await?;
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for t in &tasks {
                *counts.entry(t.status.to_string()).or_default() += 1;
            }
            println!("Total:     {}", tasks.len());
            for (status, n) in &counts {
                println!("{:<10} {}", format!("{}:", status), n);
            }
            Ok(())
        }
        Commands::Probe { url, id } => {
            let renderer = build_renderer(&config)?;
            let page = renderer
                .render(&url)
                .await
                .and_then(|p| render::inspect(p, &config.render));
            match page {
                Ok(page) => {
                    println!("Status:   {}", page.http_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()));
                    println!("Title:    {}", page.title.as_deref().unwrap_or("-"));
                    println!("Headings: {}", page.headings.len());
                    for h in &page.headings {
                        println!("  {}", preview(h, 60));
                    }
                    println!("Body:     {} chars", page.body.chars().count());
                    match HeadingFirst.extract(&page.headings, &page.body, &id) {
                        Some(m) => println!("Name:     {} (id {}, from {:?})", m.name, m.matched_id, m.source),
                        None => println!("Name:     not found"),
                    }
                }
                Err(e) => println!("Render failed: {} (status would be error:{})", e, e.reason()),
            }
            Ok(())
        }
    };

    if let Some(footer) = elapsed_footer(t0.elapsed()) {
        println!("\n{}", footer);
    }

    result
}

/// Opens the configured store and proves the credentials work before any
/// task is touched.
async fn open_store(config: &Config) -> Result<Box<dyn TabularStore>, FatalError> {
    let store: Box<dyn TabularStore> = match &config.store {
        StoreConfig::Sheets {
            spreadsheet_id,
            access_token,
        } => Box::new(SheetsStore::new(spreadsheet_id, access_token)),
        StoreConfig::Sqlite { path } => Box::new(SqliteStore::open(path)?),
    };
    store.verify_access().await?;
    Ok(store)
}

fn build_renderer(config: &Config) -> anyhow::Result<Box<dyn PageRenderer>> {
    Ok(match &config.renderer {
        RendererConfig::Chromium => Box::new(ChromiumRenderer::new(config.render.clone())),
        RendererConfig::Spider { api_key } => {
            Box::new(SpiderRenderer::new(api_key, config.render.clone())?)
        }
    })
}

/// First `max` characters of a heading, marked when cut.
fn preview(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

/// Footer for runs that took a noticeable amount of time.
fn elapsed_footer(d: std::time::Duration) -> Option<String> {
    let secs = d.as_secs();
    let text = match secs {
        0 => return None,
        1..=59 => format!("{:.1}s", d.as_secs_f64()),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    };
    Some(format!("Done in {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preview_cuts_on_char_boundary() {
        assert_eq!(preview("株式会社Example", 4), "株式会社…");
        assert_eq!(preview("短い", 4), "短い");
    }

    #[test]
    fn footer_only_after_a_second() {
        assert_eq!(elapsed_footer(Duration::from_millis(400)), None);
        assert_eq!(elapsed_footer(Duration::from_millis(2500)).as_deref(), Some("Done in 2.5s"));
        assert_eq!(elapsed_footer(Duration::from_secs(125)).as_deref(), Some("Done in 2m 05s"));
        assert_eq!(elapsed_footer(Duration::from_secs(3720)).as_deref(), Some("Done in 1h 02m"));
    }
}

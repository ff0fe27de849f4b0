use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::extract::TextExtractionStrategy;
use crate::ledger::{FillOutcome, LedgerReconciler};
use crate::queue::{now_timestamp, QueueRepository, QueueTask, TaskOutcome, TaskStatus};
use crate::render::{self, PageRenderer};
use crate::store::{StoreError, TabularStore};

/// Default number of tasks taken per invocation.
pub const DEFAULT_BATCH_LIMIT: usize = 10;

/// Failures that end the whole invocation.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("store authorization failed: {0}")]
    Unauthorized(StoreError),
    #[error("store unreachable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for FatalError {
    fn from(e: StoreError) -> Self {
        if e.is_unauthorized() {
            FatalError::Unauthorized(e)
        } else {
            FatalError::Store(e)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub limit: usize,
    pub include_retry: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_BATCH_LIMIT,
            include_retry: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ledger_filled: usize,
}

impl BatchStats {
    pub fn print(&self) {
        println!(
            "Done: {} tasks ({} done, {} failed, {} skipped), {} ledger names filled.",
            self.total, self.done, self.failed, self.skipped, self.ledger_filled
        );
    }
}

enum TaskResult {
    Done { ledger_filled: bool },
    Failed,
    Skipped,
}

/// Drains one batch: read queue, then render, extract, write back and
/// reconcile each task in order. Tasks never overlap.
pub struct TaskRunner<'a> {
    config: &'a Config,
    queue: QueueRepository<'a>,
    ledger: LedgerReconciler<'a>,
    renderer: &'a dyn PageRenderer,
    extractor: &'a dyn TextExtractionStrategy,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn TabularStore,
        renderer: &'a dyn PageRenderer,
        extractor: &'a dyn TextExtractionStrategy,
    ) -> Self {
        Self {
            config,
            queue: QueueRepository::new(store, &config.queue),
            ledger: LedgerReconciler::new(store, &config.ledger),
            renderer,
            extractor,
        }
    }

    pub async fn run_batch(&self, opts: BatchOptions) -> Result<BatchStats, FatalError> {
        let tasks = self.queue.read_pending(opts.limit, opts.include_retry).await?;
        let mut stats = BatchStats {
            total: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            info!("no pending tasks");
            return Ok(stats);
        }
        info!("processing {} tasks", tasks.len());

        let pb = ProgressBar::new(tasks.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );

        for task in &tasks {
            pb.set_message(task.record_id.clone());
            match self.process(task).await {
                TaskResult::Done { ledger_filled } => {
                    stats.done += 1;
                    if ledger_filled {
                        stats.ledger_filled += 1;
                    }
                }
                TaskResult::Failed => stats.failed += 1,
                TaskResult::Skipped => stats.skipped += 1,
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!(
            "batch finished: {} done, {} failed, {} skipped",
            stats.done, stats.failed, stats.skipped
        );
        Ok(stats)
    }

    async fn process(&self, task: &QueueTask) -> TaskResult {
        if !host_allowed(&task.target_url, &self.config.allowed_hosts) {
            warn!(row = task.row, url = %task.target_url, "host not allowed, skipping");
            return TaskResult::Skipped;
        }

        let outcome = match AssertUnwindSafe(self.resolve(task)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(row = task.row, "task panicked");
                TaskOutcome::failed("exception")
            }
        };

        let ts = now_timestamp(self.config.utc_offset);
        if let Err(e) = self.queue.write_outcome(task, &outcome, &ts).await {
            error!(row = task.row, "write-back failed: {}", e);
            let fallback = TaskOutcome::failed("exception");
            if outcome != fallback {
                if let Err(e) = self.queue.write_outcome(task, &fallback, &ts).await {
                    error!(row = task.row, "could not record exception either: {}", e);
                }
            }
            return TaskResult::Failed;
        }
        info!(
            row = task.row,
            id = %task.record_id,
            status = %outcome.status,
            name = %outcome.resolved_name,
            "task written"
        );

        if outcome.status != TaskStatus::Done {
            return TaskResult::Failed;
        }

        let ledger_filled = match self
            .ledger
            .fill_if_empty(&task.record_id, &outcome.resolved_name)
            .await
        {
            Ok(FillOutcome::Filled { .. }) => true,
            Ok(FillOutcome::NotFound) => {
                warn!(id = %task.record_id, "no ledger row for id");
                false
            }
            Ok(_) => false,
            Err(e) => {
                warn!(id = %task.record_id, "ledger update failed: {}", e);
                false
            }
        };
        TaskResult::Done { ledger_filled }
    }

    /// Render and extract. Every failure becomes an error outcome here.
    async fn resolve(&self, task: &QueueTask) -> TaskOutcome {
        let page = match self.renderer.render(&task.target_url).await {
            Ok(page) => render::inspect(page, &self.config.render),
            Err(e) => Err(e),
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!(row = task.row, url = %task.target_url, "render failed: {}", e);
                return TaskOutcome::failed(e.reason());
            }
        };

        match self
            .extractor
            .extract(&page.headings, &page.body, &task.record_id)
        {
            Some(m) => {
                if m.matched_id != task.record_id {
                    warn!(
                        row = task.row,
                        "page shows id {} instead of {}", m.matched_id, task.record_id
                    );
                }
                TaskOutcome::done(&m.name)
            }
            None => {
                warn!(
                    row = task.row,
                    headings = page.headings.len(),
                    body_chars = page.body.chars().count(),
                    title = page.title.as_deref().unwrap_or(""),
                    "no company name found"
                );
                TaskOutcome::failed("no_corp")
            }
        }
    }
}

/// True when the URL's host is, or is a subdomain of, an allowed host. An
/// empty allow-list allows everything.
pub fn host_allowed(url: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
        return false;
    };
    allowed.iter().any(|a| {
        let a = a.trim_start_matches('.').to_lowercase();
        host == a || host.ends_with(&format!(".{}", a))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::FixedOffset;

    use super::*;
    use crate::config::RendererConfig;
    use crate::config::StoreConfig;
    use crate::extract::HeadingFirst;
    use crate::ledger::LedgerLayout;
    use crate::queue::QueueLayout;
    use crate::render::{RenderError, RenderSettings, RenderedPage};
    use crate::store::{CellRange, Rows, SqliteStore};

    const QUEUE: &str = "_Queue";
    const LEDGER: &str = "お届け案件管理";
    const URL_OK: &str = "https://tool.example.cloud/x";

    enum Script {
        Page(RenderedPage),
        Timeout,
        Broken,
        Panic,
    }

    #[derive(Default)]
    struct ScriptedRenderer {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRenderer {
        fn with(mut self, url: &str, script: Script) -> Self {
            self.scripts.insert(url.to_string(), script);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageRenderer for ScriptedRenderer {
        async fn render(&self, url: &str) -> Result<RenderedPage, RenderError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.scripts.get(url) {
                Some(Script::Page(p)) => Ok(p.clone()),
                Some(Script::Timeout) => Err(RenderError::Timeout),
                Some(Script::Broken) => Err(anyhow::anyhow!("browser crashed").into()),
                Some(Script::Panic) => panic!("renderer blew up"),
                None => Err(RenderError::Navigation("unknown url".into())),
            }
        }
    }

    /// Sqlite underneath, but writes touching a chosen (sheet, row) fail a
    /// set number of times.
    struct FlakyStore {
        inner: SqliteStore,
        failures: Mutex<HashMap<(String, u32), usize>>,
        writes: Mutex<Vec<String>>,
    }

    impl FlakyStore {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                failures: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
            }
        }

        fn fail(self, sheet: &str, row: u32, times: usize) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert((sheet.to_string(), row), times);
            self
        }

        fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TabularStore for FlakyStore {
        async fn verify_access(&self) -> Result<(), StoreError> {
            self.inner.verify_access().await
        }

        async fn get_range(&self, range: &CellRange) -> Result<Rows, StoreError> {
            self.inner.get_range(range).await
        }

        async fn update_range(&self, range: &CellRange, rows: Rows) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push(range.to_string());
            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&(range.sheet.clone(), range.start_row)) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(StoreError::Status {
                    status: 503,
                    body: "backend unavailable".into(),
                });
            }
            self.inner.update_range(range, rows).await
        }
    }

    fn page(headings: &[&str], body: &str) -> Script {
        Script::Page(RenderedPage {
            http_status: Some(200),
            title: Some("案件".into()),
            headings: headings.iter().map(|s| s.to_string()).collect(),
            body: body.to_string(),
        })
    }

    fn config() -> Config {
        Config {
            store: StoreConfig::Sqlite {
                path: ":memory:".into(),
            },
            queue: QueueLayout {
                sheet: QUEUE.into(),
                first_row: 2,
            },
            ledger: LedgerLayout {
                sheet: LEDGER.into(),
                id_col: 5,
                name_col: 6,
                first_row: 2,
            },
            renderer: RendererConfig::Chromium,
            render: RenderSettings::default(),
            allowed_hosts: vec!["tool.example.cloud".into()],
            utc_offset: FixedOffset::east_opt(9 * 3600).unwrap(),
        }
    }

    async fn store_with(queue: &[[&str; 5]], ledger: &[(&str, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let q = queue
            .iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect();
        store
            .update_range(&CellRange::from_row(QUEUE, 0, 4, 2), q)
            .await
            .unwrap();
        let l = ledger
            .iter()
            .map(|(id, name)| vec![id.to_string(), name.to_string()])
            .collect();
        store
            .update_range(&CellRange::from_row(LEDGER, 5, 6, 2), l)
            .await
            .unwrap();
        store
    }

    async fn queue_row(store: &SqliteStore, row: u32) -> QueueTask {
        let rows = store.get_range(&CellRange::row(QUEUE, 0, 4, row)).await.unwrap();
        QueueTask::from_cells(row, rows.first().map(|r| r.as_slice()).unwrap_or(&[]))
    }

    async fn ledger_name(store: &SqliteStore, row: u32) -> String {
        let rows = store.get_range(&CellRange::cell(LEDGER, 6, row)).await.unwrap();
        rows.first()
            .and_then(|r| r.first())
            .cloned()
            .unwrap_or_default()
    }

    async fn run(store: &SqliteStore, renderer: &ScriptedRenderer) -> BatchStats {
        let config = config();
        TaskRunner::new(&config, store, renderer, &HeadingFirst)
            .run_batch(BatchOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_name_and_fills_ledger() {
        let store = store_with(
            &[["3007608", URL_OK, "", "", "pending"]],
            &[("1111111", "他社"), ("3007608", "")],
        )
        .await;
        let renderer = ScriptedRenderer::default().with(
            URL_OK,
            page(&["案件詳細", "3007608：株式会社Example"], "本文"),
        );

        let stats = run(&store, &renderer).await;
        assert_eq!(stats.done, 1);
        assert_eq!(stats.ledger_filled, 1);

        let t = queue_row(&store, 2).await;
        assert_eq!(t.resolved_name, "株式会社Example");
        assert_eq!(t.status, TaskStatus::Done);
        assert_eq!(t.last_attempt.len(), "2024-05-01T00:00:00".len());
        assert_eq!(ledger_name(&store, 3).await, "株式会社Example");
        assert_eq!(ledger_name(&store, 2).await, "他社");
    }

    #[tokio::test]
    async fn existing_ledger_name_is_kept() {
        let store = store_with(
            &[["3007608", URL_OK, "", "", "pending"]],
            &[("3007608", "既存企業")],
        )
        .await;
        let renderer = ScriptedRenderer::default()
            .with(URL_OK, page(&["3007608：株式会社Example"], ""));

        let stats = run(&store, &renderer).await;
        assert_eq!(stats.done, 1);
        assert_eq!(stats.ledger_filled, 0);
        assert_eq!(queue_row(&store, 2).await.status, TaskStatus::Done);
        assert_eq!(ledger_name(&store, 2).await, "既存企業");
    }

    #[tokio::test]
    async fn loading_gate_is_auth_check() {
        let store = store_with(&[["3007608", URL_OK, "", "", "pending"]], &[("3007608", "")]).await;
        let renderer = ScriptedRenderer::default().with(
            URL_OK,
            page(&[], "Verification in progress. 3007608：株式会社Example"),
        );

        run(&store, &renderer).await;
        let t = queue_row(&store, 2).await;
        assert_eq!(t.status, TaskStatus::Error("auth_check".into()));
        assert_eq!(t.resolved_name, "");
        assert!(!t.last_attempt.is_empty());
        assert_eq!(ledger_name(&store, 2).await, "");
    }

    #[tokio::test]
    async fn one_broken_task_does_not_stop_the_batch() {
        let broken = "https://tool.example.cloud/broken";
        let panics = "https://tool.example.cloud/panic";
        let store = store_with(
            &[
                ["1000001", broken, "", "", "pending"],
                ["1000002", panics, "", "", "pending"],
                ["3007608", URL_OK, "", "", "pending"],
            ],
            &[],
        )
        .await;
        let renderer = ScriptedRenderer::default()
            .with(broken, Script::Broken)
            .with(panics, Script::Panic)
            .with(URL_OK, page(&["3007608：株式会社Example"], ""));

        let stats = run(&store, &renderer).await;
        assert_eq!((stats.total, stats.done, stats.failed), (3, 1, 2));
        assert_eq!(renderer.calls(), vec![broken, panics, URL_OK]);
        assert_eq!(
            queue_row(&store, 2).await.status,
            TaskStatus::Error("exception".into())
        );
        assert_eq!(
            queue_row(&store, 3).await.status,
            TaskStatus::Error("exception".into())
        );
        assert_eq!(queue_row(&store, 4).await.status, TaskStatus::Done);
    }

    async fn run_on(store: &FlakyStore, renderer: &ScriptedRenderer) -> BatchStats {
        let config = config();
        TaskRunner::new(&config, store, renderer, &HeadingFirst)
            .run_batch(BatchOptions::default())
            .await
            .unwrap()
    }

    fn two_task_renderer() -> ScriptedRenderer {
        ScriptedRenderer::default()
            .with(URL_OK, page(&["3007608：株式会社Example"], ""))
            .with(
                "https://tool.example.cloud/y",
                page(&["3007609：株式会社Second"], ""),
            )
    }

    async fn two_task_store() -> SqliteStore {
        store_with(
            &[
                ["3007608", URL_OK, "", "", "pending"],
                ["3007609", "https://tool.example.cloud/y", "", "", "pending"],
            ],
            &[("3007608", ""), ("3007609", "")],
        )
        .await
    }

    #[tokio::test]
    async fn failed_write_back_is_recorded_as_exception() {
        let store = FlakyStore::new(two_task_store().await).fail(QUEUE, 2, 1);
        let renderer = two_task_renderer();

        let stats = run_on(&store, &renderer).await;
        assert_eq!((stats.total, stats.done, stats.failed), (2, 1, 1));

        let first = queue_row(&store.inner, 2).await;
        assert_eq!(first.status, TaskStatus::Error("exception".into()));
        assert_eq!(first.resolved_name, "");
        assert_eq!(queue_row(&store.inner, 3).await.status, TaskStatus::Done);
        assert_eq!(ledger_name(&store.inner, 3).await, "株式会社Second");
    }

    #[tokio::test]
    async fn unwritable_row_does_not_stop_the_batch() {
        let store = FlakyStore::new(two_task_store().await).fail(QUEUE, 2, usize::MAX);
        let renderer = two_task_renderer();

        let stats = run_on(&store, &renderer).await;
        assert_eq!((stats.done, stats.failed), (1, 1));
        assert_eq!(queue_row(&store.inner, 2).await.status, TaskStatus::Pending);
        assert_eq!(queue_row(&store.inner, 3).await.status, TaskStatus::Done);
        assert_eq!(
            store.writes().iter().filter(|w| w.as_str() == "_Queue!C2:E2").count(),
            2
        );
    }

    #[tokio::test]
    async fn ledger_failure_keeps_done_and_writes_queue_once() {
        let store = FlakyStore::new(two_task_store().await).fail(LEDGER, 2, 1);
        let renderer = two_task_renderer();

        let stats = run_on(&store, &renderer).await;
        assert_eq!((stats.done, stats.failed, stats.ledger_filled), (2, 0, 1));

        let first = queue_row(&store.inner, 2).await;
        assert_eq!(first.status, TaskStatus::Done);
        assert_eq!(first.resolved_name, "株式会社Example");
        assert_eq!(ledger_name(&store.inner, 2).await, "");
        assert_eq!(ledger_name(&store.inner, 3).await, "株式会社Second");
        assert_eq!(
            store.writes().iter().filter(|w| w.as_str() == "_Queue!C2:E2").count(),
            1
        );
    }

    #[tokio::test]
    async fn render_failures_and_misses_get_reasons() {
        let slow = "https://tool.example.cloud/slow";
        let empty = "https://tool.example.cloud/empty";
        let store = store_with(
            &[
                ["1000001", slow, "", "", "pending"],
                ["1000002", empty, "stale", "", "pending"],
            ],
            &[],
        )
        .await;
        let renderer = ScriptedRenderer::default()
            .with(slow, Script::Timeout)
            .with(empty, page(&["会社情報"], "住所：東京都"));

        run(&store, &renderer).await;
        assert_eq!(
            queue_row(&store, 2).await.status,
            TaskStatus::Error("timeout".into())
        );
        let miss = queue_row(&store, 3).await;
        assert_eq!(miss.status, TaskStatus::Error("no_corp".into()));
        assert_eq!(miss.resolved_name, "");
    }

    #[tokio::test]
    async fn disallowed_host_is_left_untouched() {
        let evil = "https://evil.example.com/x";
        let store = store_with(&[["3007608", evil, "", "", "pending"]], &[]).await;
        let before = queue_row(&store, 2).await;
        let renderer = ScriptedRenderer::default().with(evil, page(&["3007608：X"], ""));

        let stats = run(&store, &renderer).await;
        assert_eq!(stats.skipped, 1);
        assert!(renderer.calls().is_empty());
        assert_eq!(queue_row(&store, 2).await, before);
    }

    #[tokio::test]
    async fn retry_rows_wait_for_opt_in() {
        let store = store_with(&[["3007608", URL_OK, "", "", "retry"]], &[]).await;
        let renderer = ScriptedRenderer::default()
            .with(URL_OK, page(&["3007608：株式会社Example"], ""));
        let config = config();
        let runner = TaskRunner::new(&config, &store, &renderer, &HeadingFirst);

        let stats = runner.run_batch(BatchOptions::default()).await.unwrap();
        assert_eq!(stats.total, 0);

        let stats = runner
            .run_batch(BatchOptions {
                include_retry: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stats.done, 1);
    }

    #[tokio::test]
    async fn batch_is_bounded() {
        let rows: Vec<[&str; 5]> = (0..12).map(|_| ["3007608", URL_OK, "", "", "pending"]).collect();
        let store = store_with(&rows, &[]).await;
        let renderer = ScriptedRenderer::default()
            .with(URL_OK, page(&["3007608：株式会社Example"], ""));

        let stats = run(&store, &renderer).await;
        assert_eq!(stats.total, DEFAULT_BATCH_LIMIT);
        assert_eq!(queue_row(&store, 13).await.status, TaskStatus::Pending);
    }

    #[test]
    fn host_allow_list() {
        let allowed = vec!["tool.readycrew.cloud".to_string()];
        assert!(host_allowed("https://tool.readycrew.cloud/a", &allowed));
        assert!(host_allowed("https://EU.Tool.Readycrew.Cloud/a", &allowed));
        assert!(!host_allowed("https://eviltool.readycrew.cloud/a", &allowed));
        assert!(!host_allowed("not a url", &allowed));
        assert!(host_allowed("https://anything.example/", &[]));
    }
}

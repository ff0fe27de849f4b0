pub mod chromium;
pub mod spider;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use chromium::ChromiumRenderer;
pub use spider::SpiderRenderer;

/// Text captured from a rendered page.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    pub http_status: Option<u16>,
    pub title: Option<String>,
    /// `h1`..`h3` texts in document order.
    pub headings: Vec<String>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render timed out")]
    Timeout,
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page answered HTTP {0}")]
    HttpStatus(u16),
    #[error("loading gate still showing")]
    AuthCheck,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    /// Short reason written after `error:` in the queue.
    pub fn reason(&self) -> String {
        match self {
            RenderError::Timeout => "timeout".into(),
            RenderError::Navigation(_) => "nav".into(),
            RenderError::HttpStatus(code) => format!("http_{}", code),
            RenderError::AuthCheck => "auth_check".into(),
            RenderError::Other(_) => "exception".into(),
        }
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError>;
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Upper bound for navigation plus settle.
    pub timeout: Duration,
    /// How long to wait for a heading to appear after navigation.
    pub settle: Duration,
    /// Characters of body text kept for extraction.
    pub body_limit: usize,
    /// Phrases of the interstitial served before the real page renders.
    pub gate_phrases: Vec<String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            settle: Duration::from_secs(5),
            body_limit: 4000,
            gate_phrases: vec!["verification in progress".into(), "認証中".into()],
        }
    }
}

/// Checks every backend's output the same way: error statuses, then the
/// loading gate within the lead section kept for extraction.
pub fn inspect(mut page: RenderedPage, settings: &RenderSettings) -> Result<RenderedPage, RenderError> {
    if let Some(status) = page.http_status.filter(|s| *s >= 400) {
        return Err(RenderError::HttpStatus(status));
    }
    if page.body.chars().count() > settings.body_limit {
        page.body = page.body.chars().take(settings.body_limit).collect();
    }
    if is_gated(&page.body, &settings.gate_phrases) {
        return Err(RenderError::AuthCheck);
    }
    Ok(page)
}

fn is_gated(body: &str, phrases: &[String]) -> bool {
    let lower = body.to_lowercase();
    phrases
        .iter()
        .filter(|p| !p.trim().is_empty())
        .any(|p| lower.contains(&p.to_lowercase()))
}

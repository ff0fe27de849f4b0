use std::sync::LazyLock;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;

use super::{PageRenderer, RenderError, RenderSettings, RenderedPage};

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)(?:\s+#+)?\s*$").unwrap());
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Renders through the spider.cloud API, which runs the browser remotely and
/// hands back markdown.
pub struct SpiderRenderer {
    spider: Spider,
    settings: RenderSettings,
}

impl SpiderRenderer {
    pub fn new(api_key: &str, settings: RenderSettings) -> anyhow::Result<Self> {
        let spider = Spider::new(Some(api_key.to_string()))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self { spider, settings })
    }
}

#[async_trait]
impl PageRenderer for SpiderRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = tokio::time::timeout(
            self.settings.timeout,
            self.spider.scrape_url(url, Some(params), "application/json"),
        )
        .await
        .map_err(|_| RenderError::Timeout)?
        .map_err(|e| RenderError::Navigation(e.to_string()))?;
        debug!("spider answered {} in {}ms", url, start.elapsed().as_millis());

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .and_then(|s| u16::try_from(s).ok());
        let markdown = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| RenderError::Other(anyhow!("No content in spider response")))?;

        let mut page = split_markdown(&strip_images(markdown));
        page.http_status = status;
        Ok(page)
    }
}

/// Pull ATX headings out as heading texts; everything else, heading text
/// included without its `#` marks, becomes the body.
pub fn split_markdown(md: &str) -> RenderedPage {
    let mut headings = Vec::new();
    let mut body = Vec::new();
    for line in md.lines() {
        let trimmed = line.trim();
        match HEADING_RE.captures(trimmed) {
            Some(caps) => {
                let text = caps[2].to_string();
                if caps[1].len() <= 3 {
                    headings.push(text.clone());
                }
                body.push(text);
            }
            None => body.push(trimmed.to_string()),
        }
    }
    let title = headings.first().cloned();
    RenderedPage {
        http_status: None,
        title,
        headings,
        body: body.join("\n").trim().to_string(),
    }
}

/// Remove markdown image syntax: ![alt](url) and [![alt](url)](link)
fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

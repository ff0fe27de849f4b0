use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{PageRenderer, RenderError, RenderSettings, RenderedPage};

const HEADING_SELECTOR: &str = "h1, h2, h3";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";
const NAV_STATUS_JS: &str = "(() => { const e = performance.getEntriesByType('navigation')[0]; \
                             return e && e.responseStatus ? e.responseStatus : 0; })()";

/// Local headless Chrome. One browser per render, always closed afterwards.
pub struct ChromiumRenderer {
    settings: RenderSettings,
}

impl ChromiumRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    fn browser_config() -> Result<BrowserConfig, RenderError> {
        BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--lang=ja-JP")
            .build()
            .map_err(|e| RenderError::Other(anyhow!("browser config: {}", e)))
    }

    async fn load(&self, browser: &Browser, url: &str) -> Result<RenderedPage, RenderError> {
        let page = browser
            .new_page("about:blank")
            .await
            .context("opening tab")?;
        page.goto(url)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        if !wait_for_heading(&page, self.settings.settle).await {
            debug!("no heading after {:?} on {}, reading what is there", self.settings.settle, url);
        }

        let mut headings = Vec::new();
        for el in page.find_elements(HEADING_SELECTOR).await.unwrap_or_default() {
            if let Ok(Some(text)) = el.inner_text().await {
                headings.push(text);
            }
        }

        let body: String = page
            .evaluate(BODY_TEXT_JS)
            .await
            .context("reading body text")?
            .into_value()
            .context("body text was not a string")?;

        let http_status = match page.evaluate(NAV_STATUS_JS).await {
            Ok(v) => v.into_value::<u16>().ok().filter(|s| *s > 0),
            Err(_) => None,
        };
        let title = page.get_title().await.ok().flatten();

        Ok(RenderedPage {
            http_status,
            title,
            headings,
            body,
        })
    }
}

/// Polls for a heading until `settle` runs out. Missing headings are not an
/// error; the caller extracts from whatever text exists.
async fn wait_for_heading(page: &Page, settle: Duration) -> bool {
    let deadline = Instant::now() + settle;
    loop {
        if page.find_element(HEADING_SELECTOR).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError> {
        let (mut browser, mut handler) = Browser::launch(Self::browser_config()?)
            .await
            .context("launching browser")?;

        let events = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let result = tokio::time::timeout(self.settings.timeout, self.load(&browser, url))
            .await
            .unwrap_or(Err(RenderError::Timeout));

        if let Err(e) = browser.close().await {
            warn!("browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        events.abort();

        result
    }
}

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::{Element, Page};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::Result;

const SELECTOR_POLL: Duration = Duration::from_millis(100);
const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// One browser tab.
#[derive(Clone)]
pub struct BrowserPage {
    page: Page,
    settle: Duration,
}

impl BrowserPage {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Extra wait after navigation for client-side rendering to settle.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub(crate) fn inner(&self) -> &Page {
        &self.page
    }

    pub async fn goto_and_wait_stable(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        sleep(self.settle).await;
        debug!(url, "Page navigation settled");
        Ok(())
    }

    /// Call `script`, a JS function expression, with JSON `args`.
    /// `undefined` results come back as `null`.
    pub async fn evaluate(&self, script: &str, args: &[Value]) -> Result<Value> {
        let args = args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let expression = format!("({script})({args})");
        let result = self.page.evaluate(expression.as_str()).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    pub async fn query_selector(&self, selector: &str) -> Result<Option<BrowserElement>> {
        Ok(self.query_selector_all(selector).await?.into_iter().next())
    }

    pub async fn query_selector_all(&self, selector: &str) -> Result<Vec<BrowserElement>> {
        let elements = self.page.find_elements(selector).await?;
        Ok(elements.into_iter().map(BrowserElement).collect())
    }

    /// Poll until `selector` matches or `timeout` elapses. Checks at least once.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.page.find_elements(selector).await?.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(SELECTOR_POLL).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

pub struct BrowserElement(Element);

impl BrowserElement {
    pub async fn bounding_box(&self) -> Result<ElementBounds> {
        let bounds = self.0.bounding_box().await?;
        Ok(ElementBounds {
            x: bounds.x,
            y: bounds.y,
            width: bounds.width,
            height: bounds.height,
        })
    }

    /// PNG capture of just this element.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.0.screenshot(CaptureScreenshotFormat::Png).await?)
    }

    pub async fn attribute(&self, name: &str) -> Result<Option<String>> {
        Ok(self.0.attribute(name).await?)
    }

    pub async fn scroll_into_view(&self) -> Result<()> {
        self.0.scroll_into_view().await?;
        Ok(())
    }
}

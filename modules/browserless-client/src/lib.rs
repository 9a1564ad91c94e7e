pub mod error;
mod network;
mod page;

pub use error::{BrowserlessError, Result};
pub use network::CapturedResponse;
pub use page::{BrowserElement, BrowserPage, ElementBounds};

use std::time::Duration;

use chromiumoxide::Browser;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: String,
}

impl BrowserlessClient {
    /// `base_url` is either an http(s) DevTools/Browserless endpoint or a
    /// ws(s) URL that is used as-is.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    /// Resolve the browser's DevTools websocket URL.
    pub async fn websocket_url(&self) -> Result<String> {
        if self.base_url.starts_with("ws://") || self.base_url.starts_with("wss://") {
            return Ok(self.with_token(&self.base_url));
        }

        let endpoint = self.with_token(&format!("{}/json/version", self.base_url));
        let resp = self.client.get(&endpoint).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let version: VersionInfo = resp.json().await?;
        Ok(self.with_token(&version.web_socket_debugger_url))
    }

    /// Connect over CDP and keep the protocol handler running in the background.
    pub async fn connect(&self) -> Result<BrowserSession> {
        let ws_url = self.websocket_url().await?;
        info!(endpoint = self.base_url.as_str(), "Connecting to remote browser");

        let (browser, mut handler) = Browser::connect(ws_url).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    warn!(error = %err, "Browser handler event error");
                }
            }
            debug!("Browser handler exited");
        });

        Ok(BrowserSession {
            browser,
            handler_task,
        })
    }

    fn with_token(&self, url: &str) -> String {
        match self.token {
            Some(ref token) if !url.contains("token=") => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}token={token}")
            }
            _ => url.to_string(),
        }
    }
}

/// A live CDP connection. Dropping it stops the protocol handler.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    /// First open tab, or a new blank one when the browser has none.
    pub async fn page(&self) -> Result<BrowserPage> {
        let mut pages = self.browser.pages().await?;
        if pages.is_empty() {
            return self.new_page("about:blank").await;
        }
        Ok(BrowserPage::new(pages.remove(0)))
    }

    pub async fn new_page(&self, url: &str) -> Result<BrowserPage> {
        let page = self.browser.new_page(url).await?;
        Ok(BrowserPage::new(page))
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

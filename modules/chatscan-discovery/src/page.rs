// Page-automation boundary.
//
// ChatPage is everything the discovery pipeline needs from a browser tab.
// BrowserPage (remote Chromium over CDP) implements it here; tests use
// testing::ScriptedPage.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use browserless_client::{BrowserElement, BrowserPage};

pub use browserless_client::ElementBounds;

/// A response body observed on the page's own traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub url: String,
    pub body: String,
    pub is_base64: bool,
}

/// Which responses the network source cares about.
#[derive(Debug, Clone)]
pub struct NetworkScope {
    pub host: String,
    pub keywords: Vec<String>,
}

impl NetworkScope {
    pub fn new(host: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            host: host.into(),
            keywords,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        if !url.starts_with("https://") || !url.contains(&self.host) {
            return false;
        }
        let lower = url.to_lowercase();
        self.keywords.is_empty() || self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

#[async_trait]
pub trait ChatPage: Send + Sync {
    async fn goto_and_wait_stable(&self, url: &str) -> Result<()>;

    async fn query_selector(&self, selector: &str) -> Result<Option<Box<dyn PageElement>>>;

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Box<dyn PageElement>>>;

    /// Call a JS function expression with JSON arguments.
    async fn evaluate(&self, script: &str, args: &[Value]) -> Result<Value>;

    /// Whether `selector` matched before `timeout` elapsed.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Subscribe to in-scope response bodies. The stream stays open until
    /// dropped.
    async fn observe_network(&self, scope: NetworkScope)
        -> Result<BoxStream<'static, NetworkResponse>>;
}

#[async_trait]
pub trait PageElement: Send + Sync {
    async fn bounding_box(&self) -> Result<ElementBounds>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn attribute(&self, name: &str) -> Result<Option<String>>;

    async fn scroll_into_view(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Remote Chromium
// ---------------------------------------------------------------------------

#[async_trait]
impl ChatPage for BrowserPage {
    async fn goto_and_wait_stable(&self, url: &str) -> Result<()> {
        Ok(BrowserPage::goto_and_wait_stable(self, url).await?)
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<Box<dyn PageElement>>> {
        let element = BrowserPage::query_selector(self, selector).await?;
        Ok(element.map(|e| Box::new(e) as Box<dyn PageElement>))
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Box<dyn PageElement>>> {
        let elements = BrowserPage::query_selector_all(self, selector).await?;
        Ok(elements
            .into_iter()
            .map(|e| Box::new(e) as Box<dyn PageElement>)
            .collect())
    }

    async fn evaluate(&self, script: &str, args: &[Value]) -> Result<Value> {
        Ok(BrowserPage::evaluate(self, script, args).await?)
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        Ok(BrowserPage::wait_for_selector(self, selector, timeout).await?)
    }

    async fn observe_network(
        &self,
        scope: NetworkScope,
    ) -> Result<BoxStream<'static, NetworkResponse>> {
        let rx = self.observe_responses(move |url| scope.matches(url)).await?;
        let responses = futures::stream::unfold(rx, |mut rx| async move {
            let captured = rx.recv().await?;
            let response = NetworkResponse {
                url: captured.url,
                body: captured.body,
                is_base64: captured.is_base64,
            };
            Some((response, rx))
        });
        Ok(responses.boxed())
    }
}

#[async_trait]
impl PageElement for BrowserElement {
    async fn bounding_box(&self) -> Result<ElementBounds> {
        Ok(BrowserElement::bounding_box(self).await?)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(BrowserElement::screenshot(self).await?)
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>> {
        Ok(BrowserElement::attribute(self, name).await?)
    }

    async fn scroll_into_view(&self) -> Result<()> {
        Ok(BrowserElement::scroll_into_view(self).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> NetworkScope {
        NetworkScope::new(
            "web.whatsapp.com",
            vec!["chat".into(), "conversation".into()],
        )
    }

    #[test]
    fn scope_requires_https_host_and_keyword() {
        let scope = scope();
        assert!(scope.matches("https://web.whatsapp.com/api/chats?page=1"));
        assert!(scope.matches("https://web.whatsapp.com/Conversation/list"));
        assert!(!scope.matches("http://web.whatsapp.com/api/chats"));
        assert!(!scope.matches("https://cdn.example.com/chats"));
        assert!(!scope.matches("https://web.whatsapp.com/static/app.js"));
    }

    #[test]
    fn empty_keyword_list_accepts_any_url_on_host() {
        let scope = NetworkScope::new("web.whatsapp.com", vec![]);
        assert!(scope.matches("https://web.whatsapp.com/static/app.js"));
    }
}

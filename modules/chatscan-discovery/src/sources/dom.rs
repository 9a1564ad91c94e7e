use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chatscan_common::{ChatScanError, DiscoveryConfig, Metadata, RawEntity, Result, SourceKind};

use super::{CompletionReason, EntitySource};
use crate::page::ChatPage;

/// Prefix of synthetic ids minted when an element carries no usable id.
pub const FALLBACK_ID_PREFIX: &str = "dom_chat_";

/// Chat list containers, most specific first.
pub const CONTAINER_SELECTORS: [&str; 4] = [
    r#"div[data-testid="chatlist"]"#,
    r#"div[role="listbox"]"#,
    r#"div[aria-label*="Chat"]"#,
    "#pane-side",
];

/// Chat row candidates. The selector matching the most elements wins.
pub const ITEM_SELECTORS: [&str; 7] = [
    r#"div[data-testid="cell-frame-container"]"#,
    r#"div[role="row"]"#,
    r#"div[data-testid="chat"]"#,
    r#"div[aria-label*="chat"]"#,
    r#"div[role="listbox"] > div"#,
    r#"div[role="list"] > div"#,
    r#"#pane-side div[role="listitem"]"#,
];

pub const SCROLL_TO_TOP_SCRIPT: &str = r#"(selectors) => {
    const list = selectors.map((s) => document.querySelector(s)).find((el) => el);
    if (!list) return false;
    list.scrollTop = 0;
    list.dispatchEvent(new Event('scroll'));
    return true;
}"#;

/// Scrolls the list by most of a viewport and reports where it ended up.
pub const SCROLL_SCRIPT: &str = r#"(selectors) => {
    const list = selectors.map((s) => document.querySelector(s)).find((el) => el);
    if (!list) return { found: false, scrolled: false, atBottom: false };
    const before = list.scrollTop;
    list.scrollTop = before + Math.max(200, list.clientHeight * 0.8);
    list.dispatchEvent(new Event('scroll'));
    return {
        found: true,
        scrolled: list.scrollTop > before,
        atBottom: list.scrollTop + list.clientHeight >= list.scrollHeight - 300,
        scrollTop: list.scrollTop,
        scrollHeight: list.scrollHeight
    };
}"#;

/// Describes every chat row currently rendered. Identity is decided in Rust.
pub const EXTRACT_SCRIPT: &str = r#"(selectors) => {
    let rows = [];
    let matched = null;
    for (const selector of selectors) {
        const found = Array.from(document.querySelectorAll(selector));
        if (found.length > rows.length) {
            rows = found;
            matched = selector;
        }
    }
    if (rows.length === 0) {
        rows = Array.from(document.querySelectorAll('div[tabindex="-1"], div[data-id]'))
            .filter((el) => el.querySelector('span[title]'));
        matched = 'heuristic';
    }
    const attr = (el, name) => (el && el.getAttribute(name)) || null;
    return rows.map((el, index) => {
        const nested = el.querySelector('[data-id], [data-chat-id]');
        const link = el.querySelector('a[href]') || (el.closest ? el.closest('a[href]') : null);
        const titled = el.querySelector('span[title]') || el.querySelector('[title]');
        const img = el.querySelector('img[src]');
        const badge = el.querySelector('[data-testid="icon-unread-count"], span[aria-label*="unread"]');
        const text = (el.innerText || el.textContent || '').trim();
        return {
            index,
            selector: matched,
            dataId: attr(el, 'data-id'),
            dataChatId: attr(el, 'data-chat-id'),
            nestedId: nested ? (attr(nested, 'data-id') || attr(nested, 'data-chat-id')) : null,
            href: attr(link, 'href'),
            ariaLabel: attr(el, 'aria-label'),
            title: attr(titled, 'title'),
            text: text.length > 0 ? text.slice(0, 200) : null,
            hasGroupIcon: !!el.querySelector('[data-testid="default-group"], [data-icon="default-group"]'),
            avatarSrc: attr(img, 'src'),
            unreadText: badge ? (badge.textContent || attr(badge, 'aria-label')) : null
        };
    });
}"#;

static RE_LINK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+@[cg]\.us|[^/?#@]+@broadcast|\d+)/?(?:[?#].*)?$").unwrap());
static RE_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

const GROUP_WORDS: [&str; 2] = ["group", "групп"];
const MAX_TEXT_NAME_LEN: usize = 100;

/// One rendered chat row as reported by [`EXTRACT_SCRIPT`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomRecord {
    pub index: usize,
    pub selector: Option<String>,
    pub data_id: Option<String>,
    pub data_chat_id: Option<String>,
    pub nested_id: Option<String>,
    pub href: Option<String>,
    pub aria_label: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub has_group_icon: bool,
    pub avatar_src: Option<String>,
    pub unread_text: Option<String>,
}

impl DomRecord {
    /// Display name: label prefix, then title, then the first short text line.
    pub fn name(&self) -> Option<String> {
        let from_label = self
            .aria_label
            .as_deref()
            .and_then(|label| label.split(',').next());
        let from_text = self
            .text
            .as_deref()
            .and_then(|text| text.lines().next())
            .filter(|line| line.chars().count() < MAX_TEXT_NAME_LEN);

        [from_label, self.title.as_deref(), from_text]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map(String::from)
    }

    /// Id carried by the markup itself. Labels and text never count.
    pub fn structural_id(&self) -> Option<String> {
        let attribute = [&self.data_id, &self.data_chat_id, &self.nested_id]
            .into_iter()
            .flatten()
            .map(|id| id.trim())
            .find(|id| !id.is_empty())
            .map(String::from);

        attribute.or_else(|| {
            let href = self.href.as_deref()?;
            RE_LINK_ID
                .captures(href)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
    }

    pub fn is_group(&self) -> Option<bool> {
        let labelled = self.aria_label.as_deref().is_some_and(|label| {
            let label = label.to_lowercase();
            GROUP_WORDS.iter().any(|w| label.contains(w))
        });
        (self.has_group_icon || labelled).then_some(true)
    }

    pub fn unread_count(&self) -> Option<u32> {
        let text = self.unread_text.as_deref()?;
        RE_DIGITS.find(text).and_then(|m| m.as_str().parse().ok())
    }
}

/// Stable synthetic id from the chat name and its row position.
pub fn fallback_id(name: &str, index: usize) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("{FALLBACK_ID_PREFIX}{}_{index}", &hex::encode(digest)[..16])
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScrollOutcome {
    found: bool,
    scrolled: bool,
    at_bottom: bool,
}

/// Last-resort source: scrolls the rendered chat list and scrapes rows.
pub struct DomSource {
    page: Arc<dyn ChatPage>,
    config: DiscoveryConfig,
    seen_ids: HashSet<String>,
    reached_bottom: bool,
    consecutive_empty_batches: u32,
    scroll_iterations: u32,
    batches: u32,
    completion_logged: bool,
}

impl DomSource {
    pub fn new(page: Arc<dyn ChatPage>, config: DiscoveryConfig) -> Self {
        Self {
            page,
            config,
            seen_ids: HashSet::new(),
            reached_bottom: false,
            consecutive_empty_batches: 0,
            scroll_iterations: 0,
            batches: 0,
            completion_logged: false,
        }
    }

    fn selectors(list: &[&str]) -> Value {
        json!(list)
    }

    /// One scroll step. Returns whether the list actually moved.
    async fn scroll_for_more(&mut self) -> bool {
        let value = match self
            .page
            .evaluate(SCROLL_SCRIPT, &[Self::selectors(&CONTAINER_SELECTORS)])
            .await
        {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "Scroll step failed");
                return false;
            }
        };
        let outcome: ScrollOutcome = serde_json::from_value(value).unwrap_or_default();
        if !outcome.found {
            debug!("Chat list container vanished during scroll");
        }
        if outcome.at_bottom && !self.reached_bottom {
            debug!(scroll_iterations = self.scroll_iterations, "Reached bottom of chat list");
            self.reached_bottom = true;
        }
        if outcome.scrolled {
            self.scroll_iterations += 1;
        }
        outcome.scrolled
    }

    async fn scroll_phase(&mut self) {
        if self.reached_bottom || self.consecutive_empty_batches >= self.config.dom_stuck_batches {
            return;
        }
        for _ in 0..self.config.dom_scrolls_per_batch {
            if self.scroll_iterations >= self.config.dom_max_scroll_iterations {
                break;
            }
            if self.scroll_for_more().await {
                sleep(self.config.dom_scroll_settle).await;
            } else if self.reached_bottom {
                break;
            } else {
                sleep(self.config.dom_idle_wait).await;
            }
        }
    }

    async fn extract(&self) -> Result<Vec<DomRecord>> {
        let value = self
            .page
            .evaluate(EXTRACT_SCRIPT, &[Self::selectors(&ITEM_SELECTORS)])
            .await
            .map_err(|e| ChatScanError::Extraction(format!("chat list scrape failed: {e}")))?;
        let Value::Array(rows) = value else {
            return Err(ChatScanError::Extraction(
                "chat list scrape returned a non-array value".to_string(),
            ));
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<DomRecord>(row) {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!(error = %err, "Skipping unreadable chat row");
                    None
                }
            })
            .collect())
    }

    fn reason(&self) -> Option<CompletionReason> {
        if self.reached_bottom && self.consecutive_empty_batches >= self.config.dom_bottom_quiet_batches
        {
            Some(CompletionReason::BottomReached)
        } else if self.consecutive_empty_batches >= self.config.dom_stuck_batches {
            Some(CompletionReason::Stuck)
        } else if self.scroll_iterations >= self.config.dom_max_scroll_iterations {
            Some(CompletionReason::ScrollCeiling)
        } else {
            None
        }
    }
}

fn to_raw(record: DomRecord, name: String, id: String) -> RawEntity {
    let mut raw_payload = Metadata::new();
    raw_payload.insert("row_index".into(), json!(record.index));
    raw_payload.insert("selector".into(), json!(record.selector));
    raw_payload.insert("synthetic_id".into(), json!(id.starts_with(FALLBACK_ID_PREFIX)));

    let (primary_id, secondary_id) = if id.contains('@') {
        (Some(id), None)
    } else {
        (None, Some(id))
    };

    RawEntity::builder()
        .source(SourceKind::Dom)
        .primary_id(primary_id)
        .secondary_id(secondary_id)
        .name(name)
        .is_group(record.is_group())
        .unread_count(record.unread_count())
        .avatar_url(record.avatar_src.clone().filter(|src| !src.trim().is_empty()))
        .raw_payload(raw_payload)
        .extracted_at(Utc::now())
        .build()
}

#[async_trait]
impl EntitySource for DomSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Dom
    }

    async fn init(&mut self) -> Result<()> {
        let mut container = None;
        for selector in CONTAINER_SELECTORS {
            match self
                .page
                .wait_for_selector(selector, self.config.dom_container_timeout)
                .await
            {
                Ok(true) => {
                    container = Some(selector);
                    break;
                }
                Ok(false) => debug!(selector, "Chat list container not present"),
                Err(err) => debug!(selector, error = %err, "Container lookup failed"),
            }
        }
        let Some(container) = container else {
            return Err(ChatScanError::unavailable(
                SourceKind::Dom,
                "chat list container not found",
            ));
        };

        if let Ok(Some(list)) = self.page.query_selector(container).await {
            if let Err(err) = list.scroll_into_view().await {
                debug!(error = %err, "Could not scroll chat list into view");
            }
            match list.bounding_box().await {
                Ok(bounds) if bounds.width <= 0.0 || bounds.height <= 0.0 => {
                    warn!(container, "Chat list container has no visible area");
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "Chat list bounds unavailable"),
            }
        }

        if let Err(err) = self
            .page
            .evaluate(SCROLL_TO_TOP_SCRIPT, &[Self::selectors(&CONTAINER_SELECTORS)])
            .await
        {
            debug!(error = %err, "Could not reset chat list scroll position");
        }

        info!(container, "DOM scraping ready");
        Ok(())
    }

    async fn fetch_batch(&mut self) -> Result<Vec<RawEntity>> {
        self.scroll_phase().await;
        let records = self.extract().await?;
        self.batches += 1;

        let rendered = records.len();
        let mut fresh = Vec::new();
        for record in records {
            let Some(name) = record.name() else {
                continue;
            };
            let id = record
                .structural_id()
                .unwrap_or_else(|| fallback_id(&name, record.index));
            if self.seen_ids.insert(id.clone()) {
                fresh.push(to_raw(record, name, id));
            }
        }

        if fresh.is_empty() {
            self.consecutive_empty_batches += 1;
        } else {
            self.consecutive_empty_batches = 0;
            // Rows past the old bottom mean the list grew.
            self.reached_bottom = false;
        }

        debug!(
            batch = self.batches,
            rendered,
            new = fresh.len(),
            seen = self.seen_ids.len(),
            empty_streak = self.consecutive_empty_batches,
            reached_bottom = self.reached_bottom,
            "DOM batch"
        );
        Ok(fresh)
    }

    async fn is_complete(&mut self) -> Result<bool> {
        let Some(reason) = self.reason() else {
            return Ok(false);
        };
        if !self.completion_logged {
            self.completion_logged = true;
            info!(
                %reason,
                seen = self.seen_ids.len(),
                scroll_iterations = self.scroll_iterations,
                batches = self.batches,
                "DOM scraping complete"
            );
        }
        Ok(true)
    }

    async fn total_expected(&mut self) -> Result<Option<usize>> {
        Ok(None)
    }

    fn completion_reason(&self) -> Option<CompletionReason> {
        self.reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DomRecord {
        DomRecord::default()
    }

    #[test]
    fn name_prefers_label_prefix_then_title_then_text() {
        let mut r = record();
        r.aria_label = Some("Alice, 3 unread messages".into());
        r.title = Some("Alice Title".into());
        assert_eq!(r.name().as_deref(), Some("Alice"));

        r.aria_label = None;
        assert_eq!(r.name().as_deref(), Some("Alice Title"));

        r.title = None;
        r.text = Some("Bob\n10:42\nsee you".into());
        assert_eq!(r.name().as_deref(), Some("Bob"));
    }

    #[test]
    fn long_text_is_not_a_name() {
        let mut r = record();
        r.text = Some("x".repeat(150));
        assert_eq!(r.name(), None);
    }

    #[test]
    fn structural_id_uses_attributes_before_links() {
        let mut r = record();
        r.href = Some("/chat/4915@c.us".into());
        assert_eq!(r.structural_id().as_deref(), Some("4915@c.us"));

        r.nested_id = Some("false_123@g.us".into());
        assert_eq!(r.structural_id().as_deref(), Some("false_123@g.us"));

        r.data_id = Some(" 777@c.us ".into());
        assert_eq!(r.structural_id().as_deref(), Some("777@c.us"));
    }

    #[test]
    fn only_id_shaped_link_segments_count() {
        let mut r = record();
        for href in ["/send?phone=1", "/chat/", "https://web.whatsapp.com/", "/profile/alice"] {
            r.href = Some(href.into());
            assert_eq!(r.structural_id(), None, "{href}");
        }

        r.href = Some("/chat/status@broadcast".into());
        assert_eq!(r.structural_id().as_deref(), Some("status@broadcast"));

        r.href = Some("/chat/4915551234?ref=list".into());
        assert_eq!(r.structural_id().as_deref(), Some("4915551234"));
    }

    #[test]
    fn labels_never_provide_identity() {
        let mut r = record();
        r.aria_label = Some("123456@c.us".into());
        r.text = Some("123456@c.us".into());
        assert_eq!(r.structural_id(), None);
    }

    #[test]
    fn fallback_ids_are_stable_per_name_and_position() {
        let a = fallback_id("Alice", 2);
        assert_eq!(a, fallback_id("Alice", 2));
        assert_ne!(a, fallback_id("Alice", 3));
        assert_ne!(a, fallback_id("Bob", 2));
        assert!(a.starts_with(FALLBACK_ID_PREFIX));
        assert!(a.ends_with("_2"));
    }

    #[test]
    fn group_and_unread_hints() {
        let mut r = record();
        assert_eq!(r.is_group(), None);
        r.aria_label = Some("Family Group, 2 members".into());
        assert_eq!(r.is_group(), Some(true));

        r.unread_text = Some("12 unread messages".into());
        assert_eq!(r.unread_count(), Some(12));
    }

    #[test]
    fn ids_with_at_sign_become_primary() {
        let mut r = record();
        r.data_id = Some("555@c.us".into());
        let raw = to_raw(r.clone(), "Eve".into(), "555@c.us".into());
        assert_eq!(raw.primary_id.as_deref(), Some("555@c.us"));
        assert!(raw.secondary_id.is_none());

        let synthetic = fallback_id("Eve", 0);
        let raw = to_raw(r, "Eve".into(), synthetic.clone());
        assert_eq!(raw.secondary_id.as_deref(), Some(synthetic.as_str()));
        assert_eq!(raw.raw_payload["synthetic_id"], true);
    }
}

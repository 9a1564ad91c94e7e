// Test doubles for the discovery pipeline.
//
// Three mocks matching the trait boundaries:
// - MockSource (EntitySource): scripted batches, completion and failures
// - MockSourceFactory (SourceFactory): hands out registered MockSources by kind
// - ScriptedPage (ChatPage): per-script evaluate responses, fake selectors
//   and canned network traffic
//
// Plus helpers for building raw chats, network responses and DOM rows.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};

use chatscan_common::{ChatScanError, RawEntity, Result, SourceKind};

use crate::page::{ChatPage, ElementBounds, NetworkResponse, NetworkScope, PageElement};
use crate::sources::{EntitySource, SourceFactory};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A raw chat with `id` in the primary slot when it has a domain part,
/// otherwise in the alternate slot.
pub fn raw_chat(source: SourceKind, id: &str, name: &str) -> RawEntity {
    let mut raw = RawEntity::builder()
        .source(source)
        .name(name.to_string())
        .build();
    if id.contains('@') {
        raw.primary_id = Some(id.to_string());
    } else {
        raw.secondary_id = Some(id.to_string());
    }
    raw
}

pub fn json_response(url: &str, payload: Value) -> NetworkResponse {
    NetworkResponse {
        url: url.to_string(),
        body: payload.to_string(),
        is_base64: false,
    }
}

pub fn base64_response(url: &str, payload: Value) -> NetworkResponse {
    NetworkResponse {
        url: url.to_string(),
        body: BASE64.encode(payload.to_string()),
        is_base64: true,
    }
}

/// A row as the DOM extraction script reports it.
pub fn dom_row(index: usize, data_id: Option<&str>, label: &str) -> Value {
    json!({
        "index": index,
        "selector": "div[role=\"row\"]",
        "dataId": data_id,
        "ariaLabel": label,
        "hasGroupIcon": false,
    })
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

enum InitOutcome {
    Ready,
    Unavailable(String),
    Failure(String),
}

enum Batch {
    Chats(Vec<RawEntity>),
    Extraction(String),
    Fatal(String),
}

enum CompleteWhen {
    Never,
    Always,
    AfterFetches(usize),
    Drained,
}

/// Scripted source. Builder pattern: `.batch()`, `.always_complete()`,
/// `.total()`, `.unavailable()`. Empty batches once the script runs out.
pub struct MockSource {
    kind: SourceKind,
    init: InitOutcome,
    batches: VecDeque<Batch>,
    complete: CompleteWhen,
    total: Option<usize>,
    failing_queries: bool,
    fetches: usize,
    cleanups: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            init: InitOutcome::Ready,
            batches: VecDeque::new(),
            complete: CompleteWhen::Never,
            total: None,
            failing_queries: false,
            fetches: 0,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn batch(mut self, chats: Vec<RawEntity>) -> Self {
        self.batches.push_back(Batch::Chats(chats));
        self
    }

    /// A batch that fails with an extraction error.
    pub fn failing_batch(mut self, message: &str) -> Self {
        self.batches.push_back(Batch::Extraction(message.to_string()));
        self
    }

    /// A batch that fails with an error the run cannot absorb.
    pub fn fatal_batch(mut self, message: &str) -> Self {
        self.batches.push_back(Batch::Fatal(message.to_string()));
        self
    }

    pub fn always_complete(mut self) -> Self {
        self.complete = CompleteWhen::Always;
        self
    }

    pub fn complete_after(mut self, fetches: usize) -> Self {
        self.complete = CompleteWhen::AfterFetches(fetches);
        self
    }

    /// Complete once every scripted batch has been fetched.
    pub fn complete_when_drained(mut self) -> Self {
        self.complete = CompleteWhen::Drained;
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn unavailable(mut self, reason: &str) -> Self {
        self.init = InitOutcome::Unavailable(reason.to_string());
        self
    }

    pub fn failing_init(mut self, message: &str) -> Self {
        self.init = InitOutcome::Failure(message.to_string());
        self
    }

    /// `is_complete` and `total_expected` both error.
    pub fn failing_queries(mut self) -> Self {
        self.failing_queries = true;
        self
    }

    /// Shared counter of `cleanup` calls, readable after the source is boxed.
    pub fn cleanup_counter(&self) -> Arc<AtomicUsize> {
        self.cleanups.clone()
    }
}

#[async_trait]
impl EntitySource for MockSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn init(&mut self) -> Result<()> {
        match &self.init {
            InitOutcome::Ready => Ok(()),
            InitOutcome::Unavailable(reason) => Err(ChatScanError::unavailable(self.kind, reason.clone())),
            InitOutcome::Failure(message) => Err(ChatScanError::Anyhow(anyhow!(message.clone()))),
        }
    }

    async fn fetch_batch(&mut self) -> Result<Vec<RawEntity>> {
        self.fetches += 1;
        match self.batches.pop_front() {
            Some(Batch::Chats(chats)) => Ok(chats),
            Some(Batch::Extraction(message)) => Err(ChatScanError::Extraction(message)),
            Some(Batch::Fatal(message)) => Err(ChatScanError::RunFailure(message)),
            None => Ok(Vec::new()),
        }
    }

    async fn is_complete(&mut self) -> Result<bool> {
        if self.failing_queries {
            return Err(ChatScanError::Extraction("completion query failed".into()));
        }
        Ok(match self.complete {
            CompleteWhen::Never => false,
            CompleteWhen::Always => true,
            CompleteWhen::AfterFetches(n) => self.fetches >= n,
            CompleteWhen::Drained => self.fetches > 0 && self.batches.is_empty(),
        })
    }

    async fn total_expected(&mut self) -> Result<Option<usize>> {
        if self.failing_queries {
            return Err(ChatScanError::Extraction("total query failed".into()));
        }
        Ok(self.total)
    }

    async fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockSourceFactory
// ---------------------------------------------------------------------------

/// Hands out each registered source once. Unregistered kinds yield `None`.
#[derive(Default)]
pub struct MockSourceFactory {
    sources: Mutex<HashMap<SourceKind, MockSource>>,
    created: Mutex<Vec<SourceKind>>,
}

impl MockSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, source: MockSource) -> Self {
        self.sources.lock().unwrap().insert(source.kind, source);
        self
    }

    /// Kinds requested so far, in order.
    pub fn created(&self) -> Vec<SourceKind> {
        self.created.lock().unwrap().clone()
    }
}

impl SourceFactory for MockSourceFactory {
    fn create(&self, kind: SourceKind) -> Option<Box<dyn EntitySource>> {
        self.created.lock().unwrap().push(kind);
        let source = self.sources.lock().unwrap().remove(&kind)?;
        Some(Box::new(source))
    }
}

// ---------------------------------------------------------------------------
// ScriptedPage
// ---------------------------------------------------------------------------

/// In-memory page. Each script keeps a queue of responses; the last one
/// repeats. Scripts without responses evaluate to `null`.
#[derive(Default)]
pub struct ScriptedPage {
    responses: Mutex<HashMap<String, VecDeque<std::result::Result<Value, String>>>>,
    calls: Mutex<HashMap<String, usize>>,
    selectors: HashSet<String>,
    network: Mutex<Vec<(Duration, NetworkResponse)>>,
    network_unavailable: bool,
    visited: Mutex<Vec<String>>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_evaluate(self, script: &str, value: Value) -> Self {
        self.push(script, Ok(value));
        self
    }

    pub fn on_evaluate_error(self, script: &str, message: &str) -> Self {
        self.push(script, Err(message.to_string()));
        self
    }

    /// Make `selector` match one element.
    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selectors.insert(selector.to_string());
        self
    }

    pub fn with_network(self, responses: Vec<NetworkResponse>) -> Self {
        self.network
            .lock()
            .unwrap()
            .extend(responses.into_iter().map(|r| (Duration::ZERO, r)));
        self
    }

    /// Queue `response` to arrive `delay` after the previous one.
    pub fn with_delayed_response(self, delay: Duration, response: NetworkResponse) -> Self {
        self.network.lock().unwrap().push((delay, response));
        self
    }

    pub fn without_network(mut self) -> Self {
        self.network_unavailable = true;
        self
    }

    pub fn evaluations(&self, script: &str) -> usize {
        self.calls.lock().unwrap().get(script).copied().unwrap_or(0)
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }

    fn push(&self, script: &str, response: std::result::Result<Value, String>) {
        self.responses
            .lock()
            .unwrap()
            .entry(script.to_string())
            .or_default()
            .push_back(response);
    }
}

#[async_trait]
impl ChatPage for ScriptedPage {
    async fn goto_and_wait_stable(&self, url: &str) -> anyhow::Result<()> {
        self.visited.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn query_selector(&self, selector: &str) -> anyhow::Result<Option<Box<dyn PageElement>>> {
        Ok(self
            .selectors
            .contains(selector)
            .then(|| Box::new(ScriptedElement) as Box<dyn PageElement>))
    }

    async fn query_selector_all(&self, selector: &str) -> anyhow::Result<Vec<Box<dyn PageElement>>> {
        Ok(self.query_selector(selector).await?.into_iter().collect())
    }

    async fn evaluate(&self, script: &str, _args: &[Value]) -> anyhow::Result<Value> {
        *self.calls.lock().unwrap().entry(script.to_string()).or_default() += 1;

        let mut responses = self.responses.lock().unwrap();
        let Some(queue) = responses.get_mut(script) else {
            return Ok(Value::Null);
        };
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match response {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Value::Null),
        }
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> anyhow::Result<bool> {
        Ok(self.selectors.contains(selector))
    }

    async fn observe_network(
        &self,
        _scope: NetworkScope,
    ) -> anyhow::Result<BoxStream<'static, NetworkResponse>> {
        if self.network_unavailable {
            return Err(anyhow!("network domain disabled"));
        }
        let responses = std::mem::take(&mut *self.network.lock().unwrap());
        Ok(futures::stream::iter(responses)
            .then(|(delay, response)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                response
            })
            .chain(futures::stream::pending())
            .boxed())
    }
}

struct ScriptedElement;

#[async_trait]
impl PageElement for ScriptedElement {
    async fn bounding_box(&self) -> anyhow::Result<ElementBounds> {
        Ok(ElementBounds {
            x: 0.0,
            y: 0.0,
            width: 320.0,
            height: 640.0,
        })
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn attribute(&self, _name: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn scroll_into_view(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

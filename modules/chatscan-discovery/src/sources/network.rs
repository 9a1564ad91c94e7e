use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use chatscan_common::{ChatScanError, DiscoveryConfig, Metadata, RawEntity, Result, SourceKind};

use super::{CompletionReason, EntitySource};
use crate::page::{ChatPage, NetworkResponse, NetworkScope};

/// Containers a chat list may be wrapped in.
const LIST_KEYS: [&str; 3] = ["chats", "conversations", "data"];

/// Entities and announced total found in one response payload.
#[derive(Debug, Default)]
pub struct ParsedPayload {
    pub entities: Vec<(String, RawEntity)>,
    pub total: Option<usize>,
}

/// Extract chats from a JSON payload. Unknown shapes yield nothing.
pub fn parse_payload(payload: &Value, url: &str) -> ParsedPayload {
    let (items, total) = match payload {
        Value::Array(items) => (Some(items), None),
        Value::Object(map) => {
            let items = LIST_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array));
            let total = ["total", "count"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_u64))
                .and_then(|t| usize::try_from(t).ok());
            (items, total)
        }
        _ => (None, None),
    };

    let entities = items
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|chat| parse_chat(chat, url))
        .collect();

    ParsedPayload { entities, total }
}

fn parse_chat(chat: &Map<String, Value>, url: &str) -> Option<(String, RawEntity)> {
    let id_object = chat.get("id").and_then(Value::as_object);
    let chat_id = match chat.get("id") {
        Some(Value::Object(id)) => serialized_id(id),
        Some(other) => scalar(other),
        None => None,
    }
    .or_else(|| chat.get("jid").and_then(scalar))
    .or_else(|| chat.get("wid").and_then(scalar))
    .filter(|id| !id.trim().is_empty())?;

    let server_id = id_object
        .and_then(|id| id.get("server_id"))
        .and_then(scalar)
        .or_else(|| (!chat_id.contains('@')).then(|| chat_id.clone()));
    let user_id = id_object.and_then(|id| id.get("user")).and_then(scalar);

    let name = chat
        .get("name")
        .and_then(scalar)
        .or_else(|| chat.get("contact")?.get("name").and_then(scalar));
    let is_group = chat
        .get("isGroup")
        .or_else(|| chat.get("isGroupChat"))
        .and_then(Value::as_bool);
    let unread_count = chat
        .get("unreadCount")
        .or_else(|| chat.get("unread"))
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
    let avatar_url = chat
        .get("avatar")
        .or_else(|| chat.get("profilePicUrl"))
        .and_then(scalar);

    let mut raw_payload = Metadata::new();
    raw_payload.insert("url".into(), json!(url));
    raw_payload.insert("source".into(), json!("network_response"));

    let entity = RawEntity::builder()
        .source(SourceKind::Network)
        .primary_id(chat_id.contains('@').then(|| chat_id.clone()))
        .secondary_id(chat.get("wid").and_then(scalar))
        .network_server_id(server_id)
        .network_user_id(user_id)
        .name(name)
        .is_group(is_group)
        .unread_count(unread_count)
        .avatar_url(avatar_url)
        .raw_payload(raw_payload)
        .extracted_at(Utc::now())
        .build();

    Some((chat_id, entity))
}

fn serialized_id(id: &Map<String, Value>) -> Option<String> {
    if let Some(serialized) = id.get("_serialized").and_then(scalar) {
        return Some(serialized);
    }
    let user = id.get("user").and_then(scalar)?;
    match id.get("server").and_then(scalar) {
        Some(server) => Some(format!("{user}@{server}")),
        None => Some(user),
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn same_content(a: &RawEntity, b: &RawEntity) -> bool {
    RawEntity {
        extracted_at: None,
        ..a.clone()
    } == RawEntity {
        extracted_at: None,
        ..b.clone()
    }
}

/// Harvests chat payloads from the page's own traffic.
pub struct NetworkSource {
    page: Arc<dyn ChatPage>,
    config: DiscoveryConfig,
    responses: Option<BoxStream<'static, NetworkResponse>>,
    stream_ended: bool,
    /// Last version handed out per id.
    delivered: HashMap<String, RawEntity>,
    /// Arrived since the previous fetch.
    pending: BTreeMap<String, RawEntity>,
    total: Option<usize>,
}

impl NetworkSource {
    pub fn new(page: Arc<dyn ChatPage>, config: DiscoveryConfig) -> Self {
        Self {
            page,
            config,
            responses: None,
            stream_ended: false,
            delivered: HashMap::new(),
            pending: BTreeMap::new(),
            total: None,
        }
    }

    fn ingest(&mut self, response: NetworkResponse) {
        let body = if response.is_base64 {
            match BASE64.decode(response.body.trim()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    debug!(url = response.url.as_str(), error = %err, "Undecodable response body");
                    return;
                }
            }
        } else {
            response.body
        };

        let payload: Value = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(_) => {
                debug!(url = response.url.as_str(), "Ignoring non-JSON response");
                return;
            }
        };

        let parsed = parse_payload(&payload, &response.url);
        if let Some(total) = parsed.total {
            self.total = Some(total);
        }
        if !parsed.entities.is_empty() {
            debug!(
                url = response.url.as_str(),
                count = parsed.entities.len(),
                "Captured chats from network"
            );
        }

        for (id, entity) in parsed.entities {
            let unchanged = self
                .delivered
                .get(&id)
                .is_some_and(|previous| same_content(previous, &entity));
            if !unchanged {
                self.pending.insert(id, entity);
            }
        }
    }

    /// Take whatever responses are already buffered without waiting.
    fn drain_ready(&mut self) {
        let Some(mut responses) = self.responses.take() else {
            return;
        };
        while let Some(next) = responses.next().now_or_never() {
            match next {
                Some(response) => self.ingest(response),
                None => {
                    self.stream_ended = true;
                    break;
                }
            }
        }
        self.responses = Some(responses);
    }

    /// Wait up to `network_wait_checks * network_wait_interval` for a chat
    /// payload. Unrelated in-scope traffic is ingested without ending the wait.
    async fn wait_for_traffic(&mut self) {
        let Some(mut responses) = self.responses.take() else {
            return;
        };
        let budget = self.config.network_wait_interval * self.config.network_wait_checks;
        let deadline = Instant::now() + budget;
        let mut received = 0usize;
        while self.pending.is_empty() {
            match timeout_at(deadline, responses.next()).await {
                Ok(Some(response)) => {
                    self.ingest(response);
                    received += 1;
                }
                Ok(None) => {
                    self.stream_ended = true;
                    break;
                }
                Err(_) => {
                    debug!(waited = ?budget, responses = received, "No chat payload before deadline");
                    break;
                }
            }
        }
        self.responses = Some(responses);
    }
}

#[async_trait]
impl EntitySource for NetworkSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Network
    }

    async fn init(&mut self) -> Result<()> {
        let scope = NetworkScope::new(
            self.config.network_host.clone(),
            self.config.network_keywords.clone(),
        );
        let responses = self.page.observe_network(scope).await.map_err(|e| {
            ChatScanError::unavailable(
                SourceKind::Network,
                format!("network instrumentation unavailable: {e}"),
            )
        })?;
        self.responses = Some(responses);
        info!(host = self.config.network_host.as_str(), "Network interception active");
        Ok(())
    }

    async fn fetch_batch(&mut self) -> Result<Vec<RawEntity>> {
        if self.responses.is_none() {
            return Err(ChatScanError::Extraction(
                "network source used before init".to_string(),
            ));
        }

        self.drain_ready();
        if self.pending.is_empty() && !self.stream_ended {
            self.wait_for_traffic().await;
            self.drain_ready();
        }

        let batch: Vec<RawEntity> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(id, entity)| {
                self.delivered.insert(id, entity.clone());
                entity
            })
            .collect();

        if batch.is_empty() {
            debug!(collected = self.delivered.len(), "No new chats on the wire");
        } else {
            info!(
                count = batch.len(),
                collected = self.delivered.len(),
                total = ?self.total,
                "Network batch"
            );
        }
        Ok(batch)
    }

    async fn is_complete(&mut self) -> Result<bool> {
        Ok(self
            .total
            .is_some_and(|total| self.delivered.len() >= total))
    }

    async fn total_expected(&mut self) -> Result<Option<usize>> {
        Ok(self.total)
    }

    fn completion_reason(&self) -> Option<CompletionReason> {
        self.total
            .filter(|total| self.delivered.len() >= *total)
            .map(|_| CompletionReason::TotalReached)
    }

    async fn cleanup(&mut self) {
        if self.responses.take().is_some() {
            debug!("Network interception detached");
        }
        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "Discarding undelivered network chats");
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chatscan_common::{ChatScanError, DiscoveryConfig, Metadata, RawEntity, Result, SourceKind};

use super::{CompletionReason, EntitySource};
use crate::page::ChatPage;

/// Reports whether the in-page store is readable and how many chats it holds.
pub const PROBE_SCRIPT: &str = r#"() => {
    const store = window.Store || (window.WWebJS && window.WWebJS.Store) || null;
    if (!store) {
        return { available: false, reason: 'window.Store not found', totalCount: 0, storeKeys: [] };
    }
    const storeKeys = Object.keys(store).slice(0, 50);
    const chat = store.Chat;
    if (!chat) {
        return { available: false, reason: 'Store.Chat not found', totalCount: 0, storeKeys };
    }
    const models = chat.models || chat._models
        || (typeof chat.getModelsArray === 'function' ? chat.getModelsArray() : null);
    if (!Array.isArray(models)) {
        return { available: false, reason: 'Store.Chat models not readable', totalCount: 0, storeKeys };
    }
    return { available: true, reason: null, totalCount: models.length, storeKeys };
}"#;

/// Reads every chat model in one pass.
pub const FETCH_SCRIPT: &str = r#"() => {
    const store = window.Store || (window.WWebJS && window.WWebJS.Store) || null;
    const chat = store && store.Chat;
    if (!chat) return [];
    const models = chat.models || chat._models
        || (typeof chat.getModelsArray === 'function' ? chat.getModelsArray() : []);
    const serialize = (id) => {
        if (!id) return null;
        if (typeof id === 'string') return id;
        if (id._serialized) return id._serialized;
        if (id.user && id.server) return id.user + '@' + id.server;
        return id.user ? String(id.user) : null;
    };
    return models.map((m, index) => {
        const jid = serialize(m.id);
        const contact = m.contact || {};
        const thumb = contact.profilePicThumbObj || m.profilePicThumbObj || {};
        return {
            jid,
            wid: m.id && m.id.user ? String(m.id.user) : null,
            name: m.name || m.formattedTitle || contact.name || contact.pushname || null,
            isGroup: typeof m.isGroup === 'boolean' ? m.isGroup : null,
            unreadCount: typeof m.unreadCount === 'number' ? Math.max(0, Math.floor(m.unreadCount)) : 0,
            avatarUrl: thumb.eurl || thumb.img || null,
            rawData: {
                hasId: !!m.id,
                hasContact: !!m.contact,
                hasName: !!m.name,
                idType: typeof m.id,
                chatIndex: index
            }
        };
    });
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreProbe {
    #[serde(default)]
    available: bool,
    reason: Option<String>,
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    store_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreRecord {
    jid: Option<String>,
    wid: Option<String>,
    name: Option<String>,
    is_group: Option<bool>,
    unread_count: Option<u32>,
    avatar_url: Option<String>,
    #[serde(default)]
    raw_data: Metadata,
}

impl StoreRecord {
    fn into_raw(self, extracted_at: DateTime<Utc>) -> RawEntity {
        RawEntity::builder()
            .source(SourceKind::Store)
            .primary_id(self.jid)
            .secondary_id(self.wid)
            .name(self.name)
            .is_group(self.is_group)
            .unread_count(self.unread_count)
            .avatar_url(self.avatar_url)
            .raw_payload(self.raw_data)
            .extracted_at(extracted_at)
            .build()
    }
}

/// Reads chats straight from the client's in-memory application state.
pub struct StoreSource {
    page: Arc<dyn ChatPage>,
    config: DiscoveryConfig,
    total_count: Option<usize>,
    fetched: bool,
}

impl StoreSource {
    pub fn new(page: Arc<dyn ChatPage>, config: DiscoveryConfig) -> Self {
        Self {
            page,
            config,
            total_count: None,
            fetched: false,
        }
    }

    async fn probe(&self) -> Result<StoreProbe> {
        let value = self.page.evaluate(PROBE_SCRIPT, &[]).await?;
        serde_json::from_value(value)
            .map_err(|e| ChatScanError::Extraction(format!("unreadable store probe: {e}")))
    }
}

#[async_trait]
impl EntitySource for StoreSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Store
    }

    async fn init(&mut self) -> Result<()> {
        let attempts = self.config.store_init_attempts.max(1);
        let mut reason = String::from("store probe never ran");
        let mut store_keys = Vec::new();

        for attempt in 0..attempts {
            match self.probe().await {
                Ok(probe) if probe.available => {
                    info!(
                        attempt = attempt + 1,
                        total = probe.total_count,
                        "State store available"
                    );
                    self.total_count = Some(probe.total_count);
                    return Ok(());
                }
                Ok(probe) => {
                    reason = probe.reason.unwrap_or_else(|| "store not ready".to_string());
                    store_keys = probe.store_keys;
                    debug!(attempt = attempt + 1, reason = reason.as_str(), "State store not ready");
                }
                Err(err) => {
                    reason = err.to_string();
                    debug!(attempt = attempt + 1, error = %err, "State store probe failed");
                }
            }
            if attempt + 1 < attempts {
                sleep(self.config.store_backoff(attempt)).await;
            }
        }

        warn!(
            attempts,
            reason = reason.as_str(),
            store_keys = ?store_keys,
            "State store unavailable"
        );
        Err(ChatScanError::unavailable(SourceKind::Store, reason))
    }

    async fn fetch_batch(&mut self) -> Result<Vec<RawEntity>> {
        let value = self
            .page
            .evaluate(FETCH_SCRIPT, &[])
            .await
            .map_err(|e| ChatScanError::Extraction(format!("store read failed: {e}")))?;
        let Value::Array(records) = value else {
            return Err(ChatScanError::Extraction(
                "store read returned a non-array value".to_string(),
            ));
        };

        let now = Utc::now();
        let mut entities = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<StoreRecord>(record) {
                Ok(record) => entities.push(record.into_raw(now)),
                Err(err) => warn!(index, error = %err, "Skipping unreadable store record"),
            }
        }

        if let Some(total) = self.total_count {
            if entities.len() < total {
                warn!(
                    collected = entities.len(),
                    total,
                    "State store returned fewer chats than it reported"
                );
            }
        }

        info!(count = entities.len(), "Read chats from state store");
        self.fetched = true;
        Ok(entities)
    }

    async fn is_complete(&mut self) -> Result<bool> {
        Ok(self.fetched)
    }

    async fn total_expected(&mut self) -> Result<Option<usize>> {
        Ok(self.total_count)
    }

    fn completion_reason(&self) -> Option<CompletionReason> {
        self.fetched.then_some(CompletionReason::Snapshot)
    }
}

// Entity sources.
//
// Each source wraps one way of reading the chat list (state store, network
// traffic, rendered DOM) behind EntitySource. The selector and orchestrator
// only ever see the trait; SourceFactory builds concrete sources on demand.

pub mod dom;
pub mod network;
pub mod store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use chatscan_common::{DiscoveryConfig, RawEntity, Result, SourceKind};

use crate::page::ChatPage;

pub use dom::DomSource;
pub use network::NetworkSource;
pub use store::StoreSource;

/// Why a source declared itself finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// One full read of the state store.
    Snapshot,
    /// Collected count reached the total announced on the wire.
    TotalReached,
    /// List bottom reached and nothing new for several batches.
    BottomReached,
    /// Nothing new for many batches, bottom never confirmed.
    Stuck,
    /// Scroll-iteration ceiling hit.
    ScrollCeiling,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionReason::Snapshot => write!(f, "snapshot"),
            CompletionReason::TotalReached => write!(f, "total_reached"),
            CompletionReason::BottomReached => write!(f, "bottom_reached"),
            CompletionReason::Stuck => write!(f, "stuck"),
            CompletionReason::ScrollCeiling => write!(f, "scroll_ceiling"),
        }
    }
}

#[async_trait]
pub trait EntitySource: Send {
    fn kind(&self) -> SourceKind;

    /// Probe availability. Fails with `SourceUnavailable` when the backing
    /// primitive cannot be reached.
    async fn init(&mut self) -> Result<()>;

    /// Zero or more newly discovered entities.
    async fn fetch_batch(&mut self) -> Result<Vec<RawEntity>>;

    /// True once the source asserts nothing more exists.
    async fn is_complete(&mut self) -> Result<bool>;

    async fn total_expected(&mut self) -> Result<Option<usize>>;

    fn completion_reason(&self) -> Option<CompletionReason> {
        None
    }

    async fn cleanup(&mut self) {}
}

/// Builds sources by kind. `None` when the kind cannot be served.
pub trait SourceFactory: Send + Sync {
    fn create(&self, kind: SourceKind) -> Option<Box<dyn EntitySource>>;
}

/// Builds the page-backed sources for one browser tab.
pub struct PageSourceFactory {
    page: Arc<dyn ChatPage>,
    config: DiscoveryConfig,
}

impl PageSourceFactory {
    pub fn new(page: Arc<dyn ChatPage>, config: DiscoveryConfig) -> Self {
        Self { page, config }
    }
}

impl SourceFactory for PageSourceFactory {
    fn create(&self, kind: SourceKind) -> Option<Box<dyn EntitySource>> {
        let page = self.page.clone();
        let config = self.config.clone();
        match kind {
            SourceKind::Store => Some(Box::new(StoreSource::new(page, config))),
            SourceKind::Network => Some(Box::new(NetworkSource::new(page, config))),
            SourceKind::Dom => Some(Box::new(DomSource::new(page, config))),
            SourceKind::Unknown => None,
        }
    }
}

use serde_json::{json, Value};
use tracing::{info, warn};

use chatscan_common::{ChatScanError, Metadata, Result, SourceKind};

use crate::sources::{EntitySource, SourceFactory};

/// Preference order: state store, then network, then DOM.
pub const SELECTION_ORDER: [SourceKind; 3] = [SourceKind::Store, SourceKind::Network, SourceKind::Dom];

/// An initialized source ready to be drained.
pub struct SelectedSource {
    pub source: Box<dyn EntitySource>,
    pub degraded: bool,
    pub metadata: Metadata,
}

/// Picks the most reliable source that initializes.
pub struct SourceSelector<'a> {
    factory: &'a dyn SourceFactory,
}

impl<'a> SourceSelector<'a> {
    pub fn new(factory: &'a dyn SourceFactory) -> Self {
        Self { factory }
    }

    pub async fn select_source(&self) -> Result<SelectedSource> {
        let mut attempted: Vec<Value> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for kind in SELECTION_ORDER {
            let Some(mut source) = self.factory.create(kind) else {
                attempted.push(attempt(kind, "unavailable", "not configured"));
                errors.push(format!("{kind}: not configured"));
                continue;
            };

            match source.init().await {
                Ok(()) => {
                    let degraded = kind.is_degraded();
                    let reason = match kind {
                        SourceKind::Store => "state store available",
                        SourceKind::Network => "state store unavailable, using network interception",
                        _ => "higher-priority sources unavailable, scraping DOM",
                    };
                    attempted.push(attempt(kind, "success", reason));
                    info!(source = %kind, degraded, "Selected chat source");

                    let mut metadata = Metadata::new();
                    metadata.insert("attempted_sources".into(), Value::Array(attempted));
                    metadata.insert("selected_source".into(), json!(kind));
                    metadata.insert("selection_reason".into(), json!(reason));
                    metadata.insert("errors".into(), json!(errors));
                    return Ok(SelectedSource {
                        source,
                        degraded,
                        metadata,
                    });
                }
                Err(err) => {
                    let status = if err.is_unavailable() {
                        warn!(source = %kind, reason = %err, "Chat source unavailable");
                        "unavailable"
                    } else {
                        warn!(source = %kind, error = %err, "Chat source failed unexpectedly");
                        "error"
                    };
                    attempted.push(attempt(kind, status, &err.to_string()));
                    errors.push(format!("{kind}: {err}"));
                    source.cleanup().await;
                }
            }
        }

        let mut selection = Metadata::new();
        selection.insert("attempted_sources".into(), Value::Array(attempted));
        selection.insert("selected_source".into(), Value::Null);
        selection.insert("errors".into(), json!(errors));
        Err(ChatScanError::AllSourcesUnavailable { errors, selection })
    }
}

fn attempt(kind: SourceKind, status: &str, reason: &str) -> Value {
    json!({
        "source": kind,
        "priority": kind.priority(),
        "status": status,
        "reason": reason,
    })
}

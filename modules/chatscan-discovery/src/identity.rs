use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use chatscan_common::{Anomaly, CanonicalEntity, ChatScanError, Integrity, RawEntity, Result, SourceKind};

use crate::sources::dom::FALLBACK_ID_PREFIX;

/// Id prefixes minted by scrapers rather than read from the application.
const WEAK_ID_PREFIXES: [&str; 2] = [FALLBACK_ID_PREFIX, "chat_"];

/// Decides which candidate field identifies a chat and audits the result set.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// First usable id in priority order: serialized application id (must
    /// contain `@`), alternate id, network server id, network user id.
    pub fn extract_id(&self, raw: &RawEntity) -> Option<String> {
        if let Some(primary) = non_blank(&raw.primary_id) {
            if primary.contains('@') {
                return Some(primary.to_string());
            }
            warn!(
                id = primary,
                source = %raw.source,
                "Primary id has no domain part, trying other candidates"
            );
        }

        if let Some(secondary) = non_blank(&raw.secondary_id) {
            if raw.source == SourceKind::Dom && secondary.starts_with(FALLBACK_ID_PREFIX) {
                debug!(id = secondary, "Using synthetic DOM id");
            }
            return Some(secondary.to_string());
        }

        if let Some(id) = non_blank(&raw.network_server_id).or_else(|| non_blank(&raw.network_user_id)) {
            return Some(id.to_string());
        }

        warn!(
            source = %raw.source,
            name = raw.name.as_deref().unwrap_or("(unnamed)"),
            candidates = ?raw.id_candidates(),
            "No usable id for chat"
        );
        None
    }

    /// [`IdentityResolver::extract_id`] as a fallible lookup.
    pub fn require_id(&self, raw: &RawEntity) -> Result<String> {
        self.extract_id(raw)
            .ok_or_else(|| ChatScanError::IdentityUnresolved {
                name: raw.name.clone(),
                kind: raw.source,
            })
    }

    /// Rejects blank ids. Synthetic ids pass but are weak.
    pub fn validate_id(&self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        if is_weak_id(id) {
            debug!(id, "Weak synthetic id");
        }
        true
    }

    /// Cross-check every observation of the run. Output order is
    /// deterministic: invalid ids in input order, then per-id conflicts
    /// sorted by id, then potential duplicates sorted by name.
    pub fn detect_ambiguities(&self, entities: &[CanonicalEntity]) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = entities
            .iter()
            .filter(|e| !self.validate_id(&e.id))
            .map(|e| Anomaly::InvalidId {
                entity_id: e.id.clone(),
                entity_name: e.name.clone(),
                source: e.source,
                integrity: e.integrity,
            })
            .collect();

        let mut by_id: BTreeMap<&str, Vec<&CanonicalEntity>> = BTreeMap::new();
        for entity in entities {
            by_id.entry(entity.id.as_str()).or_default().push(entity);
        }

        for (id, group) in by_id.iter().filter(|(_, g)| g.len() > 1) {
            let sources = distinct(group.iter().map(|e| e.source));
            let names = distinct(group.iter().filter_map(|e| e.name.clone()));
            if names.len() > 1 {
                anomalies.push(Anomaly::NameConflict {
                    entity_id: id.to_string(),
                    names,
                    sources: sources.clone(),
                    count: group.len(),
                });
            }
            let types = distinct(group.iter().map(|e| e.entity_type));
            if types.len() > 1 {
                anomalies.push(Anomaly::TypeConflict {
                    entity_id: id.to_string(),
                    types,
                    sources: sources.clone(),
                    count: group.len(),
                });
            }
            let integrities = distinct(group.iter().map(|e| e.integrity));
            if integrities.len() > 1 {
                anomalies.push(Anomaly::IntegrityConflict {
                    entity_id: id.to_string(),
                    integrities,
                    sources,
                    count: group.len(),
                });
            }
        }

        let mut by_name: BTreeMap<&str, Vec<&CanonicalEntity>> = BTreeMap::new();
        for entity in entities {
            if let Some(name) = entity.name.as_deref() {
                by_name.entry(name).or_default().push(entity);
            }
        }

        for (name, group) in by_name {
            let verified_ids = distinct(
                group
                    .iter()
                    .filter(|e| e.integrity == Integrity::Verified)
                    .map(|e| e.id.as_str()),
            );
            if verified_ids.len() > 1 {
                let ids = distinct(group.iter().map(|e| e.id.clone()));
                anomalies.push(Anomaly::PotentialDuplicate {
                    entity_name: name.to_string(),
                    entity_ids: ids,
                    sources: distinct(group.iter().map(|e| e.source)),
                    count: group.len(),
                });
            }
        }

        if !anomalies.is_empty() {
            warn!(count = anomalies.len(), "Identity anomalies detected");
        }
        anomalies
    }

    /// Whether every id occurs once, plus the sorted ids that repeat.
    pub fn validate_uniqueness(&self, entities: &[CanonicalEntity]) -> (bool, Vec<String>) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entity in entities {
            *counts.entry(entity.id.as_str()).or_default() += 1;
        }

        let mut repeated: Vec<String> = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(id, _)| id.to_string())
            .collect();
        repeated.sort();

        if !repeated.is_empty() {
            warn!(duplicates = ?repeated, "Duplicate chat ids observed");
        }
        (repeated.is_empty(), repeated)
    }
}

pub fn is_weak_id(id: &str) -> bool {
    WEAK_ID_PREFIXES.iter().any(|p| id.starts_with(p))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn distinct<T: Ord>(values: impl Iterator<Item = T>) -> Vec<T> {
    values.collect::<BTreeSet<_>>().into_iter().collect()
}

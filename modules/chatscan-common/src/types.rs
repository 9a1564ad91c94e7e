use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Free-form JSON object attached to entities and results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Where a chat was discovered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// In-page application state object.
    Store,
    /// The page's own intercepted traffic.
    Network,
    /// Rendered chat list.
    Dom,
    #[serde(other)]
    Unknown,
}

impl SourceKind {
    /// Selection order: lower is tried first.
    pub fn priority(self) -> u8 {
        match self {
            SourceKind::Store => 1,
            SourceKind::Network => 2,
            SourceKind::Dom => 3,
            SourceKind::Unknown => u8::MAX,
        }
    }

    /// Any run not backed by the state store is degraded.
    pub fn is_degraded(self) -> bool {
        !matches!(self, SourceKind::Store)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Store => "store",
            SourceKind::Network => "network",
            SourceKind::Dom => "dom",
            SourceKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Personal,
    Group,
    Broadcast,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Personal => write!(f, "personal"),
            EntityType::Group => write!(f, "group"),
            EntityType::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// How much an entity's identity can be trusted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Integrity {
    Verified,
    Fallback,
    Ambiguous,
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Integrity::Verified => write!(f, "verified"),
            Integrity::Fallback => write!(f, "fallback"),
            Integrity::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Partial,
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completeness::Complete => write!(f, "complete"),
            Completeness::Partial => write!(f, "partial"),
        }
    }
}

// ---------------------------------------------------------------------------
// RawEntity
// ---------------------------------------------------------------------------

/// One chat as a single source saw it, before any identity or type decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RawEntity {
    pub source: SourceKind,
    /// Serialized application id (`<digits>@c.us` and friends).
    #[builder(default, setter(into))]
    pub primary_id: Option<String>,
    /// Alternate id: store wid, DOM data attribute or synthetic fallback.
    #[builder(default, setter(into))]
    pub secondary_id: Option<String>,
    #[builder(default, setter(into))]
    pub network_server_id: Option<String>,
    #[builder(default, setter(into))]
    pub network_user_id: Option<String>,
    #[builder(default, setter(into))]
    pub name: Option<String>,
    #[builder(default, setter(into))]
    pub is_group: Option<bool>,
    #[builder(default, setter(into))]
    pub unread_count: Option<u32>,
    #[builder(default, setter(into))]
    pub avatar_url: Option<String>,
    #[builder(default)]
    pub raw_payload: Metadata,
    #[builder(default, setter(into))]
    pub extracted_at: Option<DateTime<Utc>>,
}

impl RawEntity {
    /// Non-blank id candidates in resolution order.
    pub fn id_candidates(&self) -> Vec<&str> {
        [
            &self.primary_id,
            &self.secondary_id,
            &self.network_server_id,
            &self.network_user_id,
        ]
        .into_iter()
        .filter_map(|c| c.as_deref())
        .filter(|c| !c.trim().is_empty())
        .collect()
    }
}

// ---------------------------------------------------------------------------
// CanonicalEntity
// ---------------------------------------------------------------------------

/// A normalized chat. Two entities are equal when their ids are.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CanonicalEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub source: SourceKind,
    pub integrity: Integrity,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub unread_count: u32,
    #[serde(default)]
    pub raw_data: Metadata,
}

impl CanonicalEntity {
    pub fn is_group(&self) -> bool {
        self.entity_type == EntityType::Group
    }

    /// Compact view handed to API consumers.
    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            entity_type: self.entity_type,
            avatar: self.avatar.clone(),
            message_count: self.unread_count,
            is_group: self.is_group(),
            source: self.source,
            integrity: self.integrity,
        }
    }
}

impl PartialEq for CanonicalEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CanonicalEntity {}

impl Hash for CanonicalEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntitySummary {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub avatar: Option<String>,
    pub message_count: u32,
    pub is_group: bool,
    pub source: SourceKind,
    pub integrity: Integrity,
}

// ---------------------------------------------------------------------------
// Anomaly
// ---------------------------------------------------------------------------

/// A consistency problem found while assembling a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    InvalidId {
        entity_id: String,
        entity_name: Option<String>,
        source: SourceKind,
        integrity: Integrity,
    },
    NameConflict {
        entity_id: String,
        names: Vec<String>,
        sources: Vec<SourceKind>,
        count: usize,
    },
    TypeConflict {
        entity_id: String,
        types: Vec<EntityType>,
        sources: Vec<SourceKind>,
        count: usize,
    },
    IntegrityConflict {
        entity_id: String,
        integrities: Vec<Integrity>,
        sources: Vec<SourceKind>,
        count: usize,
    },
    PotentialDuplicate {
        entity_name: String,
        entity_ids: Vec<String>,
        sources: Vec<SourceKind>,
        count: usize,
    },
    DuplicateIds {
        duplicate_ids: Vec<String>,
        count: usize,
    },
    ParsingError {
        error: String,
    },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::InvalidId { .. } => "invalid_id",
            Anomaly::NameConflict { .. } => "name_conflict",
            Anomaly::TypeConflict { .. } => "type_conflict",
            Anomaly::IntegrityConflict { .. } => "integrity_conflict",
            Anomaly::PotentialDuplicate { .. } => "potential_duplicate",
            Anomaly::DuplicateIds { .. } => "duplicate_ids",
            Anomaly::ParsingError { .. } => "parsing_error",
        }
    }
}

// ---------------------------------------------------------------------------
// ParsingResult
// ---------------------------------------------------------------------------

/// One published view of a discovery run, intermediate or terminal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParsingResult {
    pub entities: Vec<CanonicalEntity>,
    pub completeness: Completeness,
    pub collected: usize,
    pub expected: Option<usize>,
    pub missing_count: usize,
    pub source_type: SourceKind,
    pub source_degraded: bool,
    pub anomalies: Vec<Anomaly>,
    pub metadata: Metadata,
}

impl ParsingResult {
    /// `collected` and `missing_count` are derived from `entities` and
    /// `expected`. A `Complete` claim that falls short of `expected` is
    /// recorded as `Partial`.
    pub fn new(
        entities: Vec<CanonicalEntity>,
        completeness: Completeness,
        expected: Option<usize>,
        source_type: SourceKind,
        source_degraded: bool,
    ) -> Self {
        let collected = entities.len();
        let completeness = match expected {
            Some(total) if collected < total => Completeness::Partial,
            _ => completeness,
        };
        Self {
            entities,
            completeness,
            collected,
            expected,
            missing_count: expected.map_or(0, |total| total.saturating_sub(collected)),
            source_type,
            source_degraded,
            anomalies: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    /// Share of the expected total collected so far, in percent.
    pub fn completeness_percentage(&self) -> Option<f64> {
        match self.expected {
            Some(total) if total > 0 => Some(self.collected as f64 / total as f64 * 100.0),
            _ => None,
        }
    }

    pub fn has_anomaly(&self, kind: &str) -> bool {
        self.anomalies.iter().any(|a| a.kind() == kind)
    }
}

/// JSON schema for one streamed result.
pub fn parsing_result_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ParsingResult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, name: &str) -> CanonicalEntity {
        CanonicalEntity {
            id: id.to_string(),
            entity_type: EntityType::Personal,
            source: SourceKind::Store,
            integrity: Integrity::Verified,
            name: Some(name.to_string()),
            avatar: None,
            unread_count: 0,
            raw_data: Metadata::new(),
        }
    }

    #[test]
    fn entities_compare_by_id_only() {
        let a = entity("a@c.us", "Alice");
        let b = entity("a@c.us", "Alice (work)");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn id_candidates_skip_blank_fields_and_keep_order() {
        let raw = RawEntity::builder()
            .source(SourceKind::Network)
            .primary_id("  ".to_string())
            .network_server_id("srv-1".to_string())
            .network_user_id("4915".to_string())
            .build();

        assert_eq!(raw.id_candidates(), vec!["srv-1", "4915"]);
    }

    #[test]
    fn short_complete_claim_is_recorded_as_partial() {
        let entities = vec![entity("a@c.us", "A"), entity("b@c.us", "B")];
        let result = ParsingResult::new(
            entities,
            Completeness::Complete,
            Some(5),
            SourceKind::Store,
            false,
        );

        assert_eq!(result.completeness, Completeness::Partial);
        assert_eq!(result.collected, 2);
        assert_eq!(result.missing_count, 3);
        assert_eq!(result.completeness_percentage(), Some(40.0));
    }

    #[test]
    fn percentage_is_absent_without_a_total() {
        let result = ParsingResult::new(vec![], Completeness::Complete, None, SourceKind::Dom, true);
        assert!(result.is_complete());
        assert_eq!(result.completeness_percentage(), None);
        assert_eq!(result.missing_count, 0);
    }

    #[test]
    fn anomalies_serialize_with_a_type_tag() {
        let anomaly = Anomaly::NameConflict {
            entity_id: "a@c.us".into(),
            names: vec!["Alice".into(), "Alicia".into()],
            sources: vec![SourceKind::Store],
            count: 2,
        };
        let value = serde_json::to_value(&anomaly).unwrap();
        assert_eq!(value["type"], "name_conflict");
        assert_eq!(value["entity_id"], "a@c.us");
        assert_eq!(anomaly.kind(), "name_conflict");
    }

    #[test]
    fn unknown_source_names_deserialize_as_unknown() {
        let kind: SourceKind = serde_json::from_value(json!("file_upload")).unwrap();
        assert_eq!(kind, SourceKind::Unknown);
        assert!(SourceKind::Network.is_degraded());
        assert!(!SourceKind::Store.is_degraded());
    }

    #[test]
    fn summary_reports_unread_as_message_count() {
        let mut e = entity("g@g.us", "Team");
        e.entity_type = EntityType::Group;
        e.unread_count = 4;

        let value = serde_json::to_value(e.summary()).unwrap();
        assert_eq!(value["message_count"], 4);
        assert_eq!(value["is_group"], true);
        assert_eq!(value["type"], "group");
    }
}

use tracing::{debug, warn};

use chatscan_common::{CanonicalEntity, EntityType, Integrity, RawEntity, SourceKind};

use crate::identity::IdentityResolver;

const GROUP_SUFFIX: &str = "@g.us";
const PERSONAL_SUFFIX: &str = "@c.us";
const BROADCAST_SUFFIX: &str = "@broadcast";

/// Entities that survived identity resolution, plus how many did not.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub entities: Vec<CanonicalEntity>,
    pub dropped: usize,
}

/// Turns raw observations into canonical entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityNormalizer;

impl EntityNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Explicit flag first, then the id suffix conventions.
    pub fn determine_type(&self, raw: &RawEntity) -> EntityType {
        match raw.is_group {
            Some(true) => return EntityType::Group,
            Some(false) => return EntityType::Personal,
            None => {}
        }

        if let Some(primary) = raw.primary_id.as_deref() {
            if primary.ends_with(GROUP_SUFFIX) {
                return EntityType::Group;
            }
            if primary.ends_with(PERSONAL_SUFFIX) {
                return EntityType::Personal;
            }
            if primary.ends_with(BROADCAST_SUFFIX) {
                return EntityType::Broadcast;
            }
        }

        if let Some(secondary) = raw.secondary_id.as_deref() {
            if secondary.contains(GROUP_SUFFIX) {
                return EntityType::Group;
            }
            if secondary.contains(BROADCAST_SUFFIX) {
                return EntityType::Broadcast;
            }
        }

        EntityType::Personal
    }

    pub fn determine_integrity(&self, raw: &RawEntity) -> Integrity {
        let has_reliable_id = raw.primary_id.is_some() || raw.secondary_id.is_some();
        match raw.source {
            SourceKind::Store if has_reliable_id => Integrity::Verified,
            SourceKind::Store => {
                warn!(
                    name = raw.name.as_deref().unwrap_or("(unnamed)"),
                    "Store chat without a store id"
                );
                Integrity::Fallback
            }
            SourceKind::Network if !raw.id_candidates().is_empty() => Integrity::Verified,
            SourceKind::Network => Integrity::Fallback,
            SourceKind::Dom => Integrity::Fallback,
            SourceKind::Unknown => {
                warn!("Chat from an unknown source");
                Integrity::Ambiguous
            }
        }
    }

    /// Build the canonical form under an already resolved `id`.
    pub fn normalize(&self, raw: &RawEntity, id: String) -> CanonicalEntity {
        CanonicalEntity {
            id,
            entity_type: self.determine_type(raw),
            source: raw.source,
            integrity: self.determine_integrity(raw),
            name: trimmed(&raw.name),
            avatar: trimmed(&raw.avatar_url),
            unread_count: raw.unread_count.unwrap_or(0),
            raw_data: raw.raw_payload.clone(),
        }
    }

    /// `None` when no id can be resolved; the entity is dropped.
    pub fn normalize_with_id(
        &self,
        raw: &RawEntity,
        resolver: &IdentityResolver,
    ) -> Option<CanonicalEntity> {
        let id = resolver.extract_id(raw)?;
        Some(self.normalize(raw, id))
    }

    pub fn normalize_batch(&self, raws: Vec<RawEntity>, resolver: &IdentityResolver) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in &raws {
            match resolver.require_id(raw) {
                Ok(id) => batch.entities.push(self.normalize(raw, id)),
                Err(err) => {
                    debug!(error = %err, "Dropping chat");
                    batch.dropped += 1;
                }
            }
        }
        if batch.dropped > 0 {
            warn!(
                dropped = batch.dropped,
                kept = batch.entities.len(),
                "Dropped chats without a usable id"
            );
        }
        batch
    }
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(source: SourceKind) -> RawEntity {
        RawEntity::builder().source(source).build()
    }

    #[test]
    fn explicit_flag_beats_suffix() {
        let n = EntityNormalizer::new();
        let mut r = raw(SourceKind::Store);
        r.primary_id = Some("team@g.us".into());
        r.is_group = Some(false);
        assert_eq!(n.determine_type(&r), EntityType::Personal);

        r.is_group = Some(true);
        r.primary_id = Some("1@c.us".into());
        assert_eq!(n.determine_type(&r), EntityType::Group);
    }

    #[test]
    fn suffixes_decide_when_flag_is_unset() {
        let n = EntityNormalizer::new();
        let mut r = raw(SourceKind::Store);

        r.primary_id = Some("team@g.us".into());
        assert_eq!(n.determine_type(&r), EntityType::Group);
        r.primary_id = Some("status@broadcast".into());
        assert_eq!(n.determine_type(&r), EntityType::Broadcast);
        r.primary_id = Some("1@c.us".into());
        assert_eq!(n.determine_type(&r), EntityType::Personal);
    }

    #[test]
    fn alternate_id_with_group_suffix_is_a_group() {
        let n = EntityNormalizer::new();
        let mut r = raw(SourceKind::Dom);
        r.secondary_id = Some("120363@g.us".into());
        assert_eq!(n.determine_type(&r), EntityType::Group);

        r.secondary_id = Some("dom_chat_ab_1".into());
        assert_eq!(n.determine_type(&r), EntityType::Personal);
    }

    #[test]
    fn integrity_by_source_and_ids() {
        let n = EntityNormalizer::new();

        let mut store = raw(SourceKind::Store);
        assert_eq!(n.determine_integrity(&store), Integrity::Fallback);
        store.secondary_id = Some("111".into());
        assert_eq!(n.determine_integrity(&store), Integrity::Verified);

        let mut network = raw(SourceKind::Network);
        assert_eq!(n.determine_integrity(&network), Integrity::Fallback);
        network.network_user_id = Some("u1".into());
        assert_eq!(n.determine_integrity(&network), Integrity::Verified);

        let mut dom = raw(SourceKind::Dom);
        dom.primary_id = Some("1@c.us".into());
        assert_eq!(n.determine_integrity(&dom), Integrity::Fallback);

        assert_eq!(n.determine_integrity(&raw(SourceKind::Unknown)), Integrity::Ambiguous);
    }

    #[test]
    fn optional_fields_are_cleaned() {
        let n = EntityNormalizer::new();
        let mut r = raw(SourceKind::Store);
        r.name = Some("  Alice  ".into());
        r.avatar_url = Some("   ".into());
        r.raw_payload.insert("chatIndex".into(), 3.into());

        let entity = n.normalize(&r, "a@c.us".into());
        assert_eq!(entity.name.as_deref(), Some("Alice"));
        assert_eq!(entity.avatar, None);
        assert_eq!(entity.unread_count, 0);
        assert_eq!(entity.raw_data["chatIndex"], 3);
    }

    #[test]
    fn batch_drops_unresolvable_entities() {
        let n = EntityNormalizer::new();
        let resolver = IdentityResolver::new();
        let mut good = raw(SourceKind::Store);
        good.primary_id = Some("a@c.us".into());
        let bad = raw(SourceKind::Store);

        let batch = n.normalize_batch(vec![good, bad], &resolver);
        assert_eq!(batch.entities.len(), 1);
        assert_eq!(batch.dropped, 1);
        assert_eq!(batch.entities[0].id, "a@c.us");
    }

    #[test]
    fn normalize_with_id_resolves_first() {
        let n = EntityNormalizer::new();
        let resolver = IdentityResolver::new();
        let mut r = raw(SourceKind::Network);
        r.network_server_id = Some("srv-7".into());

        let entity = n.normalize_with_id(&r, &resolver).unwrap();
        assert_eq!(entity.id, "srv-7");
        assert!(n.normalize_with_id(&raw(SourceKind::Network), &resolver).is_none());
    }
}

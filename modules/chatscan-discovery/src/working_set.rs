use std::collections::HashSet;

use chatscan_common::CanonicalEntity;

/// Per-run accumulation of canonical entities.
///
/// The first observation of an id is the published one. Every observation,
/// repeats included, is kept so conflicts can be audited at the end.
#[derive(Debug, Default)]
pub struct WorkingSet {
    ids: HashSet<String>,
    entities: Vec<CanonicalEntity>,
    observations: Vec<CanonicalEntity>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch; returns the entities whose ids were not seen before.
    pub fn extend(&mut self, batch: Vec<CanonicalEntity>) -> Vec<CanonicalEntity> {
        let mut fresh = Vec::new();
        for entity in batch {
            if self.ids.insert(entity.id.clone()) {
                self.entities.push(entity.clone());
                fresh.push(entity.clone());
            }
            self.observations.push(entity);
        }
        fresh
    }

    pub fn entities(&self) -> &[CanonicalEntity] {
        &self.entities
    }

    pub fn observations(&self) -> &[CanonicalEntity] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Observations that collapsed onto an already known id.
    pub fn repeated_observations(&self) -> usize {
        self.observations.len() - self.entities.len()
    }
}

//! Purge plan generation.
//!
//! Collapses a batch of purge events into the smallest set of store operations.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::events::{EventKind, PurgeEvent};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgePlan {
    /// A global event was seen; entity and URL work is subsumed.
    pub purge_all: bool,
    pub entities: BTreeSet<u64>,
    pub urls: BTreeSet<String>,
}

impl fmt::Display for PurgePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PurgePlan {{ purge_all: {}, entities: {}, urls: {} }}",
            self.purge_all,
            self.entities.len(),
            self.urls.len(),
        )
    }
}

impl PurgePlan {
    pub fn from_events(events: Vec<PurgeEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            match event.kind {
                kind if kind.is_global() => plan.purge_all = true,
                EventKind::EntityChanged { entity_id } => {
                    plan.entities.insert(entity_id);
                }
                EventKind::UrlChanged { url } => {
                    plan.urls.insert(url);
                }
                EventKind::SettingsChanged | EventKind::PurgeRequested => plan.purge_all = true,
            }
        }

        if plan.purge_all {
            plan.entities.clear();
            plan.urls.clear();
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        !self.purge_all && self.entities.is_empty() && self.urls.is_empty()
    }
}

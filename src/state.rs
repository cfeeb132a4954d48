//! State shared between the refresher and the collectors.
//!
//! Both the repository list and the workflow definition cache are immutable
//! snapshots behind an [`ArcSwap`]: writers build a complete replacement and
//! swap it in, readers hold whichever snapshot was current when they loaded it.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::providers::github::types::{RepositoryName, Workflow};

/// Currently monitored repositories.
#[derive(Default)]
pub struct RepositorySet {
    current: ArcSwap<Vec<RepositoryName>>,
}

impl RepositorySet {
    pub fn load(&self) -> Arc<Vec<RepositoryName>> {
        self.current.load_full()
    }

    pub fn replace(&self, repositories: Vec<RepositoryName>) {
        self.current.store(Arc::new(repositories));
    }
}

/// Workflow definitions of every monitored repository, by workflow id.
#[derive(Debug, Default)]
pub struct WorkflowSnapshot {
    definitions: HashMap<RepositoryName, HashMap<u64, Workflow>>,
}

impl WorkflowSnapshot {
    pub fn from_map(definitions: HashMap<RepositoryName, HashMap<u64, Workflow>>) -> Self {
        Self { definitions }
    }

    pub fn workflow(&self, repository: &RepositoryName, id: u64) -> Option<&Workflow> {
        self.definitions.get(repository)?.get(&id)
    }

    /// Every cached definition, ordered by repository then workflow id.
    pub fn iter_sorted(&self) -> Vec<(&RepositoryName, &Workflow)> {
        let mut all: Vec<_> = self
            .definitions
            .iter()
            .flat_map(|(repo, workflows)| workflows.values().map(move |w| (repo, w)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0).then(a.1.id.cmp(&b.1.id)));
        all
    }

    pub fn repository_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Default)]
pub struct WorkflowCache {
    current: ArcSwap<WorkflowSnapshot>,
}

impl WorkflowCache {
    pub fn load(&self) -> Arc<WorkflowSnapshot> {
        self.current.load_full()
    }

    pub fn replace(&self, snapshot: WorkflowSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn clear(&self) {
        self.replace(WorkflowSnapshot::default());
    }
}

/// Handles shared by every periodic task.
#[derive(Default)]
pub struct SharedState {
    pub repositories: RepositorySet,
    pub workflows: WorkflowCache,
}

//! In-memory project table.
//!
//! Projects live for the lifetime of the process. Ids come from an atomic
//! counter, so two creations can never hand out the same id even if they
//! race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Identity of a project and the driver it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: String,
    pub distro_id: String,
}

#[derive(Debug, Default)]
pub struct ProjectRegistry {
    next_id: AtomicU64,
    projects: RwLock<HashMap<String, ProjectRecord>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id. The project is not visible until [`insert`](Self::insert).
    pub fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("project-{n}")
    }

    pub fn insert(&self, record: ProjectRecord) {
        self.projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<ProjectRecord> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn allocated_ids_are_sequential() {
        let registry = ProjectRegistry::new();
        assert_eq!(registry.allocate_id(), "project-1");
        assert_eq!(registry.allocate_id(), "project-2");
        // Allocation alone does not create a project.
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        let registry = Arc::new(ProjectRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| registry.allocate_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate project id");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn inserted_projects_resolve() {
        let registry = ProjectRegistry::new();
        let id = registry.allocate_id();
        registry.insert(ProjectRecord {
            id: id.clone(),
            distro_id: "arch".into(),
        });
        assert_eq!(registry.get(&id).unwrap().distro_id, "arch");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("project-999").is_none());
    }
}

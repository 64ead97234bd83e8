//! Authoritative instance registry.
//!
//! A process-wide map from instance id to record plus a parent→children
//! index. Structural edits (insert) and record mutations take the single
//! registry mutex; reads clone records so callers never hold the lock across
//! a suspension point.
//!
//! The registry is where the forest invariants live: at most one root, every
//! non-root parent must name an existing record, and state only moves
//! forward.

use madrox_core::{InstanceRecord, InstanceState};
use std::collections::HashMap;
use std::sync::Mutex;

/// Structural registry errors. The dispatcher maps these onto the tool error
/// taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("instance '{0}' not found in registry")]
    UnknownInstance(String),

    #[error("parent instance '{0}' not found in registry")]
    UnknownParent(String),

    #[error("a root instance already exists ('{0}')")]
    DuplicateRoot(String),

    #[error("instance cap reached ({0} live instances)")]
    MaxInstances(usize),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<String, InstanceRecord>,
    children: HashMap<String, Vec<String>>,
}

/// Process-wide instance registry. Cheap to share behind an `Arc`.
pub struct InstanceRegistry {
    inner: Mutex<RegistryInner>,
    max_instances: usize,
}

impl InstanceRegistry {
    pub fn new(max_instances: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_instances: max_instances.max(1),
        }
    }

    /// Insert a fresh record, enforcing the forest invariants:
    /// a non-root parent must exist (terminated parents are allowed, the
    /// edge stays valid for the tree view), and only one root may ever be
    /// registered.
    pub fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();

        let live = inner
            .records
            .values()
            .filter(|r| r.state.is_live())
            .count();
        if live >= self.max_instances {
            return Err(RegistryError::MaxInstances(live));
        }

        match &record.parent_id {
            Some(parent) => {
                if !inner.records.contains_key(parent) {
                    return Err(RegistryError::UnknownParent(parent.clone()));
                }
            }
            None => {
                if let Some(root) = inner.records.values().find(|r| r.is_root()) {
                    return Err(RegistryError::DuplicateRoot(root.id.clone()));
                }
            }
        }

        if let Some(parent) = &record.parent_id {
            inner
                .children
                .entry(parent.clone())
                .or_default()
                .push(record.id.clone());
        }
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().records.contains_key(id)
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Result<InstanceRecord, RegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))
    }

    /// Snapshot of every record, terminated ones included.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.inner.lock().unwrap().records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Direct children of `id`, creation order.
    pub fn children_of(&self, id: &str) -> Vec<InstanceRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .children
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|cid| inner.records.get(cid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members of a team session, terminated ones included.
    pub fn team_members(&self, team_session_id: &str) -> Vec<InstanceRecord> {
        let mut members: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.team_session_id.as_deref() == Some(team_session_id))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        members
    }

    /// Mutate one record under the registry lock. `f` must be quick and must
    /// not touch the filesystem or await anything.
    pub fn with_record_mut<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut InstanceRecord) -> T,
    ) -> Result<T, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        Ok(f(record))
    }

    /// Apply a validated state transition. Returns the previous state.
    /// No-op transitions to the current state are rejected by the state
    /// machine, so callers that might re-enter (terminate, error paths)
    /// should check first via [`InstanceRegistry::get`].
    pub fn transition(
        &self,
        id: &str,
        next: InstanceState,
    ) -> Result<InstanceState, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        if !record.state.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: record.state,
                to: next,
            });
        }
        let previous = record.state;
        record.state = next;
        record.touch();
        Ok(previous)
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.state.is_live())
            .count()
    }

    /// The root record, if one has been spawned.
    pub fn root(&self) -> Option<InstanceRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.is_root())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use madrox_core::{InstanceKind, Role};

    fn record(name: &str) -> InstanceRecord {
        InstanceRecord::new(name, Role::General, InstanceKind::Claude, "/tmp/w".into())
    }

    #[test]
    fn single_root_enforced() {
        let reg = InstanceRegistry::new(10);
        let root = record("main-orchestrator");
        reg.insert(root).unwrap();
        let err = reg.insert(record("second-root")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRoot(_)));
    }

    #[test]
    fn parent_must_exist() {
        let reg = InstanceRegistry::new(10);
        let mut child = record("child");
        child.parent_id = Some("nope".to_string());
        assert!(matches!(
            reg.insert(child),
            Err(RegistryError::UnknownParent(_))
        ));
    }

    #[test]
    fn children_index_tracks_insert_order() {
        let reg = InstanceRegistry::new(10);
        let root = record("main-orchestrator");
        let root_id = root.id.clone();
        reg.insert(root).unwrap();
        for name in ["a", "b", "c"] {
            let mut child = record(name);
            child.parent_id = Some(root_id.clone());
            reg.insert(child).unwrap();
        }
        let names: Vec<_> = reg
            .children_of(&root_id)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn max_instances_counts_live_only() {
        let reg = InstanceRegistry::new(2);
        let root = record("main-orchestrator");
        let root_id = root.id.clone();
        reg.insert(root).unwrap();
        let mut child = record("a");
        child.parent_id = Some(root_id.clone());
        let child_id = child.id.clone();
        reg.insert(child).unwrap();

        let mut extra = record("b");
        extra.parent_id = Some(root_id.clone());
        assert!(matches!(
            reg.insert(extra.clone()),
            Err(RegistryError::MaxInstances(2))
        ));

        // Terminate one; capacity frees up.
        reg.transition(&child_id, InstanceState::Terminating).unwrap();
        reg.transition(&child_id, InstanceState::Terminated).unwrap();
        assert!(reg.insert(extra).is_ok());
    }

    #[test]
    fn transition_rejects_backwards_moves() {
        let reg = InstanceRegistry::new(10);
        let rec = record("main-orchestrator");
        let id = rec.id.clone();
        reg.insert(rec).unwrap();
        reg.transition(&id, InstanceState::Initializing).unwrap();
        reg.transition(&id, InstanceState::Ready).unwrap();
        let err = reg.transition(&id, InstanceState::Initializing).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn terminated_is_final() {
        let reg = InstanceRegistry::new(10);
        let rec = record("main-orchestrator");
        let id = rec.id.clone();
        reg.insert(rec).unwrap();
        reg.transition(&id, InstanceState::Terminating).unwrap();
        reg.transition(&id, InstanceState::Terminated).unwrap();
        for next in [
            InstanceState::Busy,
            InstanceState::Error,
            InstanceState::Terminating,
        ] {
            assert!(reg.transition(&id, next).is_err());
        }
    }

    #[test]
    fn team_members_include_terminated() {
        let reg = InstanceRegistry::new(10);
        let mut root = record("main-orchestrator");
        root.team_session_id = Some("team-x".to_string());
        let root_id = root.id.clone();
        reg.insert(root).unwrap();
        let mut child = record("a");
        child.parent_id = Some(root_id.clone());
        child.team_session_id = Some("team-x".to_string());
        let child_id = child.id.clone();
        reg.insert(child).unwrap();
        reg.transition(&child_id, InstanceState::Terminating).unwrap();
        reg.transition(&child_id, InstanceState::Terminated).unwrap();
        assert_eq!(reg.team_members("team-x").len(), 2);
    }
}

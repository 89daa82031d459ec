use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::{EphemeralSpace, OwnerToken, SpaceId, SpaceMetrics, SpaceState};
use crate::error::SpaceError;
use crate::mount::MountPath;
use crate::storage::SnapshotHandle;

/// Table of every space that currently exists.
///
/// All mutations take the write lock for their whole check-and-update, so
/// capacity checks and state transitions are linearized. No method awaits:
/// the lock is a `std` lock and is never held across a suspension point.
/// Readers receive cloned records, never references into the table.
#[derive(Debug)]
pub struct SpaceRegistry {
    max_spaces: usize,
    spaces: RwLock<HashMap<SpaceId, EphemeralSpace>>,
}

impl SpaceRegistry {
    pub(crate) fn new(max_spaces: usize) -> Self {
        Self {
            max_spaces,
            spaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_spaces(&self) -> usize {
        self.max_spaces
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SpaceId, EphemeralSpace>> {
        self.spaces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SpaceId, EphemeralSpace>> {
        self.spaces.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `space` if doing so keeps the number of creating/active spaces
    /// within `max_spaces`. Check and insert happen under one write lock.
    pub(crate) fn try_register(&self, space: EphemeralSpace) -> Result<(), SpaceError> {
        let mut spaces = self.write();
        if spaces.contains_key(&space.id) {
            return Err(SpaceError::Internal(format!("space id {} reused", space.id)));
        }
        if space.state.counts_toward_capacity() {
            let live = spaces
                .values()
                .filter(|s| s.state.counts_toward_capacity())
                .count();
            if live >= self.max_spaces {
                return Err(SpaceError::MaxSpacesExceeded {
                    limit: self.max_spaces,
                });
            }
        }
        debug!(space_id = %space.id, state = %space.state, "space registered");
        spaces.insert(space.id, space);
        Ok(())
    }

    /// Remove a space. Returns whether it was present.
    pub(crate) fn unregister(&self, id: SpaceId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!(space_id = %id, "space unregistered");
        }
        removed
    }

    pub fn lookup(&self, id: SpaceId) -> Option<EphemeralSpace> {
        self.read().get(&id).cloned()
    }

    /// Consistent copy of every record, oldest first.
    pub fn all(&self) -> Vec<EphemeralSpace> {
        let mut all: Vec<EphemeralSpace> = self.read().values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Spaces occupying a capacity slot (creating or active).
    pub fn live_count(&self) -> usize {
        self.read()
            .values()
            .filter(|s| s.state.counts_toward_capacity())
            .count()
    }

    /// Record the snapshot a creating space now owns.
    pub(crate) fn attach_snapshot(&self, id: SpaceId, snapshot: SnapshotHandle) -> Result<(), SpaceError> {
        let mut spaces = self.write();
        match spaces.get_mut(&id) {
            Some(space) if space.state == SpaceState::Creating => {
                space.snapshot = Some(snapshot);
                Ok(())
            }
            _ => Err(SpaceError::SpaceNotFound(id)),
        }
    }

    /// Creating → Active. Fails with `SpaceNotFound` if the reservation is
    /// gone or no longer creating.
    pub(crate) fn activate(
        &self,
        id: SpaceId,
        snapshot: SnapshotHandle,
        mount_path: MountPath,
        metrics: SpaceMetrics,
    ) -> Result<EphemeralSpace, SpaceError> {
        let mut spaces = self.write();
        match spaces.get_mut(&id) {
            Some(space) if space.state == SpaceState::Creating => {
                space.snapshot = Some(snapshot);
                space.mount_path = Some(mount_path);
                space.metrics = metrics;
                space.state = SpaceState::Active;
                Ok(space.clone())
            }
            _ => Err(SpaceError::SpaceNotFound(id)),
        }
    }

    /// Active → Destroying. Exactly one concurrent caller wins; everyone else
    /// observes `SpaceNotFound`.
    pub(crate) fn begin_destroy(&self, id: SpaceId) -> Result<EphemeralSpace, SpaceError> {
        let mut spaces = self.write();
        match spaces.get_mut(&id) {
            Some(space) if space.state == SpaceState::Active => {
                space.state = SpaceState::Destroying;
                Ok(space.clone())
            }
            _ => Err(SpaceError::SpaceNotFound(id)),
        }
    }

    /// Remove a space only if it is still creating. Used to release the
    /// reservation of a create that never reached its own rollback.
    pub(crate) fn remove_creating(&self, id: SpaceId) -> Option<EphemeralSpace> {
        let mut spaces = self.write();
        match spaces.get(&id) {
            Some(space) if space.state == SpaceState::Creating => spaces.remove(&id),
            _ => None,
        }
    }

    /// Active spaces belonging to `owner`.
    pub fn owned_by(&self, owner: &OwnerToken) -> Vec<SpaceId> {
        self.read()
            .values()
            .filter(|s| s.state == SpaceState::Active && &s.owner == owner)
            .map(|s| s.id)
            .collect()
    }

    /// Snapshots held by registered spaces, in any state.
    pub fn tracked_snapshots(&self) -> HashSet<SnapshotHandle> {
        self.read()
            .values()
            .filter_map(|s| s.snapshot.clone())
            .collect()
    }

    /// Mount paths held by registered spaces, in any state.
    pub fn tracked_mounts(&self) -> HashSet<MountPath> {
        self.read()
            .values()
            .filter_map(|s| s.mount_path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn creating() -> EphemeralSpace {
        EphemeralSpace::reserve(OwnerToken::Session("test".into()))
    }

    fn active(registry: &SpaceRegistry) -> SpaceId {
        let space = creating();
        let id = space.id;
        registry.try_register(space).unwrap();
        registry
            .activate(
                id,
                SnapshotHandle::for_space(id),
                MountPath::new(format!("/mnt/{}", id)),
                SpaceMetrics::default(),
            )
            .unwrap();
        id
    }

    #[test]
    fn register_within_capacity() {
        let registry = SpaceRegistry::new(2);
        registry.try_register(creating()).unwrap();
        registry.try_register(creating()).unwrap();
        assert_eq!(
            registry.try_register(creating()).unwrap_err(),
            SpaceError::MaxSpacesExceeded { limit: 2 }
        );
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn destroying_spaces_free_their_slot() {
        let registry = SpaceRegistry::new(1);
        let id = active(&registry);
        assert!(registry.try_register(creating()).is_err());

        registry.begin_destroy(id).unwrap();
        assert_eq!(registry.live_count(), 0);
        registry.try_register(creating()).unwrap();
    }

    #[test]
    fn unregister_reports_presence() {
        let registry = SpaceRegistry::new(4);
        let space = creating();
        let id = space.id;
        registry.try_register(space).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn activate_requires_creating() {
        let registry = SpaceRegistry::new(4);
        let missing = SpaceId::new();
        assert_eq!(
            registry
                .activate(
                    missing,
                    SnapshotHandle::for_space(missing),
                    MountPath::new("/mnt/x"),
                    SpaceMetrics::default(),
                )
                .unwrap_err(),
            SpaceError::SpaceNotFound(missing)
        );

        let id = active(&registry);
        let space = registry.lookup(id).unwrap();
        assert_eq!(space.state, SpaceState::Active);
        assert_eq!(space.snapshot, Some(SnapshotHandle::for_space(id)));
        assert!(registry
            .activate(
                id,
                SnapshotHandle::for_space(id),
                MountPath::new("/mnt/y"),
                SpaceMetrics::default()
            )
            .is_err());
    }

    #[test]
    fn attach_snapshot_is_tracked() {
        let registry = SpaceRegistry::new(4);
        let space = creating();
        let id = space.id;
        registry.try_register(space).unwrap();

        let handle = SnapshotHandle::for_space(id);
        registry.attach_snapshot(id, handle.clone()).unwrap();
        assert!(registry.tracked_snapshots().contains(&handle));
        assert!(registry.attach_snapshot(SpaceId::new(), handle).is_err());
    }

    #[test]
    fn begin_destroy_wins_once() {
        let registry = SpaceRegistry::new(4);
        let id = active(&registry);

        let first = registry.begin_destroy(id).unwrap();
        assert_eq!(first.state, SpaceState::Destroying);
        assert_eq!(
            registry.begin_destroy(id).unwrap_err(),
            SpaceError::SpaceNotFound(id)
        );
    }

    #[test]
    fn remove_creating_leaves_active_spaces_alone() {
        let registry = SpaceRegistry::new(2);
        let space = creating();
        let id = space.id;
        registry.try_register(space).unwrap();
        let live = active(&registry);

        assert!(registry.remove_creating(live).is_none());
        assert_eq!(registry.remove_creating(id).map(|s| s.id), Some(id));
        assert!(registry.remove_creating(id).is_none());
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn owned_by_filters_active_spaces() {
        let registry = SpaceRegistry::new(4);
        let mine = EphemeralSpace::reserve(OwnerToken::Process(10));
        let mine_id = mine.id;
        registry.try_register(mine).unwrap();
        assert!(registry.owned_by(&OwnerToken::Process(10)).is_empty());

        registry
            .activate(
                mine_id,
                SnapshotHandle::for_space(mine_id),
                MountPath::new("/mnt/a"),
                SpaceMetrics::default(),
            )
            .unwrap();
        active(&registry);

        assert_eq!(registry.owned_by(&OwnerToken::Process(10)), vec![mine_id]);
        assert!(registry.owned_by(&OwnerToken::Process(11)).is_empty());
    }

    #[test]
    fn concurrent_registration_never_exceeds_capacity() {
        let registry = Arc::new(SpaceRegistry::new(5));
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.try_register(creating()).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(admitted, 5);
        assert_eq!(registry.live_count(), 5);
    }

    #[test]
    fn concurrent_begin_destroy_has_one_winner() {
        let registry = Arc::new(SpaceRegistry::new(1));
        let id = active(&registry);
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.begin_destroy(id).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
    }
}

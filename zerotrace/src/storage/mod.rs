pub mod simulated;
pub mod zfs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SpaceError;
use crate::space::SpaceId;

pub use simulated::SimulatedSnapshotProvider;
pub use zfs::{Zfs, ZfsSnapshotProvider};

/// Prefix shared by every snapshot this system creates. Anything without it
/// is invisible to listing and refused by deletion.
pub const HANDLE_PREFIX: &str = "zt-";

/// Opaque reference to a copy-on-write snapshot, e.g. `zt-1f0c...`.
///
/// The name embeds the owning space's id so an orphan found after a crash
/// can still be attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHandle(String);

impl SnapshotHandle {
    pub fn for_space(id: SpaceId) -> Self {
        Self(format!("{}{}", HANDLE_PREFIX, id.as_uuid().simple()))
    }

    /// Accept a name found on the host, if it is one of ours.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(HANDLE_PREFIX)?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        Some(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The space this snapshot was created for, when the name carries one.
    pub fn space_id(&self) -> Option<SpaceId> {
        let rest = self.0.strip_prefix(HANDLE_PREFIX)?;
        Uuid::parse_str(rest).ok().map(SpaceId::from_uuid)
    }
}

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time, copy-on-write snapshot backend.
///
/// Implementations must be safe to call concurrently; every method may
/// suspend on host I/O (or simulated latency).
#[async_trait]
pub trait SnapshotProvider: Send + Sync + std::fmt::Debug {
    /// Create a snapshot for `space`. Fails with
    /// [`SpaceError::SnapshotCreationFailed`].
    async fn create_snapshot(&self, space: SpaceId) -> Result<SnapshotHandle, SpaceError>;

    /// Delete a snapshot. Deleting a handle that no longer exists succeeds.
    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), SpaceError>;

    /// All managed snapshots currently present on the host.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>, SpaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrips_space_id() {
        let id = SpaceId::new();
        let handle = SnapshotHandle::for_space(id);
        assert!(handle.as_str().starts_with("zt-"));
        assert_eq!(handle.as_str().len(), 3 + 32);
        assert_eq!(handle.space_id(), Some(id));
    }

    #[test]
    fn parse_accepts_only_managed_names() {
        assert!(SnapshotHandle::parse("zt-abc123").is_some());
        assert!(SnapshotHandle::parse("zt-").is_none());
        assert!(SnapshotHandle::parse("autosnap_2024-01-01").is_none());
        assert!(SnapshotHandle::parse("zt-../../etc").is_none());
        assert!(SnapshotHandle::parse("zt-a b").is_none());
    }

    #[test]
    fn handle_without_uuid_has_no_space() {
        let handle = SnapshotHandle::parse("zt-legacy").unwrap();
        assert_eq!(handle.space_id(), None);
    }
}

//! Ephemeral copy-on-write execution spaces.
//!
//! Every space is a snapshot of a source dataset mounted at a private path.
//! Creation is all-or-nothing, teardown is best-effort with a retry queue,
//! and a recovery sweep reclaims anything a crash left behind.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mount;
pub mod space;
pub mod storage;
mod util;

pub use config::Config;
pub use error::SpaceError;
pub use events::{EventSink, LifecycleEvent};
pub use space::{OwnerToken, SpaceHandle, SpaceId, SpaceOrchestrator};

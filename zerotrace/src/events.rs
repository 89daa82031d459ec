//! Lifecycle events delivered to the external security/telemetry sink.
//!
//! Delivery is fire-and-forget: [`EventSink::emit`] is synchronous and must
//! never block the lifecycle path, and a sink that cannot deliver simply
//! drops the event.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::CreateStep;
use crate::space::SpaceId;

/// Phase whose duration is checked against a configured budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetedPhase {
    Creation,
    Mount,
    Teardown,
}

impl std::fmt::Display for BudgetedPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creation => write!(f, "creation"),
            Self::Mount => write!(f, "mount"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    SpaceCreated {
        id: SpaceId,
        creation_duration_ms: u64,
    },
    SpaceDestroyed {
        id: SpaceId,
        teardown_duration_ms: u64,
    },
    SpaceCreationFailed {
        reason: String,
        step_failed: CreateStep,
    },
    /// Metadata only; never file contents or full host paths.
    SuspiciousActivity {
        id: SpaceId,
        description: String,
    },
    PerformanceAnomaly {
        id: SpaceId,
        step: BudgetedPhase,
        observed_duration_ms: u64,
        budget_ms: u64,
    },
}

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Writes every event to the `tracing` log. Used when no external sink is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::SpaceCreated {
                id,
                creation_duration_ms,
            } => info!(space_id = %id, creation_duration_ms, "space created"),
            LifecycleEvent::SpaceDestroyed {
                id,
                teardown_duration_ms,
            } => info!(space_id = %id, teardown_duration_ms, "space destroyed"),
            LifecycleEvent::SpaceCreationFailed { reason, step_failed } => {
                warn!(step = %step_failed, reason = %reason, "space creation failed")
            }
            LifecycleEvent::SuspiciousActivity { id, description } => {
                warn!(space_id = %id, description = %description, "suspicious activity")
            }
            LifecycleEvent::PerformanceAnomaly {
                id,
                step,
                observed_duration_ms,
                budget_ms,
            } => warn!(
                space_id = %id,
                step = %step,
                observed_duration_ms,
                budget_ms,
                "performance budget exceeded"
            ),
        }
    }
}

/// Forwards events over an unbounded tokio channel to an external consumer.
///
/// Sending never blocks; if the receiver is gone the event is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_camel_case_schema() {
        let id = SpaceId::new();
        let event = LifecycleEvent::PerformanceAnomaly {
            id,
            step: BudgetedPhase::Mount,
            observed_duration_ms: 75,
            budget_ms: 50,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "performanceAnomaly");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["step"], "mount");
        assert_eq!(json["observedDurationMs"], 75);
        assert_eq!(json["budgetMs"], 50);
    }

    #[test]
    fn creation_failed_reports_step() {
        let event = LifecycleEvent::SpaceCreationFailed {
            reason: "mount failed: injected".into(),
            step_failed: CreateStep::Mount,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "spaceCreationFailed");
        assert_eq!(json["stepFailed"], "mount");
    }

    #[test]
    fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let id = SpaceId::new();
        sink.emit(LifecycleEvent::SpaceCreated {
            id,
            creation_duration_ms: 3,
        });
        sink.emit(LifecycleEvent::SpaceDestroyed {
            id,
            teardown_duration_ms: 4,
        });
        assert!(matches!(rx.try_recv(), Ok(LifecycleEvent::SpaceCreated { .. })));
        assert!(matches!(rx.try_recv(), Ok(LifecycleEvent::SpaceDestroyed { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_sink_drops_after_receiver_closed() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic or block.
        sink.emit(LifecycleEvent::SpaceCreationFailed {
            reason: "x".into(),
            step_failed: CreateStep::Capacity,
        });
    }
}

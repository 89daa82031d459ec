use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::error::{CreateStep, TeardownStep};
use crate::events::BudgetedPhase;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    step: FailureStepLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum FailureStepLabel {
    Capacity,
    Snapshot,
    Mount,
    Register,
    Unmount,
    DeleteSnapshot,
    Unregister,
}

impl From<CreateStep> for FailureStepLabel {
    fn from(step: CreateStep) -> Self {
        match step {
            CreateStep::Capacity => Self::Capacity,
            CreateStep::Snapshot => Self::Snapshot,
            CreateStep::Mount => Self::Mount,
            CreateStep::Register => Self::Register,
        }
    }
}

impl From<TeardownStep> for FailureStepLabel {
    fn from(step: TeardownStep) -> Self {
        match step {
            TeardownStep::Unmount => Self::Unmount,
            TeardownStep::DeleteSnapshot => Self::DeleteSnapshot,
            TeardownStep::Unregister => Self::Unregister,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PhaseLabels {
    phase: PhaseLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum PhaseLabel {
    Creation,
    Mount,
    Teardown,
}

impl From<BudgetedPhase> for PhaseLabel {
    fn from(phase: BudgetedPhase) -> Self {
        match phase {
            BudgetedPhase::Creation => Self::Creation,
            BudgetedPhase::Mount => Self::Mount,
            BudgetedPhase::Teardown => Self::Teardown,
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics registry for zerotrace.
///
/// All methods are cheap (atomic operations) and safe to call from any async context.
/// The struct is `Clone + Send + Sync` via internal `Arc`.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    spaces_live: Gauge,
    creation_duration_seconds: Histogram,
    teardown_duration_seconds: Histogram,
    failures_total: Family<FailureLabels, Counter>,
    anomalies_total: Family<PhaseLabels, Counter>,
    orphans_reclaimed_total: Counter,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("spaces_live", &self.inner.spaces_live.get())
            .finish_non_exhaustive()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let spaces_live = Gauge::default();
        registry.register(
            "zerotrace_spaces_live",
            "Spaces currently creating or active",
            spaces_live.clone(),
        );

        // 1ms to ~0.5s (exponential)
        let creation_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 10));
        registry.register(
            "zerotrace_creation_duration_seconds",
            "End-to-end space creation duration in seconds",
            creation_duration_seconds.clone(),
        );

        let teardown_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 10));
        registry.register(
            "zerotrace_teardown_duration_seconds",
            "Space teardown duration in seconds",
            teardown_duration_seconds.clone(),
        );

        let failures_total = Family::<FailureLabels, Counter>::default();
        registry.register(
            "zerotrace_failures",
            "Failed lifecycle steps by step",
            failures_total.clone(),
        );

        let anomalies_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "zerotrace_performance_anomalies",
            "Budget overruns by phase",
            anomalies_total.clone(),
        );

        let orphans_reclaimed_total = Counter::default();
        registry.register(
            "zerotrace_orphans_reclaimed",
            "Orphaned snapshots and mounts reclaimed by the recovery sweep",
            orphans_reclaimed_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                spaces_live,
                creation_duration_seconds,
                teardown_duration_seconds,
                failures_total,
                anomalies_total,
                orphans_reclaimed_total,
            }),
        }
    }

    pub fn set_live(&self, live: usize) {
        self.inner
            .spaces_live
            .set(i64::try_from(live).unwrap_or(i64::MAX));
    }

    pub fn record_creation(&self, duration: Duration) {
        self.inner
            .creation_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_teardown(&self, duration: Duration) {
        self.inner
            .teardown_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_create_failure(&self, step: CreateStep) {
        self.inner
            .failures_total
            .get_or_create(&FailureLabels { step: step.into() })
            .inc();
    }

    pub fn record_teardown_failure(&self, step: TeardownStep) {
        self.inner
            .failures_total
            .get_or_create(&FailureLabels { step: step.into() })
            .inc();
    }

    pub fn record_anomaly(&self, phase: BudgetedPhase) {
        self.inner
            .anomalies_total
            .get_or_create(&PhaseLabels {
                phase: phase.into(),
            })
            .inc();
    }

    pub fn record_orphans_reclaimed(&self, count: u64) {
        self.inner.orphans_reclaimed_total.inc_by(count);
    }

    pub fn orphans_reclaimed(&self) -> u64 {
        self.inner.orphans_reclaimed_total.get()
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = encode(&mut buf, &registry) {
            warn!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

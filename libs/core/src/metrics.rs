//! Metrics shared by the three controllers and the CORE's ipset/rule-engine layers
//! (SPEC_FULL.md §B.4). Mirrors the reference stack's `ControllerMetrics` /
//! `ReconcileMetrics` / `ReconcileMeasurer` shape, backed directly by `prometheus_client`
//! (rather than routed through an OpenTelemetry meter) so `/node-metrics` and
//! `/cluster-metrics` can each expose their own `Registry` without a collector pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

pub type ControllerId = &'static str;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum TriggerAction {
    Apply,
    Delete,
}

impl TriggerAction {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerAction::Apply => "apply",
            TriggerAction::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ControllerLabel {
    controller: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, EncodeLabelSet)]
struct TriggerLabel {
    controller: String,
    action: String,
}

/// Per-controller reconcile counters/histogram, shared between the reconcile loop and the
/// `ReconcileMeasurer` RAII timer it hands out.
#[derive(Clone)]
pub struct ReconcileMetrics {
    operations: Family<ControllerLabel, Counter>,
    failures: Family<ControllerLabel, Counter>,
    duration: Family<ControllerLabel, Histogram>,
}

/// Drop-based duration timer: records into the histogram whenever it goes out of scope,
/// success or failure, matching the reference stack's `ReconcileMeasurer`.
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: Family<ControllerLabel, Histogram>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.metric
            .get_or_create(&ControllerLabel {
                controller: self.controller.clone(),
            })
            .observe(elapsed);
    }
}

/// Metrics owned by one controller (`"pod"`, `"namespace"`, or `"networkpolicy"`).
pub struct ControllerMetrics {
    controller: ControllerId,
    reconcile: ReconcileMetrics,
    triggered: Family<TriggerLabel, Counter>,
    watch_operations_failed: Family<ControllerLabel, Counter>,
    ready: Family<ControllerLabel, Gauge>,
    reconcile_failures_total: Family<ControllerLabel, Counter>,
}

impl ControllerMetrics {
    fn register(controller: ControllerId, registry: &mut Registry) -> Self {
        let operations = Family::<ControllerLabel, Counter>::default();
        let failures = Family::<ControllerLabel, Counter>::default();
        let duration =
            Family::<ControllerLabel, Histogram>::new_with_constructor(|| {
                Histogram::new([0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter())
            });
        let triggered = Family::<TriggerLabel, Counter>::default();
        let watch_operations_failed = Family::<ControllerLabel, Counter>::default();
        let ready = Family::<ControllerLabel, Gauge>::default();
        let reconcile_failures_total = Family::<ControllerLabel, Counter>::default();

        registry.register(
            "reconcile_operations",
            "Number of times a reconcile attempt has started",
            operations.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconcile attempts that returned an error",
            failures.clone(),
        );
        registry.register(
            "reconcile_duration_seconds",
            "Duration of a reconcile attempt",
            duration.clone(),
        );
        registry.register(
            "triggered",
            "Number of times an informer event triggered an enqueue",
            triggered.clone(),
        );
        registry.register(
            "watch_operations_failed",
            "Number of watch stream errors observed",
            watch_operations_failed.clone(),
        );
        registry.register(
            "ready",
            "1 once the controller's informer cache has synced",
            ready.clone(),
        );
        registry.register(
            "reconcile_failures_total",
            "Keys forgotten after exceeding the maximum reconcile attempts",
            reconcile_failures_total.clone(),
        );

        Self {
            controller,
            reconcile: ReconcileMetrics {
                operations,
                failures,
                duration,
            },
            triggered,
            watch_operations_failed,
            ready,
            reconcile_failures_total,
        }
    }

    fn label(&self) -> ControllerLabel {
        ControllerLabel {
            controller: self.controller.to_string(),
        }
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile.operations.get_or_create(&self.label()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            controller: self.controller.to_string(),
            metric: self.reconcile.duration.clone(),
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile.failures.get_or_create(&self.label()).inc();
    }

    pub fn key_forgotten_inc(&self) {
        self.reconcile_failures_total.get_or_create(&self.label()).inc();
    }

    pub fn triggered_inc(&self, action: TriggerAction) {
        self.triggered
            .get_or_create(&TriggerLabel {
                controller: self.controller.to_string(),
                action: action.as_str().to_string(),
            })
            .inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed.get_or_create(&self.label()).inc();
    }

    pub fn ready_set(&self, value: i64) {
        self.ready.get_or_create(&self.label()).set(value);
    }
}

/// Node-local counters the kernel shim / IPSet Manager / Rule Engine contribute, independent
/// of any one controller (spec.md §4.1-§4.4).
pub struct CoreMetrics {
    pub ipset_apply_total: Counter,
    pub ipset_apply_failures_total: Counter,
    pub rule_engine_restarts_total: Counter,
    pub policy_install_failures_total: Counter,
}

impl CoreMetrics {
    fn register(registry: &mut Registry) -> Self {
        let ipset_apply_total = Counter::default();
        let ipset_apply_failures_total = Counter::default();
        let rule_engine_restarts_total = Counter::default();
        let policy_install_failures_total = Counter::default();

        registry.register(
            "ipset_apply_total",
            "Number of IPSet Manager apply() batches sent to the kernel shim",
            ipset_apply_total.clone(),
        );
        registry.register(
            "ipset_apply_failures_total",
            "Number of IPSet Manager apply() batches that failed",
            ipset_apply_failures_total.clone(),
        );
        registry.register(
            "rule_engine_restarts_total",
            "Number of atomic restore calls issued by the Rule Engine",
            rule_engine_restarts_total.clone(),
        );
        registry.register(
            "policy_install_failures_total",
            "Number of policies currently marked failed after a syntax-reject",
            policy_install_failures_total.clone(),
        );

        Self {
            ipset_apply_total,
            ipset_apply_failures_total,
            rule_engine_restarts_total,
            policy_install_failures_total,
        }
    }
}

/// Two independent registries so `/node-metrics` and `/cluster-metrics` (spec.md §6) each
/// encode only the families relevant to them; `Metrics::new` wires the node-local family set.
pub struct Metrics {
    pub node_registry: Registry,
    pub cluster_registry: Registry,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
    pub core: Arc<CoreMetrics>,
}

impl Metrics {
    pub fn new(controller_ids: &[ControllerId]) -> Self {
        let mut node_registry = Registry::default();
        let cluster_registry = Registry::default();

        let controllers = controller_ids
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::register(id, &mut node_registry))))
            .collect();
        let core = Arc::new(CoreMetrics::register(&mut node_registry));

        Self {
            node_registry,
            cluster_registry,
            controllers,
            core,
        }
    }

    pub fn encode_node(&self) -> String {
        let mut buf = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut buf, &self.node_registry);
        buf
    }

    pub fn encode_cluster(&self) -> String {
        let mut buf = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut buf, &self.cluster_registry);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_measurer_records_on_drop() {
        let metrics = Metrics::new(&["pod"]);
        let ctl = metrics.controllers.get("pod").unwrap();
        {
            let _timer = ctl.reconcile_count_and_measure();
        }
        let encoded = metrics.encode_node();
        assert!(encoded.contains("reconcile_operations_total"));
        assert!(encoded.contains("reconcile_duration_seconds"));
    }

    #[test]
    fn triggered_and_ready_labels_present() {
        let metrics = Metrics::new(&["namespace"]);
        let ctl = metrics.controllers.get("namespace").unwrap();
        ctl.triggered_inc(TriggerAction::Apply);
        ctl.ready_set(1);
        let encoded = metrics.encode_node();
        assert!(encoded.contains("action=\"apply\""));
        assert!(encoded.contains("ready"));
    }
}

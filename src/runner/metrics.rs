use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

use std::fmt::{self, Debug};

const OUTCOME: &[&str] = &["outcome"];
const ERROR_KIND: &[&str] = &["kind"];

/// All of the prometheus metrics for one reconciler process. Components get cheap handles
/// to their own subset through `client_metrics`, `reconcile_metrics` and `guard_metrics`.
pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    reconciles_by_outcome: IntCounterVec,
    reconcile_errors_by_kind: IntCounterVec,
    guard_corrections: IntCounter,
    guard_conflicts: IntCounter,
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
    watched_workloads: IntGauge,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let api_server_request_times = Histogram::with_opts(request_time_opts).unwrap();
        registry
            .register(Box::new(api_server_request_times.clone()))
            .unwrap();

        let reconcile_opts = Opts::new("reconciles", "number of reconciles by outcome")
            .subsystem("reconciler")
            .variable_label("outcome");
        let reconciles_by_outcome = IntCounterVec::new(reconcile_opts, OUTCOME).unwrap();
        registry
            .register(Box::new(reconciles_by_outcome.clone()))
            .unwrap();

        let reconcile_error_opts = Opts::new("reconcile_errors", "number of failed reconciles by error kind")
            .subsystem("reconciler")
            .variable_label("kind");
        let reconcile_errors_by_kind = IntCounterVec::new(reconcile_error_opts, ERROR_KIND).unwrap();
        registry
            .register(Box::new(reconcile_errors_by_kind.clone()))
            .unwrap();

        let corrections_opts = Opts::new("corrections", "replica counts clamped back into bounds")
            .subsystem("scale_guard");
        let guard_corrections = IntCounter::with_opts(corrections_opts).unwrap();
        registry.register(Box::new(guard_corrections.clone())).unwrap();

        let conflicts_opts = Opts::new("conflicts", "corrective writes abandoned because of a newer revision")
            .subsystem("scale_guard");
        let guard_conflicts = IntCounter::with_opts(conflicts_opts).unwrap();
        registry.register(Box::new(guard_conflicts.clone())).unwrap();

        let watcher_request_opts = Opts::new("watcher_requests", "number of list and watch requests")
            .subsystem("scale_guard");
        let watcher_requests = IntCounter::with_opts(watcher_request_opts).unwrap();
        registry.register(Box::new(watcher_requests.clone())).unwrap();

        let watcher_error_opts = Opts::new("watcher_errors", "number of errors from the workload watch")
            .subsystem("scale_guard");
        let watcher_errors = IntCounter::with_opts(watcher_error_opts).unwrap();
        registry.register(Box::new(watcher_errors.clone())).unwrap();

        let watch_event_opts = Opts::new("watch_events", "number of workload events received, including the initial list")
            .subsystem("scale_guard");
        let watch_events = IntCounter::with_opts(watch_event_opts).unwrap();
        registry.register(Box::new(watch_events.clone())).unwrap();

        let watched_opts = Opts::new("workloads", "number of workloads returned by the last full list")
            .subsystem("scale_guard");
        let watched_workloads = IntGauge::with_opts(watched_opts).unwrap();
        registry.register(Box::new(watched_workloads.clone())).unwrap();

        Metrics {
            registry,
            api_server_request_times,
            reconciles_by_outcome,
            reconcile_errors_by_kind,
            guard_corrections,
            guard_conflicts,
            watcher_requests,
            watcher_errors,
            watch_events,
            watched_workloads,
        }
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn reconcile_metrics(&self) -> ReconcileMetrics {
        ReconcileMetrics {
            reconciles_by_outcome: self.reconciles_by_outcome.clone(),
            reconcile_errors_by_kind: self.reconcile_errors_by_kind.clone(),
        }
    }

    pub fn guard_metrics(&self) -> GuardMetrics {
        GuardMetrics {
            corrections: self.guard_corrections.clone(),
            conflicts: self.guard_conflicts.clone(),
            watcher_requests: self.watcher_requests.clone(),
            watcher_errors: self.watcher_errors.clone(),
            watch_events: self.watch_events.clone(),
            workloads: self.watched_workloads.clone(),
        }
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    reconciles_by_outcome: IntCounterVec,
    reconcile_errors_by_kind: IntCounterVec,
}

impl Debug for ReconcileMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ReconcileMetrics")
    }
}

impl ReconcileMetrics {
    pub fn outcome(&self, outcome: &str) {
        self.reconciles_by_outcome.with_label_values(&[outcome]).inc();
    }

    pub fn error(&self, kind: &str) {
        self.reconcile_errors_by_kind.with_label_values(&[kind]).inc();
    }
}

#[derive(Clone)]
pub struct GuardMetrics {
    corrections: IntCounter,
    conflicts: IntCounter,
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
    workloads: IntGauge,
}

impl Debug for GuardMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("GuardMetrics")
    }
}

impl GuardMetrics {
    pub fn correction(&self) {
        self.corrections.inc();
    }

    pub fn conflict(&self) {
        self.conflicts.inc();
    }

    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }

    pub fn set_workload_count(&self, count: usize) {
        self.workloads.set(count as i64);
    }
}

use prometheus::{CounterVec, HistogramVec, Opts, Registry};

/// Per-reconciler counters and histograms, matching the call sites every
/// `#[cfg(feature = "metrics")]` block in this crate already uses:
/// a reconcile counter keyed by (name, namespace), an action counter and
/// a read/write-phase histogram keyed by (name, namespace, action).
pub struct ControllerMetrics {
    pub reconcile_counter: CounterVec,
    pub action_counter: CounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let reconcile_counter = CounterVec::new(
            Opts::new(
                "reconcile_total",
                "Number of reconciliations processed by this controller.",
            )
            .subsystem(subsystem),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = CounterVec::new(
            Opts::new(
                "reconcile_action_total",
                "Number of times a given reconcile action was taken.",
            )
            .subsystem(subsystem),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reconcile_read_seconds",
                "Time spent determining the next action during reconciliation.",
            )
            .subsystem(subsystem),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reconcile_write_seconds",
                "Time spent applying the chosen action during reconciliation.",
            )
            .subsystem(subsystem),
            &["name", "namespace", "action"],
        )
        .unwrap();
        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }

    /// Registers this controller's metrics with the process-wide
    /// registry so they're scraped alongside every other controller's.
    pub fn register(&self, registry: &Registry) {
        registry
            .register(Box::new(self.reconcile_counter.clone()))
            .ok();
        registry
            .register(Box::new(self.action_counter.clone()))
            .ok();
        registry
            .register(Box::new(self.read_histogram.clone()))
            .ok();
        registry
            .register(Box::new(self.write_histogram.clone()))
            .ok();
    }
}

/// Pick Engine attempt timings: `pickAndLockDuration`,
/// `initRuntimeDuration`, `totalDuration`.
pub struct PickEngineMetrics {
    pub pick_and_lock_duration: HistogramVec,
    pub init_runtime_duration: HistogramVec,
    pub total_duration: HistogramVec,
    pub picks_total: CounterVec,
}

impl PickEngineMetrics {
    pub fn new() -> Self {
        let picks_total = CounterVec::new(
            Opts::new("picks_total", "Pick Engine attempts by outcome.")
                .subsystem("sandboxclaim"),
            &["outcome"],
        )
        .unwrap();
        let hist = |name: &str, help: &str| {
            HistogramVec::new(
                prometheus::HistogramOpts::new(name, help).subsystem("sandboxclaim"),
                &["outcome"],
            )
            .unwrap()
        };
        Self {
            pick_and_lock_duration: hist(
                "pick_and_lock_duration_seconds",
                "Time from candidate selection through a successful CAS patch.",
            ),
            init_runtime_duration: hist(
                "init_runtime_duration_seconds",
                "Time spent on the optional warm-up step after a successful pick.",
            ),
            total_duration: hist(
                "pick_total_duration_seconds",
                "End-to-end time for one Pick Engine attempt.",
            ),
            picks_total,
        }
    }

    pub fn register(&self, registry: &Registry) {
        registry.register(Box::new(self.picks_total.clone())).ok();
        registry
            .register(Box::new(self.pick_and_lock_duration.clone()))
            .ok();
        registry
            .register(Box::new(self.init_runtime_duration.clone()))
            .ok();
        registry
            .register(Box::new(self.total_duration.clone()))
            .ok();
    }
}

impl Default for PickEngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

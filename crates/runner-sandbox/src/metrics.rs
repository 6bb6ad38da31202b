//! Prometheus metrics for script validation, builds and executions.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for pipeline stage outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "success" or "error".
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind, as reported by [`crate::SandboxError::kind`].
    pub error_kind: String,
}

/// Prometheus metrics for the runner.
pub struct RunnerMetrics {
    /// Total executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Histogram,
    /// Execution errors by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Toolchain builds by outcome.
    pub builds_total: Family<OutcomeLabels, Counter>,
    /// Build duration in seconds.
    pub build_duration_seconds: Histogram,
    /// Scripts rejected by the security validator.
    pub validation_rejections_total: Counter,
}

fn outcome(success: bool) -> OutcomeLabels {
    OutcomeLabels {
        outcome: if success { "success" } else { "error" }.to_string(),
    }
}

impl RunnerMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "runner_executions",
            "Total script executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0].into_iter());
        registry.register(
            "runner_execution_duration_seconds",
            "Script execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "runner_errors",
            "Script execution errors by kind",
            errors_total.clone(),
        );

        let builds_total = Family::default();
        registry.register(
            "runner_builds",
            "Toolchain bundle builds",
            builds_total.clone(),
        );

        let build_duration_seconds =
            Histogram::new([0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0].into_iter());
        registry.register(
            "runner_build_duration_seconds",
            "Toolchain bundle build duration",
            build_duration_seconds.clone(),
        );

        let validation_rejections_total = Counter::default();
        registry.register(
            "runner_validation_rejections",
            "Scripts rejected by the security validator",
            validation_rejections_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
            builds_total,
            build_duration_seconds,
            validation_rejections_total,
        }
    }

    /// Record a finished execution. `error_kind` is `None` on success.
    pub fn record_execution(&self, duration_secs: f64, error_kind: Option<&str>) {
        self.executions_total
            .get_or_create(&outcome(error_kind.is_none()))
            .inc();
        self.execution_duration_seconds.observe(duration_secs);
        if let Some(kind) = error_kind {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.to_string(),
                })
                .inc();
        }
    }

    /// Record a finished build.
    pub fn record_build(&self, duration_secs: f64, success: bool) {
        self.builds_total.get_or_create(&outcome(success)).inc();
        self.build_duration_seconds.observe(duration_secs);
    }

    /// Record a validator rejection.
    pub fn record_rejection(&self) {
        self.validation_rejections_total.inc();
    }
}

/// Prometheus metrics for depth-class inference and training runs.
///
/// Collectors live in a process-wide registry and are registered once by
/// [`init_metrics`]. Recording into an unregistered collector is harmless,
/// it just never shows up in [`gather_metrics`].
///
/// # Example
/// ```no_run
/// use quake_depth::metrics::{self, PREDICTIONS_TOTAL};
///
/// metrics::init_metrics().ok();
/// PREDICTIONS_TOTAL
///     .with_label_values(&["gradient_boosting", "shallow"])
///     .inc();
/// println!("{}", metrics::gather_metrics());
/// ```

use crate::error::AppError;
use lazy_static::lazy_static;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

const NAMESPACE: &str = "quake_depth";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Inference Metrics
    // ============================================================================

    /// Predictions served
    ///
    /// Labels: model, depth_class
    pub static ref PREDICTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("predictions_total", "Total number of depth-class predictions")
            .namespace(NAMESPACE),
        &["model", "depth_class"]
    ).expect("Failed to create PREDICTIONS_TOTAL metric");

    /// End-to-end prediction latency (assemble, scale, classify)
    ///
    /// Labels: model
    pub static ref PREDICTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "prediction_duration_seconds",
            "Depth-class prediction duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        &["model"]
    ).expect("Failed to create PREDICTION_DURATION_SECONDS metric");

    /// Predictions answered without the sequence model
    pub static ref SEQUENCE_MODEL_UNAVAILABLE_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new(
            "sequence_model_unavailable_total",
            "Predictions served while the sequence model was unavailable"
        )
        .namespace(NAMESPACE)
    ).expect("Failed to create SEQUENCE_MODEL_UNAVAILABLE_TOTAL metric");

    /// Artifact load attempts
    ///
    /// Labels: artifact, status (ok, not_found, corrupt)
    pub static ref ARTIFACT_LOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("artifact_loads_total", "Artifact load attempts")
            .namespace(NAMESPACE),
        &["artifact", "status"]
    ).expect("Failed to create ARTIFACT_LOADS_TOTAL metric");

    // ============================================================================
    // Training Metrics
    // ============================================================================

    /// Training pipeline runs
    ///
    /// Labels: status (success, failure)
    pub static ref TRAINING_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("training_runs_total", "Training pipeline runs")
            .namespace(NAMESPACE),
        &["status"]
    ).expect("Failed to create TRAINING_RUNS_TOTAL metric");

    /// Held-out accuracy of the most recent training run
    ///
    /// Labels: model
    pub static ref MODEL_TEST_ACCURACY: GaugeVec = GaugeVec::new(
        Opts::new("model_test_accuracy", "Held-out test accuracy of the last trained model")
            .namespace(NAMESPACE),
        &["model"]
    ).expect("Failed to create MODEL_TEST_ACCURACY metric");

    // ============================================================================
    // Error & System Metrics
    // ============================================================================

    /// Errors by component and error code
    ///
    /// Labels: component, error_type
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("errors_total", "Total number of errors")
            .namespace(NAMESPACE),
        &["component", "error_type"]
    ).expect("Failed to create ERRORS_TOTAL metric");

    /// Build information
    ///
    /// Labels: version, git_commit
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Application build information")
            .namespace(NAMESPACE),
        &["version", "git_commit"]
    ).expect("Failed to create BUILD_INFO metric");
}

/// Register every collector with [`PROMETHEUS_REGISTRY`]
///
/// Fails with `AlreadyReg` when called twice in one process.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    // Inference
    PROMETHEUS_REGISTRY.register(Box::new(PREDICTIONS_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(PREDICTION_DURATION_SECONDS.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(SEQUENCE_MODEL_UNAVAILABLE_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(ARTIFACT_LOADS_TOTAL.clone()))?;

    // Training
    PROMETHEUS_REGISTRY.register(Box::new(TRAINING_RUNS_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(MODEL_TEST_ACCURACY.clone()))?;

    // Errors and build info
    PROMETHEUS_REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(BUILD_INFO.clone()))?;

    BUILD_INFO
        .with_label_values(&[
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_COMMIT").unwrap_or("unknown"),
        ])
        .set(1.0);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Count an error against a component
pub fn record_error(component: &str, error: &AppError) {
    ERRORS_TOTAL
        .with_label_values(&[component, error.error_code()])
        .inc();
}

/// Render the registry in the Prometheus text exposition format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}

use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::links::LinkVerdict;

struct OrchestratorMetrics {
    cycles: Counter<u64>,
    iterations: Histogram<f64>,
    link_checks: Counter<u64>,
}

static METRICS: OnceCell<OrchestratorMetrics> = OnceCell::new();

fn handles() -> &'static OrchestratorMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("rfx.orchestrator");
        OrchestratorMetrics {
            cycles: meter
                .u64_counter("rfx_cycles_total")
                .with_description("Question cycles by terminal status")
                .init(),
            iterations: meter
                .f64_histogram("rfx_cycle_iterations")
                .with_description("Iterations consumed per terminated cycle")
                .init(),
            link_checks: meter
                .u64_counter("rfx_link_checks_total")
                .with_description("Citation reachability checks by verdict")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("RFX_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "RFX_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export orchestrator metrics."
        );
    }
}

/// Record a terminated cycle (no-op if no provider installed).
pub fn record_cycle(status: &str, iterations: u32) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.to_string())];
    metrics.cycles.add(1, &attrs);
    metrics.iterations.record(f64::from(iterations), &attrs);
}

pub fn record_link_verdict(verdict: &LinkVerdict) {
    let attrs = [
        KeyValue::new("reachable", verdict.reachable),
        KeyValue::new("reason", verdict.reason.as_str()),
    ];
    handles().link_checks.add(1, &attrs);
}

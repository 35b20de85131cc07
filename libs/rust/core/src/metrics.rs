//! OpenTelemetry instruments for prediction serving and experiment traffic.
//!
//! Instruments are created lazily against the global meter provider, so they are
//! no-ops until the host process installs an exporter.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

pub struct ServingMetrics {
    pub predictions_total: Counter<u64>,
    pub degraded_predictions_total: Counter<u64>,
    pub member_failures_total: Counter<u64>,
    pub prediction_latency_ms: Histogram<f64>,
    pub assignments_total: Counter<u64>,
    pub sticky_hits_total: Counter<u64>,
    pub outcomes_total: Counter<u64>,
    pub outcomes_dropped_total: Counter<u64>,
}

static SERVING_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("careserve"));

pub static SERVING_METRICS: Lazy<ServingMetrics> = Lazy::new(|| ServingMetrics {
    predictions_total: SERVING_METER.u64_counter("careserve_predictions_total").with_description("Ensemble predictions served, by combination").init(),
    degraded_predictions_total: SERVING_METER.u64_counter("careserve_degraded_predictions_total").with_description("Predictions with at least one substituted member").init(),
    member_failures_total: SERVING_METER.u64_counter("careserve_member_failures_total").with_description("Member model calls that failed or returned an invalid score").init(),
    prediction_latency_ms: SERVING_METER.f64_histogram("careserve_prediction_latency_ms").with_description("End to end ensemble prediction latency ms").with_unit(Unit::new("ms")).init(),
    assignments_total: SERVING_METER.u64_counter("careserve_assignments_total").with_description("First-time experiment assignments").init(),
    sticky_hits_total: SERVING_METER.u64_counter("careserve_sticky_hits_total").with_description("Assignment lookups served from an existing binding").init(),
    outcomes_total: SERVING_METER.u64_counter("careserve_outcomes_total").with_description("Experiment outcomes recorded").init(),
    outcomes_dropped_total: SERVING_METER.u64_counter("careserve_outcomes_dropped_total").with_description("Outcomes ignored (no assignment or score outside [0,1])").init(),
});

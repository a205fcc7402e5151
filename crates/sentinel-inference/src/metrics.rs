use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static LOAD_ATTEMPTS: OnceLock<IntCounterVec> = OnceLock::new();
static INFERENCES: OnceLock<IntCounterVec> = OnceLock::new();
static DIAGNOSIS_DURATION: OnceLock<Histogram> = OnceLock::new();
static LIVE_RESOURCES: OnceLock<IntGauge> = OnceLock::new();

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() {
    let load_attempts = LOAD_ATTEMPTS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("model_load_attempts_total", "Model load attempts per model"),
            &["model", "outcome"],
        )
        .expect("valid metric definition")
    });

    let inferences = INFERENCES.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("inference_total", "Forward passes per model"),
            &["model", "outcome"],
        )
        .expect("valid metric definition")
    });

    let duration = DIAGNOSIS_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "diagnosis_duration_seconds",
            "End-to-end time to diagnose one image",
        ))
        .expect("valid metric definition")
    });

    let live = LIVE_RESOURCES.get_or_init(|| {
        IntGauge::new(
            "live_request_resources",
            "Temporary files and tensors currently held by requests",
        )
        .expect("valid metric definition")
    });

    REGISTRY.register(Box::new(load_attempts.clone())).ok();
    REGISTRY.register(Box::new(inferences.clone())).ok();
    REGISTRY.register(Box::new(duration.clone())).ok();
    REGISTRY.register(Box::new(live.clone())).ok();
}

pub fn inc_load_attempt(model: &str, outcome: &str) {
    if let Some(counter) = LOAD_ATTEMPTS.get() {
        counter.with_label_values(&[model, outcome]).inc();
    }
}

pub fn inc_inference(model: &str, outcome: &str) {
    if let Some(counter) = INFERENCES.get() {
        counter.with_label_values(&[model, outcome]).inc();
    }
}

pub fn observe_diagnosis(seconds: f64) {
    if let Some(histogram) = DIAGNOSIS_DURATION.get() {
        histogram.observe(seconds);
    }
}

pub fn inc_resources() {
    if let Some(gauge) = LIVE_RESOURCES.get() {
        gauge.inc();
    }
}

pub fn dec_resources() {
    if let Some(gauge) = LIVE_RESOURCES.get() {
        gauge.dec();
    }
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

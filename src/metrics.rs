use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).expect("valid metric");
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).expect("valid metric");
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).expect("valid metric");
    // Upload counter by final outcome
    pub static ref UPLOADS: IntCounterVec = IntCounterVec::new(
        Opts::new("uploads", "The number of uploads handled, by outcome"),
        &["outcome"]
    ).expect("valid metric");
    // Data file counter by result
    pub static ref DATA_FILES: IntCounterVec = IntCounterVec::new(
        Opts::new("data_files", "The number of data files seen in uploads, by result"),
        &["result"]
    ).expect("valid metric");
    // Upload processing histogram by outcome
    pub static ref INGESTION_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("ingestion_time", "The time taken to process each upload"),
            buckets: vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0],
        },
        &["outcome"],
    ).expect("valid metric");
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .expect("metric registered once");
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .expect("metric registered once");
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .expect("metric registered once");
    REGISTRY
        .register(Box::new(UPLOADS.clone()))
        .expect("metric registered once");
    REGISTRY
        .register(Box::new(DATA_FILES.clone()))
        .expect("metric registered once");
    REGISTRY
        .register(Box::new(INGESTION_TIME_COLLECTOR.clone()))
        .expect("metric registered once");
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {}", err);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

/// Record the outcome and duration of one upload.
pub fn record_upload(outcome: &str, duration: std::time::Duration) {
    UPLOADS.with_label_values(&[outcome]).inc();
    INGESTION_TIME_COLLECTOR
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

/// Count a data file as processed or skipped.
pub fn record_data_file(result: &str) {
    DATA_FILES.with_label_values(&[result]).inc();
}

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_histogram_vec, register_int_counter_vec, HistogramVec,
    IntCounterVec, Registry,
};

pub const DEFAULT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

lazy_static! {
    pub static ref DB_QUERY_SECONDS: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "db_query_seconds",
            "Duration of database calls",
            DEFAULT_TIME_BUCKETS.to_vec()
        ),
        &["svc", "api"]
    )
    .unwrap();
    pub static ref DB_QUERY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "db_query_failures_total",
        "Failed database calls",
        &["svc", "api"]
    )
    .unwrap();
    pub static ref EVENTS_PUBLISHED: IntCounterVec = register_int_counter_vec!(
        "events_published_total",
        "Events published to the bus by topic and type",
        &["topic", "type"]
    )
    .unwrap();
}

pub fn record_db_call(svc: &'static str, api: &'static str, seconds: f64, success: bool) {
    DB_QUERY_SECONDS.with_label_values(&[svc, api]).observe(seconds);
    if !success {
        DB_QUERY_FAILURES.with_label_values(&[svc, api]).inc();
    }
}

/// Forces initialization of the shared metric families and hands back the
/// default registry they are registered in.
pub fn register_all() -> Registry {
    lazy_static::initialize(&DB_QUERY_SECONDS);
    lazy_static::initialize(&DB_QUERY_FAILURES);
    lazy_static::initialize(&EVENTS_PUBLISHED);
    prometheus::default_registry().clone()
}

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, Registry};

lazy_static! {
    pub static ref JOBS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "worker_jobs_processed_total",
        "Jobs executed by type and terminal state",
        &["type", "state"]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    lazy_static::initialize(&JOBS_PROCESSED);
    cineforge_common::metrics::register_all()
}

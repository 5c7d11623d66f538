use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, Registry};

lazy_static! {
    pub static ref SWEEP_REQUEUED: IntCounterVec = register_int_counter_vec!(
        "monitor_requeued_total",
        "Jobs pushed back to CREATED by sweep context",
        &["context"]
    )
    .unwrap();
    pub static ref SWEEP_OPTIMISTIC_MISSES: IntCounterVec = register_int_counter_vec!(
        "monitor_optimistic_misses_total",
        "Requeue attempts that lost the optimistic attempt guard",
        &["context"]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    lazy_static::initialize(&SWEEP_REQUEUED);
    lazy_static::initialize(&SWEEP_OPTIMISTIC_MISSES);
    cineforge_common::metrics::register_all()
}

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, Registry};

lazy_static! {
    pub static ref COMMANDS_HANDLED: IntCounterVec = register_int_counter_vec!(
        "coordinator_commands_total",
        "Commands handled by outcome",
        &["command", "outcome"]
    )
    .unwrap();
    pub static ref WORKFLOW_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "coordinator_workflow_runs_total",
        "Graph invocations by outcome",
        &["outcome"]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    lazy_static::initialize(&COMMANDS_HANDLED);
    lazy_static::initialize(&WORKFLOW_OUTCOMES);
    cineforge_common::metrics::register_all()
}

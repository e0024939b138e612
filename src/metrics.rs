use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static::lazy_static! {
    pub static ref VECTORS_ADDED_TOTAL: IntCounter = register_int_counter!(
        "ivfsq_vectors_added_total", "Vectors appended to inverted lists"
    ).unwrap();
    pub static ref QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ivfsq_queries_total", "Queries answered", &["metric"]
    ).unwrap();
    pub static ref SEARCH_DURATION: Histogram = register_histogram!(
        "ivfsq_search_duration_seconds", "Batch search duration",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();
    pub static ref TRAININGS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ivfsq_trainings_total", "Training runs", &["status"]
    ).unwrap();
    pub static ref BYTES_RECLAIMED_TOTAL: IntCounter = register_int_counter!(
        "ivfsq_bytes_reclaimed_total", "List storage released by reclaim"
    ).unwrap();
    pub static ref ALLOCATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "ivfsq_allocation_failures_total", "List allocations refused by the memory budget"
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&VECTORS_ADDED_TOTAL);
    lazy_static::initialize(&QUERIES_TOTAL);
    lazy_static::initialize(&SEARCH_DURATION);
    lazy_static::initialize(&TRAININGS_TOTAL);
    lazy_static::initialize(&BYTES_RECLAIMED_TOTAL);
    lazy_static::initialize(&ALLOCATION_FAILURES_TOTAL);
}

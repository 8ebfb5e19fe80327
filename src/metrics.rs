use tracing::trace;

// Trace-level counters; the Prometheus recorder picks up what it is told to.

pub fn inc_requests(route: &'static str) {
    trace!(target = "emlak.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "emlak.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

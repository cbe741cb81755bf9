//! Prometheus Metrics
//!
//! Counters registered once in the default registry; the binary serves them
//! on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Fragment writes by outcome (`ok`, `error`, `skipped`)
pub static FRAGMENT_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mojettestor_fragment_writes_total",
        "Fragment write attempts by outcome",
        &["outcome"]
    )
    .expect("fragment write counter registers once")
});

/// Fragment reads by outcome (`ok`, `error`, `skipped`)
pub static FRAGMENT_READS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mojettestor_fragment_reads_total",
        "Fragment read attempts by outcome",
        &["outcome"]
    )
    .expect("fragment read counter registers once")
});

/// Reconnect-and-retry rounds by path (`read`, `write`)
pub static RUN_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mojettestor_run_retries_total",
        "Runs retried after reconnecting unreachable slots",
        &["path"]
    )
    .expect("run retry counter registers once")
});

/// Blocks served as zeros without network I/O
pub static SPARSE_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "mojettestor_sparse_blocks_total",
        "Blocks read from an empty distribution bitmap"
    )
    .expect("sparse block counter registers once")
});

/// Completed capacity balancing passes
pub static BALANCE_PASSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "mojettestor_balance_passes_total",
        "Capacity balancing passes completed"
    )
    .expect("balance pass counter registers once")
});

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";
pub const OUTCOME_SKIPPED: &str = "skipped";

/// Encode every registered metric in the text exposition format
pub fn gather_text() -> Vec<u8> {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        SPARSE_BLOCKS.inc();
        FRAGMENT_WRITES.with_label_values(&[OUTCOME_OK]).inc();

        let text = String::from_utf8(gather_text()).unwrap();
        assert!(text.contains("mojettestor_sparse_blocks_total"));
        assert!(text.contains("mojettestor_fragment_writes_total{outcome=\"ok\"}"));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde_json::{json, Value};

/// Process-wide request counters, exposed as JSON at `GET /metrics`.
#[derive(Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    generation_requests: AtomicU64,
    tokens_generated: AtomicU64,
    errors_total: AtomicU64,
}

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

impl Metrics {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation(&self) {
        self.generation_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, count: u64) {
        self.tokens_generated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "generation_requests": self.generation_requests.load(Ordering::Relaxed),
            "tokens_generated": self.tokens_generated.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_the_snapshot() {
        let metrics = Metrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_generation();
        metrics.add_tokens(42);
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["requests_total"], 2);
        assert_eq!(snapshot["generation_requests"], 1);
        assert_eq!(snapshot["tokens_generated"], 42);
        assert_eq!(snapshot["errors_total"], 1);
    }
}

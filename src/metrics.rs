//! Metric instruments for the async wait stage.
//!
//! Instruments are created from the global OpenTelemetry meter. The
//! crate never installs a meter provider; until the embedding process
//! does, every instrument is a no-op.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::UpDownCounter;
use opentelemetry::KeyValue;

use crate::recovery::StepId;

pub(crate) struct AsyncWaitMetrics {
    pub(crate) labels: Vec<KeyValue>,
    pub(crate) invocations: Counter<u64>,
    pub(crate) retries: Counter<u64>,
    pub(crate) timeouts: Counter<u64>,
    pub(crate) fallbacks: Counter<u64>,
    pub(crate) item_out_count: Counter<u64>,
    pub(crate) in_flight: UpDownCounter<i64>,
    pub(crate) invocation_histogram: Histogram<f64>,
    pub(crate) snapshot_histogram: Histogram<f64>,
}

impl AsyncWaitMetrics {
    pub(crate) fn new(step_id: &StepId) -> Self {
        let meter = global::meter("async_wait");
        let invocations = meter
            .u64_counter("async_invocations")
            .with_description("number of attempts started, retries included")
            .init();
        let retries = meter
            .u64_counter("async_retries")
            .with_description("number of attempts scheduled as a retry")
            .init();
        let timeouts = meter
            .u64_counter("async_timeouts")
            .with_description("number of entries that hit the overall timeout")
            .init();
        let fallbacks = meter
            .u64_counter("async_fallbacks")
            .with_description("number of failed entries replaced by fallback output")
            .init();
        let item_out_count = meter
            .u64_counter("item_out_count")
            .with_description("number of items this step has emitted")
            .init();
        let in_flight = meter
            .i64_up_down_counter("async_in_flight")
            .with_description("number of entries currently in the queue")
            .init();
        let invocation_histogram = meter
            .f64_histogram("async_invocation_duration_seconds")
            .with_description("processing time from an attempt starting to its result arriving")
            .init();
        let snapshot_histogram = meter
            .f64_histogram("snapshot_duration_seconds")
            .with_description("`snapshot` duration in seconds")
            .init();
        let labels = vec![KeyValue::new("step_id", step_id.0.to_string())];
        Self {
            labels,
            invocations,
            retries,
            timeouts,
            fallbacks,
            item_out_count,
            in_flight,
            invocation_histogram,
            snapshot_histogram,
        }
    }
}

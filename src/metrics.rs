//! Process-global metrics the core emits.
//!
//! Collectors register against the default registry; exposition is the
//! responsibility of the deployment's metrics backend.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, histogram_opts, opts, register_histogram_vec,
    register_int_counter_vec,
};

static MSG_SEND_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "courier_msg_send_seconds",
            "Time taken to hand a message to its provider"
        ),
        &["channel_type"]
    )
    .expect("collector registration")
});

static MSG_SEND_ERROR_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "courier_msg_send_error_seconds",
            "Time spent on send attempts that errored or failed"
        ),
        &["channel_type"]
    )
    .expect("collector registration")
});

static RECEIVE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_receive_total",
            "Messages, statuses and events received via webhooks"
        ),
        &["channel_type", "kind"]
    )
    .expect("collector registration")
});

/// Record a completed send attempt.
pub fn record_send(channel_type: &str, elapsed: Duration, success: bool) {
    let histogram = if success {
        &MSG_SEND_SECONDS
    } else {
        &MSG_SEND_ERROR_SECONDS
    };
    histogram
        .with_label_values(&[channel_type])
        .observe(elapsed.as_secs_f64());
}

/// Count one received msg/status/event.
pub fn record_receive(channel_type: &str, kind: &str) {
    RECEIVE_TOTAL.with_label_values(&[channel_type, kind]).inc();
}

//! Prometheus counters for the relay.
//!
//! Registered once in the global default registry and rendered by the
//! `/metrics` handler.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, CounterVec, Encoder, TextEncoder};

static WEBHOOK_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("hookrelay_webhook_requests_total", "Webhook requests by outcome"),
        &["outcome"]
    )
    .expect("failed to register hookrelay_webhook_requests_total")
});

static COMMANDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("hookrelay_commands_total", "Slash commands by command name"),
        &["command"]
    )
    .expect("failed to register hookrelay_commands_total")
});

static RECONCILE_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("hookrelay_reconcile_events_total", "Reconciliation events applied, by kind"),
        &["kind"]
    )
    .expect("failed to register hookrelay_reconcile_events_total")
});

/// `outcome` is one of a fixed set of short labels (`ok`, `not_found`, ...).
pub fn record_webhook(outcome: &str) {
    WEBHOOK_REQUESTS.with_label_values(&[outcome]).inc();
}

/// Unknown commands are bucketed so arbitrary input can't grow cardinality.
pub fn record_command(command: &str) {
    let label = if command.starts_with("/hookrelay-") {
        command
    } else {
        "other"
    };
    COMMANDS.with_label_values(&[label]).inc();
}

pub fn record_reconcile_event(kind: &str) {
    RECONCILE_EVENTS.with_label_values(&[kind]).inc();
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    // Touch the lazies so every family shows up before its first increment.
    Lazy::force(&WEBHOOK_REQUESTS);
    Lazy::force(&COMMANDS);
    Lazy::force(&RECONCILE_EVENTS);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

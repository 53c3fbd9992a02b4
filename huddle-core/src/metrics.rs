//! Prometheus metrics for presence, calls and signaling
//!
//! Everything registers into one process-wide registry exposed via the
//! `/metrics` endpoint.

use prometheus::{
    register_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, IntCounter, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Presence and transport connections
pub mod presence {
    use super::{register_int_gauge_with_registry, IntGauge, REGISTRY};

    /// Live signaling connections
    pub static ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "huddle_active_connections",
            "Current number of live signaling connections",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_CONNECTIONS")
    });

    /// Users with at least one live connection
    pub static ONLINE_USERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "huddle_online_users",
            "Current number of online users",
            REGISTRY.clone()
        )
        .expect("Failed to register ONLINE_USERS")
    });
}

/// Call sessions
pub mod calls {
    use super::{
        register_counter_vec_with_registry, register_int_counter_with_registry,
        register_int_gauge_with_registry, CounterVec, IntCounter, IntGauge, REGISTRY,
    };

    pub static ACTIVE_CALLS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "huddle_active_calls",
            "Current number of active call sessions",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_CALLS")
    });

    pub static CALL_PARTICIPANTS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "huddle_call_participants",
            "Current number of participants across all calls",
            REGISTRY.clone()
        )
        .expect("Failed to register CALL_PARTICIPANTS")
    });

    pub static CALLS_ENDED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "huddle_calls_ended_total",
            "Total number of call sessions torn down",
            REGISTRY.clone()
        )
        .expect("Failed to register CALLS_ENDED")
    });

    /// Errors returned to clients, by error kind
    pub static CALL_ERRORS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "huddle_call_errors_total",
            "Total number of errors reported back to clients",
            &["kind"],
            REGISTRY.clone()
        )
        .expect("Failed to register CALL_ERRORS")
    });
}

/// Signaling relay
pub mod signaling {
    use super::{register_counter_vec_with_registry, CounterVec, REGISTRY};

    /// Envelopes forwarded, by payload kind
    pub static ENVELOPES_RELAYED: std::sync::LazyLock<CounterVec> =
        std::sync::LazyLock::new(|| {
            register_counter_vec_with_registry!(
                "huddle_signaling_envelopes_total",
                "Total number of signaling envelopes relayed",
                &["kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register ENVELOPES_RELAYED")
        });
}

/// Render all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

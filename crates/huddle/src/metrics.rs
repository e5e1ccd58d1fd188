use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUESTS_PROPOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "huddle_requests_proposed_total",
            "Connect requests submitted to the broker",
        ),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REQUEST_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "huddle_request_outcomes_total",
            "Connect requests by terminal status",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LINK_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "huddle_link_transitions_total",
            "Peer link state transitions by target state",
        ),
        &["state", "role"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIVE_LINKS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("huddle_active_links", "Peer links not yet closed").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RELAY_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "huddle_relay_published_total",
            "Signaling envelopes accepted by the relay",
        ),
        &["slot"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RELAY_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "huddle_relay_delivered_total",
            "Signaling envelopes handed to a subscriber",
        ),
        &["slot"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESH_MEMBERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "huddle_mesh_members",
        "Remote members tracked by local mesh sessions",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(target = "huddle::metrics", error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_contains_touched_series() {
        REQUEST_OUTCOMES.with_label_values(&["accepted"]).inc();
        let text = gather();
        assert!(text.contains("huddle_request_outcomes_total"));
    }
}

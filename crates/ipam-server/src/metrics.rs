//! Prometheus metrics.

use crate::error::ServerError;
use ipam::AllocatorStatus;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Request counters plus gauges refreshed from the allocator on each scrape.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    owned: IntGauge,
    free: IntGauge,
    pending_allocates: IntGauge,
    pending_claims: IntGauge,
    awaiting_consensus: IntGauge,
}

impl Metrics {
    /// # Errors
    ///
    /// Registration failures.
    pub fn new() -> Result<Self, ServerError> {
        let registry = Registry::new_custom(Some("ipam".to_string()), None)?;
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Allocator requests by operation and outcome"),
            &["op", "outcome"],
        )?;
        let owned = IntGauge::new("owned_addresses", "Addresses in ranges this peer owns")?;
        let free = IntGauge::new("free_addresses", "Unallocated addresses in ranges this peer owns")?;
        let pending_allocates = IntGauge::new("pending_allocates", "Allocations waiting for space")?;
        let pending_claims = IntGauge::new("pending_claims", "Claims waiting for space or consensus")?;
        let awaiting_consensus = IntGauge::new("awaiting_consensus", "1 while the ring is not yet agreed")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(owned.clone()))?;
        registry.register(Box::new(free.clone()))?;
        registry.register(Box::new(pending_allocates.clone()))?;
        registry.register(Box::new(pending_claims.clone()))?;
        registry.register(Box::new(awaiting_consensus.clone()))?;

        Ok(Self {
            registry,
            requests,
            owned,
            free,
            pending_allocates,
            pending_claims,
            awaiting_consensus,
        })
    }

    pub fn observe<T, E>(&self, op: &str, result: &Result<T, E>) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.requests.with_label_values(&[op, outcome]).inc();
    }

    pub fn update(&self, status: &AllocatorStatus) {
        self.owned.set(clamp(status.num_owned));
        self.free.set(clamp(status.num_free));
        self.pending_allocates.set(clamp(status.pending_allocates as u128));
        self.pending_claims.set(clamp(status.pending_claims as u128));
        self.awaiting_consensus.set(i64::from(status.awaiting_consensus));
    }

    /// Text exposition of every registered metric.
    ///
    /// # Errors
    ///
    /// Encoding failures.
    pub fn render(&self) -> Result<String, ServerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

// IPv6 universes overflow i64
fn clamp(n: u128) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam::PeerName;

    #[test]
    fn test_render_includes_counters_and_gauges() {
        let metrics = Metrics::new().expect("metrics");
        metrics.observe::<(), ()>("allocate", &Ok(()));
        metrics.observe::<(), ()>("allocate", &Err(()));
        metrics.observe::<(), ()>("allocate", &Ok(()));
        metrics.update(&AllocatorStatus {
            peer: PeerName::from("a"),
            nickname: "host-a".to_string(),
            universe: "10.0.0.0/24".to_string(),
            awaiting_consensus: false,
            num_owned: 256,
            num_free: 250,
            pending_allocates: 1,
            pending_claims: 0,
            ring: Vec::new(),
        });

        let text = metrics.render().expect("render");
        assert!(text.contains(r#"ipam_requests_total{op="allocate",outcome="ok"} 2"#), "{text}");
        assert!(text.contains(r#"ipam_requests_total{op="allocate",outcome="error"} 1"#), "{text}");
        assert!(text.contains("ipam_owned_addresses 256"), "{text}");
        assert!(text.contains("ipam_free_addresses 250"), "{text}");
        assert!(text.contains("ipam_awaiting_consensus 0"), "{text}");
    }

    #[test]
    fn test_huge_counts_saturate() {
        assert_eq!(clamp(1u128 << 100), i64::MAX);
        assert_eq!(clamp(42), 42);
    }
}

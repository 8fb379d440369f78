use prometheus::{
    register_gauge_with_registry, register_int_counter_with_registry, Gauge, IntCounter, Registry,
};
use std::sync::Arc;

pub struct FacilitatorMetrics {
    pub registrations: IntCounter,
    pub registration_conflicts: IntCounter,
    pub matches: IntCounter,
    pub empty_matches: IntCounter,
    pub protocol_errors: IntCounter,
    pub guard_disconnects: IntCounter,
    pub active_connections: Gauge,
    pub unserved_clients: Gauge,
    pub relays: Gauge,
    pub registry: Arc<Registry>,
}

impl FacilitatorMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations = register_int_counter_with_registry!(
            "fpx_facilitator_registrations_total",
            "Total number of client registrations accepted",
            registry
        )?;

        let registration_conflicts = register_int_counter_with_registry!(
            "fpx_facilitator_registration_conflicts_total",
            "Total number of registrations rejected because the address was already registered",
            registry
        )?;

        let matches = register_int_counter_with_registry!(
            "fpx_facilitator_matches_total",
            "Total number of client/relay pairs handed to proxies",
            registry
        )?;

        let empty_matches = register_int_counter_with_registry!(
            "fpx_facilitator_empty_matches_total",
            "Total number of proxy polls answered with no client",
            registry
        )?;

        let protocol_errors = register_int_counter_with_registry!(
            "fpx_facilitator_protocol_errors_total",
            "Total number of malformed or unknown requests",
            registry
        )?;

        let guard_disconnects = register_int_counter_with_registry!(
            "fpx_facilitator_guard_disconnects_total",
            "Total number of connections closed for exceeding the deadline or line limit",
            registry
        )?;

        let active_connections = register_gauge_with_registry!(
            "fpx_facilitator_active_connections",
            "Number of open connections",
            registry
        )?;

        let unserved_clients = register_gauge_with_registry!(
            "fpx_facilitator_unserved_clients",
            "Number of registered clients not yet handed to any proxy",
            registry
        )?;

        let relays = register_gauge_with_registry!(
            "fpx_facilitator_relays",
            "Number of registered relays",
            registry
        )?;

        Ok(Self {
            registrations,
            registration_conflicts,
            matches,
            empty_matches,
            protocol_errors,
            guard_disconnects,
            active_connections,
            unserved_clients,
            relays,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

//! Facilitator state and request dispatch

use std::sync::Arc;
use std::time::Duration;

use fpx_registry::{canonical, Endpoint, Endpoints, Registries, Transport};
use tracing::{debug, info, warn};

use crate::addr::{parse_addr_spec, scrub};
use crate::config::ServerConfig;
use crate::metrics::FacilitatorMetrics;
use crate::protocol::Transaction;

/// Transport assumed when a client or proxy does not name one.
pub const DEFAULT_TRANSPORT: &str = "websocket";

/// A reply to send back, and whether the connection survives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub transaction: Transaction,
    pub keep_open: bool,
}

impl Reply {
    fn keep(transaction: Transaction) -> Self {
        Self {
            transaction,
            keep_open: true,
        }
    }

    /// `ERROR`, after which the connection is closed.
    pub fn error() -> Self {
        Self {
            transaction: Transaction::new("ERROR"),
            keep_open: false,
        }
    }
}

/// Shared facilitator state: client and relay registries for both address
/// families. Handed to every connection task by `Arc`.
pub struct Facilitator {
    clients: Registries,
    relays: Registries,
    check_back_in: Duration,
    unsafe_logging: bool,
    metrics: Arc<FacilitatorMetrics>,
}

impl Facilitator {
    pub fn new(config: &ServerConfig, metrics: Arc<FacilitatorMetrics>) -> Self {
        Self {
            clients: Registries::new(config.client_max_serve()),
            relays: Registries::new(None),
            check_back_in: config.check_back_in(),
            unsafe_logging: config.unsafe_logging,
            metrics,
        }
    }

    pub fn clients(&self) -> &Registries {
        &self.clients
    }

    pub fn relays(&self) -> &Registries {
        &self.relays
    }

    pub fn metrics(&self) -> &Arc<FacilitatorMetrics> {
        &self.metrics
    }

    pub fn unsafe_logging(&self) -> bool {
        self.unsafe_logging
    }

    /// Refresh the registry gauges.
    pub fn update_gauges(&self) {
        self.metrics
            .unserved_clients
            .set(self.clients.num_unserved_endpoints() as f64);
        self.metrics.relays.set(self.relays.len() as f64);
    }

    pub fn handle(&self, request: &Transaction) -> Reply {
        let reply = match request.command.as_str() {
            "GETREG" => self.do_getreg(request),
            "PUTREG" => self.do_putreg(request),
            other => {
                warn!(command = other, "Unrecognized command");
                Reply::error()
            }
        };
        if !reply.keep_open {
            self.metrics.protocol_errors.inc();
        }
        reply
    }

    fn do_getreg(&self, request: &Transaction) -> Reply {
        let Some(from) = request.param("FROM") else {
            warn!("GETREG missing FROM param");
            return Reply::error();
        };
        let proxy_addr = match parse_addr_spec(from, Some(0)) {
            Ok(addr) => canonical(&addr),
            Err(e) => {
                warn!(error = %e, "GETREG bad FROM param");
                return Reply::error();
            }
        };

        let mut outers: Vec<&str> = request.param_all("PROXY-TRANSPORT").collect();
        if outers.is_empty() {
            outers.push(DEFAULT_TRANSPORT);
        }

        let proxy = scrub(&proxy_addr, self.unsafe_logging);
        let check_back_in = self.check_back_in.as_secs().to_string();
        let clients = self.clients.for_addr(&proxy_addr);
        let relays = self.relays.for_addr(&proxy_addr);

        let reply = match Endpoints::match_endpoints(clients, relays, outers.as_slice()) {
            Some((client, relay)) => {
                self.metrics.matches.inc();
                info!(
                    proxy = %proxy,
                    client = %scrub(&client.addr, self.unsafe_logging),
                    relay = %relay.addr,
                    transports = ?outers,
                    remaining = clients.len(),
                    "Proxy gets client"
                );
                match_reply(&client, &relay, &check_back_in)
            }
            None => {
                self.metrics.empty_matches.inc();
                debug!(proxy = %proxy, transports = ?outers, "Proxy gets none");
                Transaction::new("NONE").with_param("CHECK-BACK-IN", check_back_in)
            }
        };

        self.update_gauges();
        Reply::keep(reply)
    }

    fn do_putreg(&self, request: &Transaction) -> Reply {
        let Some(client_spec) = request.param("CLIENT") else {
            warn!("PUTREG missing CLIENT param");
            return Reply::error();
        };
        let client_addr = match parse_addr_spec(client_spec, None) {
            Ok(addr) => canonical(&addr),
            Err(e) => {
                warn!(error = %scrub(&e, self.unsafe_logging), "PUTREG bad CLIENT param");
                return Reply::error();
            }
        };
        let transport_spec = request.param("TRANSPORT").unwrap_or(DEFAULT_TRANSPORT);
        let transport: Transport = match transport_spec.parse() {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "PUTREG bad TRANSPORT param");
                return Reply::error();
            }
        };

        let client = scrub(&client_addr, self.unsafe_logging);
        let label = client_addr.to_string();
        let registry = self.clients.for_addr(&client_addr);
        let reply = if registry.add_endpoint(label, transport.clone()) {
            self.metrics.registrations.inc();
            info!(client = %client, transport = %transport, "Client registered");
            Transaction::new("OK")
        } else {
            self.metrics.registration_conflicts.inc();
            debug!(client = %client, "Client already registered");
            Transaction::new("FAIL")
        };

        self.update_gauges();
        Reply::keep(reply)
    }
}

fn match_reply(client: &Endpoint, relay: &Endpoint, check_back_in: &str) -> Transaction {
    Transaction::new("OK")
        .with_param("CLIENT", client.addr.as_str())
        .with_param("CLIENT-TRANSPORT", client.transport.to_string())
        .with_param("RELAY", relay.addr.as_str())
        .with_param("RELAY-TRANSPORT", relay.transport.to_string())
        .with_param("CHECK-BACK-IN", check_back_in)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpx_registry::AddressFamily;

    fn facilitator(max_serve: u32) -> Facilitator {
        let config = ServerConfig {
            client_max_serve: max_serve,
            ..ServerConfig::default()
        };
        let fac = Facilitator::new(&config, Arc::new(FacilitatorMetrics::new().unwrap()));
        fac.relays()
            .get(AddressFamily::V4)
            .add_endpoint("0.0.1.0:1", Transport::plain("websocket"));
        fac.relays()
            .get(AddressFamily::V6)
            .add_endpoint("[::1:0]:1", Transport::plain("websocket"));
        fac
    }

    fn request(line: &str) -> Transaction {
        Transaction::parse(line).unwrap()
    }

    #[test]
    fn test_putreg_then_getreg() {
        let fac = facilitator(10);
        let reply = fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000" TRANSPORT="websocket""#));
        assert_eq!(reply, Reply::keep(Transaction::new("OK")));

        let reply = fac.handle(&request(
            r#"GETREG FROM="2.2.2.2:13000" PROXY-TRANSPORT="websocket" PROXY-TRANSPORT="webrtc""#,
        ));
        assert!(reply.keep_open);
        let tx = reply.transaction;
        assert_eq!(tx.command, "OK");
        assert_eq!(tx.param("CLIENT"), Some("1.1.1.1:9000"));
        assert_eq!(tx.param("CLIENT-TRANSPORT"), Some("websocket"));
        assert_eq!(tx.param("RELAY"), Some("0.0.1.0:1"));
        assert_eq!(tx.param("RELAY-TRANSPORT"), Some("websocket"));
        assert_eq!(tx.param("CHECK-BACK-IN"), Some("10"));
    }

    #[test]
    fn test_putreg_conflict_keeps_first() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000" TRANSPORT="obfs3|websocket""#));
        let reply = fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000" TRANSPORT="websocket""#));
        assert_eq!(reply, Reply::keep(Transaction::new("FAIL")));
        assert_eq!(
            fac.clients().get(AddressFamily::V4).get("1.1.1.1:9000"),
            Some(Transport::new("obfs3", "websocket"))
        );
    }

    #[test]
    fn test_putreg_default_transport() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="[11::11]:9000""#));
        assert_eq!(
            fac.clients().get(AddressFamily::V6).get("[11::11]:9000"),
            Some(Transport::plain(DEFAULT_TRANSPORT))
        );
    }

    #[test]
    fn test_putreg_rejects_bad_input() {
        let fac = facilitator(10);
        for line in [
            "PUTREG",
            r#"PUTREG CLIENT="1.1.1.1""#,
            r#"PUTREG CLIENT="example.com:80""#,
            r#"PUTREG CLIENT="1.1.1.1:9000" TRANSPORT="a||websocket""#,
        ] {
            assert_eq!(fac.handle(&request(line)), Reply::error(), "{line}");
        }
        assert!(fac.clients().is_empty());
    }

    #[test]
    fn test_getreg_respects_address_family() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="[11::11]:9000""#));

        let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2:13000""#));
        assert_eq!(reply.transaction.command, "NONE");
        assert_eq!(reply.transaction.param("CHECK-BACK-IN"), Some("10"));

        let reply = fac.handle(&request(r#"GETREG FROM="[22::22]:13000""#));
        assert_eq!(reply.transaction.param("CLIENT"), Some("[11::11]:9000"));
        assert_eq!(reply.transaction.param("RELAY"), Some("[::1:0]:1"));
    }

    #[test]
    fn test_mapped_client_handed_out_as_ipv4() {
        let fac = facilitator(10);
        let reply = fac.handle(&request(r#"PUTREG CLIENT="[::ffff:1.1.1.1]:9000""#));
        assert_eq!(reply.transaction.command, "OK");

        // Same endpoint, other spelling.
        let reply = fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));
        assert_eq!(reply.transaction.command, "FAIL");

        let reply = fac.handle(&request(r#"GETREG FROM="[22::22]:13000""#));
        assert_eq!(reply.transaction.command, "NONE");

        let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2""#));
        assert_eq!(reply.transaction.command, "OK");
        assert_eq!(reply.transaction.param("CLIENT"), Some("1.1.1.1:9000"));
        assert_eq!(reply.transaction.param("RELAY"), Some("0.0.1.0:1"));
    }

    #[test]
    fn test_mapped_proxy_gets_ipv4_client() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));
        let reply = fac.handle(&request(r#"GETREG FROM="[::ffff:2.2.2.2]:13000""#));
        assert_eq!(reply.transaction.param("CLIENT"), Some("1.1.1.1:9000"));
    }

    #[test]
    fn test_getreg_proxy_port_optional() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));
        let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2""#));
        assert_eq!(reply.transaction.command, "OK");
    }

    #[test]
    fn test_getreg_unsupported_transport() {
        let fac = facilitator(10);
        fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));
        let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2:1" PROXY-TRANSPORT="webrtc""#));
        assert_eq!(reply.transaction.command, "NONE");
        assert_eq!(fac.clients().num_unserved_endpoints(), 1);
    }

    #[test]
    fn test_client_exhausted_after_max_serve() {
        let fac = facilitator(2);
        fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));

        for _ in 0..2 {
            let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2:1""#));
            assert_eq!(reply.transaction.command, "OK");
        }
        let reply = fac.handle(&request(r#"GETREG FROM="2.2.2.2:1""#));
        assert_eq!(reply.transaction.command, "NONE");

        // Once exhausted the client may register again.
        let reply = fac.handle(&request(r#"PUTREG CLIENT="1.1.1.1:9000""#));
        assert_eq!(reply.transaction.command, "OK");
    }

    #[test]
    fn test_unknown_command_closes() {
        let fac = facilitator(10);
        assert_eq!(fac.handle(&request("HELLO")), Reply::error());
        assert_eq!(fac.handle(&request("GETREG")), Reply::error());
        assert_eq!(fac.metrics().protocol_errors.get(), 2);
    }
}

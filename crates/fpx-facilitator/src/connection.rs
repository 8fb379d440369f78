//! Per-connection request loop

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::addr::scrub;
use crate::facilitator::{Facilitator, Reply};
use crate::guard::{GuardConfig, GuardError, GuardedConnection};
use crate::protocol::Transaction;

/// Serve requests on one accepted stream until the peer hangs up, sends
/// something unparseable, or breaches the guard.
pub async fn handle_connection<S>(
    facilitator: Arc<Facilitator>,
    stream: S,
    peer: SocketAddr,
    guard: GuardConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let metrics = Arc::clone(facilitator.metrics());
    metrics.active_connections.inc();

    let peer_display = scrub(&peer, facilitator.unsafe_logging());
    let mut conn = GuardedConnection::new(stream, guard);

    match serve_requests(&facilitator, &mut conn).await {
        Ok(()) => debug!(peer = %peer_display, "Connection closed"),
        Err(e) if e.is_limit() => {
            metrics.guard_disconnects.inc();
            debug!(peer = %peer_display, error = %e, "Connection cut off");
        }
        Err(e) => debug!(peer = %peer_display, error = %e, "Connection error"),
    }

    let _ = conn.shutdown().await;
    metrics.active_connections.dec();
}

async fn serve_requests<S>(
    facilitator: &Facilitator,
    conn: &mut GuardedConnection<S>,
) -> Result<(), GuardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = conn.read_line().await? {
        let reply = match Transaction::parse(&line) {
            Ok(request) => facilitator.handle(&request),
            Err(e) => {
                warn!(error = %e, "Unparseable request");
                facilitator.metrics().protocol_errors.inc();
                Reply::error()
            }
        };

        conn.write_line(&reply.transaction.to_string()).await?;
        if !reply.keep_open {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::metrics::FacilitatorMetrics;
    use fpx_registry::{AddressFamily, Transport};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn facilitator() -> Arc<Facilitator> {
        let fac = Facilitator::new(
            &ServerConfig::default(),
            Arc::new(FacilitatorMetrics::new().unwrap()),
        );
        fac.relays()
            .get(AddressFamily::V4)
            .add_endpoint("0.0.1.0:1", Transport::plain("websocket"));
        Arc::new(fac)
    }

    fn peer() -> SocketAddr {
        "192.0.2.1:5555".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_on_one_connection() {
        let fac = facilitator();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(handle_connection(Arc::clone(&fac), server, peer(), GuardConfig::default()));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"PUTREG CLIENT=\"1.1.1.1:9000\"\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("OK"));

        write.write_all(b"PUTREG CLIENT=\"1.1.1.1:9000\"\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("FAIL"));

        write.write_all(b"GETREG FROM=\"2.2.2.2\"\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        let reply = Transaction::parse(&reply).unwrap();
        assert_eq!(reply.command, "OK");
        assert_eq!(reply.param("CLIENT"), Some("1.1.1.1:9000"));

        write.shutdown().await.unwrap();
        assert_eq!(lines.next_line().await.unwrap(), None);
        task.await.unwrap();
        assert_eq!(fac.metrics().active_connections.get(), 0.0);
        assert_eq!(fac.metrics().guard_disconnects.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_closes_connection() {
        let fac = facilitator();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(handle_connection(Arc::clone(&fac), server, peer(), GuardConfig::default()));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"BOGUS\nPUTREG CLIENT=\"1.1.1.1:9000\"\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ERROR"));
        assert_eq!(lines.next_line().await.unwrap(), None);

        task.await.unwrap();
        assert!(fac.clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_line_gets_error() {
        let fac = facilitator();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(handle_connection(Arc::clone(&fac), server, peer(), GuardConfig::default()));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"PUTREG CLIENT=\"unterminated\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ERROR"));

        task.await.unwrap();
        assert_eq!(fac.metrics().protocol_errors.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_cut_off() {
        let fac = facilitator();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(handle_connection(Arc::clone(&fac), server, peer(), GuardConfig::default()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        task.await.unwrap();
        assert_eq!(fac.metrics().guard_disconnects.get(), 1);
        drop(client);
    }
}

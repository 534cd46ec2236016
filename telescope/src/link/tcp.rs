//! TCP client link

use super::channel::{pump, ChannelLink, LinkEvent, EVENT_CHANNEL_CAPACITY, OUTGOING_CHANNEL_CAPACITY};
use crate::error::LinkError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Resolve `host` synchronously and pick its first IPv4 address
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| LinkError::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| LinkError::NoIpv4Address(host.to_string()))
}

/// Start connecting to `host:port`.
///
/// Returns immediately; the link reports establishment or failure through
/// [`super::Link::poll_established`].
pub fn connect_tcp(
    handle: &Handle,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<ChannelLink, LinkError> {
    let addr = resolve_ipv4(host, port)?;
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(OUTGOING_CHANNEL_CAPACITY);

    tracing::debug!("Connecting to {} ({}:{})", addr, host, port);
    let task = handle.spawn(async move {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(LinkEvent::Failed(LinkError::ConnectFailed(format!("{}: {}", addr, e))))
                    .await;
                return;
            }
            Err(_) => {
                let ms = connect_timeout.as_millis() as u64;
                let _ = event_tx.send(LinkEvent::Failed(LinkError::ConnectTimeout(ms))).await;
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        if event_tx.send(LinkEvent::Connected).await.is_err() {
            return;
        }
        let (read_half, write_half) = stream.into_split();
        pump(read_half, write_half, event_tx, out_rx).await;
    });

    Ok(ChannelLink::new(format!("tcp://{}", addr), event_rx, out_tx, vec![task]))
}

use super::{
    connection::{TransportReceiver, TransportSender},
    sip_addr::SipAddr,
    tcp::TcpConnection,
    tls::{TlsConfig, TlsConnection},
    ws::WebSocketConnection,
    SipConnection, TransportEvent,
};
use crate::{transaction::key::TransactionKey, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an unreferenced dialed connection stays cached before it is
/// closed. Covers late retransmissions after the last transaction using the
/// connection has terminated.
const IDLE_LINGER: Duration = Duration::from_secs(32);

struct ConnectionEntry {
    connection: SipConnection,
    refs: usize,
}

pub struct TransportLayerInner {
    pub(crate) cancel_token: CancellationToken,
    /// Listening transports: UDP sockets and stream listeners.
    listens: RwLock<Vec<SipConnection>>,
    /// Dialed and accepted stream connections, keyed by remote address and
    /// refcounted by the transactions using them.
    connections: RwLock<HashMap<SipAddr, ConnectionEntry>>,
    pub(crate) transport_tx: TransportSender,
    pub(crate) transport_rx: Mutex<Option<TransportReceiver>>,
    tls_config: RwLock<Option<TlsConfig>>,
}
pub(crate) type TransportLayerInnerRef = Arc<TransportLayerInner>;

pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    pub inner: TransportLayerInnerRef,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = TransportLayerInner {
            cancel_token,
            listens: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            tls_config: RwLock::new(None),
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    pub fn set_tls_config(&self, config: TlsConfig) {
        match self.inner.tls_config.write() {
            Ok(mut tls_config) => *tls_config = Some(config),
            Err(e) => warn!("failed to write tls config: {:?}", e),
        }
    }

    pub fn add_transport(&self, transport: SipConnection) {
        self.inner.add_listener(transport)
    }

    /// Resolve a destination to a connection, incrementing its refcount when
    /// it comes from the connection cache. Callers pair this with
    /// [`TransportLayer::release`] when they are done with the connection.
    pub async fn lookup(
        &self,
        target: &SipAddr,
        key: Option<&TransactionKey>,
    ) -> Result<(SipConnection, SipAddr)> {
        self.inner.lookup(target, self.outbound.as_ref(), key).await
    }

    pub fn release(&self, addr: &SipAddr) {
        self.inner.release(addr)
    }

    pub async fn serve_listens(&self) -> Result<()> {
        let listens: Vec<SipConnection> = match self.inner.listens.read() {
            Ok(listens) => listens.iter().cloned().collect(),
            Err(e) => {
                return Err(crate::Error::Error(format!(
                    "failed to read listens: {:?}",
                    e
                )));
            }
        };

        for transport in listens {
            let inner = self.inner.clone();
            let addr = transport.get_addr().clone();
            tokio::spawn(async move {
                if let Err(e) = TransportLayerInner::serve_listener(inner, transport).await {
                    warn!(?addr, "failed to serve listener: {:?}", e);
                }
            });
        }
        Ok(())
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        match self.inner.listens.read() {
            Ok(listens) => listens.iter().map(|t| t.get_addr().to_owned()).collect(),
            Err(e) => {
                warn!("failed to read listens: {:?}", e);
                Vec::new()
            }
        }
    }
}

impl TransportLayerInner {
    pub(super) fn add_listener(&self, connection: SipConnection) {
        match self.listens.write() {
            Ok(mut listens) => {
                listens.push(connection);
            }
            Err(e) => {
                warn!("failed to write listens: {:?}", e);
            }
        }
    }

    /// Cache a stream connection and start serving it. Used both by listener
    /// accept loops (write-through on accept) and by [`lookup`] after a dial.
    pub(crate) fn add_connection(self: &Arc<Self>, connection: SipConnection) {
        let addr = connection.get_addr().to_owned();
        match self.connections.write() {
            Ok(mut connections) => {
                // keep the refcount when an address reconnects
                let refs = connections.get(&addr).map_or(0, |entry| entry.refs);
                connections.insert(
                    addr,
                    ConnectionEntry {
                        connection: connection.clone(),
                        refs,
                    },
                );
            }
            Err(e) => {
                warn!("failed to write connections: {:?}", e);
                return;
            }
        }
        self.serve_connection(connection);
    }

    pub(super) fn del_connection(&self, addr: &SipAddr) {
        match self.connections.write() {
            Ok(mut connections) => {
                connections.remove(addr);
            }
            Err(e) => {
                warn!("failed to write connections: {} {:?}", addr, e);
            }
        }
    }

    /// Cache hit with the refcount bumped, or None.
    fn acquire(&self, addr: &SipAddr) -> Option<SipConnection> {
        match self.connections.write() {
            Ok(mut connections) => connections.get_mut(addr).map(|entry| {
                entry.refs += 1;
                entry.connection.clone()
            }),
            Err(e) => {
                warn!("failed to write connections: {:?}", e);
                None
            }
        }
    }

    /// Drop one reference. When the count reaches zero the connection stays
    /// cached for [`IDLE_LINGER`], then closes if still unreferenced.
    pub(crate) fn release(self: &Arc<Self>, addr: &SipAddr) {
        let idle = match self.connections.write() {
            Ok(mut connections) => match connections.get_mut(addr) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            },
            Err(e) => {
                warn!("failed to write connections: {:?}", e);
                false
            }
        };
        if !idle {
            return;
        }
        let inner = self.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            select! {
                _ = inner.cancel_token.cancelled() => return,
                _ = tokio::time::sleep(IDLE_LINGER) => {}
            }
            let connection = match inner.connections.write() {
                Ok(mut connections) => match connections.get(&addr) {
                    Some(entry) if entry.refs == 0 => {
                        connections.remove(&addr).map(|entry| entry.connection)
                    }
                    _ => None,
                },
                Err(_) => None,
            };
            if let Some(connection) = connection {
                debug!("closing idle connection: {}", connection);
                connection.close().await.ok();
            }
        });
    }

    async fn lookup(
        self: &Arc<Self>,
        destination: &SipAddr,
        outbound: Option<&SipAddr>,
        key: Option<&TransactionKey>,
    ) -> Result<(SipConnection, SipAddr)> {
        let target = outbound.cloned().unwrap_or_else(|| destination.clone());
        debug!(?key, "lookup target: {} -> {}", destination, target);

        if let Some(connection) = self.acquire(&target) {
            return Ok((connection, target));
        }

        let transport = target
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Udp);
        match transport {
            rsip::transport::Transport::Udp => {}
            rsip::transport::Transport::Tcp => {
                let connection = TcpConnection::connect(&target).await?;
                let sip_connection = SipConnection::Tcp(connection);
                self.add_connection(sip_connection.clone());
                self.acquire(&target);
                return Ok((sip_connection, target));
            }
            rsip::transport::Transport::Tls => {
                let tls_config = self.tls_config.read().ok().and_then(|c| c.clone());
                let connection = TlsConnection::connect(&target, tls_config.as_ref()).await?;
                let sip_connection = SipConnection::Tls(connection);
                self.add_connection(sip_connection.clone());
                self.acquire(&target);
                return Ok((sip_connection, target));
            }
            rsip::transport::Transport::Ws | rsip::transport::Transport::Wss => {
                let tls_config = self.tls_config.read().ok().and_then(|c| c.clone());
                let connection =
                    WebSocketConnection::connect(&target, tls_config.as_ref()).await?;
                let sip_connection = SipConnection::WebSocket(connection);
                self.add_connection(sip_connection.clone());
                self.acquire(&target);
                return Ok((sip_connection, target));
            }
            other => {
                return Err(crate::Error::TransportLayerError(
                    format!("unsupported transport type: {:?}", other),
                    target.clone(),
                ));
            }
        }

        // UDP goes out a listening socket; any bound UDP socket can reach
        // any peer.
        let listens = self.listens.read().map_err(|e| {
            crate::Error::Error(format!("failed to read listens: {:?}", e))
        })?;
        let mut first_udp = None;
        for transport in listens.iter() {
            let addr = transport.get_addr();
            if addr.r#type == Some(rsip::transport::Transport::Udp) && first_udp.is_none() {
                first_udp = Some(transport.clone());
            }
            if addr == &target {
                return Ok((transport.clone(), target.clone()));
            }
        }
        if let Some(transport) = first_udp {
            return Ok((transport, target));
        }
        Err(crate::Error::TransportLayerError(
            format!("no transport available for: {:?}", target.r#type),
            target,
        ))
    }

    pub(super) async fn serve_listener(self: Arc<Self>, transport: SipConnection) -> Result<()> {
        let sender = self.transport_tx.clone();
        match transport {
            SipConnection::Udp(connection) => {
                tokio::spawn(async move { connection.serve_loop(sender).await });
                Ok(())
            }
            SipConnection::Channel(connection) => {
                tokio::spawn(async move { connection.serve_loop(sender).await });
                Ok(())
            }
            SipConnection::TcpListener(connection) => connection.serve_listener(self.clone()).await,
            SipConnection::TlsListener(connection) => connection.serve_listener(self.clone()).await,
            SipConnection::WebSocketListener(connection) => {
                connection.serve_listener(self.clone()).await
            }
            _ => {
                warn!(
                    "serve_listener: unsupported transport type: {:?}",
                    transport.get_addr()
                );
                Ok(())
            }
        }
    }

    /// Run a stream connection's read loop until it exits, reporting `New`
    /// up front and `Closed` (after dropping it from the cache) at the end.
    pub(crate) fn serve_connection(self: &Arc<Self>, transport: SipConnection) {
        let sub_token = self.cancel_token.child_token();
        let sender = self.transport_tx.clone();
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.send(TransportEvent::New(transport.clone())) {
                warn!(addr=%transport.get_addr(), "error sending new connection event: {:?}", e);
                return;
            }
            select! {
                _ = sub_token.cancelled() => {}
                result = transport.serve_loop(sender.clone()) => {
                    if let Err(e) = result {
                        info!(addr=%transport.get_addr(), "connection error: {}", e);
                    }
                }
            }
            info!(addr=%transport.get_addr(), "transport serve_loop exited");
            inner.del_connection(transport.get_addr());
            sender.send(TransportEvent::Closed(transport)).ok();
        });
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        self.inner.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        transport::{udp::UdpConnection, SipAddr},
        Result,
    };

    #[tokio::test]
    async fn test_lookup_udp() -> Result<()> {
        let mut tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let first_uri = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: rsip::HostWithPort {
                host: rsip::Host::IpAddr("127.0.0.1".parse().expect("ip")),
                port: Some(5060.into()),
            },
        };
        assert!(tl.lookup(&first_uri, None).await.is_err());

        let udp_peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let udp_peer_addr = udp_peer.get_addr().to_owned();
        tl.add_transport(udp_peer.into());

        let (target, _) = tl.lookup(&first_uri, None).await?;
        assert_eq!(target.get_addr(), &udp_peer_addr);

        // outbound overrides the destination
        let outbound_peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let outbound = outbound_peer.get_addr().to_owned();
        tl.add_transport(outbound_peer.into());
        tl.outbound = Some(outbound.clone());

        let (_, resolved) = tl.lookup(&first_uri, None).await?;
        assert_eq!(resolved, outbound);
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_cache_single_entry() -> Result<()> {
        let tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let peer = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: listener.local_addr()?.into(),
        };
        // hold the accepted sockets so the dialed connections stay open
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => held.push(stream),
                    Err(_) => break,
                }
            }
        });

        let (first, _) = tl.lookup(&peer, None).await?;
        let (second, _) = tl.lookup(&peer, None).await?;
        assert_eq!(first.get_addr(), second.get_addr());

        {
            let connections = tl.inner.connections.read().expect("connections");
            assert_eq!(
                connections.len(),
                1,
                "one cache entry per (transport, peer)"
            );
            assert_eq!(connections.get(&peer).expect("entry").refs, 2);
        }

        tl.release(&peer);
        let connections = tl.inner.connections.read().expect("connections");
        assert_eq!(connections.get(&peer).expect("entry").refs, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_serve_listens() -> Result<()> {
        let tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let udp_conn = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let addr = udp_conn.get_addr().clone();
        tl.add_transport(udp_conn.into());

        tl.serve_listens().await?;

        let addrs = tl.get_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0], addr);

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        drop(tl);
        Ok(())
    }
}

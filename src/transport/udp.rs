use super::{
    codec::{decode_datagram, DEFAULT_MAX_UDP_MESSAGE_SIZE, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    connection::TransportSender,
    SipAddr, SipConnection, TransportEvent,
};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, instrument, trace};

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
    max_message_size: usize,
}

/// One bound socket serving many peers. Datagrams are whole messages; the
/// peer address travels with each one as the `source` annotation.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: external.unwrap_or(conn.local_addr()?).into(),
        };
        let t = UdpConnection {
            inner: Arc::new(UdpInner {
                addr,
                conn,
                max_message_size: DEFAULT_MAX_UDP_MESSAGE_SIZE,
            }),
        };
        info!("created UDP transport: {} external: {:?}", t, external);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; self.inner.max_message_size + 1];
        let connection = SipConnection::Udp(self.clone());
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                received => {
                    if received.iter().all(|&b| b.is_ascii_whitespace()) {
                        continue;
                    }
                }
            }

            let msg = match decode_datagram(&buf[..len], self.inner.max_message_size) {
                Ok(msg) => msg,
                Err(e) => {
                    // malformed datagram: drop, connectionless transports
                    // have nothing to close
                    info!("dropping datagram from {}: {}", addr, e);
                    continue;
                }
            };

            debug!("received {} bytes {} -> {}", len, addr, self.get_addr());

            let msg = SipConnection::update_msg_received(
                msg,
                addr,
                rsip::transport::Transport::Udp,
            )?;
            let source = SipAddr {
                r#type: Some(rsip::transport::Transport::Udp),
                addr: addr.into(),
            };
            sender.send(TransportEvent::Incoming(msg, connection.clone(), source))?;
        }
    }

    #[instrument(skip(self, msg), fields(addr = %self.get_addr()))]
    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.dial_target(),
            None => SipConnection::get_destination(&msg)?.dial_target(),
        };
        let buf = msg.to_string();
        trace!("sending {} bytes -> {}\n{}", buf.len(), target, buf);
        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), self.get_addr().clone()))
            .map(|_| ())
    }

    pub async fn send_raw(&self, data: &[u8], destination: &SipAddr) -> Result<()> {
        self.inner
            .conn
            .send_to(data, destination.get_socketaddr()?)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), self.get_addr().clone()))
            .map(|_| ())
    }

    pub async fn recv_raw(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.inner.conn.recv_from(buf).await.map_err(Into::into)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

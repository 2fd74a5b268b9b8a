use crate::transport::{
    tcp::TcpConnection, transport_layer::TransportLayerInnerRef, SipAddr, SipConnection,
};
use crate::Result;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct TcpListenerConnectionInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
}

/// Accepting side of the TCP transport. Accepted connections are inserted
/// into the transport-layer cache keyed by peer address, so outbound traffic
/// to that peer reuses the inbound socket.
#[derive(Clone)]
pub struct TcpListenerConnection {
    pub inner: Arc<TcpListenerConnectionInner>,
}

impl TcpListenerConnection {
    pub async fn new(local_addr: SipAddr, external: Option<SocketAddr>) -> Result<Self> {
        let inner = TcpListenerConnectionInner {
            local_addr,
            external: external.map(|addr| SipAddr {
                r#type: Some(rsip::transport::Transport::Tcp),
                addr: addr.into(),
            }),
        };
        Ok(TcpListenerConnection {
            inner: Arc::new(inner),
        })
    }

    pub async fn serve_listener(&self, transport_layer: TransportLayerInnerRef) -> Result<()> {
        let listener = TcpListener::bind(self.inner.local_addr.get_socketaddr()?).await?;
        let local_addr = self.inner.local_addr.clone();
        info!("starting TCP listener on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("failed to accept TCP connection: {:?}", e);
                        continue;
                    }
                };
                let tcp_connection = match TcpConnection::from_stream(stream, local_addr.clone()) {
                    Ok(tcp_connection) => tcp_connection,
                    Err(e) => {
                        error!("failed to wrap accepted TCP stream: {:?}", e);
                        continue;
                    }
                };
                // write-through: cache under the peer address and start the
                // reader task
                transport_layer.add_connection(SipConnection::Tcp(tcp_connection));
            }
        });
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.inner.external.as_ref().unwrap_or(&self.inner.local_addr)
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP Listener {}", self.get_addr())
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

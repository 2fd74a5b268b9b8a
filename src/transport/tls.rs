use crate::{
    transport::{
        connection::TransportSender,
        sip_addr::SipAddr,
        stream::{StreamConnection, StreamConnectionInner},
        transport_layer::TransportLayerInnerRef,
        SipConnection,
    },
    Error, Result,
};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector, TlsStream,
};
use tracing::{error, info, warn};

/// PEM material for the TLS transport. `cert`/`key` make the accepting side
/// work; `ca_certs` is the trusted-root pool for outbound dials.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub ca_certs: Option<Vec<u8>>,
}

type TlsInner = StreamConnectionInner<
    tokio::io::ReadHalf<TlsStream<TcpStream>>,
    tokio::io::WriteHalf<TlsStream<TcpStream>>,
>;

#[derive(Clone)]
pub struct TlsConnection {
    pub inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Performs a client-side TLS handshake over an already connected TCP
    /// stream, trusting the roots in `config.ca_certs`.
    pub(crate) async fn tls_connect_stream(
        stream: TcpStream,
        remote: &SipAddr,
        config: Option<&TlsConfig>,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut root_store = RootCertStore::empty();
        if let Some(ca_certs) = config.and_then(|c| c.ca_certs.as_ref()) {
            let mut reader = std::io::BufReader::new(ca_certs.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| Error::Error(format!("bad CA cert: {}", e)))?;
                root_store
                    .add(cert)
                    .map_err(|e| Error::Error(format!("bad CA cert: {}", e)))?;
            }
        }
        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let domain_string = match &remote.addr.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        let server_name = pki_types::ServerName::try_from(domain_string.as_str())
            .map_err(|_| Error::Error(format!("invalid TLS server name: {}", domain_string)))?
            .to_owned();

        connector.connect(server_name, stream).await.map_err(|e| {
            Error::TransportLayerError(format!("TLS handshake failed: {}", e), remote.clone())
        })
    }

    pub async fn connect(remote: &SipAddr, config: Option<&TlsConfig>) -> Result<Self> {
        let stream = TcpStream::connect(remote.dial_target()).await.map_err(|e| {
            Error::TransportLayerError(format!("dial failed: {}", e), remote.clone())
        })?;
        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tls),
            addr: stream.local_addr()?.into(),
        };
        let tls_stream = Self::tls_connect_stream(stream, remote, config).await?;

        let (read_half, write_half) = tokio::io::split(TlsStream::Client(tls_stream));
        let connection = TlsConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote.clone(),
                read_half,
                write_half,
            )),
        };
        info!("created TLS client connection: {}", connection);
        Ok(connection)
    }

    pub fn from_stream(
        stream: TlsStream<TcpStream>,
        local_addr: SipAddr,
        remote_addr: SipAddr,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        TlsConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        }
    }

    pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
        let certs = match &config.cert {
            Some(cert_data) => {
                let mut reader = std::io::BufReader::new(cert_data.as_slice());
                rustls_pemfile::certs(&mut reader)
                    .collect::<std::result::Result<Vec<_>, std::io::Error>>()
                    .map_err(|e| Error::Error(format!("failed to parse certificate: {}", e)))?
            }
            None => return Err(Error::Error("no TLS certificate provided".to_string())),
        };

        let key = match &config.key {
            Some(key_data) => {
                let mut reader = std::io::BufReader::new(key_data.as_slice());
                rustls_pemfile::private_key(&mut reader)
                    .map_err(|e| Error::Error(format!("failed to parse private key: {}", e)))?
                    .ok_or_else(|| Error::Error("no valid private key found".to_string()))?
            }
            None => return Err(Error::Error("no TLS private key provided".to_string())),
        };

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Error(format!("TLS configuration error: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let sip_connection = SipConnection::Tls(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TLS {} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub struct TlsListenerConnectionInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
    pub config: TlsConfig,
}

#[derive(Clone)]
pub struct TlsListenerConnection {
    pub inner: Arc<TlsListenerConnectionInner>,
}

impl TlsListenerConnection {
    pub async fn new(
        local_addr: SipAddr,
        external: Option<SocketAddr>,
        config: TlsConfig,
    ) -> Result<Self> {
        let inner = TlsListenerConnectionInner {
            local_addr,
            external: external.map(|addr| SipAddr {
                r#type: Some(rsip::transport::Transport::Tls),
                addr: addr.into(),
            }),
            config,
        };
        Ok(TlsListenerConnection {
            inner: Arc::new(inner),
        })
    }

    pub async fn serve_listener(&self, transport_layer: TransportLayerInnerRef) -> Result<()> {
        let acceptor = TlsConnection::create_acceptor(&self.inner.config)?;
        let listener = TcpListener::bind(self.inner.local_addr.get_socketaddr()?).await?;
        let local_addr = self.inner.local_addr.clone();
        info!("starting TLS listener on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept TLS connection: {:?}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let local_addr = local_addr.clone();
                let transport_layer = transport_layer.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("TLS handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };
                    let remote_addr = SipAddr {
                        r#type: Some(rsip::transport::Transport::Tls),
                        addr: peer_addr.into(),
                    };
                    let connection = TlsConnection::from_stream(
                        TlsStream::Server(tls_stream),
                        local_addr,
                        remote_addr,
                    );
                    transport_layer.add_connection(SipConnection::Tls(connection));
                });
            }
        });
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.inner.external.as_ref().unwrap_or(&self.inner.local_addr)
    }
}

impl fmt::Display for TlsListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS Listener {}", self.get_addr())
    }
}

impl fmt::Debug for TlsListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

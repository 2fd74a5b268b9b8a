use crate::{
    transport::{
        connection::{TransportEvent, TransportSender},
        sip_addr::SipAddr,
        stream::StreamConnection,
        tls::{TlsConfig, TlsConnection},
        transport_layer::TransportLayerInnerRef,
        SipConnection,
    },
    Error, Result,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_tungstenite::{
    accept_hdr_async, client_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::http::HeaderValue,
    tungstenite::Message,
    WebSocketStream,
};
use tracing::{info, warn};

/// Object-safe alias so plain and TLS-wrapped streams share one
/// `WebSocketStream` type.
pub trait WsTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> WsTransport for T {}

type WsStream = WebSocketStream<Box<dyn WsTransport>>;
const SIP_SUBPROTOCOL: &str = "sip";

pub struct WebSocketInner {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    read_half: Mutex<Option<SplitStream<WsStream>>>,
    write_half: Mutex<SplitSink<WsStream, Message>>,
}

/// SIP over WebSocket (RFC 7118) carries exactly one SIP message per frame,
/// so no streaming codec is involved on this transport.
#[derive(Clone)]
pub struct WebSocketConnection {
    pub inner: Arc<WebSocketInner>,
}

impl WebSocketConnection {
    pub async fn connect(remote: &SipAddr, tls_config: Option<&TlsConfig>) -> Result<Self> {
        let secure = matches!(remote.r#type, Some(rsip::transport::Transport::Wss));
        let tcp_stream = TcpStream::connect(remote.dial_target()).await.map_err(|e| {
            Error::TransportLayerError(format!("dial failed: {}", e), remote.clone())
        })?;
        let local_addr = tcp_stream.local_addr()?;

        let stream: Box<dyn WsTransport> = if secure {
            let tls = TlsConnection::tls_connect_stream(tcp_stream, remote, tls_config).await?;
            Box::new(tls)
        } else {
            Box::new(tcp_stream)
        };

        let scheme = if secure { "wss" } else { "ws" };
        let url = format!("{}://{}", scheme, remote.addr);
        let mut request =
            tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
                url.as_str(),
            )
            .map_err(|e| Error::TransportLayerError(format!("bad url: {}", e), remote.clone()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SIP_SUBPROTOCOL),
        );

        let (ws_stream, _) = client_async(request, stream).await.map_err(|e| {
            Error::TransportLayerError(format!("websocket handshake failed: {}", e), remote.clone())
        })?;

        let transport = if secure {
            rsip::transport::Transport::Wss
        } else {
            rsip::transport::Transport::Ws
        };
        let connection = Self::from_ws_stream(
            ws_stream,
            SipAddr {
                r#type: Some(transport),
                addr: local_addr.into(),
            },
            SipAddr {
                r#type: Some(transport),
                addr: remote.addr.clone(),
            },
        );
        info!("created WebSocket client connection: {}", connection);
        Ok(connection)
    }

    pub fn from_ws_stream(stream: WsStream, local_addr: SipAddr, remote_addr: SipAddr) -> Self {
        let (write_half, read_half) = stream.split();
        WebSocketConnection {
            inner: Arc::new(WebSocketInner {
                local_addr,
                remote_addr,
                read_half: Mutex::new(Some(read_half)),
                write_half: Mutex::new(write_half),
            }),
        }
    }
}

#[async_trait::async_trait]
impl StreamConnection for WebSocketConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        write_half
            .send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| {
                Error::TransportLayerError(e.to_string(), self.inner.remote_addr.clone())
            })
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        write_half
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| {
                Error::TransportLayerError(e.to_string(), self.inner.remote_addr.clone())
            })
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let sip_connection = SipConnection::WebSocket(self.clone());
        let remote_addr = self.inner.remote_addr.clone();
        let mut read_half = self
            .inner
            .read_half
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Error("websocket read half already taken".to_string()))?;

        while let Some(frame) = read_half.next().await {
            let frame = frame.map_err(|e| {
                Error::TransportLayerError(e.to_string(), remote_addr.clone())
            })?;
            let payload = match frame {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(data) => data,
                // tungstenite answers pings internally
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                Message::Frame(_) => continue,
            };
            if payload.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let mut msg = match SipMessage::try_from(payload.as_slice()) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{} dropping malformed websocket frame: {}", remote_addr, e);
                    continue;
                }
            };
            msg = SipConnection::update_msg_received(
                msg,
                remote_addr.get_socketaddr()?,
                remote_addr.r#type.unwrap_or(rsip::transport::Transport::Ws),
            )?;
            sender.send(TransportEvent::Incoming(
                msg,
                sip_connection.clone(),
                remote_addr.clone(),
            ))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        write_half.send(Message::Close(None)).await.ok();
        Ok(())
    }
}

impl fmt::Display for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WS {} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub struct WebSocketListenerConnectionInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
    pub tls_config: Option<TlsConfig>,
    pub secure: bool,
}

#[derive(Clone)]
pub struct WebSocketListenerConnection {
    pub inner: Arc<WebSocketListenerConnectionInner>,
}

impl WebSocketListenerConnection {
    pub async fn new(
        local_addr: SipAddr,
        external: Option<SocketAddr>,
        tls_config: Option<TlsConfig>,
        secure: bool,
    ) -> Result<Self> {
        let transport = if secure {
            rsip::transport::Transport::Wss
        } else {
            rsip::transport::Transport::Ws
        };
        Ok(WebSocketListenerConnection {
            inner: Arc::new(WebSocketListenerConnectionInner {
                local_addr,
                external: external.map(|addr| SipAddr {
                    r#type: Some(transport),
                    addr: addr.into(),
                }),
                tls_config,
                secure,
            }),
        })
    }

    pub async fn serve_listener(&self, transport_layer: TransportLayerInnerRef) -> Result<()> {
        let acceptor = if self.inner.secure {
            let config = self
                .inner
                .tls_config
                .as_ref()
                .ok_or_else(|| Error::Error("wss listener requires a TLS config".to_string()))?;
            Some(TlsConnection::create_acceptor(config)?)
        } else {
            None
        };
        let listener = TcpListener::bind(self.inner.local_addr.get_socketaddr()?).await?;
        let local_addr = self.inner.local_addr.clone();
        let transport = if self.inner.secure {
            rsip::transport::Transport::Wss
        } else {
            rsip::transport::Transport::Ws
        };
        info!("starting WebSocket listener on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept WebSocket connection: {:?}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let local_addr = local_addr.clone();
                let transport_layer = transport_layer.clone();
                tokio::spawn(async move {
                    let stream: Box<dyn WsTransport> = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => Box::new(tls_stream),
                            Err(e) => {
                                warn!("TLS handshake failed for {}: {}", peer_addr, e);
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };
                    let negotiate = |req: &Request, mut resp: Response| {
                        let _ = req;
                        resp.headers_mut().insert(
                            "Sec-WebSocket-Protocol",
                            HeaderValue::from_static(SIP_SUBPROTOCOL),
                        );
                        Ok::<Response, ErrorResponse>(resp)
                    };
                    let ws_stream = match accept_hdr_async(stream, negotiate).await {
                        Ok(ws_stream) => ws_stream,
                        Err(e) => {
                            warn!("websocket handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };
                    let remote_addr = SipAddr {
                        r#type: Some(transport),
                        addr: peer_addr.into(),
                    };
                    let connection =
                        WebSocketConnection::from_ws_stream(ws_stream, local_addr, remote_addr);
                    transport_layer.add_connection(SipConnection::WebSocket(connection));
                });
            }
        });
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.inner.external.as_ref().unwrap_or(&self.inner.local_addr)
    }
}

impl fmt::Display for WebSocketListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WS Listener {}", self.get_addr())
    }
}

impl fmt::Debug for WebSocketListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

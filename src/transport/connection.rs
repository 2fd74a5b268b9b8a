use super::{
    channel::ChannelConnection,
    sip_addr::SipAddr,
    stream::StreamConnection,
    tcp::TcpConnection,
    tcp_listener::TcpListenerConnection,
    tls::{TlsConnection, TlsListenerConnection},
    udp::UdpConnection,
    ws::{WebSocketConnection, WebSocketListenerConnection},
};
use crate::Result;
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// What the transport layer reports upward.
#[derive(Clone)]
pub enum TransportEvent {
    /// A parsed message, the connection it arrived on, and its source.
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// A logical transport endpoint. UDP is a shared socket with per-datagram
/// peers; the stream variants are one connection per remote peer; the
/// listener variants accept and cache new stream connections.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    TcpListener(TcpListenerConnection),
    Tls(TlsConnection),
    TlsListener(TlsListenerConnection),
    WebSocket(WebSocketConnection),
    WebSocketListener(WebSocketListenerConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipConnection::Udp(_))
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(t) => t.get_addr(),
            SipConnection::Tcp(t) => t.get_addr(),
            SipConnection::TcpListener(t) => t.get_addr(),
            SipConnection::Tls(t) => t.get_addr(),
            SipConnection::TlsListener(t) => t.get_addr(),
            SipConnection::WebSocket(t) => t.get_addr(),
            SipConnection::WebSocketListener(t) => t.get_addr(),
            SipConnection::Channel(t) => t.get_addr(),
        }
    }

    /// Write a serialized message. `destination` is only meaningful for UDP,
    /// where one socket serves many peers; stream connections already have a
    /// remote end.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(t) => t.send(msg, destination).await,
            SipConnection::Tcp(t) => t.send_message(msg).await,
            SipConnection::Tls(t) => t.send_message(msg).await,
            SipConnection::WebSocket(t) => t.send_message(msg).await,
            SipConnection::Channel(t) => t.send(msg).await,
            _ => Err(crate::Error::TransportLayerError(
                "cannot send on a listener".into(),
                self.get_addr().to_owned(),
            )),
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(t) => t.serve_loop(sender).await,
            SipConnection::Tcp(t) => t.serve_loop(sender).await,
            SipConnection::Tls(t) => t.serve_loop(sender).await,
            SipConnection::WebSocket(t) => t.serve_loop(sender).await,
            SipConnection::Channel(t) => t.serve_loop(sender).await,
            _ => Err(crate::Error::TransportLayerError(
                "listeners are served by the transport layer".into(),
                self.get_addr().to_owned(),
            )),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(t) => t.close().await,
            SipConnection::Tls(t) => t.close().await,
            SipConnection::WebSocket(t) => t.close().await,
            _ => Ok(()),
        }
    }
}

impl SipConnection {
    /// Stamp the topmost Via of an inbound request with `received`/`rport`
    /// (RFC 3581) when the sent-by address differs from the actual source.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr, transport)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(
        via: &mut rsip::headers::Via,
        addr: SocketAddr,
        _transport: rsip::transport::Transport,
    ) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.uri.host_with_port == received {
            return Ok(());
        }
        typed_via.params.retain(|param| {
            if let Param::Other(key, _) = param {
                !key.value().eq_ignore_ascii_case("rport")
            } else {
                true
            }
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(received.host.to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Next hop for a response, from its topmost Via: sent-by overridden by
    /// `received` and `rport` when present.
    pub fn parse_target_from_via(
        via: &rsip::headers::untyped::Via,
    ) -> Result<(Option<rsip::transport::Transport>, HostWithPort)> {
        let typed_via = via.typed()?;
        let transport = Some(typed_via.transport.clone());
        let mut host_with_port = typed_via.uri.host_with_port.clone();
        for param in typed_via.params.iter() {
            match param {
                Param::Received(v) => {
                    if let Ok(addr) = v.value().parse::<std::net::IpAddr>() {
                        host_with_port.host = addr.into();
                    }
                }
                Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                    if let Ok(port) = value.value().try_into() {
                        host_with_port.port = Some(port);
                    }
                }
                _ => {}
            }
        }
        Ok((transport, host_with_port))
    }

    /// Destination address for an outbound message with no explicit
    /// destination annotation: the Request-URI for requests, the top Via for
    /// responses.
    pub fn get_destination(msg: &SipMessage) -> Result<SipAddr> {
        match msg {
            SipMessage::Request(req) => {
                let mut addr = SipAddr::try_from(&req.uri)?;
                if addr.r#type.is_none() {
                    addr.r#type = Some(rsip::transport::Transport::Udp);
                }
                Ok(addr)
            }
            SipMessage::Response(res) => {
                let (transport, host_with_port) =
                    Self::parse_target_from_via(res.via_header()?)?;
                Ok(SipAddr {
                    r#type: transport,
                    addr: host_with_port,
                })
            }
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "{}", t),
            SipConnection::TcpListener(t) => write!(f, "{}", t),
            SipConnection::Tls(t) => write!(f, "{}", t),
            SipConnection::TlsListener(t) => write!(f, "{}", t),
            SipConnection::WebSocket(t) => write!(f, "{}", t),
            SipConnection::WebSocketListener(t) => write!(f, "{}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}

impl From<WebSocketConnection> for SipConnection {
    fn from(connection: WebSocketConnection) -> Self {
        SipConnection::WebSocket(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

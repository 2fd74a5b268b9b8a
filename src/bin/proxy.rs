use clap::Parser;
use siprelay::proxy::{ProxyCore, Registrar};
use siprelay::transport::{
    tcp_listener::TcpListenerConnection,
    tls::{TlsConfig, TlsListenerConnection},
    udp::UdpConnection,
    ws::WebSocketListenerConnection,
    SipAddr, SipConnection, TransportLayer,
};
use siprelay::{EndpointBuilder, Error, Result, UserAgentBuilder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A stateful SIP proxy with an in-memory registrar.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Advertised listen address
    #[arg(long, short = 'i', default_value = "127.0.0.1:5060")]
    ip: String,

    /// Default upstream destination; when absent, only registered users are
    /// routable
    #[arg(long, short = 'd')]
    dst: Option<String>,

    /// Listen transport: udp, tcp, tls, ws or wss
    #[arg(long, short = 't', default_value = "udp")]
    transport: String,

    /// Insert a Record-Route on forwarded requests
    #[arg(long)]
    record_route: bool,

    /// Verbose message tracing (env LOGDEBUG=1 does the same)
    #[arg(long)]
    debug: bool,

    /// PEM certificate chain, required for tls/wss
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key, required for tls/wss
    #[arg(long)]
    key: Option<PathBuf>,
}

fn parse_transport(token: &str) -> Result<rsip::transport::Transport> {
    match token.to_ascii_lowercase().as_str() {
        "udp" => Ok(rsip::transport::Transport::Udp),
        "tcp" => Ok(rsip::transport::Transport::Tcp),
        "tls" => Ok(rsip::transport::Transport::Tls),
        "ws" => Ok(rsip::transport::Transport::Ws),
        "wss" => Ok(rsip::transport::Transport::Wss),
        other => Err(Error::Error(format!("unknown transport: {}", other))),
    }
}

fn load_tls_config(args: &Args) -> Result<TlsConfig> {
    let cert = args
        .cert
        .as_ref()
        .ok_or_else(|| Error::Error("--cert is required for tls/wss".to_string()))?;
    let key = args
        .key
        .as_ref()
        .ok_or_else(|| Error::Error("--key is required for tls/wss".to_string()))?;
    Ok(TlsConfig {
        cert: Some(std::fs::read(cert)?),
        key: Some(std::fs::read(key)?),
        ca_certs: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug = args.debug || std::env::var("LOGDEBUG").map(|v| v == "1").unwrap_or(false);
    tracing_subscriber::fmt()
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    let transport = parse_transport(&args.transport)?;
    let local: SocketAddr = args.ip.parse()?;
    let advertised = SipAddr::new(transport.clone(), local.into());

    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.clone());

    match &transport {
        rsip::transport::Transport::Udp => {
            let connection = UdpConnection::create_connection(local, None).await?;
            transport_layer.add_transport(connection.into());
        }
        rsip::transport::Transport::Tcp => {
            let listener = TcpListenerConnection::new(advertised.clone(), None).await?;
            transport_layer.add_transport(SipConnection::TcpListener(listener));
        }
        rsip::transport::Transport::Tls => {
            let config = load_tls_config(&args)?;
            transport_layer.set_tls_config(config.clone());
            let listener = TlsListenerConnection::new(advertised.clone(), None, config).await?;
            transport_layer.add_transport(SipConnection::TlsListener(listener));
        }
        rsip::transport::Transport::Ws | rsip::transport::Transport::Wss => {
            let secure = matches!(transport, rsip::transport::Transport::Wss);
            let config = if secure {
                let config = load_tls_config(&args)?;
                transport_layer.set_tls_config(config.clone());
                Some(config)
            } else {
                None
            };
            let listener =
                WebSocketListenerConnection::new(advertised.clone(), None, config, secure).await?;
            transport_layer.add_transport(SipConnection::WebSocketListener(listener));
        }
        other => {
            return Err(Error::Error(format!("unsupported transport: {}", other)));
        }
    }

    let upstream = match args.dst.as_deref() {
        Some(dst) if !dst.is_empty() => {
            let addr: SocketAddr = dst.parse()?;
            Some(SipAddr::new(transport.clone(), addr.into()))
        }
        _ => None,
    };

    let endpoint = EndpointBuilder::new()
        .with_cancel_token(token.clone())
        .with_transport_layer(transport_layer)
        .build();
    let ua = Arc::new(UserAgentBuilder::new().with_endpoint(endpoint).build());

    let registrar = Arc::new(Registrar::new());
    let proxy = Arc::new(ProxyCore::new(
        registrar,
        advertised.clone(),
        upstream.clone(),
        args.record_route,
    ));

    let p = proxy.clone();
    ua.on_request(rsip::Method::Register, move |tx| {
        let p = p.clone();
        async move { p.handle_register(tx).await }
    });
    let p = proxy.clone();
    ua.on_request(rsip::Method::Invite, move |tx| {
        let p = p.clone();
        async move { p.forward(tx).await }
    });
    let p = proxy.clone();
    ua.on_request(rsip::Method::Bye, move |tx| {
        let p = p.clone();
        async move { p.forward(tx).await }
    });
    let p = proxy.clone();
    ua.on_request(rsip::Method::Options, move |tx| {
        let p = p.clone();
        async move { p.forward(tx).await }
    });
    let p = proxy.clone();
    ua.on_request(rsip::Method::Ack, move |tx| {
        let p = p.clone();
        async move { p.handle_ack(tx).await }
    });

    info!(%advertised, upstream = ?upstream, "proxy listening");

    select! {
        result = ua.serve() => {
            info!("serve loop finished: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            ua.shutdown();
        }
    }
    Ok(())
}

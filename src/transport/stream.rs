use crate::{
    transport::{
        codec::{SipCodec, SipFrame, KEEPALIVE_RESPONSE, MAX_STREAM_MESSAGE_SIZE},
        connection::TransportSender,
        SipAddr, SipConnection, TransportEvent,
    },
    Result,
};
use bytes::BytesMut;
use rsip::SipMessage;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Shared plumbing for the connection-oriented transports. TCP, TLS and the
/// WebSocket handshake layer differ only in their I/O halves; the read loop,
/// framing and write path are identical.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        send_to_stream(&self.write_half, msg).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    /// Reader task: feed the codec, push complete messages upward stamped
    /// with the peer address. A framing error closes the connection, per
    /// RFC 3261 stream handling.
    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("stream already being served: {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; MAX_STREAM_MESSAGE_SIZE];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("connection closed by peer: {}", remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(SipFrame::Message(msg))) => {
                                debug!("received from {}: {}", remote_addr, msg);
                                let peer = remote_addr.get_socketaddr()?;
                                let msg = SipConnection::update_msg_received(
                                    msg,
                                    peer,
                                    remote_addr.r#type.unwrap_or_default(),
                                )?;
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    remote_addr.clone(),
                                ))?;
                            }
                            Ok(Some(SipFrame::KeepaliveRequest)) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("closing {} on framing error: {}", remote_addr, e);
                                return Err(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read error on {}: {}", remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await.map_err(|e| {
            crate::Error::TransportLayerError(e.to_string(), self.remote_addr.clone())
        })?;
        Ok(())
    }
}

/// Capability set shared by the stream transports.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub async fn send_to_stream<W>(write_half: &Mutex<W>, msg: SipMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    send_raw_to_stream(write_half, msg.to_string().as_bytes()).await
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}

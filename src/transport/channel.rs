use crate::{
    transport::{
        connection::{TransportEvent, TransportReceiver, TransportSender},
        sip_addr::SipAddr,
        SipConnection,
    },
    Result,
};
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

pub struct ChannelInner {
    pub addr: SipAddr,
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
}

/// In-process transport backed by a channel pair. Sent messages go out the
/// `outgoing` sender; the peer feeds messages in through `incoming`. Used to
/// drive the stack in tests without touching the network.
#[derive(Clone)]
pub struct ChannelConnection {
    pub inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: Mutex::new(Some(incoming)),
                outgoing,
            }),
        })
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(
                msg,
                SipConnection::Channel(self.clone()),
                self.inner.addr.clone(),
            ))
            .map_err(Into::into)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = self
            .inner
            .incoming
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::Error::Error("channel read half already taken".to_string()))?;
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        debug!("channel connection closed: {}", self.inner.addr);
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

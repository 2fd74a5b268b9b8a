use super::{
    key::{TransactionKey, TransactionRole},
    timer::Timer,
    transaction::Transaction,
    TransactionEvent, TransactionEventSender, TransactionReceiver, TransactionSender,
    TransactionTimer, T1, T1X64, T2, T4,
};
use crate::{
    transport::{SipAddr, SipConnection, TransportEvent, TransportLayer},
    Error, Result,
};
use rsip::{Method, Response, SipMessage, StatusCode};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const USER_AGENT: &str = concat!("siprelay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    pub timer_interval: Duration,
    /// Domain part appended to generated Call-IDs.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1X64,
            timer_interval: Duration::from_millis(20),
            callid_suffix: None,
        }
    }
}

/// Shared state behind an [`Endpoint`]: the timer wheel, the transport
/// layer, and the table of live transactions.
pub struct EndpointInner {
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    pub option: EndpointOption,
    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    /// Final responses of recently terminated server transactions, kept
    /// around so late retransmissions can be absorbed.
    pub finished_transactions: Mutex<HashMap<TransactionKey, Option<Response>>>,
    incoming_sender: Mutex<Option<TransactionSender>>,
    dropped_responses: AtomicUsize,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The transaction-layer entry point: owns the transport layer and
/// demultiplexes incoming messages onto transactions per RFC 3261
/// section 17.1.3 / 17.2.3.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    option: EndpointOption,
}

impl EndpointInner {
    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        trace!(key=%key, "attach transaction");
        match self.transactions.lock() {
            Ok(mut transactions) => {
                transactions.insert(key.clone(), sender);
            }
            Err(e) => warn!("failed to lock transactions: {:?}", e),
        }
    }

    /// Remove a terminated transaction. Server transactions leave their
    /// final response behind for a cleanup interval so retransmitted
    /// requests can be answered without a live transaction.
    pub fn detach_transaction(&self, key: &TransactionKey, last_response: Option<Response>) {
        trace!(key=%key, "detach transaction");
        match self.transactions.lock() {
            Ok(mut transactions) => {
                transactions.remove(key);
            }
            Err(e) => warn!("failed to lock transactions: {:?}", e),
        }
        if let Some(response) = last_response {
            match self.finished_transactions.lock() {
                Ok(mut finished) => {
                    finished.insert(key.clone(), Some(response));
                }
                Err(e) => warn!("failed to lock finished transactions: {:?}", e),
            }
            self.timers
                .timeout(self.option.t1x64, TransactionTimer::TimerCleanup(key.clone()));
        }
    }

    fn get_transaction_sender(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        match self.transactions.lock() {
            Ok(transactions) => transactions.get(key).cloned(),
            Err(e) => {
                warn!("failed to lock transactions: {:?}", e);
                None
            }
        }
    }

    fn get_finished_response(&self, key: &TransactionKey) -> Option<Response> {
        match self.finished_transactions.lock() {
            Ok(finished) => finished.get(key).cloned().flatten(),
            Err(e) => {
                warn!("failed to lock finished transactions: {:?}", e);
                None
            }
        }
    }

    pub fn set_incoming_sender(&self, sender: Option<TransactionSender>) {
        match self.incoming_sender.lock() {
            Ok(mut incoming) => *incoming = sender,
            Err(e) => warn!("failed to lock incoming sender: {:?}", e),
        }
    }

    /// Drive the timer wheel, delivering due timers into their
    /// transactions' event channels.
    async fn process_timers(&self) {
        loop {
            for timer in self.timers.poll(Instant::now()) {
                if let TransactionTimer::TimerCleanup(key) = &timer {
                    match self.finished_transactions.lock() {
                        Ok(mut finished) => {
                            finished.remove(key);
                        }
                        Err(e) => warn!("failed to lock finished transactions: {:?}", e),
                    }
                    continue;
                }
                if let Some(sender) = self.get_transaction_sender(timer.key()) {
                    sender.send(TransactionEvent::Timer(timer)).ok();
                }
            }
            tokio::time::sleep(self.option.timer_interval).await;
        }
    }

    async fn process_transport_events(self: &Arc<Self>) -> Result<()> {
        let mut transport_rx = match self.transport_layer.inner.transport_rx.lock() {
            Ok(mut rx) => rx.take().ok_or_else(|| {
                Error::EndpointError("transport events already being consumed".to_string())
            })?,
            Err(e) => {
                return Err(Error::EndpointError(format!(
                    "failed to lock transport receiver: {:?}",
                    e
                )));
            }
        };
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, source) => {
                    if let Err(e) = self.on_received_message(msg, connection, source).await {
                        warn!("error handling incoming message: {}", e);
                    }
                }
                TransportEvent::New(connection) => {
                    debug!(%connection, "new transport connection");
                }
                TransportEvent::Closed(connection) => {
                    debug!(%connection, "transport connection closed");
                }
            }
        }
        Ok(())
    }

    /// Section 17.1.3 / 17.2.3 matching: route the message to its
    /// transaction, or mint a server transaction for a new request.
    async fn on_received_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
                if let Some(sender) = self.get_transaction_sender(&key) {
                    sender
                        .send(TransactionEvent::Received(
                            req.into(),
                            Some(connection),
                            Some(source),
                        ))
                        .ok();
                    return Ok(());
                }
                // retransmission of a request whose transaction already
                // terminated: replay the stored final response
                if let Some(last) = self.get_finished_response(&key) {
                    return connection.send(last.into(), Some(&source)).await;
                }

                if req.method == Method::Cancel {
                    // a CANCEL targets the INVITE transaction it names, and
                    // is answered here on the transaction layer's behalf
                    let invite_key = key.to_invite();
                    return match self.get_transaction_sender(&invite_key) {
                        Some(invite_sender) => {
                            let resp = self.make_response(&req, StatusCode::OK, None);
                            connection.send(resp.into(), Some(&source)).await?;
                            invite_sender
                                .send(TransactionEvent::Received(
                                    req.into(),
                                    Some(connection),
                                    Some(source),
                                ))
                                .ok();
                            Ok(())
                        }
                        None => {
                            let resp = self.make_response(
                                &req,
                                StatusCode::CallTransactionDoesNotExist,
                                None,
                            );
                            connection.send(resp.into(), Some(&source)).await
                        }
                    };
                }

                let mut tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                tx.destination = Some(source);
                match self.incoming_sender.lock() {
                    Ok(incoming) => match incoming.as_ref() {
                        Some(sender) => {
                            sender.send(tx).map_err(|e| {
                                Error::EndpointError(format!(
                                    "failed to deliver incoming transaction: {}",
                                    e
                                ))
                            })?;
                        }
                        None => {
                            warn!("no incoming handler, dropping {}", tx.original.method);
                        }
                    },
                    Err(e) => warn!("failed to lock incoming sender: {:?}", e),
                }
                Ok(())
            }
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp)?;
                match self.get_transaction_sender(&key) {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(
                                resp.into(),
                                Some(connection),
                                Some(source),
                            ))
                            .ok();
                    }
                    None => {
                        self.dropped_responses.fetch_add(1, Ordering::Relaxed);
                        debug!(key=%key, "response without a matching transaction");
                    }
                }
                Ok(())
            }
        }
    }

    /// Responses that matched no transaction since startup.
    pub fn dropped_responses(&self) -> usize {
        self.dropped_responses.load(Ordering::Relaxed)
    }
}

impl EndpointInner {
    /// Run until shutdown: serves every listener and pumps timers and
    /// transport events.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.transport_layer.serve_listens().await?;
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint shutting down");
            }
            _ = self.process_timers() => {}
            result = self.process_transport_events() => {
                if let Err(e) = result {
                    warn!("transport event loop exited: {}", e);
                }
            }
        }
        Ok(())
    }
}

impl Endpoint {
    pub async fn serve(&self) -> Result<()> {
        self.inner.serve().await
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.inner.cancel_token.cancel();
    }

    /// Hand back the stream of new server transactions. The caller owns
    /// the receiving side; dropping it makes the endpoint reject new work.
    pub fn incoming_transactions(&self) -> TransactionReceiver {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        self.inner.set_incoming_sender(Some(sender));
        receiver
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }

    pub fn get_via(
        &self,
        transport: Option<rsip::transport::Transport>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        self.inner.get_via(transport, branch)
    }
}

impl EndpointInner {
    /// A typed Via for requests this endpoint originates, built from the
    /// first listen matching `transport`, with a fresh branch unless one is
    /// given.
    pub fn get_via(
        &self,
        transport: Option<rsip::transport::Transport>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = self
            .transport_layer
            .get_addrs()
            .into_iter()
            .find(|addr| transport.is_none() || addr.r#type == transport)
            .ok_or_else(|| Error::EndpointError("no listen for transport".to_string()))?;
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr.clone(),
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(super::make_via_branch),
                rsip::Param::Other("rport".into(), None),
            ],
        })
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            option: EndpointOption::default(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let inner = EndpointInner {
            user_agent: self.user_agent,
            timers: Timer::new(),
            transport_layer,
            cancel_token,
            option: self.option,
            transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
            dropped_responses: AtomicUsize::new(0),
        };
        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.inner.cancel_token.cancel();
    }
}

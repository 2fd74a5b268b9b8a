use super::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionTimer, TransactionType,
};
use crate::{
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{
    prelude::HeadersExt, Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, trace, warn};

/// Linger in Completed after a non-2xx INVITE final, absorbing response
/// retransmissions (Timer D, RFC 3261 section 17.1.1.2).
const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);

/// One RFC 3261 section 17 transaction of any of the four kinds.
///
/// Client transactions are driven by [`Transaction::send`] then
/// [`Transaction::receive`]; server transactions arrive over
/// `Endpoint::incoming_transactions` and are answered with
/// [`Transaction::respond`] or [`Transaction::reply`]. The receive stream
/// carries responses for client transactions, and ACK/CANCEL requests for
/// server transactions; retransmissions and timers never surface.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub last_error: Option<Error>,
    pub tu_sender: TransactionEventSender,
    tu_receiver: TransactionEventReceiver,
    /// Timer A, E or G depending on the machine.
    retrans_timer: Option<u64>,
    /// Timer B, F or H.
    timeout_timer: Option<u64>,
    /// Timer D, I, J, K, or the RFC 6026 Accepted timeout.
    linger_timer: Option<u64>,
    /// Auto-100 timer on server INVITE transactions.
    trying_timer: Option<u64>,
    holds_connection_ref: bool,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite => TransactionState::Calling,
            TransactionType::ClientNonInvite => TransactionState::Calling,
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                TransactionState::Trying
            }
        };
        Transaction {
            transaction_type,
            key,
            original,
            state,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            last_error: None,
            tu_sender,
            tu_receiver,
            retrans_timer: None,
            timeout_timer: None,
            linger_timer: None,
            trying_timer: None,
            holds_connection_ref: false,
            is_cleaned_up: false,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Self::new(transaction_type, key, original, endpoint_inner, connection)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let mut tx = Self::new(transaction_type, key, original, endpoint_inner, connection);
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        if tx.transaction_type == TransactionType::ServerInvite {
            // answer 100 Trying on the TU's behalf if it stays silent
            tx.trying_timer = Some(tx.endpoint_inner.timers.timeout(
                super::TO_TRYING,
                TransactionTimer::TimerTrying(tx.key.clone()),
            ));
        }
        tx
    }

    fn is_unreliable(&self) -> bool {
        !self
            .connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    async fn send_msg(&self, msg: SipMessage) -> Result<()> {
        match &self.connection {
            Some(connection) => connection.send(msg, self.destination.as_ref()).await,
            None => Err(Error::TransactionError(
                "no connection".to_string(),
                self.key.clone(),
            )),
        }
    }

    /// Send the original request. Client transactions only; this resolves
    /// the destination through the transport layer, registers the
    /// transaction with the endpoint, and starts the section 17.1 timers.
    pub async fn send(&mut self) -> Result<()> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "send is a client-transaction operation".to_string(),
                    self.key.clone(),
                ));
            }
        }

        if self.connection.is_none() {
            let target = match &self.destination {
                Some(destination) => destination.clone(),
                None => SipConnection::get_destination(&self.original.clone().into())?,
            };
            let (connection, resolved) = self
                .endpoint_inner
                .transport_layer
                .lookup(&target, Some(&self.key))
                .await?;
            self.connection = Some(connection);
            self.destination = Some(resolved);
            self.holds_connection_ref = true;
        }

        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());
        self.send_msg(self.original.clone().into()).await?;

        let option = &self.endpoint_inner.option;
        match self.transaction_type {
            TransactionType::ClientInvite => {
                if self.is_unreliable() {
                    self.retrans_timer = Some(self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerA(self.key.clone(), option.t1),
                    ));
                }
                self.timeout_timer = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerB(self.key.clone())),
                );
            }
            TransactionType::ClientNonInvite => {
                if self.is_unreliable() {
                    self.retrans_timer = Some(self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerE(self.key.clone(), option.t1),
                    ));
                }
                self.timeout_timer = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerF(self.key.clone())),
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Next TU-visible message: responses on a client transaction, ACK or
    /// CANCEL requests on a server transaction. Returns None once the
    /// transaction terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection, source) => {
                    if self.connection.is_none() {
                        self.connection = connection;
                    }
                    if source.is_some() && self.destination.is_none() {
                        self.destination = source;
                    }
                    let surfaced = match msg {
                        SipMessage::Request(req) => self.on_received_request(req).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    match surfaced {
                        Ok(Some(msg)) => return Some(msg),
                        Ok(None) => {}
                        Err(e) => warn!(key=%self.key, "error handling message: {}", e),
                    }
                }
                TransactionEvent::Timer(timer) => {
                    if let Err(e) = self.on_timer(timer).await {
                        warn!(key=%self.key, "error handling timer: {}", e);
                    }
                    if self.state == TransactionState::Terminated {
                        return None;
                    }
                }
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated);
                    return None;
                }
            }
        }
        None
    }

    /// Send a response on a server transaction and run the section 17.2
    /// transitions for its status class.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "respond is a server-transaction operation".to_string(),
                    self.key.clone(),
                ));
            }
        }
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {}
            // RFC 6026: the TU retransmits its 2xx while Accepted
            TransactionState::Accepted
                if response.status_code.kind() == StatusCodeKind::Successful =>
            {
                return self.send_msg(response.into()).await;
            }
            _ => {
                return Err(Error::TransactionError(
                    format!("cannot respond in {:?}", self.state),
                    self.key.clone(),
                ));
            }
        }

        let kind = response.status_code.kind();
        self.send_msg(response.clone().into()).await?;
        self.last_response = Some(response);

        match kind {
            StatusCodeKind::Provisional => {
                self.transition(TransactionState::Proceeding);
            }
            StatusCodeKind::Successful
                if self.transaction_type == TransactionType::ServerInvite =>
            {
                // RFC 6026: absorb INVITE retransmissions while 2xx
                // retransmission is the TU's concern
                self.cancel_trying_timer();
                self.linger_timer = Some(self.endpoint_inner.timers.timeout(
                    self.endpoint_inner.option.t1x64,
                    TransactionTimer::TimerK(self.key.clone()),
                ));
                self.transition(TransactionState::Accepted);
            }
            _ => match self.transaction_type {
                TransactionType::ServerInvite => {
                    self.cancel_trying_timer();
                    if self.is_unreliable() {
                        let t1 = self.endpoint_inner.option.t1;
                        self.retrans_timer = Some(self.endpoint_inner.timers.timeout(
                            t1,
                            TransactionTimer::TimerG(self.key.clone(), t1),
                        ));
                    }
                    self.timeout_timer = Some(self.endpoint_inner.timers.timeout(
                        self.endpoint_inner.option.t1x64,
                        TransactionTimer::TimerH(self.key.clone()),
                    ));
                    self.transition(TransactionState::Completed);
                }
                TransactionType::ServerNonInvite => {
                    let linger = if self.is_unreliable() {
                        self.endpoint_inner.option.t1x64
                    } else {
                        Duration::ZERO
                    };
                    self.transition(TransactionState::Completed);
                    self.schedule_linger(linger, TransactionTimer::TimerJ(self.key.clone()));
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Respond with a bare status line built from the original request.
    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut response = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            response.headers.unique_push(header);
        }
        self.respond(response).await
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        self.reply(StatusCode::Trying).await
    }

    /// TU-built ACK for a 2xx, sent outside any transaction (section
    /// 17.1.1.3 makes only the non-2xx ACK the transaction's business).
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "ACK belongs to an INVITE client transaction".to_string(),
                self.key.clone(),
            ));
        }
        self.send_msg(ack.clone().into()).await?;
        self.last_ack = Some(ack);
        Ok(())
    }

    /// Fire a CANCEL for an in-flight INVITE client transaction. The CANCEL
    /// mirrors the INVITE's top Via, From, To, Call-ID and CSeq number
    /// (RFC 3261 section 9.1) and runs as its own non-INVITE client
    /// transaction toward the same hop, so it is retransmitted over UDP and
    /// its 200 is consumed. Its outcome is ignored; the 487 arrives on the
    /// INVITE transaction.
    pub async fn send_cancel(&mut self) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "only an INVITE client transaction can be canceled".to_string(),
                self.key.clone(),
            ));
        }
        match self.state {
            TransactionState::Calling | TransactionState::Proceeding => {}
            _ => {
                return Err(Error::TransactionCanceled(self.key.clone()));
            }
        }
        let cancel = make_cancel_request(&self.original)?;
        let key = TransactionKey::from_request(&cancel, TransactionRole::Client)?;
        let mut cancel_tx = Transaction::new_client(
            key,
            cancel,
            self.endpoint_inner.clone(),
            self.connection.clone(),
        );
        cancel_tx.destination = self.destination.clone();
        cancel_tx.send().await?;
        tokio::spawn(async move {
            while cancel_tx.receive().await.is_some() {}
        });
        Ok(())
    }

    async fn on_received_request(&mut self, req: Request) -> Result<Option<SipMessage>> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {}
            _ => return Ok(None),
        }

        if req.method == self.original.method {
            // retransmitted request: replay the last response, if any
            if let Some(last) = self.last_response.clone() {
                self.send_msg(last.into()).await?;
            }
            return Ok(None);
        }

        match req.method {
            Method::Ack => match self.state {
                TransactionState::Completed => {
                    self.cancel_retrans_timer();
                    self.cancel_timeout_timer();
                    let linger = if self.is_unreliable() {
                        self.endpoint_inner.option.t4
                    } else {
                        Duration::ZERO
                    };
                    self.transition(TransactionState::Confirmed);
                    self.schedule_linger(linger, TransactionTimer::TimerI(self.key.clone()));
                    Ok(Some(req.into()))
                }
                TransactionState::Accepted => Ok(Some(req.into())),
                _ => Ok(None),
            },
            // the endpoint already answered the CANCEL itself; the TU
            // decides what the canceled transaction answers
            Method::Cancel => Ok(Some(req.into())),
            _ => Ok(None),
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Result<Option<SipMessage>> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {}
            _ => return Ok(None),
        }
        let kind = resp.status_code.kind();

        match self.transaction_type {
            TransactionType::ClientInvite => match kind {
                StatusCodeKind::Provisional => match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        self.cancel_retrans_timer();
                        self.last_response = Some(resp.clone());
                        self.transition(TransactionState::Proceeding);
                        Ok(Some(resp.into()))
                    }
                    _ => Ok(None),
                },
                StatusCodeKind::Successful => match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        self.cancel_retrans_timer();
                        self.cancel_timeout_timer();
                        self.last_response = Some(resp.clone());
                        self.linger_timer = Some(self.endpoint_inner.timers.timeout(
                            self.endpoint_inner.option.t1x64,
                            TransactionTimer::TimerD(self.key.clone()),
                        ));
                        self.transition(TransactionState::Accepted);
                        Ok(Some(resp.into()))
                    }
                    // retransmitted 2xx goes to the TU until Timer M fires
                    TransactionState::Accepted => Ok(Some(resp.into())),
                    _ => Ok(None),
                },
                _ => match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        self.cancel_retrans_timer();
                        self.cancel_timeout_timer();
                        self.last_response = Some(resp.clone());
                        let ack = build_non_2xx_ack(&self.original, &resp)?;
                        self.send_msg(ack.clone().into()).await?;
                        self.last_ack = Some(ack);
                        let linger = if self.is_unreliable() {
                            TIMER_D_UNRELIABLE
                        } else {
                            Duration::ZERO
                        };
                        self.transition(TransactionState::Completed);
                        self.schedule_linger(linger, TransactionTimer::TimerD(self.key.clone()));
                        Ok(Some(resp.into()))
                    }
                    TransactionState::Completed => {
                        // retransmitted final: re-ACK, do not surface
                        if let Some(ack) = self.last_ack.clone() {
                            self.send_msg(ack.into()).await?;
                        }
                        Ok(None)
                    }
                    _ => Ok(None),
                },
            },
            TransactionType::ClientNonInvite => match kind {
                StatusCodeKind::Provisional => match self.state {
                    TransactionState::Calling
                    | TransactionState::Trying
                    | TransactionState::Proceeding => {
                        self.last_response = Some(resp.clone());
                        self.transition(TransactionState::Proceeding);
                        Ok(Some(resp.into()))
                    }
                    _ => Ok(None),
                },
                _ => match self.state {
                    TransactionState::Calling
                    | TransactionState::Trying
                    | TransactionState::Proceeding => {
                        self.cancel_retrans_timer();
                        self.cancel_timeout_timer();
                        self.last_response = Some(resp.clone());
                        let linger = if self.is_unreliable() {
                            self.endpoint_inner.option.t4
                        } else {
                            Duration::ZERO
                        };
                        self.transition(TransactionState::Completed);
                        self.schedule_linger(linger, TransactionTimer::TimerK(self.key.clone()));
                        Ok(Some(resp.into()))
                    }
                    _ => Ok(None),
                },
            },
            _ => Ok(None),
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                if self.state == TransactionState::Calling {
                    self.send_msg(self.original.clone().into()).await?;
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.retrans_timer = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerA(key, next)),
                    );
                }
            }
            TransactionTimer::TimerE(key, interval) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    self.send_msg(self.original.clone().into()).await?;
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.retrans_timer = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerE(key, next)),
                    );
                }
            }
            TransactionTimer::TimerG(key, interval) => {
                if self.state == TransactionState::Completed {
                    if let Some(last) = self.last_response.clone() {
                        self.send_msg(last.into()).await?;
                    }
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.retrans_timer = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerG(key, next)),
                    );
                }
            }
            TransactionTimer::TimerB(key) | TransactionTimer::TimerF(key) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    debug!(key=%key, "transaction timed out");
                    self.last_error = Some(Error::TransactionTimeout(key));
                    self.transition(TransactionState::Terminated);
                }
            }
            TransactionTimer::TimerH(key) => {
                if self.state == TransactionState::Completed {
                    debug!(key=%key, "no ACK for final response");
                    self.last_error = Some(Error::TransactionTimeout(key));
                    self.transition(TransactionState::Terminated);
                }
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                self.transition(TransactionState::Terminated);
            }
            TransactionTimer::TimerTrying(_) => {
                if self.transaction_type == TransactionType::ServerInvite
                    && self.state == TransactionState::Trying
                    && self.last_response.is_none()
                {
                    self.send_trying().await?;
                }
            }
            TransactionTimer::TimerCleanup(_) => {
                self.transition(TransactionState::Terminated);
            }
        }
        Ok(())
    }

    /// Park in the current state for `duration`, then let `timer`
    /// terminate the transaction. Zero means terminate right away, the
    /// reliable-transport case throughout section 17.
    fn schedule_linger(&mut self, duration: Duration, timer: TransactionTimer) {
        if duration.is_zero() {
            self.transition(TransactionState::Terminated);
        } else {
            self.linger_timer = Some(self.endpoint_inner.timers.timeout(duration, timer));
        }
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        trace!(key=%self.key, "transition {:?} -> {:?}", self.state, state);
        self.state = state;
        if state == TransactionState::Terminated {
            self.cleanup();
        }
    }

    fn cancel_retrans_timer(&mut self) {
        if let Some(id) = self.retrans_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_timeout_timer(&mut self) {
        if let Some(id) = self.timeout_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_trying_timer(&mut self) {
        if let Some(id) = self.trying_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cancel_retrans_timer();
        self.cancel_timeout_timer();
        self.cancel_trying_timer();
        if let Some(id) = self.linger_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        self.endpoint_inner
            .detach_transaction(&self.key, self.last_response.take());
        if self.holds_connection_ref {
            if let Some(connection) = &self.connection {
                self.endpoint_inner
                    .transport_layer
                    .release(connection.get_addr());
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// The section 17.1.1.3 ACK for a non-2xx final: same top Via (branch
/// included), From, Call-ID, Route and CSeq number as the INVITE, To taken
/// from the response.
fn build_non_2xx_ack(original: &Request, resp: &Response) -> Result<Request> {
    let mut ack = original.clone();
    ack.method = Method::Ack;
    ack.body = vec![];
    ack.headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::Route(_)
                | Header::MaxForwards(_)
        )
    });
    ack.headers.unique_push(resp.to_header()?.clone().into());
    for header in ack.headers.iter_mut() {
        if let Header::CSeq(cseq) = header {
            cseq.mut_method(Method::Ack)?;
        }
    }
    ack.headers.unique_push(Header::ContentLength((0u32).into()));
    Ok(ack)
}

/// The section 9.1 CANCEL for an in-flight INVITE.
fn make_cancel_request(original: &Request) -> Result<Request> {
    let mut cancel = original.clone();
    cancel.method = Method::Cancel;
    cancel.body = vec![];
    cancel.headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::Route(_)
                | Header::MaxForwards(_)
        )
    });
    for header in cancel.headers.iter_mut() {
        if let Header::CSeq(cseq) = header {
            cseq.mut_method(Method::Cancel)?;
        }
    }
    cancel.headers.unique_push(Header::ContentLength((0u32).into()));
    Ok(cancel)
}

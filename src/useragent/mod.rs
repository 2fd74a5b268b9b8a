use crate::{
    transaction::{
        endpoint::Endpoint,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
    },
    transport::SipAddr,
    Error, Result,
};
use rsip::prelude::HeadersExt;
use rsip::{Request, Response, SipMessage, StatusCode};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};
use tokio::select;
use tracing::{debug, info, warn};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type RequestHandler = Arc<dyn Fn(Transaction) -> HandlerFuture + Send + Sync>;

/// Handler-dispatch facade over an [`Endpoint`].
///
/// Register per-method handlers with [`UserAgent::on_request`], then run
/// [`UserAgent::serve`]. Requests with no registered handler are answered
/// 405 Method Not Allowed. Outbound, [`UserAgent::send_request`] opens a
/// client transaction and [`UserAgent::request`] waits for its final
/// response.
pub struct UserAgent {
    pub endpoint: Endpoint,
    // keyed by the method's canonical token, rsip::Method is not Hash
    handlers: Mutex<HashMap<String, RequestHandler>>,
    /// Last CSeq sent per method, for out-of-dialog auto-increment.
    cseqs: Mutex<HashMap<String, u32>>,
}

pub struct UserAgentBuilder {
    endpoint: Option<Endpoint>,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder { endpoint: None }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn build(self) -> UserAgent {
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| crate::EndpointBuilder::new().build());
        UserAgent {
            endpoint,
            handlers: Mutex::new(HashMap::new()),
            cseqs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgent {
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    pub fn on_request<F, Fut>(&self, method: rsip::Method, handler: F)
    where
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |tx| Box::pin(handler(tx)));
        match self.handlers.lock() {
            Ok(mut handlers) => {
                handlers.insert(method.to_string(), handler);
            }
            Err(e) => warn!("failed to lock handlers: {:?}", e),
        }
    }

    fn get_handler(&self, method: &rsip::Method) -> Option<RequestHandler> {
        match self.handlers.lock() {
            Ok(handlers) => handlers.get(&method.to_string()).cloned(),
            Err(e) => {
                warn!("failed to lock handlers: {:?}", e);
                None
            }
        }
    }

    /// Serve the endpoint and dispatch incoming server transactions to
    /// their method handlers until shutdown.
    pub async fn serve(&self) -> Result<()> {
        let mut incoming = self.endpoint.incoming_transactions();
        let dispatch_loop = async {
            while let Some(mut tx) = incoming.recv().await {
                debug!(key=%tx.key, "incoming transaction: {}", tx.original.method);
                match self.get_handler(&tx.original.method) {
                    Some(handler) => {
                        let method = tx.original.method;
                        tokio::spawn(async move {
                            if let Err(e) = handler(tx).await {
                                warn!("{} handler failed: {}", method, e);
                            }
                        });
                    }
                    None => {
                        info!("no handler for {}", tx.original.method);
                        tx.reply(StatusCode::MethodNotAllowed).await.ok();
                    }
                }
            }
            Ok::<_, Error>(())
        };

        select! {
            result = self.endpoint.serve() => result,
            result = dispatch_loop => result,
        }
    }

    pub fn shutdown(&self) {
        self.endpoint.shutdown();
    }

    /// Open a client transaction for `request` and send it. The returned
    /// transaction streams the responses. Without an explicit destination
    /// the request is routed by its first Route header, else its
    /// Request-URI.
    pub async fn send_request(
        &self,
        mut request: Request,
        destination: Option<SipAddr>,
    ) -> Result<Transaction> {
        self.bump_cseq(&mut request)?;
        let destination =
            destination.or_else(|| crate::rsip_ext::destination_from_request(&request));
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.inner.clone(), None);
        tx.destination = destination;
        tx.send().await?;
        Ok(tx)
    }

    /// Send and wait for the final response, discarding provisionals.
    pub async fn request(
        &self,
        request: Request,
        destination: Option<SipAddr>,
    ) -> Result<Response> {
        let mut tx = self.send_request(request, destination).await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() != rsip::StatusCodeKind::Provisional {
                    return Ok(resp);
                }
            }
        }
        match tx.last_error.take() {
            Some(e) => Err(e),
            None => Err(Error::TransactionError(
                "transaction ended without a final response".to_string(),
                tx.key.clone(),
            )),
        }
    }

    /// Stateless send, outside any transaction. Used for relaying the ACK
    /// of an established 2xx dialog.
    pub async fn write_request(&self, msg: SipMessage, destination: &SipAddr) -> Result<()> {
        let transport_layer = &self.endpoint.inner.transport_layer;
        let (connection, resolved) = transport_layer.lookup(destination, None).await?;
        let result = connection.send(msg, Some(&resolved)).await;
        transport_layer.release(connection.get_addr());
        result
    }

    /// Out-of-dialog requests repeating a method get a monotonically
    /// increasing CSeq; in-dialog requests keep the caller's sequence.
    fn bump_cseq(&self, request: &mut Request) -> Result<()> {
        let in_dialog = request
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok().flatten())
            .is_some();
        if in_dialog {
            return Ok(());
        }
        let current: u32 = request.cseq_header()?.seq()?;
        let mut cseqs = match self.cseqs.lock() {
            Ok(cseqs) => cseqs,
            Err(e) => {
                return Err(Error::Error(format!("failed to lock cseqs: {:?}", e)));
            }
        };
        match cseqs.get_mut(&request.method.to_string()) {
            Some(last) if *last >= current => {
                *last += 1;
                request.cseq_header_mut()?.mut_seq(*last)?;
            }
            _ => {
                cseqs.insert(request.method.to_string(), current);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::{CSeq, CallId, From, To, Via};
    use rsip::prelude::UntypedHeader;

    fn make_register(seq: u32) -> Request {
        rsip::Request {
            method: rsip::Method::Register,
            uri: rsip::Uri::try_from("sip:example.com").expect("uri"),
            headers: vec![
                Via::new("SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKtest1").into(),
                CSeq::new(format!("{} REGISTER", seq)).into(),
                From::new("<sip:alice@example.com>;tag=fromtag").into(),
                To::new("<sip:alice@example.com>").into(),
                CallId::new("ua-test@example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_cseq_bump_out_of_dialog() {
        let ua = UserAgent::builder().build();

        let mut first = make_register(1);
        ua.bump_cseq(&mut first).expect("bump");
        let seq: u32 = first.cseq_header().unwrap().seq().unwrap();
        assert_eq!(seq, 1, "first send keeps the caller's CSeq");

        let mut second = make_register(1);
        ua.bump_cseq(&mut second).expect("bump");
        let seq: u32 = second.cseq_header().unwrap().seq().unwrap();
        assert_eq!(seq, 2, "repeat of the same method is auto-incremented");
    }

    #[test]
    fn test_cseq_untouched_in_dialog() {
        let ua = UserAgent::builder().build();

        let mut first = make_register(7);
        ua.bump_cseq(&mut first).expect("bump");

        let mut in_dialog = make_register(1);
        in_dialog
            .headers
            .unique_push(To::new("<sip:alice@example.com>;tag=totag").into());
        ua.bump_cseq(&mut in_dialog).expect("bump");
        let seq: u32 = in_dialog.cseq_header().unwrap().seq().unwrap();
        assert_eq!(seq, 1, "in-dialog requests keep their sequence");
    }
}

use super::registrar::Registrar;
use crate::{
    header_pop,
    rsip_ext::RsipHeadersExt,
    transaction::{
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
        TransactionType,
    },
    transport::SipAddr,
    Result,
};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, Request, SipMessage, StatusCode};
use std::sync::Arc;
use tokio::select;
use tracing::{debug, info, warn};

/// Stateful forwarding core: one [`ProxyCore::forward`] task per inbound
/// request, pairing the server transaction with a client transaction toward
/// the next hop and pumping responses back with the proxy's Via stripped.
pub struct ProxyCore {
    pub registrar: Arc<Registrar>,
    /// The address written into Via and Record-Route headers we add.
    pub advertised: SipAddr,
    /// Where requests go when the callee is not registered here.
    pub upstream: Option<SipAddr>,
    pub record_route: bool,
}

impl ProxyCore {
    pub fn new(
        registrar: Arc<Registrar>,
        advertised: SipAddr,
        upstream: Option<SipAddr>,
        record_route: bool,
    ) -> Self {
        ProxyCore {
            registrar,
            advertised,
            upstream,
            record_route,
        }
    }

    /// Next hop for `request`: the registrar binding for the To user, else
    /// the configured upstream.
    fn route_for(&self, request: &Request) -> Option<SipAddr> {
        request
            .to_header()
            .ok()
            .and_then(|to| to.uri().ok())
            .and_then(|uri| uri.auth.map(|auth| auth.user))
            .and_then(|user| self.registrar.get(&user))
            .or_else(|| self.upstream.clone())
    }

    /// Serve a REGISTER in place. The binding address comes from the Contact
    /// host and port, corrected by the Via transport and the `received` /
    /// `rport` parameters when the peer sits behind a NAT (RFC 3581).
    pub async fn handle_register(&self, mut tx: Transaction) -> Result<()> {
        let contact_uri = match tx
            .original
            .contact_header()
            .ok()
            .and_then(|contact| contact.uri().ok())
        {
            Some(uri) => uri,
            None => {
                return tx.reply(StatusCode::NotFound).await;
            }
        };

        let via = tx.original.via_header()?.typed()?;
        let mut binding = SipAddr {
            r#type: via.uri.transport().cloned(),
            addr: contact_uri.host_with_port.clone(),
        };
        for param in via.params.iter() {
            match param {
                rsip::Param::Transport(transport) => {
                    binding.r#type = Some(transport.clone());
                }
                rsip::Param::Received(received) => {
                    if let Ok(ip) = received.value().parse::<std::net::IpAddr>() {
                        binding.addr.host = ip.into();
                    }
                }
                rsip::Param::Other(name, Some(value))
                    if name.value().eq_ignore_ascii_case("rport") =>
                {
                    if let Ok(port) = value.value().try_into() {
                        binding.addr.port = Some(port);
                    }
                }
                _ => {}
            }
        }

        // a Contact pointing back at us would make the proxy call itself
        if binding.addr == self.advertised.addr {
            return tx.reply(StatusCode::Unauthorized).await;
        }

        // the To header carries the address of record being registered,
        // which is what route_for later looks up
        let user = match tx.original.to_header()?.uri()?.auth.map(|auth| auth.user) {
            Some(user) => user,
            None => {
                return tx.reply(StatusCode::BadRequest).await;
            }
        };

        let transport = binding
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Udp);
        self.registrar.add(user, binding.clone());

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: rsip::Uri {
                scheme: contact_uri.scheme.clone(),
                auth: contact_uri.auth.clone(),
                host_with_port: binding.addr,
                params: vec![rsip::Param::Transport(transport)],
                headers: Default::default(),
            },
            params: vec![],
        };
        tx.reply_with(
            StatusCode::OK,
            vec![
                rsip::Header::Expires(60.into()),
                rsip::Header::Contact(contact.into()),
            ],
            None,
        )
        .await
    }

    /// Relay an ACK that belongs to an established 2xx dialog. Such an ACK
    /// is its own transaction-less request (RFC 3261 section 17.1.1.3), so
    /// it is written straight to the callee with our Via prepended, and
    /// nothing is ever answered upstream.
    pub async fn handle_ack(&self, tx: Transaction) -> Result<()> {
        let destination = match self.route_for(&tx.original) {
            Some(addr) => addr,
            None => {
                info!(key=%tx.key, "ACK for unknown target dropped");
                return Ok(());
            }
        };
        let mut ack = tx.original.clone();
        let via = tx.endpoint_inner.get_via(destination.r#type.clone(), None)?;
        ack.headers.push_front(rsip::Header::Via(via.into()));
        self.write_stateless(&tx, ack, &destination).await
    }

    async fn write_stateless(
        &self,
        tx: &Transaction,
        request: Request,
        destination: &SipAddr,
    ) -> Result<()> {
        let transport_layer = &tx.endpoint_inner.transport_layer;
        let (connection, resolved) = transport_layer.lookup(destination, None).await?;
        let result = connection
            .send(SipMessage::Request(request), Some(&resolved))
            .await;
        transport_layer.release(connection.get_addr());
        result
    }

    /// Forward one request statefully: clone it, prepend our Via (and a
    /// Record-Route when configured), run a client transaction toward the
    /// next hop, and pump its responses back minus our Via. Upstream CANCEL
    /// is propagated downstream for INVITEs; client-side timeout and
    /// transport failure become 408 / 500 upstream.
    pub async fn forward(&self, mut tx: Transaction) -> Result<()> {
        if tx.original.method == Method::Ack {
            return self.handle_ack(tx).await;
        }

        let destination = match self.route_for(&tx.original) {
            Some(addr) => addr,
            None => {
                return tx.reply(StatusCode::NotFound).await;
            }
        };

        let mut request = tx.original.clone();
        if self.record_route {
            let mut uri = rsip::Uri::from(&self.advertised);
            uri.params.push(rsip::Param::Other("lr".into(), None));
            request.headers.push_front(rsip::Header::RecordRoute(
                rsip::headers::RecordRoute::new(format!("<{}>", uri)),
            ));
        }
        let via = tx.endpoint_inner.get_via(destination.r#type.clone(), None)?;
        request.headers.push_front(rsip::Header::Via(via.into()));

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        info!(key=%tx.key, %destination, "forwarding {}", request.method);

        let mut client_tx = Transaction::new_client(key, request, tx.endpoint_inner.clone(), None);
        client_tx.destination = Some(destination.clone());
        if let Err(e) = client_tx.send().await {
            warn!(key=%tx.key, "downstream send failed: {}", e);
            return tx.reply(StatusCode::ServerInternalError).await;
        }

        let cancel_token = tx.endpoint_inner.cancel_token.clone();
        let mut forwarded_final = false;
        let mut final_was_2xx = false;
        loop {
            select! {
                msg = client_tx.receive() => match msg {
                    Some(SipMessage::Response(mut resp)) => {
                        header_pop!(resp.headers, rsip::Header::Via);
                        let kind = resp.status_code.kind();
                        debug!(key=%tx.key, "forwarding response {}", resp.status_code);
                        tx.respond(resp).await?;
                        if kind != rsip::StatusCodeKind::Provisional {
                            forwarded_final = true;
                            final_was_2xx = kind == rsip::StatusCodeKind::Successful;
                        }
                    }
                    Some(SipMessage::Request(_)) => {}
                    None => {
                        if !forwarded_final {
                            let status = match client_tx.last_error.take() {
                                Some(e) if e.is_timeout() => StatusCode::RequestTimeout,
                                Some(e) => {
                                    warn!(key=%tx.key, "downstream failed: {}", e);
                                    StatusCode::ServerInternalError
                                }
                                None => StatusCode::ServerInternalError,
                            };
                            tx.reply(status).await.ok();
                        }
                        break;
                    }
                },
                msg = tx.receive() => match msg {
                    Some(SipMessage::Request(req)) => match req.method {
                        Method::Ack => {
                            // ACK for our 2xx belongs to the dialog and is
                            // relayed downstream. The non-2xx ACK only ends
                            // the loop, the client machine already sent its
                            // own ACK.
                            if final_was_2xx {
                                let mut ack = req;
                                let via = tx
                                    .endpoint_inner
                                    .get_via(destination.r#type.clone(), None)?;
                                ack.headers.push_front(rsip::Header::Via(via.into()));
                                self.write_stateless(&tx, ack, &destination).await.ok();
                            }
                            if forwarded_final {
                                break;
                            }
                        }
                        Method::Cancel => {
                            if client_tx.transaction_type == TransactionType::ClientInvite {
                                // the 487 comes back through the response arm
                                client_tx.send_cancel().await.ok();
                            }
                        }
                        _ => {}
                    },
                    Some(SipMessage::Response(_)) => {}
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_prefers_registrar_over_upstream() {
        let registrar = Arc::new(Registrar::new());
        let bob = SipAddr::new(
            rsip::transport::Transport::Udp,
            rsip::HostWithPort::try_from("192.168.1.20:5066").expect("addr"),
        );
        registrar.add("bob".to_string(), bob.clone());
        let upstream = SipAddr::new(
            rsip::transport::Transport::Udp,
            rsip::HostWithPort::try_from("10.0.0.1:5060").expect("addr"),
        );
        let proxy = ProxyCore::new(
            registrar,
            SipAddr::new(
                rsip::transport::Transport::Udp,
                rsip::HostWithPort::try_from("127.0.0.1:5060").expect("addr"),
            ),
            Some(upstream.clone()),
            false,
        );

        let request = |to: &str| rsip::Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from(to).expect("uri"),
            headers: vec![rsip::headers::To::new(format!("<{}>", to)).into()].into(),
            version: rsip::Version::V2,
            body: Default::default(),
        };

        assert_eq!(proxy.route_for(&request("sip:bob@example.com")), Some(bob));
        assert_eq!(
            proxy.route_for(&request("sip:carol@example.com")),
            Some(upstream)
        );
    }

    #[test]
    fn test_route_without_upstream_is_none() {
        let proxy = ProxyCore::new(
            Arc::new(Registrar::new()),
            SipAddr::new(
                rsip::transport::Transport::Udp,
                rsip::HostWithPort::try_from("127.0.0.1:5060").expect("addr"),
            ),
            None,
            false,
        );
        let request = rsip::Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from("sip:nobody@example.com").expect("uri"),
            headers: vec![rsip::headers::To::new("<sip:nobody@example.com>").into()].into(),
            version: rsip::Version::V2,
            body: Default::default(),
        };
        assert!(proxy.route_for(&request).is_none());
    }
}

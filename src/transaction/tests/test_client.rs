use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transport::udp::UdpConnection;
use crate::transport::{SipAddr, TransportLayer};
use crate::{transport::TransportEvent, EndpointBuilder, EndpointOption, Result};
use rsip::{headers::*, Header, Response, SipMessage, Uri};
use std::time::Duration;
use tokio::{select, sync::mpsc::unbounded_channel, time::sleep, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::test]
async fn test_client_transaction() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0")).await?;

    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let peer_loop = async {
        let (sender, mut receiver) = unbounded_channel();
        select! {
            _ = async {
                match receiver.recv().await {
                    Some(TransportEvent::Incoming(SipMessage::Request(req), connection, _)) => {
                        let headers = req.headers.clone();
                        let trying = Response {
                            version: rsip::Version::V2,
                            status_code: rsip::StatusCode::Trying,
                            headers: headers.clone(),
                            body: Default::default(),
                        };
                        connection.send(trying.into(), None).await.expect("send trying");
                        sleep(Duration::from_millis(50)).await;

                        let ok = Response {
                            version: rsip::Version::V2,
                            status_code: rsip::StatusCode::OK,
                            headers,
                            body: Default::default(),
                        };
                        connection.send(ok.into(), None).await.expect("send ok");
                        sleep(Duration::from_secs(1)).await;
                    }
                    _ => panic!("must not reach here"),
                }
            } => {}
            _ = peer.serve_loop(sender) => {
                panic!("must not reach here");
            }
        }
    };

    let client_loop = async {
        let register_req = rsip::Request {
            method: rsip::Method::Register,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                host_with_port: peer.get_addr().addr.clone(),
                ..Default::default()
            },
            headers: vec![
                Via::new("SIP/2.0/TLS example.com:5061;branch=z9hG4bKnashd92").into(),
                CSeq::new("1 REGISTER").into(),
                From::new("Bob <sips:bob@example.com>;tag=ja743ks76zlflH").into(),
                CallId::new("1j9FpLxk3uxtm8tn@example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        };

        let key =
            TransactionKey::from_request(&register_req, TransactionRole::Client).expect("key");
        let mut tx = Transaction::new_client(key, register_req, endpoint.inner.clone(), None);
        tx.send().await.expect("send request");

        let mut got_trying = false;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                info!("received response: {}", resp.status_code);
                match resp.status_code.kind() {
                    rsip::StatusCodeKind::Provisional => got_trying = true,
                    _ => {
                        assert_eq!(resp.status_code, rsip::StatusCode::OK);
                        break;
                    }
                }
            }
        }
        assert!(got_trying, "must see the 100 Trying first");
    };

    select! {
        _ = client_loop => {}
        _ = peer_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(2)) => {
            panic!("timeout waiting");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_client_transaction_timeout() -> Result<()> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let socket = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    transport_layer.add_transport(socket.into());

    // shrunk timers so Timer F fires quickly
    let endpoint = EndpointBuilder::new()
        .with_user_agent("siprelay-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(token)
        .with_option(EndpointOption {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(40),
            t1x64: Duration::from_millis(120),
            timer_interval: Duration::from_millis(5),
            callid_suffix: None,
        })
        .build();

    // bound but never read, so the request goes unanswered
    let blackhole = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;

    let client_loop = async {
        let register_req = rsip::Request {
            method: rsip::Method::Register,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                host_with_port: blackhole.get_addr().addr.clone(),
                ..Default::default()
            },
            headers: vec![
                Via::new("SIP/2.0/UDP example.com:5060;branch=z9hG4bKtimeout1").into(),
                CSeq::new("1 REGISTER").into(),
                From::new("Bob <sip:bob@example.com>;tag=timeout-tag").into(),
                CallId::new("timeout-test@example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        };
        let key =
            TransactionKey::from_request(&register_req, TransactionRole::Client).expect("key");
        let mut tx = Transaction::new_client(key, register_req, endpoint.inner.clone(), None);
        tx.destination = Some(blackhole.get_addr().clone());
        tx.send().await.expect("send request");

        while tx.receive().await.is_some() {}
        let err = tx.last_error.take().expect("Timer F must leave an error");
        assert!(err.is_timeout(), "expected a timeout, got {:?}", err);
    };

    select! {
        _ = client_loop => {}
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(2)) => {
            panic!("timeout waiting");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_client_cancel_runs_own_transaction() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0")).await?;

    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let peer_addr = peer.get_addr().clone();
    let (sender, mut receiver) = unbounded_channel();
    tokio::spawn(async move {
        peer.serve_loop(sender).await.ok();
    });

    // answer the INVITE with 180, the CANCEL with 200, then finish the
    // INVITE with 487
    let peer_loop = async {
        let mut invite_headers = None;
        loop {
            match timeout(Duration::from_secs(5), receiver.recv()).await {
                Ok(Some(TransportEvent::Incoming(SipMessage::Request(req), connection, _))) => {
                    match req.method {
                        rsip::Method::Invite => {
                            invite_headers = Some(req.headers.clone());
                            let ringing = Response {
                                status_code: rsip::StatusCode::Ringing,
                                headers: req.headers.clone(),
                                version: rsip::Version::V2,
                                body: vec![],
                            };
                            connection.send(ringing.into(), None).await.ok();
                        }
                        rsip::Method::Cancel => {
                            let ok = Response {
                                status_code: rsip::StatusCode::OK,
                                headers: req.headers.clone(),
                                version: rsip::Version::V2,
                                body: vec![],
                            };
                            connection.send(ok.into(), None).await.ok();
                            let headers = invite_headers.clone().expect("INVITE first");
                            let terminated = Response {
                                status_code: rsip::StatusCode::RequestTerminated,
                                headers,
                                version: rsip::Version::V2,
                                body: vec![],
                            };
                            connection.send(terminated.into(), None).await.ok();
                        }
                        rsip::Method::Ack => break,
                        _ => {}
                    }
                }
                _ => break,
            }
        }
    };

    let client_loop = async {
        let invite_req = rsip::Request {
            method: rsip::Method::Invite,
            uri: Uri::try_from("sip:bob@example.com").expect("uri"),
            version: rsip::Version::V2,
            headers: rsip::Headers::from(vec![
                Via::new("SIP/2.0/UDP test.example.com:5060;branch=z9hG4bKcancel1").into(),
                From::new("<sip:alice@example.com>;tag=cancel-tag").into(),
                To::new("sip:bob@example.com").into(),
                CallId::new("cancel-test@example.com").into(),
                CSeq::new("1 INVITE").into(),
                MaxForwards::new("70").into(),
            ]),
            body: vec![],
        };
        let key =
            TransactionKey::from_request(&invite_req, TransactionRole::Client).expect("key");
        let mut tx = Transaction::new_client(key, invite_req, endpoint.inner.clone(), None);
        tx.destination = Some(peer_addr);
        tx.send().await.expect("send request");

        let mut final_status = None;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                match resp.status_code.kind() {
                    rsip::StatusCodeKind::Provisional => {
                        tx.send_cancel().await.expect("send cancel");
                    }
                    _ => {
                        final_status = Some(resp.status_code);
                        break;
                    }
                }
            }
        }
        assert_eq!(final_status, Some(rsip::StatusCode::RequestTerminated));

        // the CANCEL's 200 must have matched its own client transaction
        sleep(Duration::from_millis(100)).await;
        assert_eq!(endpoint.inner.dropped_responses(), 0);
    };

    select! {
        _ = async { tokio::join!(client_loop, peer_loop) } => {}
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(2)) => {
            panic!("timeout waiting");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_client_invite_retransmit_caps_at_t2() -> Result<()> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let socket = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    transport_layer.add_transport(socket.into());

    let endpoint = EndpointBuilder::new()
        .with_user_agent("siprelay-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(token)
        .with_option(EndpointOption {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(20),
            t4: Duration::from_millis(20),
            t1x64: Duration::from_millis(300),
            timer_interval: Duration::from_millis(5),
            callid_suffix: None,
        })
        .build();

    // counts the INVITE retransmissions without ever answering, so Timer A
    // keeps firing until Timer B ends the transaction
    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let peer_addr = peer.get_addr().clone();
    let (sender, mut receiver) = unbounded_channel();
    tokio::spawn(async move {
        peer.serve_loop(sender).await.ok();
    });
    let invites = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = invites.clone();
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let TransportEvent::Incoming(SipMessage::Request(req), _, _) = event {
                if req.method == rsip::Method::Invite {
                    counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    });

    let client_loop = async {
        let invite_req = rsip::Request {
            method: rsip::Method::Invite,
            uri: Uri::try_from("sip:bob@example.com").expect("uri"),
            version: rsip::Version::V2,
            headers: rsip::Headers::from(vec![
                Via::new("SIP/2.0/UDP test.example.com:5060;branch=z9hG4bKretrans1").into(),
                From::new("<sip:alice@example.com>;tag=retrans-tag").into(),
                To::new("sip:bob@example.com").into(),
                CallId::new("retrans-test@example.com").into(),
                CSeq::new("1 INVITE").into(),
                MaxForwards::new("70").into(),
            ]),
            body: vec![],
        };
        let key =
            TransactionKey::from_request(&invite_req, TransactionRole::Client).expect("key");
        let mut tx = Transaction::new_client(key, invite_req, endpoint.inner.clone(), None);
        tx.destination = Some(peer_addr);
        tx.send().await.expect("send request");

        while tx.receive().await.is_some() {}
        let err = tx.last_error.take().expect("Timer B must leave an error");
        assert!(err.is_timeout(), "expected a timeout, got {:?}", err);

        // with the doubling capped at T2 the peer sees a retransmission
        // roughly every 20ms over the 300ms window; unbounded doubling
        // would top out near 5 sends
        let count = invites.load(std::sync::atomic::Ordering::Relaxed);
        assert!(count >= 8, "expected capped retransmissions, got {}", count);
    };

    select! {
        _ = client_loop => {}
        _ = endpoint.serve() => {
            panic!("must not reach here");
        }
        _ = sleep(Duration::from_secs(2)) => {
            panic!("timeout waiting");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_make_ack_uses_contact_and_reversed_route_order() -> Result<()> {
    let endpoint = super::create_test_endpoint(None).await?;

    let raw_response = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/TCP uac.example.com:5060;branch=z9hG4bK1\r\n\
Record-Route: <sip:proxy1.example.com:5060;transport=tcp;lr>\r\n\
Record-Route: <sip:proxy2.example.com:5070;transport=tcp;lr>\r\n\
From: <sip:alice@example.com>;tag=from-tag\r\n\
To: <sip:bob@example.com>;tag=to-tag\r\n\
Call-ID: test-call-id\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:uas@192.0.2.55:5080;transport=tcp>\r\n\
Content-Length: 0\r\n\r\n";

    let response = Response::try_from(raw_response)?;
    let ack = endpoint.inner.make_ack(&response, None, None)?;

    let expected_uri = Uri::try_from("sip:uas@192.0.2.55:5080;transport=tcp")?;
    assert_eq!(ack.uri, expected_uri, "ACK must target the remote Contact");

    let content_length: String = ack
        .headers
        .iter()
        .filter_map(|header| match header {
            Header::ContentLength(content_length) => Some(content_length.value().to_string()),
            _ => None,
        })
        .next()
        .expect("ACK must include a Content-Length header");
    assert_eq!(content_length, "0");

    let routes: Vec<String> = ack
        .headers
        .iter()
        .filter_map(|header| match header {
            Header::Route(route) => Some(route.value().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(
        routes,
        vec![
            "<sip:proxy2.example.com:5070;transport=tcp;lr>".to_string(),
            "<sip:proxy1.example.com:5060;transport=tcp;lr>".to_string()
        ],
        "ACK Route headers must follow the reversed Record-Route order"
    );

    Ok(())
}

#[tokio::test]
async fn test_make_ack_uses_contact_with_ob() -> Result<()> {
    let endpoint = super::create_test_endpoint(None).await?;

    let raw_response = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/TCP uac.example.com:5060;branch=z9hG4bK1;rport=15060;received=1.2.3.4\r\n\
From: <sip:alice@example.com>;tag=from-tag\r\n\
To: <sip:bob@example.com>;tag=to-tag\r\n\
Call-ID: test-call-id\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:uas@192.0.2.55:5080;transport=tcp;ob>\r\n\
Content-Length: 0\r\n\r\n";

    let response = Response::try_from(raw_response)?;
    let dest = SipAddr {
        r#type: Some(rsip::transport::Transport::Tcp),
        addr: "1.2.3.4:15060".try_into()?,
    };
    let ack = endpoint.inner.make_ack(&response, None, Some(&dest))?;
    let expected_uri = Uri::try_from("sip:uas@1.2.3.4:15060;transport=tcp")?;
    assert_eq!(ack.uri, expected_uri, "ACK must target the rewritten Contact");
    Ok(())
}

#[tokio::test]
async fn test_client_invite_sends_ack_for_non_2xx() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0")).await?;

    let endpoint_inner = endpoint.inner.clone();
    tokio::spawn(async move {
        endpoint_inner.serve().await.ok();
    });

    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let peer_addr = peer.get_addr().clone();

    let (sender, mut receiver) = unbounded_channel();
    tokio::spawn(async move {
        peer.serve_loop(sender).await.ok();
    });

    let peer_loop = async {
        let mut received_invite = false;
        let mut received_ack = false;
        loop {
            match timeout(Duration::from_secs(5), receiver.recv()).await {
                Ok(Some(TransportEvent::Incoming(SipMessage::Request(req), connection, _))) => {
                    if req.method == rsip::Method::Invite {
                        received_invite = true;
                        let response = Response {
                            status_code: rsip::StatusCode::BusyHere,
                            headers: req.headers.clone(),
                            version: rsip::Version::V2,
                            body: vec![],
                        };
                        connection.send(response.into(), None).await.ok();
                    } else if req.method == rsip::Method::Ack {
                        received_ack = true;
                        break;
                    }
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        (received_invite, received_ack)
    };

    let client_loop = async {
        let invite_req = rsip::Request {
            method: rsip::Method::Invite,
            uri: Uri::try_from("sip:bob@example.com")?,
            version: rsip::Version::V2,
            headers: rsip::Headers::from(vec![
                Via::new("SIP/2.0/UDP test.example.com:5060;branch=z9hG4bKtest-ack").into(),
                From::new("<sip:alice@example.com>;tag=from-tag").into(),
                To::new("sip:bob@example.com").into(),
                CallId::new("test-call-id@example.com").into(),
                CSeq::new("1 INVITE").into(),
                MaxForwards::new("70").into(),
            ]),
            body: vec![],
        };

        let key = TransactionKey::from_request(&invite_req, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, invite_req, endpoint.inner.clone(), None);
        tx.destination = Some(peer_addr);
        tx.send().await?;

        match timeout(Duration::from_secs(5), tx.receive()).await {
            Ok(Some(SipMessage::Response(resp))) => {
                assert_eq!(resp.status_code, rsip::StatusCode::BusyHere);
            }
            other => panic!("expected final response, got {:?}", other.is_ok()),
        }

        // give the ACK time to reach the peer
        sleep(Duration::from_millis(100)).await;
        Result::<()>::Ok(())
    };

    let (peer_result, client_result) = tokio::join!(peer_loop, client_loop);
    client_result?;

    let (received_invite, received_ack) = peer_result;
    assert!(received_invite, "peer must receive the INVITE");
    assert!(received_ack, "peer must receive the ACK for the non-2xx");
    Ok(())
}

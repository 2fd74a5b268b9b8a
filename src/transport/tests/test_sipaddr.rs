use crate::transport::SipAddr;

#[test]
fn test_sipaddr_from_uri() {
    let addr = "sip:proxy1.example.org:25060;transport=tcp";
    let uri = rsip::Uri::try_from(addr).expect("parse uri");
    let sipaddr = SipAddr::try_from(&uri).expect("SipAddr::try_from");
    assert_eq!(sipaddr.r#type, Some(rsip::transport::Transport::Tcp));
    assert_eq!(
        sipaddr.addr,
        rsip::HostWithPort {
            host: "proxy1.example.org".parse().unwrap(),
            port: Some(25060.into()),
        }
    );
}

#[test]
fn test_sipaddr_default_ports() {
    let tls = SipAddr {
        r#type: Some(rsip::transport::Transport::Tls),
        addr: rsip::HostWithPort {
            host: "example.org".parse().unwrap(),
            port: None,
        },
    };
    assert_eq!(tls.default_port(), 5061);
    assert_eq!(tls.dial_target(), "example.org:5061");

    let udp = SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: rsip::HostWithPort {
            host: "example.org".parse().unwrap(),
            port: None,
        },
    };
    assert_eq!(udp.default_port(), 5060);
    assert!(!udp.is_reliable());
    assert!(tls.is_reliable());
}

#[test]
fn test_sipaddr_cache_identity() {
    use std::collections::HashMap;

    // transport + host + port is the cache key; same address over two
    // transports must not collide
    let mut cache: HashMap<SipAddr, u32> = HashMap::new();
    let tcp = SipAddr {
        r#type: Some(rsip::transport::Transport::Tcp),
        addr: rsip::HostWithPort {
            host: "10.0.0.1".parse().unwrap(),
            port: Some(5060.into()),
        },
    };
    let mut ws = tcp.clone();
    ws.r#type = Some(rsip::transport::Transport::Ws);

    cache.insert(tcp.clone(), 1);
    cache.insert(ws.clone(), 2);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&tcp), Some(&1));
    assert_eq!(cache.get(&ws), Some(&2));

    // re-inserting the same identity overwrites, it never duplicates
    cache.insert(tcp.clone(), 3);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&tcp), Some(&3));
}

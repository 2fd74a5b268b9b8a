use crate::{Error, Result};
use rsip::headers::UntypedHeader;
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Which side of the wire the transaction lives on. The same request text
/// yields distinct keys for the client and server transactions a proxy runs
/// for it, so both can coexist in one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Key for messages carrying the z9hG4bK magic cookie (RFC 3261 section
/// 17.2.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
    }
}

/// Fallback key for pre-RFC 3261 peers whose Via carries no branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    Rfc3261(Rfc3261),
    Rfc2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261(key) => write!(
                f,
                "{}:{} {}/{} {}({})",
                key.role, key.call_id, key.method, key.cseq, key.from_tag, key.branch,
            ),
            TransactionKey::Rfc2543(key) => write!(
                f,
                "{}:{} {}/{} {}[{}]",
                key.role, key.call_id, key.method, key.cseq, key.from_tag, key.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TransactionKey {
    /// Key for a request. ACK folds onto the INVITE transaction it
    /// acknowledges (section 17.1.1.3: the ACK for a non-2xx reuses the
    /// INVITE branch; a 2xx ACK carries a new branch and simply will not
    /// match).
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let mut method = req.method().clone();
        if method == Method::Ack {
            method = Method::Invite;
        }
        let from_tag = req.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = req.call_id_header()?.value().to_string();
        let cseq = req.cseq_header()?.seq()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::Rfc3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::Rfc2543(Rfc2543 {
                role,
                method,
                cseq,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    /// Key for an incoming response: always matched against the client
    /// transaction that sent the request.
    pub fn from_response(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let from_tag = resp.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = resp.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::Rfc3261(Rfc3261 {
                role: TransactionRole::Client,
                branch: branch.to_string(),
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::Rfc2543(Rfc2543 {
                role: TransactionRole::Client,
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    /// The INVITE server transaction this CANCEL targets: same key with the
    /// method swapped (RFC 3261 section 9.2).
    pub fn to_invite(&self) -> TransactionKey {
        match self {
            TransactionKey::Rfc3261(key) => TransactionKey::Rfc3261(Rfc3261 {
                method: Method::Invite,
                ..key.clone()
            }),
            TransactionKey::Rfc2543(key) => TransactionKey::Rfc2543(Rfc2543 {
                method: Method::Invite,
                ..key.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> rsip::Request {
        use rsip::headers::*;
        rsip::message::Request {
            method: rsip::method::Method::Register,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sips),
                host_with_port: rsip::Domain::from("example.com").into(),
                ..Default::default()
            },
            headers: vec![
                Via::new("SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92")
                    .into(),
                CSeq::new("2 REGISTER").into(),
                From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
                CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_transaction_key() -> Result<()> {
        let register_req = register_request();
        let key = TransactionKey::from_request(&register_req, TransactionRole::Server)?;
        assert_eq!(
            key,
            TransactionKey::Rfc3261(Rfc3261 {
                role: TransactionRole::Server,
                branch: "z9hG4bKnashd92".to_string(),
                method: Method::Register,
                cseq: 2,
                from_tag: Tag::new("ja743ks76zlflH"),
                call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
            })
        );

        // responses always match the client transaction
        let register_resp = rsip::message::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: register_req.headers.clone(),
            body: Default::default(),
        };
        let key = TransactionKey::from_response(&register_resp)?;
        assert_eq!(
            key,
            TransactionKey::from_request(&register_req, TransactionRole::Client)?
        );
        Ok(())
    }

    #[test]
    fn test_roles_do_not_collide() -> Result<()> {
        let req = register_request();
        let client = TransactionKey::from_request(&req, TransactionRole::Client)?;
        let server = TransactionKey::from_request(&req, TransactionRole::Server)?;
        assert_ne!(client, server);
        Ok(())
    }

    #[test]
    fn test_ack_folds_to_invite() -> Result<()> {
        use rsip::headers::CSeq;
        let mut ack_req = register_request();
        ack_req.method = Method::Ack;
        ack_req.headers.unique_push(CSeq::new("2 ACK").into());

        let key = TransactionKey::from_request(&ack_req, TransactionRole::Server)?;
        match &key {
            TransactionKey::Rfc3261(key) => assert_eq!(key.method, Method::Invite),
            _ => panic!("expected rfc3261 key"),
        }
        Ok(())
    }

    #[test]
    fn test_cancel_to_invite() -> Result<()> {
        use rsip::headers::CSeq;
        let mut cancel_req = register_request();
        cancel_req.method = Method::Cancel;
        cancel_req.headers.unique_push(CSeq::new("2 CANCEL").into());

        let cancel_key = TransactionKey::from_request(&cancel_req, TransactionRole::Server)?;
        let invite_key = cancel_key.to_invite();
        match &invite_key {
            TransactionKey::Rfc3261(key) => {
                assert_eq!(key.method, Method::Invite);
                assert_eq!(key.role, TransactionRole::Server);
            }
            _ => panic!("expected rfc3261 key"),
        }
        Ok(())
    }
}

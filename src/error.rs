use crate::{transaction::key::TransactionKey, transport::SipAddr};

/// Failure kinds of the stack.
///
/// Transaction-scoped errors carry the [`TransactionKey`] of the owning
/// transaction so the log line identifies the branch; transport errors carry
/// the address of the connection that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Request-line or status-line could not be parsed.
    MalformedStartLine(String),
    /// Header section violation, including a missing Content-Length on a
    /// stream transport.
    MalformedHeader(String),
    MalformedUri(String),
    /// Inbound message exceeded the configured size cap.
    MessageTooLarge(usize),
    /// Semantic parse failure from the message model.
    SipMessageError(String),
    TransportLayerError(String, SipAddr),
    TransactionError(String, TransactionKey),
    /// Timer B/F/H/J expiry.
    TransactionTimeout(TransactionKey),
    /// CANCEL received or 487 seen.
    TransactionCanceled(TransactionKey),
    EndpointError(String),
    ProxyError(String),
    Error(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MalformedStartLine(e) => write!(f, "malformed start line: {}", e),
            Error::MalformedHeader(e) => write!(f, "malformed header: {}", e),
            Error::MalformedUri(e) => write!(f, "malformed uri: {}", e),
            Error::MessageTooLarge(n) => write!(f, "message too large: {} bytes", n),
            Error::SipMessageError(e) => write!(f, "sip message error: {}", e),
            Error::TransportLayerError(e, addr) => write!(f, "transport error: {} ({})", e, addr),
            Error::TransactionError(e, key) => write!(f, "transaction error: {} ({})", e, key),
            Error::TransactionTimeout(key) => write!(f, "transaction timeout ({})", key),
            Error::TransactionCanceled(key) => write!(f, "transaction canceled ({})", key),
            Error::EndpointError(e) => write!(f, "endpoint error: {}", e),
            Error::ProxyError(e) => write!(f, "proxy error: {}", e),
            Error::Error(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// A timeout warrants 408 upstream in the proxy; every other downstream
    /// failure maps to 500.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransactionTimeout(_))
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::MalformedUri(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}

use crate::transport::{SipAddr, SipConnection};
use key::TransactionKey;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use transaction::Transaction;

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;
#[cfg(test)]
mod tests;

pub use key::TransactionRole;

/// RTT estimate, the base unit for all retransmission timers (RFC 3261
/// section 17.1.1.1).
pub const T1: Duration = Duration::from_millis(500);
/// Maximum retransmission interval for non-INVITE requests and INVITE
/// responses.
pub const T2: Duration = Duration::from_millis(4000);
/// Maximum duration a message can stay in the network.
pub const T4: Duration = Duration::from_millis(5000);
/// 64*T1, the overall transaction timeout.
pub const T1X64: Duration = Duration::from_millis(64 * 500);
/// How long a server INVITE transaction waits before answering 100 Trying
/// on the TU's behalf.
pub const TO_TRYING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    /// RFC 6026: a 2xx was sent or received; the transaction absorbs
    /// retransmissions while the TU completes the dialog handshake.
    Accepted,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Timers as named by RFC 3261 section 17, plus the auto-100 timer and the
/// post-termination cleanup timer. Retransmission timers carry their next
/// interval.
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerTrying(TransactionKey),
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerTrying(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, interval) => {
                write!(f, "TimerA({:?}): {}", interval, key)
            }
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD: {}", key),
            TransactionTimer::TimerE(key, interval) => {
                write!(f, "TimerE({:?}): {}", interval, key)
            }
            TransactionTimer::TimerF(key) => write!(f, "TimerF: {}", key),
            TransactionTimer::TimerG(key, interval) => {
                write!(f, "TimerG({:?}): {}", interval, key)
            }
            TransactionTimer::TimerH(key) => write!(f, "TimerH: {}", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI: {}", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ: {}", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK: {}", key),
            TransactionTimer::TimerTrying(key) => write!(f, "TimerTrying: {}", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup: {}", key),
        }
    }
}

/// What the endpoint delivers into a transaction's event channel.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>, Option<SipAddr>),
    Timer(TransactionTimer),
    Terminate,
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Stream of new server transactions handed to the TU.
pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

pub fn random_text(count: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

/// A fresh RFC 3261 magic-cookie branch parameter.
pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "z9hG4bK{}",
        random_text(12)
    )))
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!("{}@{}", random_text(16), domain.unwrap_or("localhost")).into()
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(8))
}

pub mod channel;
pub mod codec;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod tls;
pub mod transport_layer;
pub mod udp;
pub mod ws;

pub use connection::{SipConnection, TransportEvent};
pub use sip_addr::SipAddr;
pub use transport_layer::TransportLayer;

#[cfg(test)]
pub mod tests;

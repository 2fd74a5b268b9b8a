//! An RFC 3261 stateful proxy core.
//!
//! The crate is layered the way the wire is: [`transport`] owns sockets and
//! the streaming message framer, [`transaction`] owns the four RFC 3261
//! section 17 state machines and the endpoint that correlates messages to
//! them, [`useragent`] dispatches incoming server transactions to method
//! handlers, and [`proxy`] implements the stateful forwarding loop plus the
//! in-memory registrar.

pub mod error;
pub mod proxy;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;
pub mod useragent;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
pub use useragent::{UserAgent, UserAgentBuilder};

pub mod forwarder;
pub mod registrar;

pub use forwarder::ProxyCore;
pub use registrar::Registrar;

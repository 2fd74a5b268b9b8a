use crate::transport::SipAddr;
use std::{collections::HashMap, sync::RwLock};
use tracing::info;

/// In-memory location service: user part of the address-of-record mapped
/// to the transport address learned from REGISTER.
///
/// Reads vastly outnumber writes (every INVITE consults it, only REGISTER
/// updates it), so it sits behind an `RwLock` rather than a `Mutex`.
#[derive(Default)]
pub struct Registrar {
    users: RwLock<HashMap<String, SipAddr>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `addr`, replacing any previous binding.
    pub fn add(&self, user: String, addr: SipAddr) {
        info!(user, %addr, "registered");
        match self.users.write() {
            Ok(mut users) => {
                users.insert(user, addr);
            }
            Err(e) => {
                // lock poisoned, keep the old bindings readable
                tracing::error!("registrar lock poisoned: {:?}", e);
            }
        }
    }

    pub fn get(&self, user: &str) -> Option<SipAddr> {
        self.users.read().ok()?.get(user).cloned()
    }

    pub fn remove(&self, user: &str) {
        if let Ok(mut users) = self.users.write() {
            users.remove(user);
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SipAddr {
        SipAddr::new(
            rsip::transport::Transport::Udp,
            rsip::HostWithPort::try_from(format!("127.0.0.1:{}", port).as_str()).expect("addr"),
        )
    }

    #[test]
    fn test_register_replace_remove() {
        let registrar = Registrar::new();
        registrar.add("alice".to_string(), addr(5061));
        assert_eq!(registrar.get("alice"), Some(addr(5061)));

        registrar.add("alice".to_string(), addr(5062));
        assert_eq!(registrar.get("alice"), Some(addr(5062)));
        assert_eq!(registrar.len(), 1);

        registrar.remove("alice");
        assert_eq!(registrar.get("alice"), None);
        assert!(registrar.is_empty());
    }

    #[test]
    fn test_concurrent_readers() {
        let registrar = Arc::new(Registrar::new());
        registrar.add("bob".to_string(), addr(5070));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let registrar = registrar.clone();
            joins.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    assert!(registrar.get("bob").is_some());
                }
            }));
        }
        registrar.add("carol".to_string(), addr(5071));
        for join in joins {
            join.join().expect("reader thread");
        }
        assert_eq!(registrar.len(), 2);
    }
}

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::session::Session;

/// Process-wide set of live sessions (§4.2).
///
/// Traversal takes the read side of the lock and clones the `Arc`s it
/// visits, so a concurrent `remove` during iteration is safe: the removed
/// session simply stops appearing in subsequent snapshots, and any `Arc`
/// already handed to the caller keeps the session alive until dropped.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails silently (no insert) if `s` is already present, by pointer
    /// identity.
    pub fn insert(&self, s: Arc<Session>) {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.iter().any(|existing| Arc::ptr_eq(existing, &s)) {
            return;
        }
        sessions.push(s);
    }

    /// Returns whether `s` was present and is now removed.
    pub fn remove(&self, s: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|existing| !Arc::ptr_eq(existing, s));
        sessions.len() != before
    }

    #[must_use]
    pub fn find_by_peer(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .find(|s| s.peer_addr() == addr && !s.is_stopped())
            .cloned()
    }

    /// Every session whose bound device's id equals `device_id`, excluding
    /// `skip` if given. Used by cross-device cleanup and by `destroy` to
    /// catch the pathological case of two sessions sharing a phone.
    #[must_use]
    pub fn find_all_by_device_id(&self, device_id: &str, skip: Option<&Arc<Session>>) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .filter(|s| {
                if let Some(skip) = skip {
                    if Arc::ptr_eq(s, skip) {
                        return false;
                    }
                }
                s.device().is_some_and(|d| d.device_id() == device_id)
            })
            .cloned()
            .collect()
    }

    /// A consistent point-in-time snapshot for sweep/listing purposes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every worker to stop; does not join them.
    pub fn terminate_all(&self) {
        for s in self.sessions.read().unwrap().iter() {
            s.request_stop_internal();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn insert_is_idempotent_by_identity() {
        let reg = SessionRegistry::new();
        let s = Session::new(3, addr(1), addr(2), 0);
        reg.insert(s.clone());
        reg.insert(s.clone());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_reports_whether_present() {
        let reg = SessionRegistry::new();
        let s = Session::new(3, addr(1), addr(2), 0);
        assert!(!reg.remove(&s));
        reg.insert(s.clone());
        assert!(reg.remove(&s));
        assert!(!reg.remove(&s));
    }

    #[test]
    fn find_by_peer_skips_stopped_sessions() {
        let reg = SessionRegistry::new();
        let s = Session::new(3, addr(1), addr(2), 0);
        reg.insert(s.clone());
        assert!(reg.find_by_peer(addr(1)).is_some());
        s.request_stop_internal();
        assert!(reg.find_by_peer(addr(1)).is_none());
    }
}

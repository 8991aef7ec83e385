//! Cluster membership table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Dead,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Alive => write!(f, "alive"),
            MemberState::Dead => write!(f, "dead"),
        }
    }
}

/// Snapshot row for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub state: MemberState,
}

pub(crate) struct Membership {
    local: MemberInfo,
    peers: RwLock<HashMap<String, (MemberInfo, MemberState)>>,
    cluster_size: Arc<AtomicUsize>,
}

impl Membership {
    pub(crate) fn new(local: MemberInfo, cluster_size: Arc<AtomicUsize>) -> Self {
        cluster_size.store(1, Ordering::Relaxed);
        Self {
            local,
            peers: RwLock::new(HashMap::new()),
            cluster_size,
        }
    }

    pub(crate) fn local(&self) -> &MemberInfo {
        &self.local
    }

    /// Record a live peer. Returns true when this is a new member or a
    /// revived one (anti-entropy healing a false-positive death).
    pub(crate) fn note_alive(&self, info: MemberInfo) -> bool {
        if info.name == self.local.name {
            return false;
        }
        let mut peers = self.peers.write().unwrap();
        let changed = !matches!(peers.get(&info.name), Some((_, MemberState::Alive)));
        peers.insert(info.name.clone(), (info, MemberState::Alive));
        drop(peers);
        self.update_cluster_size();
        changed
    }

    pub(crate) fn note_dead(&self, name: &str) -> bool {
        if name == self.local.name {
            return false;
        }
        let mut peers = self.peers.write().unwrap();
        let changed = match peers.get_mut(name) {
            Some(peer @ (_, MemberState::Alive)) => {
                peer.1 = MemberState::Dead;
                true
            }
            _ => false,
        };
        drop(peers);
        self.update_cluster_size();
        changed
    }

    pub(crate) fn alive_peers(&self) -> Vec<MemberInfo> {
        self.peers
            .read()
            .unwrap()
            .values()
            .filter(|(_, state)| *state == MemberState::Alive)
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// Local node first, then peers sorted by name.
    pub(crate) fn snapshot(&self) -> Vec<Member> {
        let mut members = vec![Member {
            name: self.local.name.clone(),
            addr: self.local.addr,
            state: MemberState::Alive,
        }];
        let mut peers: Vec<Member> = self
            .peers
            .read()
            .unwrap()
            .values()
            .map(|(info, state)| Member {
                name: info.name.clone(),
                addr: info.addr,
                state: *state,
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        members.extend(peers);
        members
    }

    fn update_cluster_size(&self) {
        let alive = 1 + self
            .peers
            .read()
            .unwrap()
            .values()
            .filter(|(_, state)| *state == MemberState::Alive)
            .count();
        self.cluster_size.store(alive, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, port: u16) -> MemberInfo {
        MemberInfo {
            name: name.to_string(),
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
        }
    }

    #[test]
    fn tracks_alive_and_dead() {
        let size = Arc::new(AtomicUsize::new(0));
        let membership = Membership::new(info("a", 1), size.clone());
        assert_eq!(size.load(Ordering::Relaxed), 1);

        assert!(membership.note_alive(info("b", 2)));
        assert!(!membership.note_alive(info("b", 2)));
        assert_eq!(size.load(Ordering::Relaxed), 2);

        assert!(membership.note_dead("b"));
        assert!(!membership.note_dead("b"));
        assert_eq!(size.load(Ordering::Relaxed), 1);
        assert!(membership.alive_peers().is_empty());

        // Anti-entropy revives a falsely declared peer.
        assert!(membership.note_alive(info("b", 2)));
        assert_eq!(membership.alive_peers().len(), 1);
    }

    #[test]
    fn ignores_self_reports() {
        let membership = Membership::new(info("a", 1), Arc::new(AtomicUsize::new(0)));
        assert!(!membership.note_alive(info("a", 1)));
        assert!(!membership.note_dead("a"));
        assert_eq!(membership.snapshot().len(), 1);
    }
}

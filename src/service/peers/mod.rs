// =============================================================================
// Trellis Matrix NextServer - Peer Registry
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Accounting of remote homeservers: resolved address, link and transfer
//   totals, and the last transport error. The transport collaborator
//   mutates entries; the ingest core consults `errmsg` during origin
//   selection and may clear a stale error with `errclear`.
//
// =============================================================================

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::RwLock,
};

use ruma::{OwnedServerName, ServerName};
use tracing::debug;

/// Per-host accounting entry.
#[derive(Clone, Debug, Default)]
pub struct Peer {
    /// Resolved remote address, when the transport has established one.
    pub remote: Option<SocketAddr>,
    pub link_count: u64,
    pub tag_count: u64,
    pub write_total: u64,
    pub read_total: u64,
    /// Sticky description of the last transport failure. A host carrying an
    /// error is skipped by fetch origin selection until cleared.
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct Service {
    peers: RwLock<HashMap<OwnedServerName, Peer>>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last error recorded against a host, if any. Consulted by origin
    /// selection to exclude known-bad peers.
    pub fn errmsg(&self, host: &ServerName) -> Option<String> {
        self.peers
            .read()
            .unwrap()
            .get(host)
            .and_then(|peer| peer.last_error.clone())
    }

    /// Clear a host's error state, making it selectable again.
    pub fn errclear(&self, host: &ServerName) -> bool {
        let mut peers = self.peers.write().unwrap();
        match peers.get_mut(host) {
            Some(peer) if peer.last_error.is_some() => {
                debug!(%host, "cleared peer error");
                peer.last_error = None;
                true
            }
            _ => false,
        }
    }

    /// Record a transport failure against a host.
    pub fn errset(&self, host: &ServerName, message: impl Into<String>) {
        let mut peers = self.peers.write().unwrap();
        peers.entry(host.to_owned()).or_default().last_error = Some(message.into());
    }

    /// Record the resolved remote address of a host.
    pub fn set_remote(&self, host: &ServerName, remote: SocketAddr) {
        let mut peers = self.peers.write().unwrap();
        peers.entry(host.to_owned()).or_default().remote = Some(remote);
    }

    pub fn remote(&self, host: &ServerName) -> Option<SocketAddr> {
        self.peers.read().unwrap().get(host).and_then(|p| p.remote)
    }

    /// Link established / torn down by the transport.
    pub fn link_opened(&self, host: &ServerName) {
        let mut peers = self.peers.write().unwrap();
        peers.entry(host.to_owned()).or_default().link_count += 1;
    }

    /// Transfer accounting, updated by the transport per request.
    pub fn note_io(&self, host: &ServerName, wrote: u64, read: u64) {
        let mut peers = self.peers.write().unwrap();
        let peer = peers.entry(host.to_owned()).or_default();
        peer.tag_count += 1;
        peer.write_total += wrote;
        peer.read_total += read;
    }

    pub fn get(&self, host: &ServerName) -> Option<Peer> {
        self.peers.read().unwrap().get(host).cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ServerName, &Peer) -> bool,
    {
        for (host, peer) in self.peers.read().unwrap().iter() {
            if !f(host, peer) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(s: &str) -> OwnedServerName {
        s.try_into().unwrap()
    }

    #[test]
    fn errmsg_roundtrip() {
        let peers = Service::new();
        let bad = host("bad.test");

        assert!(peers.errmsg(&bad).is_none());
        peers.errset(&bad, "connection refused");
        assert_eq!(peers.errmsg(&bad).as_deref(), Some("connection refused"));

        assert!(peers.errclear(&bad));
        assert!(peers.errmsg(&bad).is_none());
        assert!(!peers.errclear(&bad));
    }

    #[test]
    fn io_accounting_accumulates() {
        let peers = Service::new();
        let remote = host("remote.test");

        peers.note_io(&remote, 100, 2000);
        peers.note_io(&remote, 50, 1000);

        let peer = peers.get(&remote).unwrap();
        assert_eq!(peer.tag_count, 2);
        assert_eq!(peer.write_total, 150);
        assert_eq!(peer.read_total, 3000);
    }
}

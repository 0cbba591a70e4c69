use std::sync::Arc;

use tracing::debug;

use kktp_core::constants::BRANCHES_PER_CONTACT;
use kktp_core::error::KktpError;
use kktp_core::types::{now_ms, PubSig};
use kktp_crypto::keys::{DhKeypair, MasterKey, SigKeypair};

use crate::store::{PeerRecord, SessionStore};

/// Long-lived identity: the master key plus per-contact branch allocation.
///
/// Every distinct peer gets a unique `base_index`; branch `base+1` is the
/// initiator-TX pair and `base+2` the responder-RX pair. An index is burned
/// on allocation and never reused, even when a handshake dies half-way.
pub struct IdentityManager {
    master: MasterKey,
    store: Arc<SessionStore>,
}

impl IdentityManager {
    pub fn new(master: MasterKey, store: Arc<SessionStore>) -> Self {
        Self { master, store }
    }

    /// Burn and return a fresh base index (peer not yet known).
    pub fn allocate_base_index(&self) -> Result<u32, KktpError> {
        let index = self.store.next_base_index(BRANCHES_PER_CONTACT)?;
        debug!(base_index = index, "allocated key branch");
        Ok(index)
    }

    /// The base index recorded for `peer`, or a fresh allocation bound to it.
    pub fn base_index_for_peer(&self, peer: &PubSig) -> Result<u32, KktpError> {
        if let Some(record) = self.store.get_peer(peer)? {
            return Ok(record.base_index);
        }
        let base_index = self.allocate_base_index()?;
        self.bind_peer(peer, base_index)?;
        Ok(base_index)
    }

    /// Bind a peer identity to an already-allocated base index.
    pub fn bind_peer(&self, peer: &PubSig, base_index: u32) -> Result<(), KktpError> {
        self.store.put_peer(&PeerRecord {
            peer_pub_sig: peer.clone(),
            base_index,
            updated_at: now_ms(),
        })
    }

    pub fn lookup_peer(&self, peer: &PubSig) -> Result<Option<PeerRecord>, KktpError> {
        self.store.get_peer(peer)
    }

    /// The branch index for a handshake role: `base+1` initiator, `base+2`
    /// responder.
    pub fn key_index(base_index: u32, is_initiator: bool) -> u32 {
        base_index + if is_initiator { 1 } else { 2 }
    }

    /// Deterministic signing/DH keypairs for a branch index.
    pub fn keys_at(&self, key_index: u32) -> (SigKeypair, DhKeypair) {
        (self.master.sig_branch(key_index), self.master.dh_branch(key_index))
    }

    /// Keys for a role on a given base index.
    pub fn keys_for_role(&self, base_index: u32, is_initiator: bool) -> (SigKeypair, DhKeypair) {
        self.keys_at(Self::key_index(base_index, is_initiator))
    }

    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }
}

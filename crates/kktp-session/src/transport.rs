//! Sealed transport packets and the per-direction receive discipline state.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use kktp_core::constants::{NONCE_LEN, REPLAY_CACHE_MAX};
use kktp_core::error::KktpError;
use kktp_core::types::{Direction, Sid, Timestamp};
use kktp_crypto::aead;

/// A sealed transport packet as it rides the session mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub sid: String,
    pub direction: Direction,
    pub seq: u64,
    /// 24-byte random nonce, hex.
    pub nonce: String,
    pub ciphertext: String,
}

impl SessionMessage {
    pub fn sid(&self) -> Result<Sid, KktpError> {
        Sid::from_hex(&self.sid)
    }

    pub fn nonce_bytes(&self) -> Result<[u8; NONCE_LEN], KktpError> {
        let raw = hex::decode(&self.nonce).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
        raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
            what: "nonce",
            expected: NONCE_LEN,
            got: raw.len(),
        })
    }
}

/// AAD binds `(sid, direction, seq)`: a packet replayed on another session,
/// direction, or position fails authentication outright.
fn aad_for(sid: &Sid, direction: Direction, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(41);
    aad.extend_from_slice(sid.as_bytes());
    aad.push(direction.as_byte());
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

/// Seal one outbound packet.
pub fn seal_message(
    key: &[u8; 32],
    sid: &Sid,
    direction: Direction,
    seq: u64,
    plaintext: &[u8],
) -> Result<SessionMessage, KktpError> {
    let (nonce, ciphertext) = aead::seal(key, &aad_for(sid, direction, seq), plaintext)?;
    Ok(SessionMessage {
        sid: sid.to_hex(),
        direction,
        seq,
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

/// Open one packet under the AAD its header claims.
pub fn open_message(key: &[u8; 32], message: &SessionMessage) -> Result<Vec<u8>, KktpError> {
    let sid = message.sid()?;
    let nonce = message.nonce_bytes()?;
    let ciphertext =
        hex::decode(&message.ciphertext).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
    aead::open(key, &nonce, &aad_for(&sid, message.direction, message.seq), &ciphertext)
}

// ── Per-direction state ──────────────────────────────────────────────────────

/// Everything the receive discipline tracks for one direction.
pub struct DirectionState {
    /// Outbound: next seq to use. Inbound: next seq expected.
    pub next_seq: u64,
    /// Nonces of delivered packets (LRU, cap 1000).
    pub replay: LruCache<[u8; NONCE_LEN], ()>,
    /// Out-of-order packets buffered by seq (bounded upstream).
    pub pending: BTreeMap<u64, SessionMessage>,
    /// When the current sequence gap opened, if one is open.
    pub gap_start: Option<Timestamp>,
}

impl DirectionState {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            replay: LruCache::new(NonZeroUsize::new(REPLAY_CACHE_MAX).unwrap()),
            pending: BTreeMap::new(),
            gap_start: None,
        }
    }

    /// True when `nonce` was already delivered or sits in the pending buffer.
    pub fn nonce_seen(&self, nonce: &[u8; NONCE_LEN]) -> bool {
        if self.replay.contains(nonce) {
            return true;
        }
        self.pending
            .values()
            .any(|m| m.nonce_bytes().map(|n| &n == nonce).unwrap_or(false))
    }

    /// Wipe buffers and caches (termination).
    pub fn clear(&mut self) {
        self.replay.clear();
        self.pending.clear();
        self.gap_start = None;
    }
}

impl Default for DirectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [1u8; 32];
        let sid = Sid::from_bytes([2; 32]);
        let msg = seal_message(&key, &sid, Direction::AtoB, 0, b"hello").unwrap();
        assert_eq!(open_message(&key, &msg).unwrap(), b"hello");
    }

    #[test]
    fn aad_binds_header_fields() {
        let key = [1u8; 32];
        let sid = Sid::from_bytes([2; 32]);
        let msg = seal_message(&key, &sid, Direction::AtoB, 5, b"hello").unwrap();

        // Any header tamper breaks authentication.
        let mut wrong_seq = msg.clone();
        wrong_seq.seq = 6;
        assert!(open_message(&key, &wrong_seq).is_err());

        let mut wrong_dir = msg.clone();
        wrong_dir.direction = Direction::BtoA;
        assert!(open_message(&key, &wrong_dir).is_err());

        let mut wrong_sid = msg;
        wrong_sid.sid = Sid::from_bytes([3; 32]).to_hex();
        assert!(open_message(&key, &wrong_sid).is_err());
    }

    #[test]
    fn replay_cache_is_bounded() {
        let mut dir = DirectionState::new();
        for i in 0..(REPLAY_CACHE_MAX + 10) {
            let mut nonce = [0u8; NONCE_LEN];
            nonce[..8].copy_from_slice(&(i as u64).to_be_bytes());
            dir.replay.put(nonce, ());
        }
        assert_eq!(dir.replay.len(), REPLAY_CACHE_MAX);
    }
}

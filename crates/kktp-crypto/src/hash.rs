use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use sha2::{Digest, Sha256};

use kktp_core::constants::GROUP_MAILBOX_DOMAIN;
use kktp_core::types::{MailboxId, PubSig, Sid};

type Blake2b256 = Blake2b<U32>;

/// SHA-256 of arbitrary bytes → 32-byte array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// BLAKE2b-256 of arbitrary bytes → 32-byte array.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut h = Blake2b256::new();
    h.update(data);
    h.finalize().into()
}

/// 32-bit FNV-1a over arbitrary bytes.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// On-ledger game tag: FNV-1a over the UTF-8 game id, big-endian, 8 hex chars.
pub fn game_id_tag_hex(game_id: &str) -> String {
    hex::encode(fnv1a_32(game_id.as_bytes()).to_be_bytes())
}

/// Deterministic session mailbox: BLAKE2b over sid and both identities.
///
/// Both sides compute the same tag because the initiator key always hashes
/// first (handshake roles, not key ordering).
pub fn session_mailbox_id(sid: &Sid, initiator: &PubSig, responder: &PubSig) -> MailboxId {
    let mut h = Blake2b256::new();
    h.update(b"KKTP:MAILBOX:");
    h.update(sid.as_bytes());
    h.update(initiator.as_bytes());
    h.update(responder.as_bytes());
    MailboxId::from_bytes(h.finalize().into())
}

/// Group mailbox: BLAKE2b over the domain string and the lobby id.
pub fn group_mailbox_id(lobby_id: &Sid) -> MailboxId {
    let mut h = Blake2b256::new();
    h.update(GROUP_MAILBOX_DOMAIN.as_bytes());
    h.update(lobby_id.as_bytes());
    MailboxId::from_bytes(h.finalize().into())
}

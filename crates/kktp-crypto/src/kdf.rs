use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use kktp_core::types::{PubSig, Sid};

/// Domain-separation salt for session-key derivation.
const SESSION_SALT: &[u8] = b"KKTP:SESSION:v1";

/// Derive the 32-byte AEAD session key from the handshake transcript.
///
/// Authenticated KDF over `(sid ∥ initiator_pub_sig ∥ responder_pub_sig ∥
/// DH_shared)`. Both sides call this with the same role ordering, so the
/// derivation is symmetric by construction.
pub fn derive_session_key(
    sid: &Sid,
    initiator: &PubSig,
    responder: &PubSig,
    dh_shared: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(sid.as_bytes());
    ikm.extend_from_slice(initiator.as_bytes());
    ikm.extend_from_slice(responder.as_bytes());
    ikm.extend_from_slice(dh_shared);

    let hk = Hkdf::<Sha256>::new(Some(SESSION_SALT), &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(b"session-key", okm.as_mut())
        .expect("32-byte HKDF expand never exceeds output limit");
    okm
}

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use kktp_core::constants::NONCE_LEN;
use kktp_core::error::KktpError;

/// Seal `plaintext` under `key` with a fresh random 24-byte nonce.
/// Returns `(nonce, ciphertext)`; `aad` is authenticated but not encrypted.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), KktpError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| KktpError::AeadFailure)?;
    Ok((nonce, ciphertext))
}

/// Open a sealed packet. Any tamper of nonce, ciphertext, or AAD fails.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, KktpError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| KktpError::AeadFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [9u8; 32];
        let (nonce, ct) = seal(&key, b"aad", b"hello").unwrap();
        assert_eq!(open(&key, &nonce, b"aad", &ct).unwrap(), b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [9u8; 32];
        let (nonce, mut ct) = seal(&key, b"aad", b"hello").unwrap();
        ct[0] ^= 0xff;
        assert!(open(&key, &nonce, b"aad", &ct).is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [9u8; 32];
        let (nonce, ct) = seal(&key, b"aad-1", b"hello").unwrap();
        assert!(open(&key, &nonce, b"aad-2", &ct).is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [9u8; 32];
        let (n1, _) = seal(&key, b"", b"x").unwrap();
        let (n2, _) = seal(&key, b"", b"x").unwrap();
        assert_ne!(n1, n2);
    }
}

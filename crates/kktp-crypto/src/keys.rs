use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use kktp_core::error::KktpError;
use kktp_core::types::PubSig;

/// Domain salt for branch-key derivation. Branch indices never repeat, so a
/// compromised branch secret exposes nothing about earlier or later branches.
const BRANCH_SALT: &[u8] = b"KKTP:KEYBRANCH:v1";

// ── SigKeypair ───────────────────────────────────────────────────────────────

/// An Ed25519 signing keypair for one key branch.
pub struct SigKeypair {
    signing: SigningKey,
    pub public: PubSig,
}

impl SigKeypair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let public = PubSig::from_bytes(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&secret);
        let public = PubSig::from_bytes(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl std::fmt::Debug for SigKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigKeypair {{ public: {:?} }}", self.public)
    }
}

/// Verify a detached Ed25519 signature.
pub fn verify_signature(public: &PubSig, message: &[u8], sig_bytes: &[u8]) -> Result<(), KktpError> {
    let vk = VerifyingKey::from_bytes(public.as_bytes()).map_err(|_| KktpError::InvalidSignature)?;
    let sig_arr: &[u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| KktpError::InvalidSignature)?;
    let sig = Signature::from_bytes(sig_arr);
    vk.verify(message, &sig).map_err(|_| KktpError::InvalidSignature)
}

// ── DhKeypair ────────────────────────────────────────────────────────────────

/// An X25519 keypair for the handshake DH.
pub struct DhKeypair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl DhKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Raw shared secret with the peer's public key; zeroised on scope exit.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let shared = self
            .secret
            .diffie_hellman(&X25519Public::from(*their_public));
        Zeroizing::new(shared.to_bytes())
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

impl std::fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeypair {{ public: {}… }}", &hex::encode(self.public)[..16])
    }
}

// ── MasterKey ────────────────────────────────────────────────────────────────

/// Long-lived master key. Per-contact key branches derive from it at integer
/// indices ≥ 100; an index is burned on first use and never reused.
pub struct MasterKey {
    ikm: [u8; 32],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut ikm);
        Self { ikm }
    }

    pub fn from_bytes(ikm: [u8; 32]) -> Self {
        Self { ikm }
    }

    fn expand(&self, label: &str, index: u32) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(BRANCH_SALT), &self.ikm);
        let info = format!("{label}:{index}");
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .expect("32-byte HKDF expand never exceeds output limit");
        okm
    }

    /// Derive the signing keypair for branch `index`.
    pub fn sig_branch(&self, index: u32) -> SigKeypair {
        let mut seed = self.expand("sig", index);
        let kp = SigKeypair::from_secret_bytes(seed);
        seed.zeroize();
        kp
    }

    /// Derive the DH keypair for branch `index`.
    pub fn dh_branch(&self, index: u32) -> DhKeypair {
        let mut seed = self.expand("dh", index);
        let kp = DhKeypair::from_secret_bytes(seed);
        seed.zeroize();
        kp
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.ikm)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.ikm.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey {{ … }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let kp = SigKeypair::generate();
        let sig = kp.sign(b"anchored move history");
        assert!(verify_signature(&kp.public, b"anchored move history", &sig).is_ok());
        assert!(verify_signature(&kp.public, b"tampered", &sig).is_err());
    }

    #[test]
    fn dh_agrees_both_ways() {
        let a = DhKeypair::generate();
        let b = DhKeypair::generate();
        assert_eq!(*a.diffie_hellman(&b.public), *b.diffie_hellman(&a.public));
    }

    #[test]
    fn branches_are_deterministic_and_distinct() {
        let master = MasterKey::from_bytes([42u8; 32]);
        let k101 = master.sig_branch(101);
        let k101_again = master.sig_branch(101);
        let k102 = master.sig_branch(102);
        assert_eq!(k101.public, k101_again.public);
        assert_ne!(k101.public, k102.public);
        // sig and dh branches at the same index are independent keys.
        assert_ne!(*master.sig_branch(101).secret_bytes(), *master.dh_branch(101).secret_bytes());
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kktp_core::error::KktpError;
use kktp_core::types::{BlockHash, PubSig, VrfOutput};

use crate::keys::{verify_signature, SigKeypair};

/// One link of the per-player VRF chain, carried in the audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VrfProof {
    pub output: VrfOutput,
    /// Ed25519 signature by the player's session signing key over the fold
    /// input bytes. Lets the auditor attribute each link to its producer.
    pub signature: Vec<u8>,
}

fn fold_input(prev: &VrfOutput, beacon: &BlockHash, descriptor_bytes: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(64 + descriptor_bytes.len());
    input.extend_from_slice(prev.as_bytes());
    input.extend_from_slice(beacon.as_bytes());
    input.extend_from_slice(descriptor_bytes);
    input
}

/// The deterministic successor function of the VRF chain:
/// `Vₙ = SHA-256(Vₙ₋₁ ∥ beaconₙ ∥ canonical(Mₙ))`.
pub fn fold(prev: &VrfOutput, beacon: &BlockHash, descriptor_bytes: &[u8]) -> VrfOutput {
    let mut h = Sha256::new();
    h.update(fold_input(prev, beacon, descriptor_bytes));
    VrfOutput::from_bytes(h.finalize().into())
}

/// Fold and sign: produces the output plus the attributable proof.
pub fn prove_fold(
    keypair: &SigKeypair,
    prev: &VrfOutput,
    beacon: &BlockHash,
    descriptor_bytes: &[u8],
) -> VrfProof {
    let output = fold(prev, beacon, descriptor_bytes);
    let signature = keypair.sign(&fold_input(prev, beacon, descriptor_bytes)).to_vec();
    VrfProof { output, signature }
}

/// Auditor-side check: recompute the fold and verify the producer signature.
pub fn verify_fold(
    producer: &PubSig,
    prev: &VrfOutput,
    beacon: &BlockHash,
    descriptor_bytes: &[u8],
    proof: &VrfProof,
) -> Result<(), KktpError> {
    let expected = fold(prev, beacon, descriptor_bytes);
    if expected != proof.output {
        return Err(KktpError::AuditFailed("VRF output mismatch".into()));
    }
    verify_signature(
        producer,
        &fold_input(prev, beacon, descriptor_bytes),
        &proof.signature,
    )
}

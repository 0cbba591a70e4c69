use std::sync::Arc;

use tracing::debug;

use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::jcs;
use kktp_core::types::{BlockHash, MoveDescriptor, TxId, VrfOutput};
use kktp_crypto::hash::sha256;
use kktp_crypto::keys::SigKeypair;
use kktp_crypto::vrf::{fold, prove_fold, VrfProof};

use crate::entropy::{BeaconInfo, EntropyProvider};

/// The chain's first output, folded from captured genesis entropy: latest
/// block hash at start, one quantum pulse, and the game tag.
pub fn genesis_seed(
    game_tag_hex: &str,
    beacon: &BlockHash,
    pulse_index: u64,
    pulse_data: &[u8; 32],
) -> VrfOutput {
    let mut input = Vec::with_capacity(96);
    input.extend_from_slice(b"KKTP:VRF:GENESIS:");
    input.extend_from_slice(beacon.as_bytes());
    input.extend_from_slice(&pulse_index.to_be_bytes());
    input.extend_from_slice(pulse_data);
    input.extend_from_slice(game_tag_hex.as_bytes());
    VrfOutput::from_bytes(sha256(&input))
}

/// Genesis reinforcement: folds the confirmed genesis txid into the chain.
pub fn reinforce_with_genesis(current: &VrfOutput, tx_id: &TxId) -> VrfOutput {
    let mut input = Vec::with_capacity(96);
    input.extend_from_slice(current.as_bytes());
    input.extend_from_slice(tx_id.as_bytes());
    input.extend_from_slice(b"KKTP:VRF:REINFORCE");
    VrfOutput::from_bytes(sha256(&input))
}

/// Everything a caller needs from one VRF fold.
#[derive(Clone, Debug)]
pub struct VrfMoveResult {
    pub output: VrfOutput,
    pub output_bytes: [u8; 32],
    pub block_hash: BlockHash,
    pub block_hash_hex: String,
    pub entropy_snapshot: BeaconInfo,
    pub proof: VrfProof,
}

/// Per-move VRF chain state for one player.
///
/// Folds are strictly sequenced by the owning processor; each fold consumes
/// the current beacon block hash and refuses to run without one.
pub struct VrfManager {
    keypair: Arc<SigKeypair>,
    entropy: Arc<EntropyProvider>,
    sink: EventSink,
    current: Option<VrfOutput>,
    genesis_tx: Option<TxId>,
    last_beacon: Option<BlockHash>,
    sync_wait_pending: bool,
}

impl VrfManager {
    pub fn new(keypair: Arc<SigKeypair>, entropy: Arc<EntropyProvider>, sink: EventSink) -> Self {
        Self {
            keypair,
            entropy,
            sink,
            current: None,
            genesis_tx: None,
            last_beacon: None,
            sync_wait_pending: false,
        }
    }

    /// Seed the chain's first output from captured genesis entropy.
    pub fn seed_genesis(
        &mut self,
        game_tag_hex: &str,
        beacon: &BlockHash,
        pulse_index: u64,
        pulse_data: &[u8; 32],
    ) -> VrfOutput {
        let output = genesis_seed(game_tag_hex, beacon, pulse_index, pulse_data);
        self.current = Some(output.clone());
        self.last_beacon = Some(beacon.clone());
        output
    }

    /// Reinforce the chain with the confirmed genesis txid. Subsequent folds
    /// descend from an output no party could predict before the anchor landed.
    pub fn set_genesis_tx_id(&mut self, tx_id: TxId) {
        if let Some(current) = &self.current {
            self.current = Some(reinforce_with_genesis(current, &tx_id));
        }
        self.genesis_tx = Some(tx_id);
    }

    pub fn genesis_tx_id(&self) -> Option<&TxId> {
        self.genesis_tx.as_ref()
    }

    pub fn current_output(&self) -> Option<&VrfOutput> {
        self.current.as_ref()
    }

    fn require_beacon(&mut self) -> Result<BeaconInfo, KktpError> {
        match self.entropy.cached_block_hash() {
            Some(beacon) => {
                if self.sync_wait_pending {
                    self.sync_wait_pending = false;
                    self.sink.emit(GameEvent::VrfSyncResolved { block_hash: beacon.hash.clone() });
                }
                Ok(beacon)
            }
            None => {
                // Raised once; cleared when the beacon comes back.
                if !self.sync_wait_pending {
                    self.sync_wait_pending = true;
                    self.sink.emit(GameEvent::VrfSyncWait);
                }
                Err(KktpError::VrfSyncRequired)
            }
        }
    }

    /// The current beacon, or the sync-wait refusal (emitted once).
    pub fn beacon(&mut self) -> Result<BeaconInfo, KktpError> {
        self.require_beacon()
    }

    /// Advance the chain for one local move.
    pub fn update_state_for_move(
        &mut self,
        descriptor: &MoveDescriptor,
    ) -> Result<VrfMoveResult, KktpError> {
        let beacon = self.require_beacon()?;
        let prev = self
            .current
            .clone()
            .ok_or_else(|| KktpError::Other("VRF chain not seeded".into()))?;

        if let Some(last) = &self.last_beacon {
            if last != &beacon.hash {
                debug!(prev = %last, current = %beacon.hash, "beacon advanced between moves");
                self.sink.emit(GameEvent::DeltaEntropyDetected {
                    prev: last.clone(),
                    current: beacon.hash.clone(),
                });
            }
        }

        let descriptor_bytes = jcs::to_canonical_bytes(descriptor)?;
        let proof = prove_fold(&self.keypair, &prev, &beacon.hash, &descriptor_bytes);
        self.current = Some(proof.output.clone());
        self.last_beacon = Some(beacon.hash.clone());

        Ok(VrfMoveResult {
            output: proof.output.clone(),
            output_bytes: *proof.output.as_bytes(),
            block_hash: beacon.hash.clone(),
            block_hash_hex: beacon.hash.to_hex(),
            entropy_snapshot: beacon,
            proof,
        })
    }

    /// Side-channel randomness (`getRandom`): derived from the current chain
    /// head and beacon without advancing the chain, so the move audit stays
    /// reproducible from moves alone.
    pub fn fold_aux(&mut self, label: &[u8]) -> Result<VrfMoveResult, KktpError> {
        let beacon = self.require_beacon()?;
        let prev = self
            .current
            .clone()
            .ok_or_else(|| KktpError::Other("VRF chain not seeded".into()))?;
        let mut descriptor = b"KKTP:VRF:AUX:".to_vec();
        descriptor.extend_from_slice(label);
        let output = fold(&prev, &beacon.hash, &descriptor);
        let signature = self.keypair.sign(output.as_bytes()).to_vec();
        Ok(VrfMoveResult {
            output_bytes: *output.as_bytes(),
            block_hash: beacon.hash.clone(),
            block_hash_hex: beacon.hash.to_hex(),
            entropy_snapshot: beacon,
            proof: VrfProof { output: output.clone(), signature },
            output,
        })
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.genesis_tx = None;
        self.last_beacon = None;
        self.sync_wait_pending = false;
    }
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kktp_core::constants::TIME_DELTA_SCALE_MS;
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::jcs;
use kktp_core::types::{
    MoveDescriptor, MoveId, MovePayload, PubSig, Timestamp, TxId, VrfOutput,
};

use crate::codec::{encode_coord14, ActionRegistry};
use crate::merkle::{MerkleAccumulator, ProofStep};
use crate::strategy::{AnchorStrategy, FinalState, GenesisSeedParams};
use crate::vault::{GameEventRecord, MoveRecord, MoveVault, VaultSnapshot};
use crate::vrf::VrfManager;

// ── Leaf encoding ────────────────────────────────────────────────────────────

/// Canonical Merkle leaf form, identical for own and opponent accumulators.
#[derive(Serialize)]
struct LeafEncoding<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    coords: Option<[u16; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lane: Option<u8>,
    time_delta: u8,
    vrf_fragment: String,
}

/// The leaf bytes for one move: `{action, [x,y,z | lane], timeDelta,
/// vrfFragment}` canonically serialised.
pub fn leaf_bytes(descriptor: &MoveDescriptor, vrf_fragment: &[u8; 4]) -> Result<Vec<u8>, KktpError> {
    let (coords, lane) = match &descriptor.payload {
        MovePayload::Move { x, y, z } => {
            (Some([encode_coord14(*x), encode_coord14(*y), encode_coord14(*z)]), None)
        }
        MovePayload::Lane { lane } => (None, Some(*lane)),
    };
    jcs::to_canonical_bytes(&LeafEncoding {
        action: &descriptor.action,
        coords,
        lane,
        time_delta: descriptor.time_delta,
        vrf_fragment: hex::encode(vrf_fragment),
    })
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ProcessedMove {
    pub move_id: MoveId,
    pub sequence: u64,
    /// Full VRF output, hex.
    pub random_value: String,
    /// First 8 bytes of the VRF output as an integer.
    pub random_number: u64,
    pub merkle_root: [u8; 32],
}

/// Outcome of validating an inbound opponent move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid { move_id: MoveId },
    Rejected { reason: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid { .. })
    }
}

/// A move received from the opponent over the session layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpponentMove {
    pub move_id: MoveId,
    pub sender: PubSig,
    pub descriptor: MoveDescriptor,
    pub vrf_fragment: [u8; 4],
}

/// Everything an auditor needs from this side of the table.
#[derive(Clone, Debug)]
pub struct AuditData {
    pub game_tag_hex: String,
    pub anchor_chain: Vec<TxId>,
    pub genesis_tx_id: Option<TxId>,
    pub merkle_root: Option<[u8; 32]>,
    pub snapshot: VaultSnapshot,
}

// ── Move processor ───────────────────────────────────────────────────────────

struct OpponentChainTrack {
    member: Option<PubSig>,
    last: TxId,
    chain: Vec<TxId>,
}

/// Orchestrates one game's local moves through VRF → Merkle → vault, and
/// validates the opponent's inbound stream against an independent
/// accumulator. Owns all per-game state; the strategy and vault hang off it.
pub struct MoveProcessor {
    registry: ActionRegistry,
    vrf: Arc<Mutex<VrfManager>>,
    vault: Arc<Mutex<MoveVault>>,
    strategy: Arc<AnchorStrategy>,
    sink: EventSink,
    game_tag_hex: String,

    own_merkle: Mutex<MerkleAccumulator>,
    opponent_merkle: Mutex<MerkleAccumulator>,
    opponent_seen: Mutex<HashSet<MoveId>>,
    opponent_identity: Mutex<Option<PubSig>>,
    opponent_chains: Mutex<Vec<OpponentChainTrack>>,

    sequence: Mutex<u64>,
    last_move_ts: Mutex<Option<Timestamp>>,
}

impl MoveProcessor {
    pub fn new(
        registry: ActionRegistry,
        vrf: Arc<Mutex<VrfManager>>,
        vault: Arc<Mutex<MoveVault>>,
        strategy: Arc<AnchorStrategy>,
        game_tag_hex: String,
        sink: EventSink,
    ) -> Self {
        Self {
            registry,
            vrf,
            vault,
            strategy,
            sink,
            game_tag_hex,
            own_merkle: Mutex::new(MerkleAccumulator::new()),
            opponent_merkle: Mutex::new(MerkleAccumulator::new()),
            opponent_seen: Mutex::new(HashSet::new()),
            opponent_identity: Mutex::new(None),
            opponent_chains: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
            last_move_ts: Mutex::new(None),
        }
    }

    pub fn vault(&self) -> Arc<Mutex<MoveVault>> {
        Arc::clone(&self.vault)
    }

    pub fn vrf(&self) -> Arc<Mutex<VrfManager>> {
        Arc::clone(&self.vrf)
    }

    pub fn strategy(&self) -> Arc<AnchorStrategy> {
        Arc::clone(&self.strategy)
    }

    /// Pin the expected opponent identity once the session is established.
    pub fn set_opponent(&self, peer: PubSig) {
        *self.opponent_identity.lock().unwrap() = Some(peer);
    }

    /// Reset per-game state for a fresh start.
    pub fn start(&self) {
        self.own_merkle.lock().unwrap().reset();
        self.opponent_merkle.lock().unwrap().reset();
        self.opponent_seen.lock().unwrap().clear();
        self.opponent_chains.lock().unwrap().clear();
        self.vault.lock().unwrap().reset_for_new_game();
        *self.sequence.lock().unwrap() = 0;
        *self.last_move_ts.lock().unwrap() = None;
    }

    /// Stop and hand back the audit snapshot.
    pub fn stop(&self) -> VaultSnapshot {
        let snapshot = self.vault.lock().unwrap().clear_for_stop();
        self.own_merkle.lock().unwrap().reset();
        self.opponent_merkle.lock().unwrap().reset();
        self.opponent_seen.lock().unwrap().clear();
        snapshot
    }

    // ── Local moves ──────────────────────────────────────────────────────────

    fn clamped_delta(&self, now: Timestamp) -> u8 {
        match *self.last_move_ts.lock().unwrap() {
            Some(prev) => {
                let scaled = (now - prev).max(0) / TIME_DELTA_SCALE_MS;
                scaled.min(255) as u8
            }
            None => 0,
        }
    }

    /// Run one local action through the pipeline at wall-clock `now`.
    /// The sequence number is consumed only when the VRF fold succeeds, so a
    /// sync wait never burns or reorders sequence space.
    pub fn process_local_move(
        &self,
        action: &str,
        payload: MovePayload,
        now: Timestamp,
    ) -> Result<ProcessedMove, KktpError> {
        let code = self.registry.code_for(action, &payload)?;
        let next_seq = *self.sequence.lock().unwrap() + 1;
        let descriptor = MoveDescriptor {
            action: action.to_string(),
            payload,
            time_delta: self.clamped_delta(now),
            sequence: next_seq,
            timestamp: now,
        };

        let vrf_result = self.vrf.lock().unwrap().update_state_for_move(&descriptor)?;
        let mut vrf_fragment = [0u8; 4];
        vrf_fragment.copy_from_slice(&vrf_result.output_bytes[..4]);

        let leaf = leaf_bytes(&descriptor, &vrf_fragment)?;
        let (append, merkle_root) = {
            let mut merkle = self.own_merkle.lock().unwrap();
            let append = merkle.add_move(&leaf);
            (append, merkle.get_root().expect("non-empty accumulator has a root"))
        };

        {
            let mut vault = self.vault.lock().unwrap();
            if !vault.add_processed_move(append.move_id.clone()) {
                return Err(KktpError::DuplicateMove(append.move_id.to_hex()));
            }
            vault.add_move(MoveRecord {
                move_id: append.move_id.clone(),
                descriptor: descriptor.clone(),
                action_code: code,
                merkle_index: append.index,
                vrf_fragment,
                beacon: vrf_result.block_hash.clone(),
            });
            vault.add_vrf_proof(vrf_result.proof.clone());
        }

        *self.sequence.lock().unwrap() = next_seq;
        *self.last_move_ts.lock().unwrap() = Some(now);

        debug!(sequence = next_seq, action, "move processed");
        self.sink.emit(GameEvent::MoveProcessed {
            move_id: append.move_id.clone(),
            sequence: next_seq,
        });

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&vrf_result.output_bytes[..8]);
        Ok(ProcessedMove {
            move_id: append.move_id,
            sequence: next_seq,
            random_value: vrf_result.output.to_hex(),
            random_number: u64::from_be_bytes(prefix),
            merkle_root,
        })
    }

    /// Record an ordered, non-anchored game event.
    pub fn process_game_event(&self, event_type: &str, data: serde_json::Value, now: Timestamp) {
        self.vault.lock().unwrap().add_game_event(GameEventRecord {
            event_type: event_type.to_string(),
            data,
            timestamp: now,
        });
    }

    // ── Opponent moves ───────────────────────────────────────────────────────

    /// Validate an inbound opponent move and advance their accumulator.
    /// Policy failures reject quietly; nothing here faults a session.
    pub fn receive_opponent_move(&self, incoming: &OpponentMove) -> ValidationOutcome {
        if let MovePayload::Move { x, y, z } = incoming.descriptor.payload {
            if x > 0x3FFF || y > 0x3FFF || z > 0x3FFF {
                self.sink.emit(GameEvent::ValidationFailed {
                    reason: "coordinates exceed 14 bits".into(),
                });
                return ValidationOutcome::Rejected { reason: "invalid shape".into() };
            }
        }
        if self.registry.code_for(&incoming.descriptor.action, &incoming.descriptor.payload).is_err() {
            return ValidationOutcome::Rejected { reason: "unknown action".into() };
        }
        if incoming.descriptor.sequence == 0 {
            return ValidationOutcome::Rejected { reason: "invalid sequence".into() };
        }
        if self.opponent_seen.lock().unwrap().contains(&incoming.move_id) {
            debug!(move_id = %incoming.move_id, "duplicate opponent move dropped");
            return ValidationOutcome::Rejected { reason: "duplicate moveId".into() };
        }
        if let Some(expected) = self.opponent_identity.lock().unwrap().as_ref() {
            if expected != &incoming.sender {
                debug!(sender = %incoming.sender, "wrong opponent identity");
                return ValidationOutcome::Rejected { reason: "wrong opponent".into() };
            }
        }

        let leaf = match leaf_bytes(&incoming.descriptor, &incoming.vrf_fragment) {
            Ok(leaf) => leaf,
            Err(e) => return ValidationOutcome::Rejected { reason: e.to_string() },
        };
        self.opponent_merkle.lock().unwrap().add_move(&leaf);
        self.opponent_seen.lock().unwrap().insert(incoming.move_id.clone());
        ValidationOutcome::Valid { move_id: incoming.move_id.clone() }
    }

    /// Current root of the opponent's independent accumulator.
    pub fn opponent_merkle_root(&self) -> Option<[u8; 32]> {
        self.opponent_merkle.lock().unwrap().get_root()
    }

    /// Track an observed foreign heartbeat for attribution. Chains are keyed
    /// by last-txid; a heartbeat extending no known chain opens a new one for
    /// the first member without a chain (best-effort fallback).
    pub fn observe_opponent_heartbeat(&self, prev: &TxId, tx_id: &TxId, move_count: u32) {
        let mut chains = self.opponent_chains.lock().unwrap();
        let sender = match chains.iter_mut().find(|c| &c.last == prev) {
            Some(track) => {
                track.chain.push(tx_id.clone());
                track.last = tx_id.clone();
                track.member.clone()
            }
            None => {
                let member = self.opponent_identity.lock().unwrap().clone();
                chains.push(OpponentChainTrack {
                    member: member.clone(),
                    last: tx_id.clone(),
                    chain: vec![prev.clone(), tx_id.clone()],
                });
                member
            }
        };
        self.sink.emit(GameEvent::OpponentHeartbeat { tx_id: tx_id.clone(), sender });
        self.sink.emit(GameEvent::OpponentMoveAnchored { tx_id: tx_id.clone(), move_count });
    }

    // ── Anchoring ────────────────────────────────────────────────────────────

    /// Seed the VRF chain from captured genesis entropy and publish the
    /// genesis anchor; reinforce the chain with the confirmed txid.
    pub async fn anchor_genesis_seed(
        &self,
        start_daa_score: u64,
        end_daa_score: u64,
        qrng_pulse_index: u64,
        qrng_pulse_data: &[u8; 32],
    ) -> Result<(TxId, kktp_core::types::BlockHash), KktpError> {
        let (beacon, initial_vrf) = {
            let mut vrf = self.vrf.lock().unwrap();
            let beacon = vrf.beacon()?;
            let initial =
                vrf.seed_genesis(&self.game_tag_hex, &beacon.hash, qrng_pulse_index, qrng_pulse_data);
            (beacon, initial)
        };

        let tx_id = self
            .strategy
            .anchor_genesis_seed(GenesisSeedParams {
                start_daa_score,
                end_daa_score,
                qrng_pulse_index,
                beacon_hash: beacon.hash.clone(),
                initial_vrf,
            })
            .await?;

        self.vrf.lock().unwrap().set_genesis_tx_id(tx_id.clone());
        info!(tx_id = %tx_id, "VRF chain reinforced with genesis txid");
        Ok((tx_id, beacon.hash))
    }

    /// Publish the final anchor over the current Merkle root.
    pub async fn anchor_final_state(&self, end_state: FinalState) -> Result<TxId, KktpError> {
        let (root, total) = {
            let mut merkle = self.own_merkle.lock().unwrap();
            (merkle.get_root().unwrap_or([0u8; 32]), merkle.size() as u32)
        };
        self.strategy.anchor_final_state(root, end_state, total).await
    }

    // ── Audit surface ────────────────────────────────────────────────────────

    pub fn get_merkle_proof(&self, index: u64) -> Result<Vec<ProofStep>, KktpError> {
        self.own_merkle.lock().unwrap().get_proof(index)
    }

    pub fn merkle_root(&self) -> Option<[u8; 32]> {
        self.own_merkle.lock().unwrap().get_root()
    }

    pub fn sequence(&self) -> u64 {
        *self.sequence.lock().unwrap()
    }

    /// Side-channel verifiable randomness; does not advance the move chain.
    pub fn get_random(&self, seed: Option<&[u8]>) -> Result<(VrfOutput, u64, Vec<u8>), KktpError> {
        let result = self.vrf.lock().unwrap().fold_aux(seed.unwrap_or(b""))?;
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&result.output_bytes[..8]);
        Ok((result.output, u64::from_be_bytes(prefix), result.proof.signature))
    }

    /// Snapshot of the local audit state (pre-stop).
    pub fn get_audit_data(&self) -> AuditData {
        let vault = self.vault.lock().unwrap();
        AuditData {
            game_tag_hex: self.game_tag_hex.clone(),
            anchor_chain: self.strategy.anchor_chain(),
            genesis_tx_id: self.strategy.genesis_tx_id(),
            merkle_root: self.own_merkle.lock().unwrap().get_root(),
            snapshot: VaultSnapshot {
                moves: vault.get_move_history().to_vec(),
                events: vault.events().to_vec(),
                proofs: vault.proofs().to_vec(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_adapter::{LedgerAdapter, MockLedger};
    use kktp_core::types::BlockHash;
    use kktp_crypto::hash::game_id_tag_hex;
    use kktp_crypto::keys::SigKeypair;
    use kktp_utxo::pool::UtxoPool;

    use crate::entropy::EntropyProvider;
    use crate::merkle;

    async fn harness() -> (Arc<MockLedger>, Arc<EntropyProvider>, MoveProcessor) {
        let ledger = Arc::new(MockLedger::new());
        ledger.fund(6, 500_000_000);
        let pool = Arc::new(Mutex::new(UtxoPool::new(EventSink::disconnected())));
        pool.lock().unwrap().add_batch(ledger.utxos().await.unwrap());

        let keypair = Arc::new(SigKeypair::from_secret_bytes([1u8; 32]));
        let entropy = EntropyProvider::new();
        let tag = game_id_tag_hex("game-42");
        let vrf = Arc::new(Mutex::new(VrfManager::new(
            Arc::clone(&keypair),
            Arc::clone(&entropy),
            EventSink::disconnected(),
        )));
        let strategy = Arc::new(AnchorStrategy::new(
            ledger.clone(),
            pool,
            keypair,
            tag.clone(),
            "p1".into(),
            EventSink::disconnected(),
        ));
        let processor = MoveProcessor::new(
            ActionRegistry::default_set(),
            vrf,
            Arc::new(Mutex::new(MoveVault::new())),
            strategy,
            tag,
            EventSink::disconnected(),
        );
        (ledger, entropy, processor)
    }

    fn advance_beacon(ledger: &MockLedger, entropy: &EntropyProvider) {
        let block = ledger.produce_empty_block();
        entropy.observe(&block);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_recording_and_proof_scenario() {
        let (ledger, entropy, processor) = harness().await;
        advance_beacon(&ledger, &entropy);
        processor
            .anchor_genesis_seed(1_000, 1_600, 777, &[9u8; 32])
            .await
            .unwrap();

        let m1 = processor
            .process_local_move("jump", MovePayload::Lane { lane: 2 }, 10_000)
            .unwrap();
        let m2 = processor
            .process_local_move("jump", MovePayload::Lane { lane: 0 }, 10_250)
            .unwrap();
        assert_eq!((m1.sequence, m2.sequence), (1, 2));

        // timeDelta for the second move: ⌊250 / 100⌋ clamped to 8 bits.
        let vault = processor.vault();
        let history = vault.lock().unwrap().get_move_history().to_vec();
        assert_eq!(history[0].descriptor.time_delta, 0);
        assert_eq!(history[1].descriptor.time_delta, 2);

        // Proof for index 0 verifies against the two-leaf root.
        let root = processor.merkle_root().unwrap();
        assert_eq!(root, m2.merkle_root);
        let proof = processor.get_merkle_proof(0).unwrap();
        assert_eq!(proof.len(), 1);
        let leaf0 = leaf_bytes(&history[0].descriptor, &history[0].vrf_fragment).unwrap();
        assert!(merkle::verify_proof(&leaf0, &proof, &root));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vrf_sync_wait_blocks_until_block_arrives() {
        let (ledger, entropy, processor) = harness().await;
        // No beacon yet: genesis cannot seed.
        let err = processor
            .anchor_genesis_seed(1, 2, 3, &[0u8; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, KktpError::VrfSyncRequired));

        advance_beacon(&ledger, &entropy);
        processor.anchor_genesis_seed(1, 2, 3, &[0u8; 32]).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_vrf_does_not_consume_sequence() {
        let (ledger, entropy, processor) = harness().await;
        advance_beacon(&ledger, &entropy);
        processor.anchor_genesis_seed(1, 2, 3, &[0u8; 32]).await.unwrap();
        processor
            .process_local_move("jump", MovePayload::Lane { lane: 1 }, 1_000)
            .unwrap();

        // Simulate losing the beacon: fresh entropy provider with no block.
        // (The VRF manager refuses; sequence must stay at 1.)
        {
            let vrf = processor.vrf();
            let mut vrf = vrf.lock().unwrap();
            let fresh = EntropyProvider::new();
            let stale = std::mem::replace(
                &mut *vrf,
                VrfManager::new(
                    Arc::new(SigKeypair::from_secret_bytes([1u8; 32])),
                    fresh,
                    EventSink::disconnected(),
                ),
            );
            drop(stale);
        }
        assert!(processor
            .process_local_move("jump", MovePayload::Lane { lane: 1 }, 2_000)
            .is_err());
        assert_eq!(processor.sequence(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opponent_move_validation() {
        let (ledger, entropy, processor) = harness().await;
        advance_beacon(&ledger, &entropy);
        let opponent = PubSig::from_bytes([7u8; 32]);
        processor.set_opponent(opponent.clone());

        let incoming = OpponentMove {
            move_id: MoveId::from_bytes([1u8; 32]),
            sender: opponent.clone(),
            descriptor: MoveDescriptor {
                action: "jump".into(),
                payload: MovePayload::Lane { lane: 1 },
                time_delta: 2,
                sequence: 1,
                timestamp: 5_000,
            },
            vrf_fragment: [1, 2, 3, 4],
        };
        assert!(processor.receive_opponent_move(&incoming).is_valid());
        assert!(processor.opponent_merkle_root().is_some());

        // Duplicate id is rejected.
        let dup = processor.receive_opponent_move(&incoming);
        assert_eq!(dup, ValidationOutcome::Rejected { reason: "duplicate moveId".into() });

        // Wrong sender is rejected.
        let mut stranger = incoming.clone();
        stranger.move_id = MoveId::from_bytes([2u8; 32]);
        stranger.sender = PubSig::from_bytes([9u8; 32]);
        assert_eq!(
            processor.receive_opponent_move(&stranger),
            ValidationOutcome::Rejected { reason: "wrong opponent".into() }
        );

        // Out-of-range coordinates are an invalid shape.
        let mut bad_shape = incoming.clone();
        bad_shape.move_id = MoveId::from_bytes([3u8; 32]);
        bad_shape.descriptor.action = "move".into();
        bad_shape.descriptor.payload = MovePayload::Move { x: 0x4000, y: 0, z: 0 };
        assert_eq!(
            processor.receive_opponent_move(&bad_shape),
            ValidationOutcome::Rejected { reason: "invalid shape".into() }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn random_does_not_disturb_move_chain() {
        let (ledger, entropy, processor) = harness().await;
        advance_beacon(&ledger, &entropy);
        processor.anchor_genesis_seed(1, 2, 3, &[0u8; 32]).await.unwrap();

        let (v1, n1, _proof) = processor.get_random(Some(b"shuffle")).unwrap();
        let (v2, _, _) = processor.get_random(Some(b"shuffle")).unwrap();
        assert_eq!(v1, v2, "same seed, same beacon, same head → same value");
        assert_ne!(n1, 0);

        let before = processor.sequence();
        processor.get_random(None).unwrap();
        assert_eq!(processor.sequence(), before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opponent_chain_attribution_tracks_prev_links() {
        let (ledger, entropy, processor) = harness().await;
        advance_beacon(&ledger, &entropy);
        let opponent = PubSig::from_bytes([7u8; 32]);
        processor.set_opponent(opponent.clone());

        let g = TxId::from_bytes([1; 32]);
        let h1 = TxId::from_bytes([2; 32]);
        let h2 = TxId::from_bytes([3; 32]);
        processor.observe_opponent_heartbeat(&g, &h1, 2);
        // Extends the tracked chain rather than opening a new one.
        processor.observe_opponent_heartbeat(&h1, &h2, 1);
        let chains = processor.opponent_chains.lock().unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].chain, vec![g, h1, h2]);
        assert_eq!(chains[0].member.as_ref(), Some(&opponent));
    }
}

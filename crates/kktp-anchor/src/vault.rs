use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use kktp_core::types::{BlockHash, MoveDescriptor, MoveId, Timestamp};
use kktp_crypto::vrf::VrfProof;

/// One processed local or opponent move, in insertion order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoveRecord {
    pub move_id: MoveId,
    pub descriptor: MoveDescriptor,
    pub action_code: u8,
    pub merkle_index: u64,
    pub vrf_fragment: [u8; 4],
    /// Beacon the VRF folded against for this move.
    pub beacon: BlockHash,
}

/// A non-anchored game event, ordered with the moves around it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameEventRecord {
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

/// Snapshot captured before `clear_for_stop`, kept for post-session audit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub moves: Vec<MoveRecord>,
    pub events: Vec<GameEventRecord>,
    pub proofs: Vec<VrfProof>,
}

/// Per-session append log of processed moves, game events, and VRF proofs.
///
/// The vault is the source of truth for heartbeat coalescing: the anchor
/// strategy consumes moves past its watermark, and a failed round simply
/// leaves the watermark in place.
#[derive(Default)]
pub struct MoveVault {
    moves: Vec<MoveRecord>,
    events: Vec<GameEventRecord>,
    proofs: Vec<VrfProof>,
    processed_ids: HashSet<MoveId>,
    anchored_watermark: usize,
}

impl MoveVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a move id as processed. Returns false if already present.
    pub fn add_processed_move(&mut self, id: MoveId) -> bool {
        self.processed_ids.insert(id)
    }

    pub fn has_processed_move(&self, id: &MoveId) -> bool {
        self.processed_ids.contains(id)
    }

    pub fn add_move(&mut self, record: MoveRecord) {
        self.moves.push(record);
    }

    pub fn add_game_event(&mut self, event: GameEventRecord) {
        self.events.push(event);
    }

    pub fn add_vrf_proof(&mut self, proof: VrfProof) {
        self.proofs.push(proof);
    }

    pub fn get_move_history(&self) -> &[MoveRecord] {
        &self.moves
    }

    pub fn proofs(&self) -> &[VrfProof] {
        &self.proofs
    }

    pub fn events(&self) -> &[GameEventRecord] {
        &self.events
    }

    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    // ── Anchoring watermark ──────────────────────────────────────────────────

    /// Moves not yet carried by a confirmed anchor, oldest first.
    pub fn unanchored_moves(&self) -> &[MoveRecord] {
        &self.moves[self.anchored_watermark..]
    }

    /// Advance the watermark after a successful anchor of `count` moves.
    pub fn mark_anchored(&mut self, count: usize) {
        self.anchored_watermark = (self.anchored_watermark + count).min(self.moves.len());
    }

    pub fn anchored_count(&self) -> usize {
        self.anchored_watermark
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Wipe all logs for a fresh game in the same session.
    pub fn reset_for_new_game(&mut self) {
        self.moves.clear();
        self.events.clear();
        self.proofs.clear();
        self.processed_ids.clear();
        self.anchored_watermark = 0;
    }

    /// Capture the audit snapshot, then clear for session stop.
    pub fn clear_for_stop(&mut self) -> VaultSnapshot {
        let snapshot = VaultSnapshot {
            moves: std::mem::take(&mut self.moves),
            events: std::mem::take(&mut self.events),
            proofs: std::mem::take(&mut self.proofs),
        };
        self.processed_ids.clear();
        self.anchored_watermark = 0;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_core::types::{MovePayload, VrfOutput};

    fn record(seed: u8, index: u64) -> MoveRecord {
        MoveRecord {
            move_id: MoveId::from_bytes([seed; 32]),
            descriptor: MoveDescriptor {
                action: "jump".into(),
                payload: MovePayload::Lane { lane: seed },
                time_delta: 0,
                sequence: index + 1,
                timestamp: 0,
            },
            action_code: 0x81,
            merkle_index: index,
            vrf_fragment: [seed; 4],
            beacon: BlockHash::from_bytes([0u8; 32]),
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut vault = MoveVault::new();
        let id = MoveId::from_bytes([1; 32]);
        assert!(vault.add_processed_move(id.clone()));
        assert!(!vault.add_processed_move(id.clone()));
        assert!(vault.has_processed_move(&id));
    }

    #[test]
    fn watermark_coalesces_failed_rounds() {
        let mut vault = MoveVault::new();
        vault.add_move(record(1, 0));
        vault.add_move(record(2, 1));
        assert_eq!(vault.unanchored_moves().len(), 2);

        // A failed anchor round leaves the watermark untouched; a later
        // round picks up the earlier moves plus new ones.
        vault.add_move(record(3, 2));
        assert_eq!(vault.unanchored_moves().len(), 3);

        vault.mark_anchored(3);
        assert_eq!(vault.unanchored_moves().len(), 0);
        assert_eq!(vault.anchored_count(), 3);
    }

    #[test]
    fn stop_snapshot_preserves_order() {
        let mut vault = MoveVault::new();
        vault.add_move(record(1, 0));
        vault.add_move(record(2, 1));
        vault.add_vrf_proof(VrfProof {
            output: VrfOutput::from_bytes([1; 32]),
            signature: vec![0; 64],
        });
        let snapshot = vault.clear_for_stop();
        assert_eq!(snapshot.moves.len(), 2);
        assert_eq!(snapshot.moves[0].merkle_index, 0);
        assert_eq!(snapshot.proofs.len(), 1);
        assert_eq!(vault.move_count(), 0);
        assert_eq!(vault.unanchored_moves().len(), 0);
    }
}

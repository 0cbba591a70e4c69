//! Independent reconstruction and verification of one player's anchor chain.
//!
//! The auditor needs only the ledger adapter, the game tag, and the txid of
//! the player's genesis anchor. On-ledger data alone proves chain linkage,
//! payload signatures, and the Merkle commitment; with the player's local
//! audit snapshot the full VRF chain is re-derived as well.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use kktp_adapter::traits::LedgerAdapter;
use kktp_core::error::KktpError;
use kktp_core::jcs;
use kktp_core::types::{BlockHash, PubSig, TxId};
use kktp_crypto::vrf::fold;

use crate::codec::{
    classify, verify_payload_signature, AnchorKind, FinalAnchor, GenesisAnchor, HeartbeatAnchor,
    PackedEntry,
};
use crate::merkle::root_of_leaves;
use crate::processor::leaf_bytes;
use crate::vault::VaultSnapshot;
use crate::vrf::reinforce_with_genesis;
use crate::ActionRegistry;

/// One player's chain as re-read from the ledger.
#[derive(Debug)]
pub struct ReconstructedChain {
    pub genesis_tx_id: TxId,
    pub genesis: GenesisAnchor,
    pub heartbeats: Vec<(TxId, HeartbeatAnchor)>,
    pub final_anchor: Option<(TxId, FinalAnchor)>,
    /// Raw payload bytes per txid, for signature verification.
    pub payloads: HashMap<TxId, Vec<u8>>,
    /// The full ordered chain `[genesis, h₁, …, final?]`.
    pub tx_ids: Vec<TxId>,
}

impl ReconstructedChain {
    /// All packed entries across heartbeats, in anchor order.
    pub fn entries(&self) -> Vec<&PackedEntry> {
        self.heartbeats.iter().flat_map(|(_, hb)| hb.entries.iter()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditVerdict {
    pub passed: bool,
    pub verdict: String,
}

impl AuditVerdict {
    fn pass() -> Self {
        Self { passed: true, verdict: "pass".into() }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self { passed: false, verdict: reason.into() }
    }
}

pub struct DagAuditor {
    adapter: Arc<dyn LedgerAdapter>,
}

impl DagAuditor {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    /// Walk the DAG range between two block hashes, filter by the three
    /// anchor prefixes and the game tag, and rebuild the linear chain rooted
    /// at `genesis_tx_id` via `prev_tx_id` references.
    pub async fn reconstruct(
        &self,
        genesis_block: &BlockHash,
        final_block: &BlockHash,
        game_tag_hex: &str,
        genesis_tx_id: &TxId,
    ) -> Result<ReconstructedChain, KktpError> {
        let tag_raw = hex::decode(game_tag_hex).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
        let tag: [u8; 4] = tag_raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
            what: "game tag",
            expected: 4,
            got: tag_raw.len(),
        })?;

        let blocks = self.adapter.blocks_in_range(genesis_block, final_block).await?;

        let mut genesis: Option<GenesisAnchor> = None;
        let mut heartbeats_by_prev: HashMap<TxId, (TxId, HeartbeatAnchor)> = HashMap::new();
        let mut finals_by_prev: HashMap<TxId, (TxId, FinalAnchor)> = HashMap::new();
        let mut payloads: HashMap<TxId, Vec<u8>> = HashMap::new();

        for block in &blocks {
            for tx in &block.transactions {
                let Some(kind) = classify(&tx.payload) else { continue };
                match kind {
                    AnchorKind::Genesis => {
                        let Ok(decoded) = GenesisAnchor::decode(&tx.payload) else { continue };
                        if decoded.game_tag != tag || &tx.txid != genesis_tx_id {
                            continue;
                        }
                        payloads.insert(tx.txid.clone(), tx.payload.clone());
                        genesis = Some(decoded);
                    }
                    AnchorKind::Heartbeat => {
                        let Ok(decoded) = HeartbeatAnchor::decode(&tx.payload) else { continue };
                        if decoded.game_tag != tag {
                            continue;
                        }
                        payloads.insert(tx.txid.clone(), tx.payload.clone());
                        heartbeats_by_prev
                            .insert(decoded.prev_tx_id.clone(), (tx.txid.clone(), decoded));
                    }
                    AnchorKind::Final => {
                        let Ok(decoded) = FinalAnchor::decode(&tx.payload) else { continue };
                        if decoded.game_tag != tag {
                            continue;
                        }
                        payloads.insert(tx.txid.clone(), tx.payload.clone());
                        finals_by_prev.insert(decoded.prev_tx_id.clone(), (tx.txid.clone(), decoded));
                    }
                }
            }
        }

        let genesis =
            genesis.ok_or_else(|| KktpError::AuditFailed("genesis anchor not found in range".into()))?;

        // Forward walk along prev links; heartbeats extend, a final terminates.
        let mut tx_ids = vec![genesis_tx_id.clone()];
        let mut heartbeats = Vec::new();
        let mut final_anchor = None;
        let mut cursor = genesis_tx_id.clone();
        loop {
            if let Some((tx_id, hb)) = heartbeats_by_prev.remove(&cursor) {
                debug!(tx_id = %tx_id, entries = hb.entries.len(), "chain extends");
                cursor = tx_id.clone();
                tx_ids.push(tx_id.clone());
                heartbeats.push((tx_id, hb));
                continue;
            }
            if let Some((tx_id, fin)) = finals_by_prev.remove(&cursor) {
                tx_ids.push(tx_id.clone());
                final_anchor = Some((tx_id, fin));
            }
            break;
        }

        Ok(ReconstructedChain {
            genesis_tx_id: genesis_tx_id.clone(),
            genesis,
            heartbeats,
            final_anchor,
            payloads,
            tx_ids,
        })
    }

    /// Decide whether the producer cheated, from ledger data alone plus an
    /// optional local snapshot for full VRF-chain re-derivation.
    pub fn audit_cheating(
        &self,
        chain: &ReconstructedChain,
        producer: &PubSig,
        registry: &ActionRegistry,
        local: Option<&VaultSnapshot>,
    ) -> AuditVerdict {
        // 1. Every payload carries a valid producer signature.
        for (tx_id, payload) in &chain.payloads {
            if verify_payload_signature(producer, payload).is_err() {
                return AuditVerdict::fail(format!("bad signature on anchor {tx_id}"));
            }
        }

        // 2. prev links are consistent by construction; require completeness.
        let Some((_, final_anchor)) = &chain.final_anchor else {
            return AuditVerdict::fail("chain has no final anchor");
        };

        // 3. Re-derive the Merkle root from the heartbeat-carried entries.
        let entries = chain.entries();
        if entries.len() != final_anchor.total_moves as usize {
            return AuditVerdict::fail(format!(
                "move count mismatch: {} anchored, {} declared",
                entries.len(),
                final_anchor.total_moves
            ));
        }

        let Some(local) = local else {
            // Without the snapshot the leaf descriptors cannot be rebuilt
            // (sequence/timestamp live off-ledger); linkage + signatures is
            // the strongest ledger-only verdict.
            return AuditVerdict::pass();
        };

        if local.moves.len() != entries.len() {
            return AuditVerdict::fail("snapshot and anchored move counts differ");
        }

        let mut leaves = Vec::with_capacity(local.moves.len());
        for (record, entry) in local.moves.iter().zip(entries.iter()) {
            // The anchored entry must agree with the snapshot record.
            if entry.vrf_fragment() != record.vrf_fragment {
                return AuditVerdict::fail("anchored VRF fragment diverges from snapshot");
            }
            if registry.name_of(entry.code()) != Some(record.descriptor.action.as_str()) {
                return AuditVerdict::fail("anchored action code diverges from snapshot");
            }
            match leaf_bytes(&record.descriptor, &record.vrf_fragment) {
                Ok(leaf) => leaves.push(leaf),
                Err(e) => return AuditVerdict::fail(e.to_string()),
            }
        }
        let derived_root = root_of_leaves(&leaves);
        if derived_root != Some(final_anchor.merkle_root) {
            return AuditVerdict::fail("re-derived Merkle root does not match final anchor");
        }

        // 4. Recompute the VRF chain from genesis entropy and stored beacons.
        let mut v = reinforce_with_genesis(&chain.genesis.initial_vrf, &chain.genesis_tx_id);
        for (i, record) in local.moves.iter().enumerate() {
            let descriptor_bytes = match jcs::to_canonical_bytes(&record.descriptor) {
                Ok(b) => b,
                Err(e) => return AuditVerdict::fail(e.to_string()),
            };
            v = fold(&v, &record.beacon, &descriptor_bytes);
            if &v.as_bytes()[..4] != record.vrf_fragment.as_slice() {
                return AuditVerdict::fail(format!("VRF chain diverges at move {i}"));
            }
            match local.proofs.get(i) {
                Some(proof) if proof.output == v => {}
                _ => return AuditVerdict::fail(format!("VRF proof missing or wrong at move {i}")),
            }
        }

        AuditVerdict::pass()
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use kktp_core::error::KktpError;
use kktp_core::types::{BlockHash, Outpoint, Timestamp, TxId, UtxoRecord};

// ── Dehydrated ledger records ────────────────────────────────────────────────
//
// Everything crossing the adapter boundary upward is a plain owned value.
// Backends holding foreign resource handles release them before returning.

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount_sompi: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_outpoint: Outpoint,
    /// Address the previous outpoint paid to, when the backend can resolve it.
    pub address: Option<String>,
}

/// One observed transaction, dehydrated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTx {
    pub txid: TxId,
    pub payload: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub accepted_at: Timestamp,
}

impl LedgerTx {
    /// Lowercased hex of the payload, the form all prefix matching runs on.
    pub fn payload_hex(&self) -> String {
        hex::encode(&self.payload)
    }
}

/// One observed block, dehydrated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub hash: BlockHash,
    pub daa_score: u64,
    pub timestamp: Timestamp,
    pub transactions: Vec<LedgerTx>,
}

// ── Adapter trait ────────────────────────────────────────────────────────────

/// The wallet/ledger boundary (L0). Implementations own address generation,
/// UTXO queries, transaction construction/signing, and submission; everything
/// above consumes only the canonical records defined here.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// This wallet's receive address.
    async fn receive_address(&self) -> Result<String, KktpError>;

    /// Spendable balance in sompi.
    async fn balance(&self) -> Result<u64, KktpError>;

    /// Enumerate spendable UTXOs, normalised.
    async fn utxos(&self) -> Result<Vec<UtxoRecord>, KktpError>;

    /// Current DAA score of the virtual chain tip.
    async fn daa_score(&self) -> Result<u64, KktpError>;

    /// Build, sign, and submit a transaction carrying `payload`, spending the
    /// reserved UTXO when one is given (single-input, single-transaction
    /// latency path) or letting the wallet pick inputs otherwise.
    async fn submit_payload_tx(
        &self,
        reserved: Option<UtxoRecord>,
        payload: Vec<u8>,
    ) -> Result<TxId, KktpError>;

    /// Split: spend `inputs` into `output_amounts` plus change back to self.
    async fn submit_split(
        &self,
        inputs: Vec<UtxoRecord>,
        output_amounts: Vec<u64>,
    ) -> Result<TxId, KktpError>;

    /// Consolidate: spend `inputs` into a single output back to self.
    async fn submit_consolidate(&self, inputs: Vec<UtxoRecord>) -> Result<TxId, KktpError>;

    /// Live block stream. Lagged receivers resubscribe.
    fn subscribe_blocks(&self) -> broadcast::Receiver<LedgerBlock>;

    /// Fetch one block by hash.
    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<LedgerBlock>, KktpError>;

    /// Walk the DAG range between two block hashes, inclusive, in accepted
    /// order. The auditor's only ledger query.
    async fn blocks_in_range(
        &self,
        from: &BlockHash,
        to: &BlockHash,
    ) -> Result<Vec<LedgerBlock>, KktpError>;

    /// One externally-sourced quantum randomness pulse `(index, data)`,
    /// captured into genesis entropy.
    async fn fetch_qrng_pulse(&self) -> Result<(u64, [u8; 32]), KktpError>;
}

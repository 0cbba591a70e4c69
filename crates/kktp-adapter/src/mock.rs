//! In-memory ledger used by tests across the workspace.
//!
//! Submissions confirm instantly: every submitted transaction lands in a
//! fresh block that is pushed to all block subscribers, which is exactly the
//! observation path the scanner consumes in production.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use kktp_core::error::KktpError;
use kktp_core::types::{now_ms, BlockHash, Outpoint, TxId, UtxoRecord};
use kktp_crypto::hash::blake2b_256;

use crate::traits::{LedgerAdapter, LedgerBlock, LedgerTx, TxInput, TxOutput};

struct MockState {
    utxos: Vec<UtxoRecord>,
    blocks: Vec<LedgerBlock>,
    /// Queue of failures to inject into upcoming submissions.
    fail_next: VecDeque<String>,
}

pub struct MockLedger {
    state: Mutex<MockState>,
    counter: AtomicU64,
    daa: AtomicU64,
    block_tx: broadcast::Sender<LedgerBlock>,
    address: String,
}

impl MockLedger {
    pub fn new() -> Self {
        let (block_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState {
                utxos: Vec::new(),
                blocks: Vec::new(),
                fail_next: VecDeque::new(),
            }),
            counter: AtomicU64::new(1),
            daa: AtomicU64::new(1_000),
            block_tx,
            address: "kktp:qmock0000".to_string(),
        }
    }

    fn next_id(&self, domain: &[u8]) -> [u8; 32] {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut input = domain.to_vec();
        input.extend_from_slice(&n.to_be_bytes());
        blake2b_256(&input)
    }

    /// Seed `n` spendable UTXOs of `amount_sompi` each.
    pub fn fund(&self, n: usize, amount_sompi: u64) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            let txid = TxId::from_bytes(self.next_id(b"fund"));
            state.utxos.push(UtxoRecord {
                outpoint: Outpoint { txid, index: 0 },
                amount_sompi,
            });
        }
    }

    /// Queue an error for the next submission.
    pub fn fail_next_submit(&self, reason: &str) {
        self.state.lock().unwrap().fail_next.push_back(reason.to_string());
    }

    /// Mine an empty block (advances the beacon without any transaction).
    pub fn produce_empty_block(&self) -> LedgerBlock {
        self.mine(Vec::new())
    }

    /// Every block mined so far, in accepted order.
    pub fn all_blocks(&self) -> Vec<LedgerBlock> {
        self.state.lock().unwrap().blocks.clone()
    }

    /// Mine a block holding arbitrary foreign transactions (an opponent's
    /// anchors, unrelated traffic).
    pub fn inject_txs(&self, txs: Vec<LedgerTx>) -> LedgerBlock {
        self.mine(txs)
    }

    /// Build a dehydrated payload-carrying transaction without submitting it.
    pub fn make_payload_tx(&self, payload: Vec<u8>) -> LedgerTx {
        LedgerTx {
            txid: TxId::from_bytes(self.next_id(b"tx")),
            payload,
            inputs: Vec::new(),
            outputs: vec![TxOutput { address: "kktp:qforeign".into(), amount_sompi: 1 }],
            accepted_at: now_ms(),
        }
    }

    fn mine(&self, transactions: Vec<LedgerTx>) -> LedgerBlock {
        let block = LedgerBlock {
            hash: BlockHash::from_bytes(self.next_id(b"block")),
            daa_score: self.daa.fetch_add(1, Ordering::SeqCst),
            timestamp: now_ms(),
            transactions,
        };
        self.state.lock().unwrap().blocks.push(block.clone());
        let _ = self.block_tx.send(block.clone());
        block
    }

    fn take_injected_failure(&self) -> Option<String> {
        self.state.lock().unwrap().fail_next.pop_front()
    }

    fn spend(&self, outpoints: &[Outpoint]) -> Result<u64, KktpError> {
        let mut state = self.state.lock().unwrap();
        let mut total = 0u64;
        for op in outpoints {
            let pos = state
                .utxos
                .iter()
                .position(|u| &u.outpoint == op)
                .ok_or_else(|| KktpError::Adapter(format!("unknown outpoint {op}")))?;
            total += state.utxos.remove(pos).amount_sompi;
        }
        Ok(total)
    }

    fn credit(&self, txid: &TxId, amounts: &[u64]) {
        let mut state = self.state.lock().unwrap();
        for (index, amount) in amounts.iter().enumerate() {
            state.utxos.push(UtxoRecord {
                outpoint: Outpoint { txid: txid.clone(), index: index as u32 },
                amount_sompi: *amount,
            });
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MockLedger {
    async fn receive_address(&self) -> Result<String, KktpError> {
        Ok(self.address.clone())
    }

    async fn balance(&self) -> Result<u64, KktpError> {
        Ok(self.state.lock().unwrap().utxos.iter().map(|u| u.amount_sompi).sum())
    }

    async fn utxos(&self) -> Result<Vec<UtxoRecord>, KktpError> {
        Ok(self.state.lock().unwrap().utxos.clone())
    }

    async fn daa_score(&self) -> Result<u64, KktpError> {
        Ok(self.daa.load(Ordering::SeqCst))
    }

    async fn submit_payload_tx(
        &self,
        reserved: Option<UtxoRecord>,
        payload: Vec<u8>,
    ) -> Result<TxId, KktpError> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(KktpError::AnchorSubmitFailed(reason));
        }
        let input = match reserved {
            Some(u) => u,
            None => {
                let state = self.state.lock().unwrap();
                state
                    .utxos
                    .first()
                    .cloned()
                    .ok_or(KktpError::InsufficientFunds { need: 1, have: 0 })?
            }
        };
        let spent = self.spend(std::slice::from_ref(&input.outpoint))?;
        let txid = TxId::from_bytes(self.next_id(b"tx"));
        // Change output minus a flat fee.
        let fee = 2_000u64.min(spent);
        self.credit(&txid, &[spent - fee]);
        let tx = LedgerTx {
            txid: txid.clone(),
            payload,
            inputs: vec![TxInput {
                previous_outpoint: input.outpoint,
                address: Some(self.address.clone()),
            }],
            outputs: vec![TxOutput { address: self.address.clone(), amount_sompi: spent - fee }],
            accepted_at: now_ms(),
        };
        self.mine(vec![tx]);
        Ok(txid)
    }

    async fn submit_split(
        &self,
        inputs: Vec<UtxoRecord>,
        output_amounts: Vec<u64>,
    ) -> Result<TxId, KktpError> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(KktpError::Adapter(reason));
        }
        let outpoints: Vec<Outpoint> = inputs.iter().map(|u| u.outpoint.clone()).collect();
        let total_in = self.spend(&outpoints)?;
        let total_out: u64 = output_amounts.iter().sum();
        if total_out > total_in {
            return Err(KktpError::InsufficientFunds { need: total_out, have: total_in });
        }
        let txid = TxId::from_bytes(self.next_id(b"tx"));
        let mut amounts = output_amounts;
        let change = total_in - amounts.iter().sum::<u64>();
        if change > 0 {
            amounts.push(change);
        }
        self.credit(&txid, &amounts);
        let tx = LedgerTx {
            txid: txid.clone(),
            payload: Vec::new(),
            inputs: outpoints
                .into_iter()
                .map(|previous_outpoint| TxInput {
                    previous_outpoint,
                    address: Some(self.address.clone()),
                })
                .collect(),
            outputs: amounts
                .iter()
                .map(|&amount_sompi| TxOutput { address: self.address.clone(), amount_sompi })
                .collect(),
            accepted_at: now_ms(),
        };
        self.mine(vec![tx]);
        Ok(txid)
    }

    async fn submit_consolidate(&self, inputs: Vec<UtxoRecord>) -> Result<TxId, KktpError> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(KktpError::Adapter(reason));
        }
        let outpoints: Vec<Outpoint> = inputs.iter().map(|u| u.outpoint.clone()).collect();
        let total = self.spend(&outpoints)?;
        let txid = TxId::from_bytes(self.next_id(b"tx"));
        self.credit(&txid, &[total]);
        let tx = LedgerTx {
            txid: txid.clone(),
            payload: Vec::new(),
            inputs: outpoints
                .into_iter()
                .map(|previous_outpoint| TxInput {
                    previous_outpoint,
                    address: Some(self.address.clone()),
                })
                .collect(),
            outputs: vec![TxOutput { address: self.address.clone(), amount_sompi: total }],
            accepted_at: now_ms(),
        };
        self.mine(vec![tx]);
        Ok(txid)
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<LedgerBlock> {
        self.block_tx.subscribe()
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<LedgerBlock>, KktpError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .iter()
            .find(|b| &b.hash == hash)
            .cloned())
    }

    async fn blocks_in_range(
        &self,
        from: &BlockHash,
        to: &BlockHash,
    ) -> Result<Vec<LedgerBlock>, KktpError> {
        let state = self.state.lock().unwrap();
        let start = state.blocks.iter().position(|b| &b.hash == from);
        let end = state.blocks.iter().position(|b| &b.hash == to);
        match (start, end) {
            (Some(s), Some(e)) if s <= e => Ok(state.blocks[s..=e].to_vec()),
            _ => Err(KktpError::Adapter("block range not found".into())),
        }
    }

    async fn fetch_qrng_pulse(&self) -> Result<(u64, [u8; 32]), KktpError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok((index, blake2b_256(&index.to_be_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fund_and_spend() {
        let ledger = MockLedger::new();
        ledger.fund(2, 500_000_000);
        assert_eq!(ledger.balance().await.unwrap(), 1_000_000_000);

        let utxo = ledger.utxos().await.unwrap()[0].clone();
        let mut rx = ledger.subscribe_blocks();
        let txid = ledger
            .submit_payload_tx(Some(utxo), b"payload".to_vec())
            .await
            .unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].txid, txid);
        assert_eq!(block.transactions[0].payload, b"payload");
    }

    #[tokio::test]
    async fn split_creates_outputs_with_change() {
        let ledger = MockLedger::new();
        ledger.fund(1, 1_000);
        let inputs = ledger.utxos().await.unwrap();
        ledger.submit_split(inputs, vec![300, 300]).await.unwrap();
        let mut amounts: Vec<u64> = ledger
            .utxos()
            .await
            .unwrap()
            .iter()
            .map(|u| u.amount_sompi)
            .collect();
        amounts.sort_unstable();
        assert_eq!(amounts, vec![300, 300, 400]);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_once() {
        let ledger = MockLedger::new();
        ledger.fund(1, 1_000_000);
        ledger.fail_next_submit("mass limit");
        let utxo = ledger.utxos().await.unwrap()[0].clone();
        assert!(ledger
            .submit_payload_tx(Some(utxo.clone()), vec![])
            .await
            .is_err());
        // Next attempt succeeds.
        assert!(ledger.submit_payload_tx(Some(utxo), vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn range_walk_is_inclusive(){
        let ledger = MockLedger::new();
        let b1 = ledger.produce_empty_block();
        let b2 = ledger.produce_empty_block();
        let b3 = ledger.produce_empty_block();
        let range = ledger.blocks_in_range(&b1.hash, &b3.hash).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[1].hash, b2.hash);
    }
}

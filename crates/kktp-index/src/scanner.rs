use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use kktp_adapter::traits::{LedgerAdapter, LedgerBlock, LedgerTx};
use kktp_core::events::EventSink;

use crate::indexer::Indexer;

// ── Matching ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixMatchMode {
    Includes,
    StartsWith,
    Exact,
    EndsWith,
}

/// One payload filter: `pattern` is lowercase hex.
#[derive(Clone, Debug)]
pub struct PrefixFilter {
    pub pattern: String,
    pub mode: PrefixMatchMode,
}

impl PrefixFilter {
    pub fn starts_with(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into().to_lowercase(), mode: PrefixMatchMode::StartsWith }
    }

    fn matches(&self, payload_hex: &str) -> bool {
        match self.mode {
            PrefixMatchMode::Includes => payload_hex.contains(&self.pattern),
            PrefixMatchMode::StartsWith => payload_hex.starts_with(&self.pattern),
            PrefixMatchMode::Exact => payload_hex == self.pattern,
            PrefixMatchMode::EndsWith => payload_hex.ends_with(&self.pattern),
        }
    }
}

/// A matched transaction handed to subscribers, with the payload decoded to
/// text where it is valid UTF-8 (KKTP text anchors).
#[derive(Clone, Debug)]
pub struct MatchedTx {
    pub block_hash: kktp_core::types::BlockHash,
    pub tx: LedgerTx,
    pub decoded: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ScannerConfig {
    pub prefixes: Vec<PrefixFilter>,
    pub addresses: HashSet<String>,
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// Subscribes to live blocks, matches payload prefixes and addresses, and
/// feeds the indexer. Runs as a dedicated tokio task; resubscribes when the
/// block stream lags or reconnects.
pub struct Scanner {
    adapter: Arc<dyn LedgerAdapter>,
    indexer: Arc<Indexer>,
    config: ScannerConfig,
    match_tx: broadcast::Sender<MatchedTx>,
    block_tx: broadcast::Sender<LedgerBlock>,
    shutdown: watch::Receiver<bool>,
    _sink: EventSink,
}

impl Scanner {
    pub fn new(
        adapter: Arc<dyn LedgerAdapter>,
        indexer: Arc<Indexer>,
        config: ScannerConfig,
        sink: EventSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (match_tx, _) = broadcast::channel(256);
        let (block_tx, _) = broadcast::channel(64);
        Self { adapter, indexer, config, match_tx, block_tx, shutdown, _sink: sink }
    }

    /// Matched-transaction stream for protocol consumers.
    pub fn subscribe_matches(&self) -> broadcast::Receiver<MatchedTx> {
        self.match_tx.subscribe()
    }

    /// Raw block stream (already dehydrated), for the entropy provider.
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<LedgerBlock> {
        self.block_tx.subscribe()
    }

    /// Drive the scan loop. Run in a dedicated tokio task.
    pub async fn run(mut self) {
        let mut blocks = self.adapter.subscribe_blocks();
        info!("scanner started");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("scanner stopping");
                        return;
                    }
                }
                received = blocks.recv() => {
                    match received {
                        Ok(block) => self.process_block(block),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "block stream lagged; resubscribing");
                            blocks = self.adapter.subscribe_blocks();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("block stream closed; resubscribing");
                            blocks = self.adapter.subscribe_blocks();
                        }
                    }
                }
            }
        }
    }

    fn process_block(&self, block: LedgerBlock) {
        let scan_txs = !self.config.prefixes.is_empty()
            || !self.config.addresses.is_empty()
            || self.indexer.wants_all_transactions();

        if scan_txs {
            for tx in &block.transactions {
                let payload_hex = tx.payload_hex();
                let prefix_hit = self.config.prefixes.iter().any(|p| p.matches(&payload_hex));
                let address_hit = self.address_match(tx);

                if prefix_hit || address_hit {
                    if self.indexer.add_transaction(tx.clone(), true) {
                        let decoded = String::from_utf8(tx.payload.clone()).ok();
                        let _ = self.match_tx.send(MatchedTx {
                            block_hash: block.hash.clone(),
                            tx: tx.clone(),
                            decoded,
                        });
                        debug!(txid = %tx.txid, prefix_hit, address_hit, "matched transaction");
                    }
                } else if self.indexer.wants_all_transactions() {
                    self.indexer.add_transaction(tx.clone(), false);
                }
            }
        }

        self.indexer.add_block(block.clone());
        let _ = self.block_tx.send(block);
    }

    fn address_match(&self, tx: &LedgerTx) -> bool {
        if self.config.addresses.is_empty() {
            return false;
        }
        tx.outputs.iter().any(|o| self.config.addresses.contains(&o.address))
            || tx
                .inputs
                .iter()
                .any(|i| i.address.as_ref().is_some_and(|a| self.config.addresses.contains(a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_adapter::MockLedger;
    use kktp_core::events::EventSink;
    use crate::indexer::IndexerConfig;

    fn temp_indexer() -> Arc<Indexer> {
        let dir = std::env::temp_dir().join(format!(
            "kktp_scanner_test_{}_{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        Arc::new(Indexer::open(&dir, IndexerConfig::default(), EventSink::disconnected()).unwrap())
    }

    #[test]
    fn prefix_modes() {
        let hex = "4b47aabbcc";
        assert!(PrefixFilter { pattern: "4b47".into(), mode: PrefixMatchMode::StartsWith }.matches(hex));
        assert!(PrefixFilter { pattern: "aabb".into(), mode: PrefixMatchMode::Includes }.matches(hex));
        assert!(PrefixFilter { pattern: "bbcc".into(), mode: PrefixMatchMode::EndsWith }.matches(hex));
        assert!(PrefixFilter { pattern: hex.into(), mode: PrefixMatchMode::Exact }.matches(hex));
        assert!(!PrefixFilter { pattern: "4b48".into(), mode: PrefixMatchMode::StartsWith }.matches(hex));
    }

    #[tokio::test]
    async fn matches_are_dispatched_and_indexed() {
        let ledger = Arc::new(MockLedger::new());
        let indexer = temp_indexer();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ScannerConfig {
            prefixes: vec![PrefixFilter::starts_with("4b47")],
            addresses: HashSet::new(),
        };
        let scanner = Scanner::new(
            ledger.clone(),
            Arc::clone(&indexer),
            config,
            EventSink::disconnected(),
            shutdown_rx,
        );
        let mut matches = scanner.subscribe_matches();
        let handle = tokio::spawn(scanner.run());

        // One matching, one non-matching transaction.
        let hit = ledger.make_payload_tx(hex::decode("4b47ff").unwrap());
        let miss = ledger.make_payload_tx(hex::decode("00ff").unwrap());
        let hit_id = hit.txid.clone();
        ledger.inject_txs(vec![hit, miss]);

        let matched = matches.recv().await.unwrap();
        assert_eq!(matched.tx.txid, hit_id);

        indexer.flush().await.unwrap();
        let metrics = indexer.get_metrics();
        assert_eq!(metrics.matching_transactions, 1);
        assert_eq!(metrics.transactions, 0, "non-match dropped when cache_all is off");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn address_match_feeds_indexer() {
        let ledger = Arc::new(MockLedger::new());
        let indexer = temp_indexer();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut addresses = HashSet::new();
        addresses.insert("kktp:qforeign".to_string());
        let scanner = Scanner::new(
            ledger.clone(),
            Arc::clone(&indexer),
            ScannerConfig { prefixes: vec![], addresses },
            EventSink::disconnected(),
            shutdown_rx,
        );
        let mut matches = scanner.subscribe_matches();
        let handle = tokio::spawn(scanner.run());

        // make_payload_tx pays to kktp:qforeign.
        let tx = ledger.make_payload_tx(b"not-hex-prefixed".to_vec());
        ledger.inject_txs(vec![tx]);

        let matched = matches.recv().await.unwrap();
        assert_eq!(matched.decoded.as_deref(), Some("not-hex-prefixed"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

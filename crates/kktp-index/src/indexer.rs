use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use kktp_adapter::traits::{LedgerBlock, LedgerTx};
use kktp_core::constants::{
    INDEXER_BATCH_THRESHOLD_RATIO, INDEXER_DEDUP_CAP, INDEXER_MAX_SIZE, INDEXER_RING_CAP,
    INDEXER_TTL_MS,
};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{now_ms, BlockHash, Timestamp, TxId};

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Max rows per persistent sub-store after size enforcement.
    pub max_size: usize,
    /// Row TTL in ms.
    pub ttl_ms: i64,
    /// Recent-txid dedup cap.
    pub dedup_cap: usize,
    /// In-memory ring capacity.
    pub ring_cap: usize,
    /// TTL eviction runs only when expired-fraction reaches this ratio.
    pub batch_threshold_ratio: f64,
    /// Eviction order: TTL-first then size, or size-first then TTL.
    pub priority_ttl: bool,
    /// When true the scanner also feeds non-matching transactions.
    pub cache_all: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_size: INDEXER_MAX_SIZE,
            ttl_ms: INDEXER_TTL_MS,
            dedup_cap: INDEXER_DEDUP_CAP,
            ring_cap: INDEXER_RING_CAP,
            batch_threshold_ratio: INDEXER_BATCH_THRESHOLD_RATIO,
            priority_ttl: true,
            cache_all: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexerMetrics {
    pub transactions: usize,
    pub matching_transactions: usize,
    pub blocks: usize,
    pub ring_len: usize,
    pub dedup_len: usize,
    pub pending_txs: usize,
    pub pending_blocks: usize,
    pub flushes: usize,
    pub evictions: usize,
}

// ── Sub-store ────────────────────────────────────────────────────────────────

/// One keyed sub-store plus its timestamp index.
///
/// Index rows are keyed `be64(timestamp) ∥ primary_key` so an in-order scan
/// yields oldest-first; the value is the primary key.
struct SubStore {
    rows: sled::Tree,
    ts_index: sled::Tree,
}

impl SubStore {
    fn open(db: &sled::Db, name: &str) -> Result<Self, KktpError> {
        let rows = db
            .open_tree(name)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        let ts_index = db
            .open_tree(format!("{name}_ts"))
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(Self { rows, ts_index })
    }

    fn ts_key(timestamp: Timestamp, key: &[u8]) -> Vec<u8> {
        let mut k = timestamp.to_be_bytes().to_vec();
        k.extend_from_slice(key);
        k
    }

    fn insert(&self, key: &[u8], timestamp: Timestamp, value: &[u8]) -> Result<(), KktpError> {
        self.rows
            .insert(key, value)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        self.ts_index
            .insert(Self::ts_key(timestamp, key), key)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    /// Remove all rows with `timestamp <= cutoff`. Returns removed count.
    fn evict_expired(&self, cutoff: Timestamp) -> usize {
        let mut removed = 0;
        let upper = Self::ts_key(cutoff, &[0xFF; 33]);
        let expired: Vec<(sled::IVec, sled::IVec)> = self
            .ts_index
            .range(..upper)
            .filter_map(|r| r.ok())
            .collect();
        for (ts_key, primary) in expired {
            if self.rows.remove(&primary).is_ok() && self.ts_index.remove(&ts_key).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Count rows with `timestamp <= cutoff` without removing them.
    fn count_expired(&self, cutoff: Timestamp) -> usize {
        let upper = Self::ts_key(cutoff, &[0xFF; 33]);
        self.ts_index.range(..upper).filter(|r| r.is_ok()).count()
    }

    /// Remove oldest rows until `len() <= max`. Returns removed count.
    fn enforce_size(&self, max: usize) -> usize {
        let mut removed = 0;
        while self.len() > max {
            let Ok(Some((ts_key, primary))) = self.ts_index.first() else {
                break;
            };
            let _ = self.rows.remove(&primary);
            let _ = self.ts_index.remove(&ts_key);
            removed += 1;
        }
        removed
    }

    fn clear(&self) -> Result<(), KktpError> {
        self.rows.clear().map_err(|e| KktpError::Storage(e.to_string()))?;
        self.ts_index.clear().map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ── Indexer ──────────────────────────────────────────────────────────────────

/// Single-flight gate: the holder does the work; late callers wait for the
/// generation bump instead of re-running it.
struct Gate {
    lock: AsyncMutex<()>,
    gen_tx: watch::Sender<u64>,
}

impl Gate {
    fn new() -> Self {
        let (gen_tx, _) = watch::channel(0);
        Self { lock: AsyncMutex::new(()), gen_tx }
    }
}

/// L1 cache of observed transactions and blocks.
///
/// Persistent writes happen only inside `flush`; everything between flushes
/// lives in the pending batches and the in-memory ring.
pub struct Indexer {
    config: IndexerConfig,
    _db: sled::Db,
    transactions: SubStore,
    matching: SubStore,
    blocks: SubStore,

    ring: Mutex<VecDeque<LedgerTx>>,
    dedup: Mutex<LruCache<TxId, ()>>,
    pending_txs: Mutex<Vec<(LedgerTx, bool)>>,
    pending_blocks: Mutex<Vec<LedgerBlock>>,

    flush_gate: Gate,
    evict_gate: Gate,
    counters: Mutex<(usize, usize)>, // (flushes, evictions)
    sink: EventSink,
}

impl Indexer {
    /// Open or create the cache database at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: IndexerConfig,
        sink: EventSink,
    ) -> Result<Self, KktpError> {
        let db = sled::open(path).map_err(|e| KktpError::Fatal(format!("cache open: {e}")))?;
        let transactions = SubStore::open(&db, "transactions")?;
        let matching = SubStore::open(&db, "matching_transactions")?;
        let blocks = SubStore::open(&db, "blocks")?;
        let dedup_cap = NonZeroUsize::new(config.dedup_cap.max(1)).unwrap();
        Ok(Self {
            config,
            _db: db,
            transactions,
            matching,
            blocks,
            ring: Mutex::new(VecDeque::new()),
            dedup: Mutex::new(LruCache::new(dedup_cap)),
            pending_txs: Mutex::new(Vec::new()),
            pending_blocks: Mutex::new(Vec::new()),
            flush_gate: Gate::new(),
            evict_gate: Gate::new(),
            counters: Mutex::new((0, 0)),
            sink,
        })
    }

    pub fn wants_all_transactions(&self) -> bool {
        self.config.cache_all
    }

    /// Insert a dehydrated transaction into the ring and the pending batch.
    /// Returns false when the txid was recently seen (dedup).
    pub fn add_transaction(&self, tx: LedgerTx, is_match: bool) -> bool {
        {
            let mut dedup = self.dedup.lock().unwrap();
            if dedup.contains(&tx.txid) {
                debug!(txid = %tx.txid, "dedup: already seen");
                return false;
            }
            dedup.put(tx.txid.clone(), ());
        }
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() >= self.config.ring_cap {
                ring.pop_front();
            }
            ring.push_back(tx.clone());
        }
        self.pending_txs.lock().unwrap().push((tx, is_match));
        true
    }

    pub fn add_block(&self, block: LedgerBlock) {
        self.pending_blocks.lock().unwrap().push(block);
    }

    /// Atomically persist all pending rows, then emit batched CACHED events,
    /// then enforce the size bound. Single-flight.
    pub async fn flush(&self) -> Result<(), KktpError> {
        let gen = *self.flush_gate.gen_tx.borrow();
        let Ok(_guard) = self.flush_gate.lock.try_lock() else {
            // Join the in-progress flush.
            let mut rx = self.flush_gate.gen_tx.subscribe();
            while *rx.borrow_and_update() == gen {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        };

        let txs: Vec<(LedgerTx, bool)> = std::mem::take(&mut *self.pending_txs.lock().unwrap());
        let blocks: Vec<LedgerBlock> = std::mem::take(&mut *self.pending_blocks.lock().unwrap());

        let mut cached: Vec<GameEvent> = Vec::with_capacity(txs.len() + blocks.len());
        for (tx, is_match) in &txs {
            let bytes = match bincode::serialize(tx) {
                Ok(b) => b,
                Err(e) => {
                    warn!(txid = %tx.txid, error = %e, "skipping unserialisable row");
                    continue;
                }
            };
            let store = if *is_match { &self.matching } else { &self.transactions };
            if let Err(e) = store.insert(tx.txid.as_bytes(), tx.accepted_at, &bytes) {
                warn!(txid = %tx.txid, error = %e, "row write failed; batch continues");
                continue;
            }
            cached.push(GameEvent::TxCached { tx_id: tx.txid.clone(), is_match: *is_match });
        }
        for block in &blocks {
            let bytes = match bincode::serialize(block) {
                Ok(b) => b,
                Err(e) => {
                    warn!(hash = %block.hash, error = %e, "skipping unserialisable block");
                    continue;
                }
            };
            if let Err(e) = self.blocks.insert(block.hash.as_bytes(), block.timestamp, &bytes) {
                warn!(hash = %block.hash, error = %e, "block write failed; batch continues");
                continue;
            }
            cached.push(GameEvent::BlockCached { hash: block.hash.clone() });
        }

        // CACHED events fire only after the write completed.
        for event in cached {
            self.sink.emit(event);
        }

        // Size bound after every flush.
        for store in [&self.transactions, &self.matching, &self.blocks] {
            store.enforce_size(self.config.max_size);
        }

        self.counters.lock().unwrap().0 += 1;
        self.flush_gate.gen_tx.send_modify(|g| *g += 1);
        Ok(())
    }

    /// TTL + size eviction in the configured priority order. Single-flight.
    pub async fn evict(&self) -> Result<(), KktpError> {
        let gen = *self.evict_gate.gen_tx.borrow();
        let Ok(_guard) = self.evict_gate.lock.try_lock() else {
            let mut rx = self.evict_gate.gen_tx.subscribe();
            while *rx.borrow_and_update() == gen {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        };

        let cutoff = now_ms() - self.config.ttl_ms;
        let stores = [&self.transactions, &self.matching, &self.blocks];

        let run_ttl = |removed: &mut usize| {
            for store in stores {
                let len = store.len();
                if len == 0 {
                    continue;
                }
                let expired = store.count_expired(cutoff);
                // Below the threshold the scan is not worth the write churn.
                if (expired as f64) / (len as f64) < self.config.batch_threshold_ratio {
                    continue;
                }
                *removed += store.evict_expired(cutoff);
            }
        };
        let run_size = |removed: &mut usize| {
            for store in stores {
                *removed += store.enforce_size(self.config.max_size);
            }
        };

        let mut removed = 0;
        if self.config.priority_ttl {
            run_ttl(&mut removed);
            run_size(&mut removed);
        } else {
            run_size(&mut removed);
            run_ttl(&mut removed);
        }
        if removed > 0 {
            info!(removed, "cache eviction pass");
        }

        self.counters.lock().unwrap().1 += 1;
        self.evict_gate.gen_tx.send_modify(|g| *g += 1);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_transaction(&self, txid: &TxId) -> Result<Option<LedgerTx>, KktpError> {
        for store in [&self.matching, &self.transactions] {
            if let Some(bytes) = store
                .rows
                .get(txid.as_bytes())
                .map_err(|e| KktpError::Storage(e.to_string()))?
            {
                let tx = bincode::deserialize(&bytes)
                    .map_err(|e| KktpError::Serialization(e.to_string()))?;
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<LedgerBlock>, KktpError> {
        match self
            .blocks
            .rows
            .get(hash.as_bytes())
            .map_err(|e| KktpError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| KktpError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Matching transactions with `from_ts <= accepted_at <= to_ts`, oldest first.
    pub fn matching_in_range(
        &self,
        from_ts: Timestamp,
        to_ts: Timestamp,
    ) -> Result<Vec<LedgerTx>, KktpError> {
        let lower = SubStore::ts_key(from_ts, &[]);
        let upper = SubStore::ts_key(to_ts, &[0xFF; 33]);
        let mut out = Vec::new();
        for item in self.matching.ts_index.range(lower..upper) {
            let (_, primary) = item.map_err(|e| KktpError::Storage(e.to_string()))?;
            if let Some(bytes) = self
                .matching
                .rows
                .get(&primary)
                .map_err(|e| KktpError::Storage(e.to_string()))?
            {
                out.push(
                    bincode::deserialize(&bytes)
                        .map_err(|e| KktpError::Serialization(e.to_string()))?,
                );
            }
        }
        Ok(out)
    }

    /// Matching transactions paying to (or spending from) `address`.
    pub fn matching_by_address(&self, address: &str) -> Result<Vec<LedgerTx>, KktpError> {
        let mut out = Vec::new();
        for item in self.matching.rows.iter() {
            let (_, bytes) = item.map_err(|e| KktpError::Storage(e.to_string()))?;
            let tx: LedgerTx =
                bincode::deserialize(&bytes).map_err(|e| KktpError::Serialization(e.to_string()))?;
            let hit = tx.outputs.iter().any(|o| o.address == address)
                || tx.inputs.iter().any(|i| i.address.as_deref() == Some(address));
            if hit {
                out.push(tx);
            }
        }
        Ok(out)
    }

    /// Most recent ring entries, newest last.
    pub fn ring_snapshot(&self) -> Vec<LedgerTx> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn get_metrics(&self) -> IndexerMetrics {
        let (flushes, evictions) = *self.counters.lock().unwrap();
        IndexerMetrics {
            transactions: self.transactions.len(),
            matching_transactions: self.matching.len(),
            blocks: self.blocks.len(),
            ring_len: self.ring.lock().unwrap().len(),
            dedup_len: self.dedup.lock().unwrap().len(),
            pending_txs: self.pending_txs.lock().unwrap().len(),
            pending_blocks: self.pending_blocks.lock().unwrap().len(),
            flushes,
            evictions,
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub fn clear_store(&self, name: &str) -> Result<(), KktpError> {
        match name {
            "transactions" => self.transactions.clear(),
            "matching_transactions" => self.matching.clear(),
            "blocks" => self.blocks.clear(),
            other => Err(KktpError::Other(format!("unknown store: {other}"))),
        }
    }

    /// Drop every persistent row and all in-memory state.
    pub async fn reset_everything(&self) -> Result<(), KktpError> {
        let _flush = self.flush_gate.lock.lock().await;
        let _evict = self.evict_gate.lock.lock().await;
        for store in [&self.transactions, &self.matching, &self.blocks] {
            store.clear()?;
        }
        self.ring.lock().unwrap().clear();
        self.dedup.lock().unwrap().clear();
        self.pending_txs.lock().unwrap().clear();
        self.pending_blocks.lock().unwrap().clear();
        info!("indexer reset");
        Ok(())
    }

    /// Reset and start from a clean slate (counters included).
    pub async fn fresh_start(&self) -> Result<(), KktpError> {
        self.reset_everything().await?;
        *self.counters.lock().unwrap() = (0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_core::types::now_ms;
    use std::sync::Arc;

    fn temp_indexer(config: IndexerConfig) -> (Arc<Indexer>, tokio::sync::mpsc::UnboundedReceiver<GameEvent>) {
        let dir = std::env::temp_dir().join(format!(
            "kktp_indexer_test_{}_{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let (sink, rx) = EventSink::new();
        (Arc::new(Indexer::open(&dir, config, sink).unwrap()), rx)
    }

    fn make_tx(seed: u8, accepted_at: Timestamp) -> LedgerTx {
        LedgerTx {
            txid: TxId::from_bytes([seed; 32]),
            payload: vec![seed],
            inputs: vec![],
            outputs: vec![],
            accepted_at,
        }
    }

    #[tokio::test]
    async fn dedup_rejects_recent_txids() {
        let (ix, _rx) = temp_indexer(IndexerConfig::default());
        assert!(ix.add_transaction(make_tx(1, now_ms()), true));
        assert!(!ix.add_transaction(make_tx(1, now_ms()), true));
        assert_eq!(ix.get_metrics().pending_txs, 1);
    }

    #[tokio::test]
    async fn cached_events_fire_after_flush_only() {
        let (ix, mut rx) = temp_indexer(IndexerConfig::default());
        ix.add_transaction(make_tx(2, now_ms()), true);
        assert!(rx.try_recv().is_err(), "no event before flush");

        ix.flush().await.unwrap();
        match rx.try_recv().unwrap() {
            GameEvent::TxCached { is_match, .. } => assert!(is_match),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ix.get_metrics().matching_transactions, 1);
        assert_eq!(ix.get_metrics().pending_txs, 0);
    }

    #[tokio::test]
    async fn size_eviction_keeps_newest() {
        let config = IndexerConfig { max_size: 3, ..Default::default() };
        let (ix, _rx) = temp_indexer(config);
        let base = now_ms();
        for i in 0..5u8 {
            ix.add_transaction(make_tx(i, base + i as i64), true);
        }
        ix.flush().await.unwrap();
        assert_eq!(ix.get_metrics().matching_transactions, 3);
        // Oldest two are gone, newest three remain.
        assert!(ix.get_transaction(&TxId::from_bytes([0; 32])).unwrap().is_none());
        assert!(ix.get_transaction(&TxId::from_bytes([4; 32])).unwrap().is_some());
    }

    #[tokio::test]
    async fn ttl_eviction_respects_threshold_ratio() {
        let config = IndexerConfig {
            ttl_ms: 1_000,
            batch_threshold_ratio: 0.5,
            ..Default::default()
        };
        let (ix, _rx) = temp_indexer(config);
        let now = now_ms();
        // 1 expired of 10 → ratio 0.1 < 0.5 → TTL pass skipped.
        ix.add_transaction(make_tx(0, now - 10_000), true);
        for i in 1..10u8 {
            ix.add_transaction(make_tx(i, now), true);
        }
        ix.flush().await.unwrap();
        ix.evict().await.unwrap();
        assert_eq!(ix.get_metrics().matching_transactions, 10);
    }

    #[tokio::test]
    async fn ttl_eviction_removes_only_expired() {
        let config = IndexerConfig {
            ttl_ms: 1_000,
            batch_threshold_ratio: 0.1,
            ..Default::default()
        };
        let (ix, _rx) = temp_indexer(config);
        let now = now_ms();
        for i in 0..4u8 {
            ix.add_transaction(make_tx(i, now - 10_000), true);
        }
        for i in 4..8u8 {
            ix.add_transaction(make_tx(i, now), true);
        }
        ix.flush().await.unwrap();
        ix.evict().await.unwrap();
        let metrics = ix.get_metrics();
        assert_eq!(metrics.matching_transactions, 4);
        assert!(ix.get_transaction(&TxId::from_bytes([5; 32])).unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_flushes_join() {
        let (ix, _rx) = temp_indexer(IndexerConfig::default());
        for i in 0..32u8 {
            ix.add_transaction(make_tx(i, now_ms()), false);
        }
        let a = { let ix = Arc::clone(&ix); tokio::spawn(async move { ix.flush().await }) };
        let b = { let ix = Arc::clone(&ix); tokio::spawn(async move { ix.flush().await }) };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(ix.get_metrics().transactions, 32);
    }

    #[tokio::test]
    async fn range_query_is_ordered() {
        let (ix, _rx) = temp_indexer(IndexerConfig::default());
        let base = 1_000_000;
        for i in [3u8, 1, 2] {
            ix.add_transaction(make_tx(i, base + i as i64), true);
        }
        ix.flush().await.unwrap();
        let rows = ix.matching_in_range(base, base + 10).unwrap();
        let order: Vec<u8> = rows.iter().map(|t| t.payload[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reset_everything_clears_all() {
        let (ix, _rx) = temp_indexer(IndexerConfig::default());
        ix.add_transaction(make_tx(1, now_ms()), true);
        ix.flush().await.unwrap();
        ix.reset_everything().await.unwrap();
        let metrics = ix.get_metrics();
        assert_eq!(metrics.matching_transactions, 0);
        assert_eq!(metrics.ring_len, 0);
        assert_eq!(metrics.dedup_len, 0);
    }
}

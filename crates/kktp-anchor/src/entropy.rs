use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use kktp_adapter::traits::{LedgerAdapter, LedgerBlock};
use kktp_core::types::{BlockHash, Timestamp};

/// The latest live block observed on the ledger, used as beacon entropy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeaconInfo {
    pub hash: BlockHash,
    pub daa_score: u64,
    pub observed_at: Timestamp,
}

/// Caches the latest block hash from the live stream.
///
/// Consumers read the cache synchronously; the VRF manager also watches for
/// arrival of the next block to resolve a sync wait.
pub struct EntropyProvider {
    latest: watch::Sender<Option<BeaconInfo>>,
}

impl EntropyProvider {
    pub fn new() -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        Arc::new(Self { latest })
    }

    /// Spawn the block-consuming task. Returns when `shutdown` flips true.
    pub fn spawn(
        self: &Arc<Self>,
        adapter: Arc<dyn LedgerAdapter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let mut blocks = adapter.subscribe_blocks();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("entropy provider stopping");
                            return;
                        }
                    }
                    received = blocks.recv() => {
                        match received {
                            Ok(block) => provider.observe(&block),
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                blocks = adapter.subscribe_blocks();
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        })
    }

    /// Record a block observation directly (tests, or a scanner-fed path).
    pub fn observe(&self, block: &LedgerBlock) {
        debug!(hash = %block.hash, daa = block.daa_score, "beacon advanced");
        let _ = self.latest.send(Some(BeaconInfo {
            hash: block.hash.clone(),
            daa_score: block.daa_score,
            observed_at: block.timestamp,
        }));
    }

    /// The cached latest block hash, if any block has been observed yet.
    pub fn cached_block_hash(&self) -> Option<BeaconInfo> {
        self.latest.borrow().clone()
    }

    /// Watch for beacon changes (used to resolve a VRF sync wait).
    pub fn subscribe(&self) -> watch::Receiver<Option<BeaconInfo>> {
        self.latest.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_core::types::now_ms;

    fn block(seed: u8, daa: u64) -> LedgerBlock {
        LedgerBlock {
            hash: BlockHash::from_bytes([seed; 32]),
            daa_score: daa,
            timestamp: now_ms(),
            transactions: vec![],
        }
    }

    #[test]
    fn cache_starts_empty_then_tracks_latest() {
        let provider = EntropyProvider::new();
        assert!(provider.cached_block_hash().is_none());
        provider.observe(&block(1, 10));
        provider.observe(&block(2, 11));
        let beacon = provider.cached_block_hash().unwrap();
        assert_eq!(beacon.hash, BlockHash::from_bytes([2; 32]));
        assert_eq!(beacon.daa_score, 11);
    }

    #[tokio::test]
    async fn watcher_sees_advancement() {
        let provider = EntropyProvider::new();
        let mut rx = provider.subscribe();
        provider.observe(&block(3, 12));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
    }
}

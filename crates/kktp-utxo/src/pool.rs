use tracing::debug;

use kktp_core::constants::{POOL_LOW_THRESHOLD, POOL_MIN_READY, STALE_RESERVATION_MS};
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{Outpoint, Timestamp, UtxoRecord};

/// Lifecycle of one pooled entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UtxoState {
    Available,
    Reserved,
    Spent,
}

#[derive(Clone, Debug)]
pub struct PoolEntry {
    pub utxo: UtxoRecord,
    pub state: UtxoState,
    pub reserved_at: Option<Timestamp>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: usize,
    pub reserved: usize,
    pub spent: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.available + self.reserved + self.spent
    }
}

/// Event-driven in-memory pool of pre-split spendable UTXOs.
///
/// Single-threaded by contract: reserve/release/mark_spent is the only write
/// path, and callers serialise access. Time is passed in explicitly so the
/// stale sweeper is deterministic under test.
pub struct UtxoPool {
    entries: Vec<PoolEntry>,
    sink: EventSink,
}

impl UtxoPool {
    pub fn new(sink: EventSink) -> Self {
        Self { entries: Vec::new(), sink }
    }

    /// Track a new spendable entry. Duplicate outpoints are ignored.
    pub fn add(&mut self, utxo: UtxoRecord) {
        if self.entries.iter().any(|e| e.utxo.outpoint == utxo.outpoint) {
            return;
        }
        self.sink.emit(GameEvent::UtxoAdded { outpoint: utxo.outpoint.clone() });
        self.entries.push(PoolEntry { utxo, state: UtxoState::Available, reserved_at: None });
        let available = self.counts().available;
        if available >= POOL_MIN_READY {
            self.sink.emit(GameEvent::PoolReady { available });
        }
    }

    pub fn add_batch(&mut self, utxos: Vec<UtxoRecord>) {
        for utxo in utxos {
            self.add(utxo);
        }
    }

    /// Reserve the first AVAILABLE entry in iteration order, transitioning it
    /// to RESERVED atomically. Returns None (and emits POOL_EMPTY) when no
    /// entry is available.
    pub fn reserve(&mut self, now: Timestamp) -> Option<UtxoRecord> {
        let entry = self.entries.iter_mut().find(|e| e.state == UtxoState::Available);
        match entry {
            Some(e) => {
                e.state = UtxoState::Reserved;
                e.reserved_at = Some(now);
                let utxo = e.utxo.clone();
                self.sink.emit(GameEvent::UtxoReserved { outpoint: utxo.outpoint.clone() });
                let available = self.counts().available;
                if available == 0 {
                    self.sink.emit(GameEvent::PoolEmpty);
                } else if available <= POOL_LOW_THRESHOLD {
                    self.sink.emit(GameEvent::PoolLow { available });
                }
                Some(utxo)
            }
            None => {
                self.sink.emit(GameEvent::PoolEmpty);
                None
            }
        }
    }

    /// Return a RESERVED entry to AVAILABLE (submission failed or abandoned).
    pub fn release(&mut self, outpoint: &Outpoint) -> bool {
        let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| &e.utxo.outpoint == outpoint && e.state == UtxoState::Reserved)
        else {
            return false;
        };
        e.state = UtxoState::Available;
        e.reserved_at = None;
        self.sink.emit(GameEvent::UtxoReleased { outpoint: outpoint.clone() });
        true
    }

    /// Transition an entry to SPENT (submission confirmed).
    pub fn mark_spent(&mut self, outpoint: &Outpoint) -> bool {
        let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| &e.utxo.outpoint == outpoint && e.state != UtxoState::Spent)
        else {
            return false;
        };
        e.state = UtxoState::Spent;
        e.reserved_at = None;
        self.sink.emit(GameEvent::UtxoSpent { outpoint: outpoint.clone() });
        true
    }

    /// Drop SPENT entries. Returns pruned count.
    pub fn prune_spent(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.state != UtxoState::Spent);
        before - self.entries.len()
    }

    /// Sweep reservations older than `max_age_ms` back to AVAILABLE.
    pub fn release_stale_reservations(&mut self, now: Timestamp, max_age_ms: i64) -> usize {
        let stale: Vec<Outpoint> = self
            .entries
            .iter()
            .filter(|e| {
                e.state == UtxoState::Reserved
                    && e.reserved_at.is_some_and(|t| now - t >= max_age_ms)
            })
            .map(|e| e.utxo.outpoint.clone())
            .collect();
        for outpoint in &stale {
            debug!(%outpoint, "releasing stale reservation");
            self.release(outpoint);
        }
        stale.len()
    }

    /// Sweep with the protocol default age.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        self.release_stale_reservations(now, STALE_RESERVATION_MS)
    }

    pub fn get_available(&self) -> Vec<UtxoRecord> {
        self.entries
            .iter()
            .filter(|e| e.state == UtxoState::Available)
            .map(|e| e.utxo.clone())
            .collect()
    }

    pub fn contains(&self, outpoint: &Outpoint) -> bool {
        self.entries.iter().any(|e| &e.utxo.outpoint == outpoint)
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for e in &self.entries {
            match e.state {
                UtxoState::Available => counts.available += 1,
                UtxoState::Reserved => counts.reserved += 1,
                UtxoState::Spent => counts.spent += 1,
            }
        }
        counts
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_core::types::TxId;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn utxo(seed: u8) -> UtxoRecord {
        UtxoRecord {
            outpoint: Outpoint { txid: TxId::from_bytes([seed; 32]), index: 0 },
            amount_sompi: 100_000_000,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<GameEvent>) -> Vec<GameEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn reserve_three_then_empty() {
        let (sink, mut rx) = EventSink::new();
        let mut pool = UtxoPool::new(sink);
        pool.add_batch(vec![utxo(1), utxo(2), utxo(3)]);
        drain(&mut rx);

        for _ in 0..3 {
            assert!(pool.reserve(0).is_some());
        }
        let events = drain(&mut rx);
        let reserved = events
            .iter()
            .filter(|e| matches!(e, GameEvent::UtxoReserved { .. }))
            .count();
        assert_eq!(reserved, 3);
        assert!(events.iter().any(|e| matches!(e, GameEvent::PoolEmpty)));

        // Fourth reserve: no entry, POOL_EMPTY again.
        assert!(pool.reserve(0).is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, GameEvent::PoolEmpty)));
    }

    #[test]
    fn stale_reservation_sweep() {
        let (sink, mut rx) = EventSink::new();
        let mut pool = UtxoPool::new(sink);
        pool.add_batch(vec![utxo(1), utxo(2)]);
        let reserved = pool.reserve(1_000).unwrap();
        drain(&mut rx);

        // 35 s later without mark_spent.
        let swept = pool.release_stale_reservations(36_000, 30_000);
        assert_eq!(swept, 1);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::UtxoReleased { outpoint } if *outpoint == reserved.outpoint
        )));
        assert_eq!(pool.counts().available, 2);
    }

    #[test]
    fn fresh_reservation_not_swept() {
        let mut pool = UtxoPool::new(EventSink::disconnected());
        pool.add(utxo(1));
        pool.reserve(1_000).unwrap();
        assert_eq!(pool.release_stale_reservations(10_000, 30_000), 0);
        assert_eq!(pool.counts().reserved, 1);
    }

    #[test]
    fn counts_invariant_holds_across_transitions() {
        let mut pool = UtxoPool::new(EventSink::disconnected());
        pool.add_batch(vec![utxo(1), utxo(2), utxo(3)]);

        let r = pool.reserve(0).unwrap();
        assert_eq!(pool.counts().total(), pool.size());
        pool.mark_spent(&r.outpoint);
        assert_eq!(pool.counts().total(), pool.size());
        let r2 = pool.reserve(0).unwrap();
        pool.release(&r2.outpoint);
        assert_eq!(pool.counts().total(), pool.size());
        assert_eq!(
            pool.counts(),
            PoolCounts { available: 2, reserved: 0, spent: 1 }
        );
    }

    #[test]
    fn reserve_never_returns_reserved_or_spent() {
        let mut pool = UtxoPool::new(EventSink::disconnected());
        pool.add_batch(vec![utxo(1), utxo(2)]);
        let a = pool.reserve(0).unwrap();
        let b = pool.reserve(0).unwrap();
        assert_ne!(a.outpoint, b.outpoint);
        pool.mark_spent(&a.outpoint);
        pool.release(&b.outpoint);
        // Only b is available again.
        assert_eq!(pool.reserve(0).unwrap().outpoint, b.outpoint);
        assert!(pool.reserve(0).is_none());
    }

    #[test]
    fn prune_drops_only_spent() {
        let mut pool = UtxoPool::new(EventSink::disconnected());
        pool.add_batch(vec![utxo(1), utxo(2)]);
        let r = pool.reserve(0).unwrap();
        pool.mark_spent(&r.outpoint);
        assert_eq!(pool.prune_spent(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn duplicate_outpoints_ignored() {
        let mut pool = UtxoPool::new(EventSink::disconnected());
        pool.add(utxo(1));
        pool.add(utxo(1));
        assert_eq!(pool.size(), 1);
    }
}

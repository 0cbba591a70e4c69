use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kktp_adapter::traits::LedgerAdapter;
use kktp_core::constants::{
    MAX_INPUTS_PER_TX, MAX_SMALL_UTXOS, TARGET_UTXO_COUNT, USABLE_THRESHOLD_SOMPI,
    UTXO_CHECK_INTERVAL_MS,
};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{now_ms, Outpoint, UtxoRecord};

use crate::pool::UtxoPool;

#[derive(Clone, Debug)]
pub struct UtxoManagerConfig {
    pub interval_ms: u64,
    /// Minimum amount (sompi) for an output to count as usable.
    pub usable_threshold: u64,
    /// Replenishment target for usable outputs.
    pub target_utxo_count: usize,
    pub auto_consolidate: bool,
    /// Auto-consolidation trigger: more small outputs than this.
    pub max_small_utxos: usize,
    /// Consolidation batch bound; halved on mass-limit errors.
    pub max_inputs_per_tx: usize,
    /// Fee model: inputs·per_in + outputs·per_out + priority.
    pub fee_per_input: u64,
    pub fee_per_output: u64,
    pub fee_priority: u64,
}

impl Default for UtxoManagerConfig {
    fn default() -> Self {
        Self {
            interval_ms: UTXO_CHECK_INTERVAL_MS,
            usable_threshold: USABLE_THRESHOLD_SOMPI,
            target_utxo_count: TARGET_UTXO_COUNT,
            auto_consolidate: true,
            max_small_utxos: MAX_SMALL_UTXOS,
            max_inputs_per_tx: MAX_INPUTS_PER_TX,
            fee_per_input: 1_100,
            fee_per_output: 500,
            fee_priority: 1_000,
        }
    }
}

/// Keeps the pool stocked with pre-split usable UTXOs so anchor sends never
/// wait on wallet-side coin selection.
pub struct UtxoManager {
    adapter: Arc<dyn LedgerAdapter>,
    pool: Arc<Mutex<UtxoPool>>,
    config: UtxoManagerConfig,
    check_in_progress: AtomicBool,
    /// Outpoints this session has already fed into a submission; the adapter
    /// may still report them until the spend confirms.
    spent_in_session: Mutex<HashSet<Outpoint>>,
    consolidate_batch: AtomicUsize,
    sink: EventSink,
}

impl UtxoManager {
    pub fn new(
        adapter: Arc<dyn LedgerAdapter>,
        pool: Arc<Mutex<UtxoPool>>,
        config: UtxoManagerConfig,
        sink: EventSink,
    ) -> Self {
        let consolidate_batch = AtomicUsize::new(config.max_inputs_per_tx);
        Self {
            adapter,
            pool,
            config,
            check_in_progress: AtomicBool::new(false),
            spent_in_session: Mutex::new(HashSet::new()),
            consolidate_batch,
            sink,
        }
    }

    /// Record outpoints consumed by a submission so the next check does not
    /// double-spend them while the wallet still reports them.
    pub fn note_spent(&self, outpoints: impl IntoIterator<Item = Outpoint>) {
        let mut spent = self.spent_in_session.lock().unwrap();
        spent.extend(outpoints);
    }

    fn estimate_fee(&self, inputs: usize, outputs: usize) -> u64 {
        inputs as u64 * self.config.fee_per_input
            + outputs as u64 * self.config.fee_per_output
            + self.config.fee_priority
    }

    /// One policy evaluation. Serialised: a second caller while one is
    /// running returns immediately.
    pub async fn run_check(&self) -> Result<(), KktpError> {
        if self
            .check_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("UTXO check already in progress; skipping");
            return Ok(());
        }
        let result = self.run_check_inner().await;
        self.check_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_check_inner(&self) -> Result<(), KktpError> {
        let mut utxos = self.adapter.utxos().await?;
        {
            let spent = self.spent_in_session.lock().unwrap();
            utxos.retain(|u| !spent.contains(&u.outpoint));
        }

        let usable: Vec<&UtxoRecord> = utxos
            .iter()
            .filter(|u| u.amount_sompi >= self.config.usable_threshold)
            .collect();
        let small: Vec<UtxoRecord> = utxos
            .iter()
            .filter(|u| u.amount_sompi < self.config.usable_threshold)
            .cloned()
            .collect();

        if usable.is_empty() && !utxos.is_empty() {
            self.emergency_consolidate(utxos.clone()).await?;
        } else if self.config.auto_consolidate && small.len() > self.config.max_small_utxos {
            self.consolidate_round(small).await?;
        } else if usable.len() < self.config.target_utxo_count {
            self.try_split(&utxos, usable.len()).await?;
        }

        self.refresh_pool().await?;
        Ok(())
    }

    /// Everything into one output, so at least one usable UTXO exists.
    async fn emergency_consolidate(&self, mut utxos: Vec<UtxoRecord>) -> Result<(), KktpError> {
        if utxos.len() == 1 {
            let have: u64 = utxos.iter().map(|u| u.amount_sompi).sum();
            warn!(have, "single sub-threshold UTXO; cannot consolidate");
            self.sink.emit(GameEvent::LowFunds { have_sompi: have });
            return Err(KktpError::InsufficientFunds {
                need: self.config.usable_threshold,
                have,
            });
        }
        utxos.truncate(self.config.max_inputs_per_tx);
        info!(inputs = utxos.len(), "emergency consolidation");
        self.note_spent(utxos.iter().map(|u| u.outpoint.clone()));
        self.adapter.submit_consolidate(utxos).await?;
        Ok(())
    }

    /// One smallest-first consolidation round; batch size backs off on
    /// mass-limit errors.
    async fn consolidate_round(&self, mut small: Vec<UtxoRecord>) -> Result<(), KktpError> {
        small.sort_by_key(|u| u.amount_sompi);
        let batch_size = self.consolidate_batch.load(Ordering::SeqCst).max(2);
        small.truncate(batch_size);
        info!(inputs = small.len(), "consolidating small UTXOs");
        let outpoints: Vec<Outpoint> = small.iter().map(|u| u.outpoint.clone()).collect();
        match self.adapter.submit_consolidate(small).await {
            Ok(_) => {
                self.note_spent(outpoints);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("mass") {
                    let reduced = (batch_size / 2).max(2);
                    warn!(from = batch_size, to = reduced, "mass limit hit; reducing batch");
                    self.consolidate_batch.store(reduced, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Split the largest UTXO when the math creates strictly more usable
    /// outputs than currently exist; otherwise log and skip.
    async fn try_split(&self, utxos: &[UtxoRecord], usable_now: usize) -> Result<(), KktpError> {
        let Some(largest) = utxos.iter().max_by_key(|u| u.amount_sompi) else {
            return Ok(());
        };
        let wanted = self.config.target_utxo_count - usable_now;
        // Outputs the largest input can fund at the threshold, fee included.
        let mut n = wanted.min(
            (largest.amount_sompi / self.config.usable_threshold).max(1) as usize,
        );
        while n > 0 {
            let fee = self.estimate_fee(1, n + 1);
            if largest.amount_sompi >= n as u64 * self.config.usable_threshold + fee {
                break;
            }
            n -= 1;
        }
        // Spending one usable input must net strictly more usable outputs.
        let spends_usable = largest.amount_sompi >= self.config.usable_threshold;
        let net_gain = if spends_usable { n > 1 } else { n > 0 };
        if !net_gain {
            debug!(
                amount = largest.amount_sompi,
                wanted, "split skipped: no net gain in usable outputs"
            );
            return Ok(());
        }

        info!(outputs = n, "splitting for pool replenishment");
        self.note_spent([largest.outpoint.clone()]);
        self.adapter
            .submit_split(
                vec![largest.clone()],
                vec![self.config.usable_threshold; n],
            )
            .await?;
        Ok(())
    }

    /// Feed newly-seen usable UTXOs into the pool.
    async fn refresh_pool(&self) -> Result<(), KktpError> {
        let mut utxos = self.adapter.utxos().await?;
        {
            let spent = self.spent_in_session.lock().unwrap();
            utxos.retain(|u| !spent.contains(&u.outpoint));
        }
        let mut pool = self.pool.lock().unwrap();
        for utxo in utxos {
            if utxo.amount_sompi >= self.config.usable_threshold && !pool.contains(&utxo.outpoint) {
                pool.add(utxo);
            }
        }
        pool.sweep(now_ms());
        Ok(())
    }

    /// Spawn the heartbeat loop. The task stops when `shutdown` flips true.
    pub fn spawn_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("UTXO heartbeat stopping");
                            return;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.run_check().await {
                            warn!(error = %e, "UTXO check failed");
                        }
                    }
                }
            }
        })
    }
}

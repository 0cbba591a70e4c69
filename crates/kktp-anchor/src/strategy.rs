use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kktp_adapter::traits::LedgerAdapter;
use kktp_core::constants::HEARTBEAT_INTERVAL_MS;
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{now_ms, BlockHash, TxId, UtxoRecord, VrfOutput};
use kktp_crypto::keys::SigKeypair;
use kktp_utxo::pool::UtxoPool;

use crate::codec::{FinalAnchor, GenesisAnchor, HeartbeatAnchor, PackedEntry};
use crate::vault::{MoveRecord, MoveVault};
use crate::vrf::VrfManager;

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorState {
    Idle,
    GenesisPending,
    Active,
    FinalPending,
    Done,
    GenesisFailed,
    AnchorFailed,
}

impl AnchorState {
    fn name(self) -> &'static str {
        match self {
            AnchorState::Idle => "IDLE",
            AnchorState::GenesisPending => "GENESIS_PENDING",
            AnchorState::Active => "ACTIVE",
            AnchorState::FinalPending => "FINAL_PENDING",
            AnchorState::Done => "DONE",
            AnchorState::GenesisFailed => "GENESIS_FAILED",
            AnchorState::AnchorFailed => "ANCHOR_FAILED",
        }
    }
}

/// Terminal game summary carried by the final anchor.
#[derive(Clone, Copy, Debug, Default)]
pub struct FinalState {
    pub final_score: u64,
    pub coins_collected: u32,
}

#[derive(Clone, Debug)]
pub struct GenesisSeedParams {
    pub start_daa_score: u64,
    pub end_daa_score: u64,
    pub qrng_pulse_index: u64,
    pub beacon_hash: BlockHash,
    pub initial_vrf: VrfOutput,
}

#[derive(Clone, Debug)]
struct PendingFinal {
    merkle_root: [u8; 32],
    end_state: FinalState,
    total_moves: u32,
}

struct StrategyInner {
    state: AnchorState,
    genesis_tx: Option<TxId>,
    last_anchor: Option<TxId>,
    chain: Vec<TxId>,
    pending_final: Option<PendingFinal>,
}

/// Drives one player's linear anchor chain: genesis, coalescing heartbeats,
/// final. Each submission rides a pre-reserved pool UTXO so a send never
/// waits on coin selection.
pub struct AnchorStrategy {
    adapter: Arc<dyn LedgerAdapter>,
    pool: Arc<Mutex<UtxoPool>>,
    keypair: Arc<SigKeypair>,
    sink: EventSink,
    game_tag_hex: String,
    player_tag: String,
    heartbeat_interval_ms: u64,
    inner: Mutex<StrategyInner>,
}

impl AnchorStrategy {
    pub fn new(
        adapter: Arc<dyn LedgerAdapter>,
        pool: Arc<Mutex<UtxoPool>>,
        keypair: Arc<SigKeypair>,
        game_tag_hex: String,
        player_tag: String,
        sink: EventSink,
    ) -> Self {
        Self {
            adapter,
            pool,
            keypair,
            sink,
            game_tag_hex,
            player_tag,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            inner: Mutex::new(StrategyInner {
                state: AnchorState::Idle,
                genesis_tx: None,
                last_anchor: None,
                chain: Vec::new(),
                pending_final: None,
            }),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn state(&self) -> AnchorState {
        self.inner.lock().unwrap().state
    }

    pub fn genesis_tx_id(&self) -> Option<TxId> {
        self.inner.lock().unwrap().genesis_tx.clone()
    }

    pub fn last_anchor_tx_id(&self) -> Option<TxId> {
        self.inner.lock().unwrap().last_anchor.clone()
    }

    /// The linear chain `[genesis, h₁, …, final?]` submitted so far.
    pub fn anchor_chain(&self) -> Vec<TxId> {
        self.inner.lock().unwrap().chain.clone()
    }

    fn transition(&self, from: &[AnchorState], to: AnchorState, op: &'static str) -> Result<(), KktpError> {
        let mut inner = self.inner.lock().unwrap();
        if !from.contains(&inner.state) {
            return Err(KktpError::AnchorBadState { op, state: inner.state.name() });
        }
        debug!(from = inner.state.name(), to = to.name(), "anchor transition");
        inner.state = to;
        Ok(())
    }

    fn reserve_utxo(&self, op: &str) -> Result<UtxoRecord, KktpError> {
        let reserved = self.pool.lock().unwrap().reserve(now_ms());
        reserved.ok_or_else(|| {
            warn!(op, "anchor blocked: UTXO pool empty");
            self.sink.emit(GameEvent::AnchorFailed {
                reason: format!("{op}: UTXO pool empty"),
                retry_needed: true,
            });
            KktpError::PoolEmpty
        })
    }

    async fn submit(&self, utxo: UtxoRecord, payload: Vec<u8>, op: &'static str) -> Result<TxId, KktpError> {
        let outpoint = utxo.outpoint.clone();
        match self.adapter.submit_payload_tx(Some(utxo), payload).await {
            Ok(tx_id) => {
                self.pool.lock().unwrap().mark_spent(&outpoint);
                self.sink.emit(GameEvent::AnchorSent { tx_id: tx_id.clone() });
                Ok(tx_id)
            }
            Err(e) => {
                // Submission never left the node: the UTXO is reusable.
                self.pool.lock().unwrap().release(&outpoint);
                warn!(error = %e, op, "anchor submission failed");
                self.sink.emit(GameEvent::AnchorFailed {
                    reason: e.to_string(),
                    retry_needed: true,
                });
                Err(e)
            }
        }
    }

    // ── Genesis ──────────────────────────────────────────────────────────────

    /// Publish the genesis anchor. Allowed from IDLE (or a failed genesis).
    pub async fn anchor_genesis_seed(&self, params: GenesisSeedParams) -> Result<TxId, KktpError> {
        self.transition(
            &[AnchorState::Idle, AnchorState::GenesisFailed],
            AnchorState::GenesisPending,
            "anchor_genesis_seed",
        )?;

        let result: Result<TxId, KktpError> = async {
            let utxo = self.reserve_utxo("genesis")?;
            let payload = GenesisAnchor::pack(
                &self.game_tag_hex,
                &self.player_tag,
                params.start_daa_score,
                params.end_daa_score,
                params.qrng_pulse_index,
                &params.beacon_hash,
                &params.initial_vrf,
                &self.keypair,
            )?;
            self.submit(utxo, payload, "genesis").await
        }
        .await;

        match result {
            Ok(tx_id) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.genesis_tx = Some(tx_id.clone());
                    inner.last_anchor = Some(tx_id.clone());
                    inner.chain.push(tx_id.clone());
                    inner.state = AnchorState::Active;
                }
                info!(tx_id = %tx_id, "genesis anchored");
                self.sink.emit(GameEvent::GenesisAnchored { tx_id: tx_id.clone() });
                Ok(tx_id)
            }
            Err(e) => {
                self.inner.lock().unwrap().state = AnchorState::GenesisFailed;
                Err(e)
            }
        }
    }

    // ── Heartbeats ───────────────────────────────────────────────────────────

    fn entries_for(records: &[MoveRecord]) -> Vec<PackedEntry> {
        records
            .iter()
            .map(|r| match &r.descriptor.payload {
                kktp_core::types::MovePayload::Move { x, y, z } => PackedEntry::Move {
                    code: r.action_code,
                    x: *x,
                    y: *y,
                    z: *z,
                    time_delta: r.descriptor.time_delta,
                    vrf_fragment: r.vrf_fragment,
                },
                kktp_core::types::MovePayload::Lane { lane } => PackedEntry::Event {
                    code: r.action_code,
                    lane: *lane,
                    time_delta: r.descriptor.time_delta,
                    vrf_fragment: r.vrf_fragment,
                },
            })
            .collect()
    }

    /// Anchor every move the vault holds past its watermark. A failed round
    /// leaves the watermark alone, so the next round coalesces the batch.
    /// Returns the heartbeat txid, or None when there was nothing to anchor.
    pub async fn send_heartbeat_anchor(
        &self,
        vault: &Mutex<MoveVault>,
        vrf_tail: [u8; 4],
    ) -> Result<Option<TxId>, KktpError> {
        let (records, prev) = {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.state, AnchorState::Active | AnchorState::AnchorFailed) {
                return Ok(None);
            }
            let prev = inner
                .last_anchor
                .clone()
                .ok_or_else(|| KktpError::Other("heartbeat before genesis".into()))?;
            (vault.lock().unwrap().unanchored_moves().to_vec(), prev)
        };
        if records.is_empty() {
            return Ok(None);
        }

        let entries = Self::entries_for(&records);
        let result: Result<TxId, KktpError> = async {
            let utxo = self.reserve_utxo("heartbeat")?;
            let payload = HeartbeatAnchor::pack(
                &self.game_tag_hex,
                &prev,
                &entries,
                vrf_tail,
                &self.keypair,
            )?;
            self.submit(utxo, payload, "heartbeat").await
        }
        .await;

        match result {
            Ok(tx_id) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_anchor = Some(tx_id.clone());
                    inner.chain.push(tx_id.clone());
                    inner.state = AnchorState::Active;
                }
                vault.lock().unwrap().mark_anchored(records.len());
                info!(tx_id = %tx_id, moves = records.len(), "heartbeat anchored");
                self.sink.emit(GameEvent::HeartbeatAnchored {
                    tx_id: tx_id.clone(),
                    move_count: records.len() as u32,
                });
                Ok(Some(tx_id))
            }
            Err(e) => {
                self.inner.lock().unwrap().state = AnchorState::AnchorFailed;
                Err(e)
            }
        }
    }

    /// Arm the heartbeat cadence. Ticks until shutdown or the final anchor.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        vault: Arc<Mutex<MoveVault>>,
        vrf: Arc<Mutex<VrfManager>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(self.heartbeat_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("heartbeat loop stopping");
                            return;
                        }
                    }
                    _ = tick.tick() => {
                        if matches!(self.state(), AnchorState::Done) {
                            return;
                        }
                        let tail = {
                            let vrf = vrf.lock().unwrap();
                            match vrf.current_output() {
                                Some(out) => {
                                    let mut tail = [0u8; 4];
                                    tail.copy_from_slice(&out.as_bytes()[..4]);
                                    tail
                                }
                                None => continue,
                            }
                        };
                        if let Err(e) = self.send_heartbeat_anchor(&vault, tail).await {
                            debug!(error = %e, "heartbeat round skipped");
                        }
                    }
                }
            }
        })
    }

    // ── Final ────────────────────────────────────────────────────────────────

    /// Publish the final anchor. ACTIVE → FINAL_PENDING → DONE.
    pub async fn anchor_final_state(
        &self,
        merkle_root: [u8; 32],
        end_state: FinalState,
        total_moves: u32,
    ) -> Result<TxId, KktpError> {
        self.transition(
            &[AnchorState::Active, AnchorState::AnchorFailed],
            AnchorState::FinalPending,
            "anchor_final_state",
        )?;
        self.inner.lock().unwrap().pending_final =
            Some(PendingFinal { merkle_root, end_state, total_moves });
        self.submit_final().await
    }

    /// Retry a failed final submission with the stored parameters.
    pub async fn retry_final_anchor(&self) -> Result<TxId, KktpError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != AnchorState::FinalPending || inner.pending_final.is_none() {
                return Err(KktpError::AnchorBadState {
                    op: "retry_final_anchor",
                    state: inner.state.name(),
                });
            }
        }
        self.submit_final().await
    }

    async fn submit_final(&self) -> Result<TxId, KktpError> {
        let (pending, prev) = {
            let inner = self.inner.lock().unwrap();
            let pending = inner
                .pending_final
                .clone()
                .ok_or_else(|| KktpError::Other("no pending final".into()))?;
            let prev = inner
                .last_anchor
                .clone()
                .ok_or_else(|| KktpError::Other("final before genesis".into()))?;
            (pending, prev)
        };

        let result: Result<TxId, KktpError> = async {
            let utxo = self.reserve_utxo("final")?;
            let payload = FinalAnchor::pack(
                &self.game_tag_hex,
                &prev,
                &pending.merkle_root,
                pending.end_state.final_score,
                pending.end_state.coins_collected,
                pending.total_moves,
                &self.keypair,
            )?;
            self.submit(utxo, payload, "final").await
        }
        .await;

        match result {
            Ok(tx_id) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_anchor = Some(tx_id.clone());
                    inner.chain.push(tx_id.clone());
                    inner.state = AnchorState::Done;
                    inner.pending_final = None;
                }
                info!(tx_id = %tx_id, "final anchored");
                self.sink.emit(GameEvent::AnchorComplete { tx_id: tx_id.clone() });
                Ok(tx_id)
            }
            // State stays FINAL_PENDING so retry_final_anchor applies.
            Err(e) => Err(e),
        }
    }
}

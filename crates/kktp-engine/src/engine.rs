use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kktp_adapter::traits::LedgerAdapter;
use kktp_anchor::audit::{AuditVerdict, DagAuditor, ReconstructedChain};
use kktp_anchor::codec::ActionRegistry;
use kktp_anchor::processor::{MoveProcessor, OpponentMove, ProcessedMove, ValidationOutcome};
use kktp_anchor::strategy::{AnchorStrategy, FinalState};
use kktp_anchor::vault::{MoveVault, VaultSnapshot};
use kktp_anchor::vrf::VrfManager;
use kktp_anchor::EntropyProvider;
use kktp_core::constants::{
    HEARTBEAT_INTERVAL_MS, KKTP_ANCHOR_PREFIX, PREFIX_GAME_END_HEX, PREFIX_GAME_START_HEX,
    PREFIX_HEARTBEAT_HEX,
};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{
    now_ms, EngineState, LobbyState, MovePayload, PubSig, Sid, TxId,
};
use kktp_crypto::hash::game_id_tag_hex;
use kktp_crypto::keys::{MasterKey, SigKeypair};
use kktp_index::indexer::{Indexer, IndexerConfig};
use kktp_index::scanner::{PrefixFilter, Scanner, ScannerConfig};
use kktp_lobby::lobby::LobbyManager;
use kktp_session::anchors::{parse_anchor_payload, KktpAnchor};
use kktp_session::identity::IdentityManager;
use kktp_session::manager::SessionManager;
use kktp_session::store::SessionStore;
use kktp_utxo::manager::{UtxoManager, UtxoManagerConfig};
use kktp_utxo::pool::UtxoPool;

use crate::pump::{spawn_pump, PumpDeps};

// ── Config ───────────────────────────────────────────────────────────────────

/// Named per-operation timeouts (ms). Every network call the facade makes is
/// wrapped in exactly one of these.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub init_ms: u64,
    pub connect_ms: u64,
    pub wallet_ms: u64,
    pub balance_ms: u64,
    pub vrf_ms: u64,
    pub block_fetch_ms: u64,
    pub qrng_ms: u64,
    pub lobby_create_ms: u64,
    pub lobby_join_ms: u64,
    pub disconnect_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_ms: 30_000,
            connect_ms: 20_000,
            wallet_ms: 15_000,
            balance_ms: 10_000,
            vrf_ms: 15_000,
            block_fetch_ms: 10_000,
            qrng_ms: 10_000,
            lobby_create_ms: 30_000,
            lobby_join_ms: 45_000,
            disconnect_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub auto_accept_joins: bool,
    pub heartbeat_interval_ms: u64,
    pub timeouts: Timeouts,
}

impl EngineConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            auto_accept_joins: true,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            timeouts: Timeouts::default(),
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct InitResult {
    pub address: String,
    pub balance_sompi: u64,
}

#[derive(Clone, Debug, Default)]
pub struct StartParams {
    pub game_id: Option<String>,
    pub player_id: Option<String>,
    pub opponent: Option<PubSig>,
    pub game_length_secs: Option<u64>,
    pub custom_move_actions: Vec<String>,
    pub custom_event_actions: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct GameStart {
    pub game_id: String,
    pub game_id_tag_hex: String,
    pub genesis_block_hash_hex: String,
    pub player_id: String,
    pub player_pub_sig: PubSig,
    pub genesis_anchor: TxId,
}

#[derive(Clone, Debug)]
pub struct GameEnd {
    pub success: bool,
    pub tx_id: TxId,
    pub audit: kktp_anchor::processor::AuditData,
}

#[derive(Clone, Debug)]
pub struct RandomResult {
    pub value: String,
    pub number: u64,
    pub proof: String,
}

#[derive(Clone, Debug)]
pub struct LobbyListing {
    pub lobby_id: Sid,
    pub lobby_name: String,
    pub host_pub_sig: PubSig,
    pub max_members: usize,
}

// ── Internal wiring ──────────────────────────────────────────────────────────

/// The session and lobby layers share one lock: lobby calls need `&mut` both.
pub(crate) struct Comms {
    pub sessions: SessionManager,
    pub lobby: LobbyManager,
}

pub(crate) struct GameCtx {
    pub processor: Arc<MoveProcessor>,
    pub game_id: String,
    pub game_tag_hex: String,
    pub player_id: String,
    pub genesis_block_hash_hex: String,
}

async fn timed<T>(
    op: &'static str,
    ms: u64,
    fut: impl std::future::Future<Output = Result<T, KktpError>>,
) -> Result<T, KktpError> {
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(KktpError::OperationTimeout { op, ms }),
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// The single entry point: wires indexer, scanner, UTXO pool, anchor stack,
/// sessions, and lobby behind one lifecycle.
pub struct GameEngine {
    adapter: Arc<dyn LedgerAdapter>,
    config: EngineConfig,
    sink: EventSink,
    events: Mutex<Option<mpsc::UnboundedReceiver<GameEvent>>>,

    state: Mutex<EngineState>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    entropy: Arc<EntropyProvider>,
    pool: Arc<Mutex<UtxoPool>>,
    indexer: Mutex<Option<Arc<Indexer>>>,
    utxo_manager: Mutex<Option<Arc<UtxoManager>>>,
    comms: Mutex<Option<Arc<AsyncMutex<Comms>>>>,
    game: Arc<Mutex<Option<GameCtx>>>,
}

impl GameEngine {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, config: EngineConfig) -> Self {
        let (sink, events) = EventSink::new();
        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Mutex::new(UtxoPool::new(sink.clone())));
        Self {
            adapter,
            config,
            sink,
            events: Mutex::new(Some(events)),
            state: Mutex::new(EngineState::Uninitialized),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            entropy: EntropyProvider::new(),
            pool,
            indexer: Mutex::new(None),
            utxo_manager: Mutex::new(None),
            comms: Mutex::new(None),
            game: Arc::new(Mutex::new(None)),
        }
    }

    /// The event stream. Callable once; the stream spans the engine lifetime.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<GameEvent>> {
        self.events.lock().unwrap().take()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock().unwrap();
        debug!(from = ?*state, to = ?next, "engine state");
        *state = next;
    }

    fn guard(&self, expected: EngineState, op: &'static str) -> Result<(), KktpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(KktpError::ShuttingDown);
        }
        let state = *self.state.lock().unwrap();
        if state != expected {
            debug!(op, ?state, "operation in wrong engine state");
            return Err(KktpError::EngineBadState(match state {
                EngineState::Uninitialized => "UNINITIALIZED",
                EngineState::Initializing => "INITIALIZING",
                EngineState::Ready => "READY",
                EngineState::InGame => "IN_GAME",
                EngineState::Ending => "ENDING",
                EngineState::Error => "ERROR",
            }));
        }
        Ok(())
    }

    fn comms(&self) -> Result<Arc<AsyncMutex<Comms>>, KktpError> {
        self.comms
            .lock()
            .unwrap()
            .clone()
            .ok_or(KktpError::EngineBadState("UNINITIALIZED"))
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    // ── init ─────────────────────────────────────────────────────────────────

    /// Bring the whole stack up: stores, scanner, entropy, UTXO heartbeat,
    /// session/lobby layers, and the payload pump.
    pub async fn init(&self) -> Result<InitResult, KktpError> {
        self.guard(EngineState::Uninitialized, "init")?;
        self.set_state(EngineState::Initializing);

        let result = timed("init", self.config.timeouts.init_ms, self.init_inner()).await;
        match result {
            Ok(out) => {
                self.set_state(EngineState::Ready);
                info!(address = %out.address, "engine ready");
                Ok(out)
            }
            Err(e) => {
                self.set_state(EngineState::Error);
                Err(e)
            }
        }
    }

    async fn init_inner(&self) -> Result<InitResult, KktpError> {
        let address = self.adapter.receive_address().await?;
        let balance = self.adapter.balance().await?;

        // Indexer + scanner watching all KKTP traffic: the text prefix plus
        // the three binary anchor prefixes.
        let indexer = Arc::new(Indexer::open(
            self.config.data_dir.join("cache"),
            IndexerConfig::default(),
            self.sink.clone(),
        )?);
        *self.indexer.lock().unwrap() = Some(Arc::clone(&indexer));

        let kktp_text_prefix = hex::encode(kktp_core::constants::KKTP_MAILBOX_PREFIX.as_bytes());
        let scanner_config = ScannerConfig {
            prefixes: vec![
                PrefixFilter::starts_with(kktp_text_prefix),
                PrefixFilter::starts_with(PREFIX_GAME_START_HEX),
                PrefixFilter::starts_with(PREFIX_HEARTBEAT_HEX),
                PrefixFilter::starts_with(PREFIX_GAME_END_HEX),
            ],
            addresses: Default::default(),
        };
        let scanner = Scanner::new(
            Arc::clone(&self.adapter),
            Arc::clone(&indexer),
            scanner_config,
            self.sink.clone(),
            self.shutdown_tx.subscribe(),
        );
        let matches = scanner.subscribe_matches();
        self.track(tokio::spawn(scanner.run()));

        // Entropy provider follows the live block stream.
        self.track(
            self.entropy
                .spawn(Arc::clone(&self.adapter), self.shutdown_tx.subscribe()),
        );

        // UTXO manager heartbeat keeps the pool stocked.
        let utxo_manager = Arc::new(UtxoManager::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.pool),
            UtxoManagerConfig::default(),
            self.sink.clone(),
        ));
        timed("wallet", self.config.timeouts.wallet_ms, utxo_manager.run_check()).await?;
        *self.utxo_manager.lock().unwrap() = Some(Arc::clone(&utxo_manager));
        self.track(Arc::clone(&utxo_manager).spawn_heartbeat(self.shutdown_tx.subscribe()));

        // Session + lobby layers over the persistent session store.
        let store = Arc::new(SessionStore::open(self.config.data_dir.join("sessions"))?);
        let identity = IdentityManager::new(MasterKey::generate(), store);
        let comms = Arc::new(AsyncMutex::new(Comms {
            sessions: SessionManager::new(identity, self.sink.clone()),
            lobby: LobbyManager::new(self.sink.clone(), self.config.auto_accept_joins),
        }));
        *self.comms.lock().unwrap() = Some(Arc::clone(&comms));

        // The pump routes every scanner match to the right layer.
        self.track(spawn_pump(PumpDeps {
            adapter: Arc::clone(&self.adapter),
            comms,
            game: Arc::clone(&self.game),
            utxo_manager,
            matches,
            shutdown: self.shutdown_tx.subscribe(),
        }));

        // Indexer maintenance cadence.
        {
            let indexer = Arc::clone(&indexer);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.track(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = indexer.flush().await;
                                return;
                            }
                        }
                        _ = tick.tick() => {
                            let _ = indexer.flush().await;
                            let _ = indexer.evict().await;
                        }
                    }
                }
            }));
        }

        self.sink.emit(GameEvent::BalanceChanged { balance_sompi: balance });
        Ok(InitResult { address, balance_sompi: balance })
    }

    // ── Game lifecycle ───────────────────────────────────────────────────────

    /// Wait until a beacon block hash is available, bounded by the VRF
    /// timeout.
    async fn wait_for_beacon(&self) -> Result<(), KktpError> {
        if self.entropy.cached_block_hash().is_some() {
            return Ok(());
        }
        let mut rx = self.entropy.subscribe();
        timed("vrf", self.config.timeouts.vrf_ms, async {
            loop {
                if rx.borrow_and_update().is_some() {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| KktpError::VrfSyncRequired)?;
            }
        })
        .await
    }

    pub async fn start_game(&self, params: StartParams) -> Result<GameStart, KktpError> {
        self.guard(EngineState::Ready, "start_game")?;

        let game_id = params.game_id.unwrap_or_else(|| {
            let mut raw = [0u8; 8];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            format!("game-{}", hex::encode(raw))
        });
        let game_tag_hex = game_id_tag_hex(&game_id);
        let player_id = params.player_id.unwrap_or_else(|| "p1".to_string());

        let mut registry = ActionRegistry::default_set();
        for action in &params.custom_move_actions {
            registry.register_move(action)?;
        }
        for action in &params.custom_event_actions {
            registry.register_event(action)?;
        }

        let keypair = Arc::new(SigKeypair::generate());
        let vrf = Arc::new(Mutex::new(VrfManager::new(
            Arc::clone(&keypair),
            Arc::clone(&self.entropy),
            self.sink.clone(),
        )));
        let vault = Arc::new(Mutex::new(MoveVault::new()));
        let strategy = Arc::new(
            AnchorStrategy::new(
                Arc::clone(&self.adapter),
                Arc::clone(&self.pool),
                Arc::clone(&keypair),
                game_tag_hex.clone(),
                player_id.clone(),
                self.sink.clone(),
            )
            .with_heartbeat_interval(self.config.heartbeat_interval_ms),
        );
        let processor = Arc::new(MoveProcessor::new(
            registry,
            Arc::clone(&vrf),
            Arc::clone(&vault),
            Arc::clone(&strategy),
            game_tag_hex.clone(),
            self.sink.clone(),
        ));
        processor.start();
        if let Some(opponent) = params.opponent {
            processor.set_opponent(opponent);
        }

        self.wait_for_beacon().await?;
        let (pulse_index, pulse_data) =
            timed("qrng", self.config.timeouts.qrng_ms, self.adapter.fetch_qrng_pulse()).await?;
        let start_daa =
            timed("block-fetch", self.config.timeouts.block_fetch_ms, self.adapter.daa_score())
                .await?;
        let end_daa = start_daa + params.game_length_secs.unwrap_or(600);

        let (genesis_tx, genesis_block) = processor
            .anchor_genesis_seed(start_daa, end_daa, pulse_index, &pulse_data)
            .await?;

        // Arm the heartbeat cadence for this game.
        self.track(Arc::clone(&strategy).spawn_heartbeat(
            vault,
            vrf,
            self.shutdown_tx.subscribe(),
        ));

        let genesis_block_hash_hex = genesis_block.to_hex();
        *self.game.lock().unwrap() = Some(GameCtx {
            processor,
            game_id: game_id.clone(),
            game_tag_hex: game_tag_hex.clone(),
            player_id: player_id.clone(),
            genesis_block_hash_hex: genesis_block_hash_hex.clone(),
        });
        self.set_state(EngineState::InGame);
        self.sink.emit(GameEvent::GameReady { game_id: game_id.clone() });

        Ok(GameStart {
            game_id,
            game_id_tag_hex: game_tag_hex,
            genesis_block_hash_hex,
            player_id,
            player_pub_sig: keypair.public.clone(),
            genesis_anchor: genesis_tx,
        })
    }

    /// `(game_id, game_tag_hex, player_id, genesis_block_hash_hex)` of the
    /// game in progress.
    pub fn current_game(&self) -> Option<(String, String, String, String)> {
        self.game.lock().unwrap().as_ref().map(|ctx| {
            (
                ctx.game_id.clone(),
                ctx.game_tag_hex.clone(),
                ctx.player_id.clone(),
                ctx.genesis_block_hash_hex.clone(),
            )
        })
    }

    fn processor(&self) -> Result<Arc<MoveProcessor>, KktpError> {
        self.game
            .lock()
            .unwrap()
            .as_ref()
            .map(|ctx| Arc::clone(&ctx.processor))
            .ok_or(KktpError::EngineBadState("no game in progress"))
    }

    pub fn record_move(&self, action: &str, payload: MovePayload) -> Result<ProcessedMove, KktpError> {
        self.guard(EngineState::InGame, "record_move")?;
        self.processor()?.process_local_move(action, payload, now_ms())
    }

    pub fn record_event(&self, event_type: &str, data: serde_json::Value) -> Result<(), KktpError> {
        self.guard(EngineState::InGame, "record_event")?;
        self.processor()?.process_game_event(event_type, data, now_ms());
        Ok(())
    }

    pub fn receive_opponent_move(&self, incoming: &OpponentMove) -> Result<ValidationOutcome, KktpError> {
        self.guard(EngineState::InGame, "receive_opponent_move")?;
        Ok(self.processor()?.receive_opponent_move(incoming))
    }

    /// Verifiable randomness from the VRF chain head; never disturbs the
    /// move sequence.
    pub fn get_random(&self, seed: Option<&[u8]>) -> Result<RandomResult, KktpError> {
        self.guard(EngineState::InGame, "get_random")?;
        let (output, number, proof) = self.processor()?.get_random(seed)?;
        Ok(RandomResult { value: output.to_hex(), number, proof: hex::encode(proof) })
    }

    /// Fisher–Yates over the VRF randomness stream; deterministic given the
    /// chain head and beacon.
    pub fn shuffle<T: Clone>(&self, items: &[T]) -> Result<Vec<T>, KktpError> {
        let mut out = items.to_vec();
        for i in (1..out.len()).rev() {
            let label = format!("shuffle:{i}");
            let draw = self.get_random(Some(label.as_bytes()))?.number;
            out.swap(i, (draw % (i as u64 + 1)) as usize);
        }
        Ok(out)
    }

    pub async fn end_game(&self, end_state: FinalState) -> Result<GameEnd, KktpError> {
        self.guard(EngineState::InGame, "end_game")?;
        self.set_state(EngineState::Ending);

        let processor = match self.processor() {
            Ok(p) => p,
            Err(e) => {
                self.set_state(EngineState::Error);
                return Err(e);
            }
        };
        match processor.anchor_final_state(end_state).await {
            Ok(tx_id) => {
                let audit = processor.get_audit_data();
                processor.stop();
                let game_id = self
                    .game
                    .lock()
                    .unwrap()
                    .take()
                    .map(|ctx| ctx.game_id)
                    .unwrap_or_default();
                self.set_state(EngineState::Ready);
                self.sink.emit(GameEvent::GameEnded { game_id });
                Ok(GameEnd { success: true, tx_id, audit })
            }
            Err(e) => {
                // The strategy keeps the final pending; the caller may retry.
                self.set_state(EngineState::InGame);
                Err(e)
            }
        }
    }

    /// Retry a failed final anchor (strategy kept the parameters).
    pub async fn retry_final_anchor(&self) -> Result<TxId, KktpError> {
        self.processor()?.strategy().retry_final_anchor().await
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    pub fn get_audit_data(&self) -> Result<kktp_anchor::processor::AuditData, KktpError> {
        Ok(self.processor()?.get_audit_data())
    }

    /// Reconstruct a player's chain straight from the DAG.
    pub async fn get_audit_data_from_dag(
        &self,
        genesis_block: &kktp_core::types::BlockHash,
        final_block: &kktp_core::types::BlockHash,
        game_tag_hex: &str,
        genesis_tx: &TxId,
    ) -> Result<ReconstructedChain, KktpError> {
        DagAuditor::new(Arc::clone(&self.adapter))
            .reconstruct(genesis_block, final_block, game_tag_hex, genesis_tx)
            .await
    }

    /// Full cheating audit over a reconstructed chain.
    pub fn audit_cheating(
        &self,
        chain: &ReconstructedChain,
        producer: &PubSig,
        snapshot: Option<&VaultSnapshot>,
    ) -> AuditVerdict {
        DagAuditor::new(Arc::clone(&self.adapter)).audit_cheating(
            chain,
            producer,
            &ActionRegistry::default_set(),
            snapshot,
        )
    }

    // ── Lobby operations ─────────────────────────────────────────────────────

    async fn submit_text(&self, payload: String) -> Result<TxId, KktpError> {
        self.adapter.submit_payload_tx(None, payload.into_bytes()).await
    }

    /// Host a lobby: publish the discovery, wait for its block, and return
    /// the join code.
    pub async fn create_lobby(
        &self,
        lobby_name: &str,
        max_members: usize,
        game: &str,
        version: &str,
    ) -> Result<(Sid, String), KktpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(KktpError::ShuttingDown);
        }
        let comms = self.comms()?;
        timed("lobby-create", self.config.timeouts.lobby_create_ms, async {
            let (lobby_id, _anchor, payload) = {
                let mut comms = comms.lock().await;
                let Comms { sessions, lobby } = &mut *comms;
                lobby.create_lobby(sessions, lobby_name, max_members, game, version)?
            };

            // Watch for the block carrying the discovery.
            let mut blocks = self.adapter.subscribe_blocks();
            let tx_id = self.submit_text(payload).await?;
            let block_hash_hex = loop {
                let block = blocks
                    .recv()
                    .await
                    .map_err(|e| KktpError::Adapter(format!("block stream: {e}")))?;
                if block.transactions.iter().any(|tx| tx.txid == tx_id) {
                    break block.hash.to_hex();
                }
            };

            let join_code = comms
                .lock()
                .await
                .lobby
                .set_join_code(&block_hash_hex, &tx_id)?;
            Ok((lobby_id, join_code))
        })
        .await
    }

    /// Join a lobby from its join code: resolve the discovery, respond,
    /// request membership, and wait until the host accepts.
    pub async fn join_lobby(&self, join_code: &str, display_name: &str) -> Result<Sid, KktpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(KktpError::ShuttingDown);
        }
        let comms = self.comms()?;
        timed("lobby-join", self.config.timeouts.lobby_join_ms, async {
            let (block_hex, tx_prefix) = LobbyManager::parse_join_code(join_code)?;
            let block_hash = kktp_core::types::BlockHash::from_hex(&block_hex)?;
            let block = self
                .adapter
                .block_by_hash(&block_hash)
                .await?
                .ok_or_else(|| KktpError::Adapter("join-code block not found".into()))?;

            // The discovery with the matching txid prefix.
            let discovery = block
                .transactions
                .iter()
                .filter(|tx| tx.txid.to_hex().starts_with(&tx_prefix))
                .find_map(|tx| {
                    let text = String::from_utf8(tx.payload.clone()).ok()?;
                    if !text.starts_with(KKTP_ANCHOR_PREFIX) {
                        return None;
                    }
                    match parse_anchor_payload(&text) {
                        Ok(KktpAnchor::Discovery(d)) if d.is_lobby() => Some(d),
                        _ => None,
                    }
                })
                .ok_or_else(|| KktpError::InvalidAnchor("no lobby discovery in block".into()))?;

            let (response_payload, request_payload, lobby_id) = {
                let mut comms = comms.lock().await;
                let Comms { sessions, lobby } = &mut *comms;
                let (dm, _response, response_payload) = sessions.accept_discovery(&discovery)?;
                let request_payload =
                    lobby.begin_join(sessions, &discovery, &dm, display_name)?;
                (response_payload, request_payload, discovery.sid()?)
            };
            self.submit_text(response_payload).await?;
            self.submit_text(request_payload).await?;

            // The host's pump answers over the DM; wait for membership.
            loop {
                {
                    let comms = comms.lock().await;
                    match comms.lobby.state() {
                        LobbyState::Member => return Ok(lobby_id),
                        LobbyState::Joining => {}
                        other => {
                            return Err(KktpError::JoinRejected(format!(
                                "lobby state became {other:?}"
                            )))
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
    }

    pub async fn send_lobby_message(&self, plaintext: &[u8]) -> Result<TxId, KktpError> {
        let comms = self.comms()?;
        let payload = comms.lock().await.lobby.send_group_message(plaintext, now_ms())?;
        self.submit_text(payload).await
    }

    pub async fn leave_lobby(&self) -> Result<(), KktpError> {
        let comms = self.comms()?;
        let payloads = {
            let mut comms = comms.lock().await;
            let Comms { sessions, lobby } = &mut *comms;
            lobby.leave_lobby(sessions)?
        };
        for payload in payloads {
            self.submit_text(payload).await?;
        }
        Ok(())
    }

    pub async fn close_lobby(&self) -> Result<(), KktpError> {
        let comms = self.comms()?;
        let payloads = comms.lock().await.lobby.close_lobby()?;
        for payload in payloads {
            self.submit_text(payload).await?;
        }
        Ok(())
    }

    pub async fn kick_member(&self, member: &PubSig, reason: &str) -> Result<(), KktpError> {
        let comms = self.comms()?;
        let payloads = {
            let mut comms = comms.lock().await;
            let Comms { sessions, lobby } = &mut *comms;
            lobby.kick(sessions, member, reason)?
        };
        for payload in payloads {
            self.submit_text(payload).await?;
        }
        Ok(())
    }

    pub async fn rotate_lobby_key(&self) -> Result<(), KktpError> {
        let comms = self.comms()?;
        let payloads = {
            let mut comms = comms.lock().await;
            let Comms { sessions, lobby } = &mut *comms;
            lobby.rotate_key(sessions, now_ms())?
        };
        let manager = self.utxo_manager.lock().unwrap().clone();
        for payload in payloads {
            self.submit_text(payload).await?;
            // Spread key DMs across UTXO refreshes, as joins are.
            if let Some(manager) = &manager {
                let _ = manager.run_check().await;
            }
        }
        Ok(())
    }

    /// Open lobbies observed on the ledger (discovery anchors flagged lobby).
    pub fn search_lobbies(&self) -> Result<Vec<LobbyListing>, KktpError> {
        let indexer = self
            .indexer
            .lock()
            .unwrap()
            .clone()
            .ok_or(KktpError::EngineBadState("UNINITIALIZED"))?;
        let mut listings = Vec::new();
        for tx in indexer.ring_snapshot() {
            let Ok(text) = String::from_utf8(tx.payload.clone()) else { continue };
            let Ok(KktpAnchor::Discovery(d)) = parse_anchor_payload(&text) else { continue };
            if !d.is_lobby() || d.verify().is_err() {
                continue;
            }
            listings.push(LobbyListing {
                lobby_id: d.sid()?,
                lobby_name: d.meta.lobby_name.clone().unwrap_or_default(),
                host_pub_sig: PubSig::from_hex(&d.pub_sig)?,
                max_members: d.meta.max_members.unwrap_or(2),
            });
        }
        Ok(listings)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Graceful teardown: reject new operations, drain tasks, close and
    /// export sessions, flush the cache.
    pub async fn shutdown(&self) -> Result<(), KktpError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let drain = Duration::from_millis(self.config.timeouts.disconnect_ms);
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!("task did not drain in time");
            }
        }

        let comms = self.comms.lock().unwrap().clone();
        if let Some(comms) = comms {
            let mut comms = comms.lock().await;
            if let Err(e) = comms.sessions.export_sessions() {
                warn!(error = %e, "session export failed during shutdown");
            }
            comms.sessions.close_all();
        }
        if let Some(ctx) = self.game.lock().unwrap().take() {
            ctx.processor.stop();
        }
        self.pool.lock().unwrap().clear();

        self.set_state(EngineState::Uninitialized);
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{BlockHash, MoveId, Outpoint, PubSig, Sid, TxId};

/// Everything observable by callers of the stack, one taxonomy.
///
/// Components never own a global emitter; each receives an [`EventSink`] at
/// construction and emits through it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GameEvent {
    // ── Lifecycle ────────────────────────────────────────────────────────────
    GameReady { game_id: String },
    GameEnded { game_id: String },

    // ── Moves ────────────────────────────────────────────────────────────────
    MoveProcessed { move_id: MoveId, sequence: u64 },
    ValidationFailed { reason: String },

    // ── VRF ──────────────────────────────────────────────────────────────────
    VrfSyncWait,
    VrfSyncResolved { block_hash: BlockHash },
    DeltaEntropyDetected { prev: BlockHash, current: BlockHash },

    // ── Anchors ──────────────────────────────────────────────────────────────
    AnchorSent { tx_id: TxId },
    AnchorFailed { reason: String, retry_needed: bool },
    GenesisAnchored { tx_id: TxId },
    HeartbeatAnchored { tx_id: TxId, move_count: u32 },
    AnchorComplete { tx_id: TxId },
    OpponentHeartbeat { tx_id: TxId, sender: Option<PubSig> },
    OpponentMoveAnchored { tx_id: TxId, move_count: u32 },

    // ── Wallet / UTXO pool ───────────────────────────────────────────────────
    UtxoAdded { outpoint: Outpoint },
    UtxoReserved { outpoint: Outpoint },
    UtxoReleased { outpoint: Outpoint },
    UtxoSpent { outpoint: Outpoint },
    PoolReady { available: usize },
    PoolLow { available: usize },
    PoolEmpty,
    LowFunds { have_sompi: u64 },
    BalanceChanged { balance_sompi: u64 },

    // ── Indexer ──────────────────────────────────────────────────────────────
    TxCached { tx_id: TxId, is_match: bool },
    BlockCached { hash: BlockHash },

    // ── Sessions ─────────────────────────────────────────────────────────────
    SessionEstablished { sid: Sid, peer: PubSig },
    SessionFaulted { sid: Sid, reason: String },
    SessionClosed { sid: Sid },

    // ── Lobby ────────────────────────────────────────────────────────────────
    LobbyCreated { lobby_id: Sid, join_code: String },
    LobbyJoined { lobby_id: Sid },
    LobbyMemberJoined { member: PubSig, display_name: String },
    LobbyMemberLeft { member: PubSig },
    LobbyKicked,
    LobbyClosed { lobby_id: Sid },
    GroupMessage { sender: PubSig, plaintext: Vec<u8> },
    GroupKeyRotated { version: u64 },
}

/// Cloneable emission handle backed by an unbounded channel.
///
/// Emitting never blocks; a dropped receiver turns emission into a no-op,
/// which keeps teardown order between components irrelevant.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<GameEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GameEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: GameEvent) {
        let _ = self.tx.send(event);
    }

    /// A sink whose receiver was dropped immediately. For tests and
    /// components that run detached.
    pub fn disconnected() -> Self {
        let (sink, _rx) = Self::new();
        sink
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventSink")
    }
}

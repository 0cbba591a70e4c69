use thiserror::Error;

#[derive(Debug, Error)]
pub enum KktpError {
    // ── Input validation ─────────────────────────────────────────────────────
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length for {what}: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid anchor: {0}")]
    InvalidAnchor(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("schema-invalid message: {0}")]
    InvalidMessage(String),

    // ── Policy ───────────────────────────────────────────────────────────────
    #[error("duplicate move id: {0}")]
    DuplicateMove(String),

    #[error("wrong opponent identity")]
    WrongOpponent,

    #[error("group message key version too old: {version} < {previous}")]
    GroupVersionTooOld { version: u64, previous: u64 },

    #[error("duplicate group message nonce")]
    DuplicateGroupNonce,

    // ── Resource ─────────────────────────────────────────────────────────────
    #[error("UTXO pool empty")]
    PoolEmpty,

    #[error("insufficient funds: need {need} sompi, have {have}")]
    InsufficientFunds { need: u64, have: u64 },

    #[error("UTXO reservation lost: {0}")]
    ReservationLost(String),

    // ── Protocol integrity (faults the session) ──────────────────────────────
    #[error("AEAD open failed")]
    AeadFailure,

    #[error("unexpected sid: expected {expected}, got {got}")]
    UnexpectedSid { expected: String, got: String },

    #[error("sequence gap timeout: expected seq {expected}")]
    GapTimeout { expected: u64 },

    #[error("reassembly buffer overflow")]
    ReassemblyOverflow,

    #[error("session is {0}")]
    SessionNotActive(&'static str),

    #[error("nonce replay detected")]
    NonceReplay,

    #[error("stale sequence: {got} < expected {expected}")]
    StaleSequence { expected: u64, got: u64 },

    // ── VRF / anchor pipeline ────────────────────────────────────────────────
    #[error("VRF REQUIRED: no live block hash available")]
    VrfSyncRequired,

    #[error("anchor state machine: cannot {op} while {state}")]
    AnchorBadState { op: &'static str, state: &'static str },

    #[error("anchor submission failed: {0}")]
    AnchorSubmitFailed(String),

    #[error("audit failed: {0}")]
    AuditFailed(String),

    // ── Lobby ────────────────────────────────────────────────────────────────
    #[error("lobby is full (max {max})")]
    LobbyFull { max: usize },

    #[error("not the lobby host")]
    NotHost,

    #[error("lobby is {0}")]
    LobbyBadState(&'static str),

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("key rotation aborted: no member reachable")]
    RotationAborted,

    // ── Engine ───────────────────────────────────────────────────────────────
    #[error("engine is {0}")]
    EngineBadState(&'static str),

    #[error("{op} timed out after {ms} ms")]
    OperationTimeout { op: &'static str, ms: u64 },

    #[error("engine is shutting down")]
    ShuttingDown,

    // ── External adapter ─────────────────────────────────────────────────────
    #[error("adapter error: {0}")]
    Adapter(String),

    // ── Fatal / storage / serialization ──────────────────────────────────────
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("{0}")]
    Other(String),
}

impl KktpError {
    /// True for the protocol-integrity class that transitions a session to
    /// FAULTED (never recovers, never sends session-end).
    pub fn faults_session(&self) -> bool {
        matches!(
            self,
            KktpError::AeadFailure
                | KktpError::GapTimeout { .. }
                | KktpError::ReassemblyOverflow
                | KktpError::UnexpectedSid { .. }
        )
    }
}

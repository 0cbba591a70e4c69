//! ─── KKTP Protocol Constants ────────────────────────────────────────────────
//!
//! Verifiable multiplayer game sessions over a public UTXO DAG ledger.
//! Anchor payloads are prefix-tagged binary blobs; session traffic rides in
//! `KKTP:`-prefixed text payloads.

// ── Anchor payload prefixes (hex, lowercased on the wire) ────────────────────

/// Genesis anchor payload prefix ("KG").
pub const PREFIX_GAME_START_HEX: &str = "4b47";

/// Heartbeat anchor payload prefix ("KH").
pub const PREFIX_HEARTBEAT_HEX: &str = "4b48";

/// Final anchor payload prefix ("KE").
pub const PREFIX_GAME_END_HEX: &str = "4b45";

// ── KKTP text payload prefixes ───────────────────────────────────────────────

/// Discovery / response anchors: `KKTP:ANCHOR:<canonical JSON>`.
pub const KKTP_ANCHOR_PREFIX: &str = "KKTP:ANCHOR:";

/// Session messages: `KKTP:<mailbox hex>:<canonical JSON>`.
pub const KKTP_MAILBOX_PREFIX: &str = "KKTP:";

/// Group messages: `KKTP:GROUP:<group mailbox hex>:<canonical JSON>`.
pub const KKTP_GROUP_PREFIX: &str = "KKTP:GROUP:";

/// Domain string hashed with the lobby id to derive the group mailbox.
pub const GROUP_MAILBOX_DOMAIN: &str = "KKTP:GROUP:MAILBOX:";

// ── Identity / key derivation ────────────────────────────────────────────────

/// First per-contact branch index. Indices below this are reserved.
pub const BASE_INDEX_START: u32 = 100;

/// Branch stride per contact: base, base+1 (initiator TX), base+2 (responder RX).
pub const BRANCHES_PER_CONTACT: u32 = 3;

// ── Session transport ────────────────────────────────────────────────────────

/// Per-direction out-of-order reassembly buffer bound. Overflow faults the session.
pub const REASSEMBLY_MAX: usize = 100;

/// Per-direction nonce replay cache capacity (LRU).
pub const REPLAY_CACHE_MAX: usize = 1000;

/// A sequence gap older than this faults the session (ms).
pub const GAP_TIMEOUT_MS: i64 = 60_000;

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;

// ── Moves / VRF ──────────────────────────────────────────────────────────────

/// Divisor applied to inter-move wall-clock deltas before 8-bit clamping.
pub const TIME_DELTA_SCALE_MS: i64 = 100;

/// Coordinate width for MOVE actions.
pub const COORD_BITS: u32 = 14;

/// Bits in the packed field after the action code: 3×coord(14) + delta(8) + vrf(32).
pub const MOVE_ENTRY_BITS: u32 = 82;

/// Bytes per packed MOVE entry: code(1) + 82-bit field + 6 zero pad bits.
pub const MOVE_ENTRY_BYTES: usize = 12;

/// Bytes per packed non-MOVE entry: action(8) + lane(8) + delta(8) + vrf(32).
pub const EVENT_ENTRY_BYTES: usize = 7;

// ── Anchor cadence ───────────────────────────────────────────────────────────

/// Default heartbeat anchor interval (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

// ── UTXO pool / manager ──────────────────────────────────────────────────────

/// Reservations older than this may be swept back to AVAILABLE (ms).
pub const STALE_RESERVATION_MS: i64 = 30_000;

/// Pool emits POOL_READY when available count reaches this.
pub const POOL_MIN_READY: usize = 3;

/// Pool emits POOL_LOW at or below this available count.
pub const POOL_LOW_THRESHOLD: usize = 1;

/// UTXO manager check cadence (ms).
pub const UTXO_CHECK_INTERVAL_MS: u64 = 15_000;

/// Minimum amount (sompi) for a UTXO to count as usable: 1 KAS-equivalent.
pub const USABLE_THRESHOLD_SOMPI: u64 = 100_000_000;

/// Replenishment target for usable UTXOs.
pub const TARGET_UTXO_COUNT: usize = 10;

/// Auto-consolidation trigger: more small UTXOs than this.
pub const MAX_SMALL_UTXOS: usize = 50;

/// Consolidation batch bound per transaction.
pub const MAX_INPUTS_PER_TX: usize = 80;

// ── Indexer ──────────────────────────────────────────────────────────────────

/// Max rows per persistent sub-store after size enforcement.
pub const INDEXER_MAX_SIZE: usize = 2_000;

/// Row TTL (ms).
pub const INDEXER_TTL_MS: i64 = 3_600_000;

/// Recent-txid dedup set capacity (LRU).
pub const INDEXER_DEDUP_CAP: usize = 4_096;

/// In-memory ring capacity for live observers.
pub const INDEXER_RING_CAP: usize = 256;

/// TTL eviction runs only when the expired fraction reaches this ratio.
pub const INDEXER_BATCH_THRESHOLD_RATIO: f64 = 0.1;

// ── Lobby / group keys ───────────────────────────────────────────────────────

/// Future-versioned group message buffer bound.
pub const GROUP_FUTURE_BUFFER_MAX: usize = 20;

/// Buffered future-versioned messages expire after this (ms).
pub const GROUP_FUTURE_TTL_MS: i64 = 60_000;

/// Short txid prefix length (hex chars) appended to a join code.
pub const JOIN_CODE_TX_PREFIX_LEN: usize = 8;

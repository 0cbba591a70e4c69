use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp in milliseconds, UTC. Move time deltas are ms-scale.
pub type Timestamp = i64;

/// Ledger base unit (1 KAS-equivalent = 100_000_000 sompi).
pub type Sompi = u64;

/// Per-direction message sequence number, starting at 0.
pub type Seq = u64;

/// Group-key version counter (monotone).
pub type KeyVersion = u64;

macro_rules! hash32_newtype {
    ($name:ident, $debug_prefix:literal) => {
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_bytes(b: [u8; 32]) -> Self {
                Self(b)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, crate::error::KktpError> {
                let bytes = hex::decode(s)
                    .map_err(|e| crate::error::KktpError::InvalidHex(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(crate::error::KktpError::InvalidLength {
                        what: stringify!($name),
                        expected: 32,
                        got: bytes.len(),
                    });
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($debug_prefix, "({}…)"), &self.to_hex()[..16])
            }
        }
    };
}

// ── 32-byte identifiers ──────────────────────────────────────────────────────

hash32_newtype!(TxId, "TxId");
hash32_newtype!(BlockHash, "BlockHash");
hash32_newtype!(Sid, "Sid");
hash32_newtype!(MailboxId, "MailboxId");
hash32_newtype!(MoveId, "MoveId");
hash32_newtype!(VrfOutput, "VrfOutput");

// ── PubSig ───────────────────────────────────────────────────────────────────

/// Ed25519 verifying-key bytes identifying one side of a session.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubSig(pub [u8; 32]);

impl PubSig {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::error::KktpError> {
        let bytes =
            hex::decode(s).map_err(|e| crate::error::KktpError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(crate::error::KktpError::InvalidLength {
                what: "PubSig",
                expected: 32,
                got: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for PubSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PubSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubSig({}…)", &self.to_hex()[..16])
    }
}

// ── UTXO ─────────────────────────────────────────────────────────────────────

/// A spendable output reference: `(txid, output index)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: TxId,
    pub index: u32,
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// The single canonical UTXO shape every layer above the adapter consumes.
/// Adapter implementations normalise whatever their backend returns into this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub outpoint: Outpoint,
    pub amount_sompi: Sompi,
}

// ── Direction ────────────────────────────────────────────────────────────────

/// Transport direction within a 1:1 session. The initiator sends `AtoB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    AtoB,
    BtoA,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::AtoB => Direction::BtoA,
            Direction::BtoA => Direction::AtoB,
        }
    }

    /// Stable byte tag used inside AAD.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::AtoB => 0,
            Direction::BtoA => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AtoB => write!(f, "AtoB"),
            Direction::BtoA => write!(f, "BtoA"),
        }
    }
}

// ── State enums ──────────────────────────────────────────────────────────────

/// Lifecycle of a 1:1 session. FAULTED and CLOSED are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    Active,
    Faulted,
    Closed,
}

/// Lifecycle of a lobby membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyState {
    Idle,
    Hosting,
    Joining,
    Member,
    Closed,
}

/// Lifecycle of the engine facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    InGame,
    Ending,
    Error,
}

// ── Move descriptors ─────────────────────────────────────────────────────────

/// Spatial or lane payload of one player action.
///
/// MOVE actions carry 14-bit clamped coordinates; every other action carries
/// an 8-bit lane. The two kinds pack to different wire sizes (see the codec).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePayload {
    Move { x: u16, y: u16, z: u16 },
    Lane { lane: u8 },
}

/// Canonical per-move descriptor fed into the VRF fold and the Merkle leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveDescriptor {
    pub action: String,
    pub payload: MovePayload,
    /// `min(255, floor((now − prev_move_ts) / scale))`.
    pub time_delta: u8,
    /// Strictly increasing per-player move counter, starting at 1.
    pub sequence: u64,
    pub timestamp: Timestamp,
}

impl MoveDescriptor {
    pub fn is_move(&self) -> bool {
        matches!(self.payload, MovePayload::Move { .. })
    }
}

/// Wall-clock now in milliseconds UTC.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

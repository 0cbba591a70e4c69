//! Canonical binary encoding of the three anchor payload kinds.
//!
//! All integers are big-endian. MOVE entries pack their post-code field
//! MSB-first into 82 bits and zero-pad each entry to a byte boundary, so a
//! heartbeat body is a self-delimiting sequence of 12-byte MOVE and 7-byte
//! non-MOVE records. The signature always occupies the final 64 bytes and
//! covers everything before it.

use std::collections::HashMap;

use kktp_core::constants::{
    EVENT_ENTRY_BYTES, MOVE_ENTRY_BYTES, PREFIX_GAME_END_HEX, PREFIX_GAME_START_HEX,
    PREFIX_HEARTBEAT_HEX,
};
use kktp_core::error::KktpError;
use kktp_core::types::{BlockHash, MovePayload, TxId, VrfOutput};
use kktp_crypto::keys::{verify_signature, SigKeypair};

const SIG_LEN: usize = 64;
const COORD_MASK: u16 = 0x3FFF;

/// Action codes with the high bit clear are MOVE-kind (coordinates); codes
/// with the high bit set are lane-kind. The registry hands out codes in the
/// matching range.
const EVENT_CODE_BIT: u8 = 0x80;

// ── Prefix classification ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorKind {
    Genesis,
    Heartbeat,
    Final,
}

impl AnchorKind {
    fn prefix_bytes(self) -> [u8; 2] {
        let hexstr = match self {
            AnchorKind::Genesis => PREFIX_GAME_START_HEX,
            AnchorKind::Heartbeat => PREFIX_HEARTBEAT_HEX,
            AnchorKind::Final => PREFIX_GAME_END_HEX,
        };
        let raw = hex::decode(hexstr).expect("prefix constants are valid hex");
        [raw[0], raw[1]]
    }
}

/// Classify a raw payload by its two-byte prefix.
pub fn classify(payload: &[u8]) -> Option<AnchorKind> {
    if payload.len() < 2 {
        return None;
    }
    let head = [payload[0], payload[1]];
    for kind in [AnchorKind::Genesis, AnchorKind::Heartbeat, AnchorKind::Final] {
        if head == kind.prefix_bytes() {
            return Some(kind);
        }
    }
    None
}

// ── Action registry ──────────────────────────────────────────────────────────

/// Maps action names to wire codes. Game integrations extend the defaults
/// through the engine's custom action maps.
#[derive(Clone, Debug)]
pub struct ActionRegistry {
    by_name: HashMap<String, u8>,
    by_code: HashMap<u8, String>,
    next_move: u8,
    next_event: u8,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_code: HashMap::new(),
            next_move: 0x01,
            next_event: EVENT_CODE_BIT | 0x01,
        }
    }

    /// Defaults shared by the reference consumers.
    pub fn default_set() -> Self {
        let mut reg = Self::new();
        reg.register_move("move").expect("default registration");
        for name in ["jump", "duck", "lane_change", "collect", "slap"] {
            reg.register_event(name).expect("default registration");
        }
        reg
    }

    pub fn register_move(&mut self, name: &str) -> Result<u8, KktpError> {
        if let Some(&code) = self.by_name.get(name) {
            return Ok(code);
        }
        if self.next_move >= EVENT_CODE_BIT {
            return Err(KktpError::Other("MOVE action code space exhausted".into()));
        }
        let code = self.next_move;
        self.next_move += 1;
        self.by_name.insert(name.to_string(), code);
        self.by_code.insert(code, name.to_string());
        Ok(code)
    }

    pub fn register_event(&mut self, name: &str) -> Result<u8, KktpError> {
        if let Some(&code) = self.by_name.get(name) {
            return Ok(code);
        }
        if self.next_event == 0xFF {
            return Err(KktpError::Other("event action code space exhausted".into()));
        }
        let code = self.next_event;
        self.next_event += 1;
        self.by_name.insert(name.to_string(), code);
        self.by_code.insert(code, name.to_string());
        Ok(code)
    }

    pub fn code_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, code: u8) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    /// The code an action must carry for the given payload shape.
    pub fn code_for(&self, name: &str, payload: &MovePayload) -> Result<u8, KktpError> {
        let code = self
            .code_of(name)
            .ok_or_else(|| KktpError::InvalidMessage(format!("unknown action: {name}")))?;
        let is_event_code = code & EVENT_CODE_BIT != 0;
        let is_lane = matches!(payload, MovePayload::Lane { .. });
        if is_event_code != is_lane {
            return Err(KktpError::InvalidMessage(format!(
                "action {name} payload shape does not match its registered kind"
            )));
        }
        Ok(code)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::default_set()
    }
}

// ── Packed entries ───────────────────────────────────────────────────────────

/// Clamp and mask a coordinate to 14 bits.
pub fn encode_coord14(v: u16) -> u16 {
    v.min(COORD_MASK) & COORD_MASK
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackedEntry {
    Move { code: u8, x: u16, y: u16, z: u16, time_delta: u8, vrf_fragment: [u8; 4] },
    Event { code: u8, lane: u8, time_delta: u8, vrf_fragment: [u8; 4] },
}

impl PackedEntry {
    pub fn code(&self) -> u8 {
        match self {
            PackedEntry::Move { code, .. } | PackedEntry::Event { code, .. } => *code,
        }
    }

    pub fn vrf_fragment(&self) -> [u8; 4] {
        match self {
            PackedEntry::Move { vrf_fragment, .. } | PackedEntry::Event { vrf_fragment, .. } => {
                *vrf_fragment
            }
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            PackedEntry::Move { .. } => MOVE_ENTRY_BYTES,
            PackedEntry::Event { .. } => EVENT_ENTRY_BYTES,
        }
    }
}

// ── Bit-level helpers ────────────────────────────────────────────────────────

struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self { buf: Vec::new(), bit_len: 0 }
    }

    /// Append the low `bits` bits of `value`, MSB first.
    fn push(&mut self, value: u64, bits: u32) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            let byte_index = self.bit_len / 8;
            if byte_index == self.buf.len() {
                self.buf.push(0);
            }
            if bit == 1 {
                self.buf[byte_index] |= 1 << (7 - (self.bit_len % 8));
            }
            self.bit_len += 1;
        }
    }

    /// Zero-pad to the next byte boundary and return the buffer.
    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, bits: u32) -> Result<u64, KktpError> {
        let mut out = 0u64;
        for _ in 0..bits {
            let byte_index = self.pos / 8;
            if byte_index >= self.buf.len() {
                return Err(KktpError::MalformedPayload("bitfield truncated".into()));
            }
            let bit = (self.buf[byte_index] >> (7 - (self.pos % 8))) & 1;
            out = (out << 1) | bit as u64;
            self.pos += 1;
        }
        Ok(out)
    }
}

fn encode_entry(entry: &PackedEntry, out: &mut Vec<u8>) {
    match entry {
        PackedEntry::Move { code, x, y, z, time_delta, vrf_fragment } => {
            out.push(*code);
            let mut bits = BitWriter::new();
            bits.push(encode_coord14(*x) as u64, 14);
            bits.push(encode_coord14(*y) as u64, 14);
            bits.push(encode_coord14(*z) as u64, 14);
            bits.push(*time_delta as u64, 8);
            bits.push(u32::from_be_bytes(*vrf_fragment) as u64, 32);
            out.extend_from_slice(&bits.finish());
        }
        PackedEntry::Event { code, lane, time_delta, vrf_fragment } => {
            out.push(*code);
            out.push(*lane);
            out.push(*time_delta);
            out.extend_from_slice(vrf_fragment);
        }
    }
}

fn decode_entry(buf: &[u8], cursor: &mut usize) -> Result<PackedEntry, KktpError> {
    let code = *buf
        .get(*cursor)
        .ok_or_else(|| KktpError::MalformedPayload("entry truncated at code".into()))?;
    if code & EVENT_CODE_BIT != 0 {
        let end = *cursor + EVENT_ENTRY_BYTES;
        let bytes = buf
            .get(*cursor..end)
            .ok_or_else(|| KktpError::MalformedPayload("event entry truncated".into()))?;
        *cursor = end;
        Ok(PackedEntry::Event {
            code,
            lane: bytes[1],
            time_delta: bytes[2],
            vrf_fragment: [bytes[3], bytes[4], bytes[5], bytes[6]],
        })
    } else {
        let end = *cursor + MOVE_ENTRY_BYTES;
        let bytes = buf
            .get(*cursor..end)
            .ok_or_else(|| KktpError::MalformedPayload("move entry truncated".into()))?;
        *cursor = end;
        let mut bits = BitReader::new(&bytes[1..]);
        let x = bits.take(14)? as u16;
        let y = bits.take(14)? as u16;
        let z = bits.take(14)? as u16;
        let time_delta = bits.take(8)? as u8;
        let vrf_fragment = (bits.take(32)? as u32).to_be_bytes();
        // The 6 pad bits must be zero: the encoding is canonical.
        if bits.take(6)? != 0 {
            return Err(KktpError::MalformedPayload("nonzero pad bits".into()));
        }
        Ok(PackedEntry::Move { code, x, y, z, time_delta, vrf_fragment })
    }
}

// ── Shared field helpers ─────────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KktpError> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| KktpError::MalformedPayload("payload truncated".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn take_arr<const N: usize>(&mut self) -> Result<[u8; N], KktpError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    fn take_u64(&mut self) -> Result<u64, KktpError> {
        Ok(u64::from_be_bytes(self.take_arr::<8>()?))
    }

    fn take_u32(&mut self) -> Result<u32, KktpError> {
        Ok(u32::from_be_bytes(self.take_arr::<4>()?))
    }

    fn take_u16(&mut self) -> Result<u16, KktpError> {
        Ok(u16::from_be_bytes(self.take_arr::<2>()?))
    }

    fn expect_end(&self) -> Result<(), KktpError> {
        if self.pos != self.buf.len() {
            return Err(KktpError::MalformedPayload(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn game_tag_from_hex(tag_hex: &str) -> Result<[u8; 4], KktpError> {
    let raw = hex::decode(tag_hex).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
    raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
        what: "game tag",
        expected: 4,
        got: raw.len(),
    })
}

fn sign_and_append(mut body: Vec<u8>, keypair: &SigKeypair) -> Vec<u8> {
    let sig = keypair.sign(&body);
    body.extend_from_slice(&sig);
    body
}

/// Check the trailing signature of any anchor payload against its producer.
pub fn verify_payload_signature(producer: &kktp_core::types::PubSig, payload: &[u8]) -> Result<(), KktpError> {
    if payload.len() < SIG_LEN + 2 {
        return Err(KktpError::MalformedPayload("too short for signature".into()));
    }
    let (body, sig) = payload.split_at(payload.len() - SIG_LEN);
    verify_signature(producer, body, sig)
}

// ── Genesis ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisAnchor {
    pub game_tag: [u8; 4],
    pub player_tag: String,
    pub start_daa_score: u64,
    pub end_daa_score: u64,
    pub qrng_pulse_index: u64,
    pub beacon_hash: BlockHash,
    pub initial_vrf: VrfOutput,
    pub signature: Vec<u8>,
}

impl GenesisAnchor {
    #[allow(clippy::too_many_arguments)]
    pub fn pack(
        game_tag_hex: &str,
        player_tag: &str,
        start_daa_score: u64,
        end_daa_score: u64,
        qrng_pulse_index: u64,
        beacon_hash: &BlockHash,
        initial_vrf: &VrfOutput,
        keypair: &SigKeypair,
    ) -> Result<Vec<u8>, KktpError> {
        if player_tag.len() > u8::MAX as usize {
            return Err(KktpError::InvalidLength {
                what: "player tag",
                expected: u8::MAX as usize,
                got: player_tag.len(),
            });
        }
        let mut body = Vec::with_capacity(128 + player_tag.len());
        body.extend_from_slice(&AnchorKind::Genesis.prefix_bytes());
        body.extend_from_slice(&game_tag_from_hex(game_tag_hex)?);
        body.push(player_tag.len() as u8);
        body.extend_from_slice(player_tag.as_bytes());
        body.extend_from_slice(&start_daa_score.to_be_bytes());
        body.extend_from_slice(&end_daa_score.to_be_bytes());
        body.extend_from_slice(&qrng_pulse_index.to_be_bytes());
        body.extend_from_slice(beacon_hash.as_bytes());
        body.extend_from_slice(initial_vrf.as_bytes());
        Ok(sign_and_append(body, keypair))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, KktpError> {
        let mut c = Cursor::new(payload);
        let prefix: [u8; 2] = c.take_arr()?;
        if prefix != AnchorKind::Genesis.prefix_bytes() {
            return Err(KktpError::MalformedPayload("not a genesis payload".into()));
        }
        let game_tag: [u8; 4] = c.take_arr()?;
        let tag_len = c.take(1)?[0] as usize;
        let player_tag = String::from_utf8(c.take(tag_len)?.to_vec())
            .map_err(|_| KktpError::MalformedPayload("player tag not UTF-8".into()))?;
        let start_daa_score = c.take_u64()?;
        let end_daa_score = c.take_u64()?;
        let qrng_pulse_index = c.take_u64()?;
        let beacon_hash = BlockHash::from_bytes(c.take_arr()?);
        let initial_vrf = VrfOutput::from_bytes(c.take_arr()?);
        let signature = c.take(SIG_LEN)?.to_vec();
        c.expect_end()?;
        Ok(Self {
            game_tag,
            player_tag,
            start_daa_score,
            end_daa_score,
            qrng_pulse_index,
            beacon_hash,
            initial_vrf,
            signature,
        })
    }
}

// ── Heartbeat ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatAnchor {
    pub game_tag: [u8; 4],
    pub prev_tx_id: TxId,
    pub entries: Vec<PackedEntry>,
    pub vrf_tail: [u8; 4],
    pub signature: Vec<u8>,
}

impl HeartbeatAnchor {
    pub fn pack(
        game_tag_hex: &str,
        prev_tx_id: &TxId,
        entries: &[PackedEntry],
        vrf_tail: [u8; 4],
        keypair: &SigKeypair,
    ) -> Result<Vec<u8>, KktpError> {
        if entries.len() > u16::MAX as usize {
            return Err(KktpError::InvalidLength {
                what: "heartbeat entries",
                expected: u16::MAX as usize,
                got: entries.len(),
            });
        }
        let body_len: usize = entries.iter().map(PackedEntry::encoded_len).sum();
        let mut body = Vec::with_capacity(44 + body_len);
        body.extend_from_slice(&AnchorKind::Heartbeat.prefix_bytes());
        body.extend_from_slice(&game_tag_from_hex(game_tag_hex)?);
        body.extend_from_slice(prev_tx_id.as_bytes());
        body.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for entry in entries {
            encode_entry(entry, &mut body);
        }
        body.extend_from_slice(&vrf_tail);
        Ok(sign_and_append(body, keypair))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, KktpError> {
        let mut c = Cursor::new(payload);
        let prefix: [u8; 2] = c.take_arr()?;
        if prefix != AnchorKind::Heartbeat.prefix_bytes() {
            return Err(KktpError::MalformedPayload("not a heartbeat payload".into()));
        }
        let game_tag: [u8; 4] = c.take_arr()?;
        let prev_tx_id = TxId::from_bytes(c.take_arr()?);
        let count = c.take_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        {
            // Entries are self-delimiting within the remaining span.
            let rest = &payload[c.pos..];
            let mut cursor = 0usize;
            for _ in 0..count {
                entries.push(decode_entry(rest, &mut cursor)?);
            }
            c.pos += cursor;
        }
        let vrf_tail: [u8; 4] = c.take_arr()?;
        let signature = c.take(SIG_LEN)?.to_vec();
        c.expect_end()?;
        Ok(Self { game_tag, prev_tx_id, entries, vrf_tail, signature })
    }
}

// ── Final ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalAnchor {
    pub game_tag: [u8; 4],
    pub prev_tx_id: TxId,
    pub merkle_root: [u8; 32],
    pub final_score: u64,
    pub coins_collected: u32,
    pub total_moves: u32,
    pub signature: Vec<u8>,
}

impl FinalAnchor {
    pub fn pack(
        game_tag_hex: &str,
        prev_tx_id: &TxId,
        merkle_root: &[u8; 32],
        final_score: u64,
        coins_collected: u32,
        total_moves: u32,
        keypair: &SigKeypair,
    ) -> Result<Vec<u8>, KktpError> {
        let mut body = Vec::with_capacity(86);
        body.extend_from_slice(&AnchorKind::Final.prefix_bytes());
        body.extend_from_slice(&game_tag_from_hex(game_tag_hex)?);
        body.extend_from_slice(prev_tx_id.as_bytes());
        body.extend_from_slice(merkle_root);
        body.extend_from_slice(&final_score.to_be_bytes());
        body.extend_from_slice(&coins_collected.to_be_bytes());
        body.extend_from_slice(&total_moves.to_be_bytes());
        Ok(sign_and_append(body, keypair))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, KktpError> {
        let mut c = Cursor::new(payload);
        let prefix: [u8; 2] = c.take_arr()?;
        if prefix != AnchorKind::Final.prefix_bytes() {
            return Err(KktpError::MalformedPayload("not a final payload".into()));
        }
        let game_tag: [u8; 4] = c.take_arr()?;
        let prev_tx_id = TxId::from_bytes(c.take_arr()?);
        let merkle_root: [u8; 32] = c.take_arr()?;
        let final_score = c.take_u64()?;
        let coins_collected = c.take_u32()?;
        let total_moves = c.take_u32()?;
        let signature = c.take(SIG_LEN)?.to_vec();
        c.expect_end()?;
        Ok(Self {
            game_tag,
            prev_tx_id,
            merkle_root,
            final_score,
            coins_collected,
            total_moves,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_crypto::hash::game_id_tag_hex;

    fn keypair() -> SigKeypair {
        SigKeypair::from_secret_bytes([7u8; 32])
    }

    #[test]
    fn genesis_round_trip() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let beacon = BlockHash::from_bytes([1u8; 32]);
        let vrf = VrfOutput::from_bytes([2u8; 32]);
        let payload =
            GenesisAnchor::pack(&tag, "p1", 1000, 1600, 777, &beacon, &vrf, &kp).unwrap();

        assert_eq!(classify(&payload), Some(AnchorKind::Genesis));
        let decoded = GenesisAnchor::decode(&payload).unwrap();
        assert_eq!(hex::encode(decoded.game_tag), tag);
        assert_eq!(decoded.player_tag, "p1");
        assert_eq!(decoded.start_daa_score, 1000);
        assert_eq!(decoded.end_daa_score, 1600);
        assert_eq!(decoded.qrng_pulse_index, 777);
        assert_eq!(decoded.beacon_hash, beacon);
        assert_eq!(decoded.initial_vrf, vrf);
        assert!(verify_payload_signature(&kp.public, &payload).is_ok());
    }

    #[test]
    fn heartbeat_round_trip_mixed_entries() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let prev = TxId::from_bytes([9u8; 32]);
        let entries = vec![
            PackedEntry::Move {
                code: 0x01,
                x: 12_345,
                y: 0,
                z: 16_383,
                time_delta: 250,
                vrf_fragment: [0xDE, 0xAD, 0xBE, 0xEF],
            },
            PackedEntry::Event { code: 0x81, lane: 2, time_delta: 3, vrf_fragment: [1, 2, 3, 4] },
            PackedEntry::Move {
                code: 0x02,
                x: 1,
                y: 2,
                z: 3,
                time_delta: 0,
                vrf_fragment: [0, 0, 0, 1],
            },
        ];
        let payload =
            HeartbeatAnchor::pack(&tag, &prev, &entries, [8, 8, 8, 8], &kp).unwrap();
        assert_eq!(classify(&payload), Some(AnchorKind::Heartbeat));
        let decoded = HeartbeatAnchor::decode(&payload).unwrap();
        assert_eq!(decoded.prev_tx_id, prev);
        assert_eq!(decoded.entries, entries);
        assert_eq!(decoded.vrf_tail, [8, 8, 8, 8]);
        assert!(verify_payload_signature(&kp.public, &payload).is_ok());
    }

    #[test]
    fn move_entry_is_12_bytes_event_is_7() {
        let kp = keypair();
        let tag = game_id_tag_hex("g");
        let prev = TxId::from_bytes([0u8; 32]);
        let one_move = vec![PackedEntry::Move {
            code: 1,
            x: 0,
            y: 0,
            z: 0,
            time_delta: 0,
            vrf_fragment: [0; 4],
        }];
        let one_event =
            vec![PackedEntry::Event { code: 0x81, lane: 0, time_delta: 0, vrf_fragment: [0; 4] }];
        let base = HeartbeatAnchor::pack(&tag, &prev, &[], [0; 4], &kp).unwrap().len();
        let with_move = HeartbeatAnchor::pack(&tag, &prev, &one_move, [0; 4], &kp).unwrap().len();
        let with_event = HeartbeatAnchor::pack(&tag, &prev, &one_event, [0; 4], &kp).unwrap().len();
        assert_eq!(with_move - base, MOVE_ENTRY_BYTES);
        assert_eq!(with_event - base, EVENT_ENTRY_BYTES);
    }

    #[test]
    fn coordinates_clamp_to_14_bits() {
        assert_eq!(encode_coord14(0x3FFF), 0x3FFF);
        assert_eq!(encode_coord14(0x4000), 0x3FFF);
        assert_eq!(encode_coord14(u16::MAX), 0x3FFF);
        assert_eq!(encode_coord14(5), 5);
    }

    #[test]
    fn final_round_trip() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let prev = TxId::from_bytes([4u8; 32]);
        let root = [5u8; 32];
        let payload = FinalAnchor::pack(&tag, &prev, &root, 9_000, 42, 17, &kp).unwrap();
        assert_eq!(classify(&payload), Some(AnchorKind::Final));
        let decoded = FinalAnchor::decode(&payload).unwrap();
        assert_eq!(decoded.merkle_root, root);
        assert_eq!(decoded.final_score, 9_000);
        assert_eq!(decoded.coins_collected, 42);
        assert_eq!(decoded.total_moves, 17);
    }

    #[test]
    fn truncated_and_padded_payloads_rejected() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let prev = TxId::from_bytes([4u8; 32]);
        let payload = FinalAnchor::pack(&tag, &prev, &[0u8; 32], 1, 2, 3, &kp).unwrap();

        assert!(FinalAnchor::decode(&payload[..payload.len() - 1]).is_err());
        let mut extended = payload.clone();
        extended.push(0);
        assert!(FinalAnchor::decode(&extended).is_err());
        // Wrong prefix kind.
        assert!(HeartbeatAnchor::decode(&payload).is_err());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let mut payload =
            FinalAnchor::pack(&tag, &TxId::from_bytes([0; 32]), &[0u8; 32], 1, 2, 3, &kp).unwrap();
        let len = payload.len();
        payload[len - 1] ^= 0xFF;
        assert!(verify_payload_signature(&kp.public, &payload).is_err());
    }

    #[test]
    fn distinct_inputs_give_distinct_bytes() {
        let kp = keypair();
        let tag = game_id_tag_hex("game-42");
        let prev = TxId::from_bytes([0; 32]);
        let a = HeartbeatAnchor::pack(
            &tag,
            &prev,
            &[PackedEntry::Event { code: 0x81, lane: 1, time_delta: 0, vrf_fragment: [0; 4] }],
            [0; 4],
            &kp,
        )
        .unwrap();
        let b = HeartbeatAnchor::pack(
            &tag,
            &prev,
            &[PackedEntry::Event { code: 0x81, lane: 2, time_delta: 0, vrf_fragment: [0; 4] }],
            [0; 4],
            &kp,
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn registry_codes_partition_by_kind() {
        let mut reg = ActionRegistry::default_set();
        let move_code = reg.code_of("move").unwrap();
        let jump_code = reg.code_of("jump").unwrap();
        assert_eq!(move_code & EVENT_CODE_BIT, 0);
        assert_ne!(jump_code & EVENT_CODE_BIT, 0);

        let custom = reg.register_event("dash").unwrap();
        assert_ne!(custom & EVENT_CODE_BIT, 0);
        assert_eq!(reg.name_of(custom), Some("dash"));

        // Payload-kind mismatch is rejected.
        let lane = MovePayload::Lane { lane: 0 };
        let coords = MovePayload::Move { x: 0, y: 0, z: 0 };
        assert!(reg.code_for("jump", &lane).is_ok());
        assert!(reg.code_for("jump", &coords).is_err());
        assert!(reg.code_for("move", &coords).is_ok());
        assert!(reg.code_for("move", &lane).is_err());
    }
}

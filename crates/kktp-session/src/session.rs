use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use kktp_core::constants::{GAP_TIMEOUT_MS, REASSEMBLY_MAX};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::types::{Direction, MailboxId, PubSig, SessionState, Sid, Timestamp};
use kktp_crypto::keys::{DhKeypair, SigKeypair};

use crate::anchors::SessionEndAnchor;
use crate::transport::{open_message, seal_message, DirectionState, SessionMessage};

/// Exported session state for resume-from-snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub sid: Sid,
    pub mailbox_id: MailboxId,
    pub base_index: u32,
    pub key_index: u32,
    pub is_initiator: bool,
    pub created_at: Timestamp,
    pub peer_pub_sig: PubSig,
    /// Present when the handshake completed; absent snapshots re-handshake.
    pub k_session: Option<[u8; 32]>,
    /// Next seq this side will send.
    pub outbound_seq: u64,
    /// Next seq this side expects to receive.
    pub inbound_seq: u64,
}

/// One established (or establishing) 1:1 session.
///
/// Only ACTIVE accepts send/receive. FAULTED and CLOSED are terminal; CLOSED
/// zeroises the session key and drops the branch private keys.
pub struct Session {
    sid: Sid,
    state: SessionState,
    is_initiator: bool,
    base_index: u32,
    key_index: u32,
    /// Branch keys; dropped (and zeroised by their Drop impls) on close.
    my_sig: Option<SigKeypair>,
    my_dh: Option<DhKeypair>,
    my_pub: PubSig,
    peer_pub_sig: PubSig,
    k_session: [u8; 32],
    mailbox_id: MailboxId,
    outbound: DirectionState,
    inbound: DirectionState,
    created_at: Timestamp,
    sink: EventSink,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn establish(
        sid: Sid,
        is_initiator: bool,
        base_index: u32,
        key_index: u32,
        my_sig: SigKeypair,
        my_dh: DhKeypair,
        peer_pub_sig: PubSig,
        k_session: [u8; 32],
        mailbox_id: MailboxId,
        created_at: Timestamp,
        sink: EventSink,
    ) -> Self {
        let my_pub = my_sig.public.clone();
        Self {
            sid,
            state: SessionState::Active,
            is_initiator,
            base_index,
            key_index,
            my_sig: Some(my_sig),
            my_dh: Some(my_dh),
            my_pub,
            peer_pub_sig,
            k_session,
            mailbox_id,
            outbound: DirectionState::new(),
            inbound: DirectionState::new(),
            created_at,
            sink,
        }
    }

    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mailbox_id(&self) -> &MailboxId {
        &self.mailbox_id
    }

    pub fn peer(&self) -> &PubSig {
        &self.peer_pub_sig
    }

    pub fn my_pub_sig(&self) -> &PubSig {
        &self.my_pub
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// The direction this side sends on.
    pub fn outbound_direction(&self) -> Direction {
        if self.is_initiator {
            Direction::AtoB
        } else {
            Direction::BtoA
        }
    }

    fn require_active(&self, op: &'static str) -> Result<(), KktpError> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Init => Err(KktpError::SessionNotActive("INIT")),
            SessionState::Faulted => Err(KktpError::SessionNotActive("FAULTED")),
            SessionState::Closed => {
                debug!(op, "operation on closed session");
                Err(KktpError::SessionNotActive("CLOSED"))
            }
        }
    }

    fn fault(&mut self, reason: &str) {
        warn!(sid = %self.sid, reason, "session faulted");
        self.state = SessionState::Faulted;
        self.sink.emit(GameEvent::SessionFaulted {
            sid: self.sid.clone(),
            reason: reason.to_string(),
        });
    }

    // ── Send ─────────────────────────────────────────────────────────────────

    /// Seal one outbound packet; the counter increments after use.
    pub fn send_message(&mut self, plaintext: &[u8]) -> Result<SessionMessage, KktpError> {
        self.require_active("send_message")?;
        let seq = self.outbound.next_seq;
        let message = seal_message(
            &self.k_session,
            &self.sid,
            self.outbound_direction(),
            seq,
            plaintext,
        )?;
        self.outbound.next_seq += 1;
        Ok(message)
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Apply the receive discipline to one inbound packet. Returns the
    /// plaintexts that became deliverable, in contiguous seq order.
    pub fn receive(
        &mut self,
        message: &SessionMessage,
        now: Timestamp,
    ) -> Result<Vec<Vec<u8>>, KktpError> {
        self.require_active("receive")?;

        let msg_sid = message.sid()?;
        if msg_sid != self.sid {
            self.fault("unexpected sid");
            return Err(KktpError::UnexpectedSid {
                expected: self.sid.to_hex(),
                got: msg_sid.to_hex(),
            });
        }
        if message.direction != self.outbound_direction().opposite() {
            // A packet claiming to flow in our own direction is malformed
            // input, not a protocol fault.
            return Err(KktpError::InvalidMessage("wrong direction".into()));
        }

        let expected = self.inbound.next_seq;
        if message.seq < expected {
            return Err(KktpError::StaleSequence { expected, got: message.seq });
        }

        let nonce = message.nonce_bytes()?;
        if self.inbound.nonce_seen(&nonce) {
            debug!(sid = %self.sid, seq = message.seq, "nonce replay rejected");
            return Err(KktpError::NonceReplay);
        }

        if message.seq > expected {
            if self.inbound.pending.len() >= REASSEMBLY_MAX {
                self.fault("reassembly buffer overflow");
                return Err(KktpError::ReassemblyOverflow);
            }
            let gap_start = *self.inbound.gap_start.get_or_insert(now);
            self.inbound.pending.insert(message.seq, message.clone());
            if now - gap_start > GAP_TIMEOUT_MS {
                self.fault("sequence gap timeout");
                return Err(KktpError::GapTimeout { expected });
            }
            return Ok(Vec::new());
        }

        // In-order: decrypt, then drain whatever became contiguous.
        let mut delivered = Vec::new();
        let mut current = message.clone();
        loop {
            match open_message(&self.k_session, &current) {
                Ok(plaintext) => {
                    let nonce = current.nonce_bytes()?;
                    self.inbound.replay.put(nonce, ());
                    self.inbound.next_seq += 1;
                    delivered.push(plaintext);
                }
                Err(_) => {
                    self.fault("AEAD authentication failure");
                    return Err(KktpError::AeadFailure);
                }
            }
            match self.inbound.pending.remove(&self.inbound.next_seq) {
                Some(next) => current = next,
                None => break,
            }
        }

        // The gap either closed or moved forward; restart its clock.
        self.inbound.gap_start =
            if self.inbound.pending.is_empty() { None } else { Some(now) };
        Ok(delivered)
    }

    /// Timer-driven gap check: faults the session when an open gap expires.
    pub fn poll_gap(&mut self, now: Timestamp) -> Result<(), KktpError> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        if let Some(gap_start) = self.inbound.gap_start {
            if now - gap_start > GAP_TIMEOUT_MS {
                let expected = self.inbound.next_seq;
                self.fault("sequence gap timeout");
                return Err(KktpError::GapTimeout { expected });
            }
        }
        Ok(())
    }

    // ── Termination ──────────────────────────────────────────────────────────

    /// Sign a session-end record. Never sent from a FAULTED session.
    pub fn create_end_anchor(&self, reason: &str) -> Result<SessionEndAnchor, KktpError> {
        self.require_active("create_end_anchor")?;
        let sig = self
            .my_sig
            .as_ref()
            .ok_or_else(|| KktpError::Other("signing key dropped".into()))?;
        SessionEndAnchor::build(&self.sid, sig, reason)
    }

    /// Accept a remote session-end: signer must be this side or the peer.
    pub fn accept_end_anchor(&mut self, anchor: &SessionEndAnchor) -> Result<(), KktpError> {
        anchor.verify()?;
        let signer = anchor.signer()?;
        if signer != self.my_pub && signer != self.peer_pub_sig {
            return Err(KktpError::InvalidAnchor("end anchor from unknown signer".into()));
        }
        self.close();
        Ok(())
    }

    /// Zeroise key material, wipe buffers, and transition to CLOSED.
    pub fn close(&mut self) {
        self.k_session.zeroize();
        self.my_sig = None;
        self.my_dh = None;
        self.inbound.clear();
        self.outbound.clear();
        self.state = SessionState::Closed;
        self.sink.emit(GameEvent::SessionClosed { sid: self.sid.clone() });
    }

    // ── Resume ───────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sid: self.sid.clone(),
            mailbox_id: self.mailbox_id.clone(),
            base_index: self.base_index,
            key_index: self.key_index,
            is_initiator: self.is_initiator,
            created_at: self.created_at,
            peer_pub_sig: self.peer_pub_sig.clone(),
            k_session: (self.state == SessionState::Active).then_some(self.k_session),
            outbound_seq: self.outbound.next_seq,
            inbound_seq: self.inbound.next_seq,
        }
    }

    /// Rebuild a session from a snapshot and re-derived branch keys. With a
    /// session key present the session resumes ACTIVE with its counters, so
    /// no prior message can be replayed into it.
    pub fn resume(
        snapshot: SessionSnapshot,
        my_sig: SigKeypair,
        my_dh: DhKeypair,
        sink: EventSink,
    ) -> Result<Self, KktpError> {
        let k_session = snapshot
            .k_session
            .ok_or_else(|| KktpError::SessionNotActive("INIT"))?;
        let mut session = Self::establish(
            snapshot.sid,
            snapshot.is_initiator,
            snapshot.base_index,
            snapshot.key_index,
            my_sig,
            my_dh,
            snapshot.peer_pub_sig,
            k_session,
            snapshot.mailbox_id,
            snapshot.created_at,
            sink,
        );
        session.outbound.next_seq = snapshot.outbound_seq;
        session.inbound.next_seq = snapshot.inbound_seq;
        Ok(session)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.k_session.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_crypto::hash::session_mailbox_id;

    fn pair() -> (Session, Session) {
        let sid = Sid::from_bytes([1; 32]);
        let a_sig = SigKeypair::from_secret_bytes([2; 32]);
        let b_sig = SigKeypair::from_secret_bytes([3; 32]);
        let a_pub = a_sig.public.clone();
        let b_pub = b_sig.public.clone();
        let mailbox = session_mailbox_id(&sid, &a_pub, &b_pub);
        let key = [9u8; 32];
        let a = Session::establish(
            sid.clone(),
            true,
            100,
            101,
            a_sig,
            DhKeypair::from_secret_bytes([4; 32]),
            b_pub.clone(),
            key,
            mailbox.clone(),
            0,
            EventSink::disconnected(),
        );
        let b = Session::establish(
            sid,
            false,
            100,
            102,
            b_sig,
            DhKeypair::from_secret_bytes([5; 32]),
            a_pub,
            key,
            mailbox,
            0,
            EventSink::disconnected(),
        );
        (a, b)
    }

    #[test]
    fn out_of_order_buffering_and_replay_rejection() {
        let (mut a, mut b) = pair();
        let m0 = a.send_message(b"zero").unwrap();
        let m1 = a.send_message(b"one").unwrap();
        let m2 = a.send_message(b"two").unwrap();

        // Receives 0, then 2 (buffered), then 1 (delivers 1 and 2).
        assert_eq!(b.receive(&m0, 1_000).unwrap(), vec![b"zero".to_vec()]);
        assert_eq!(b.receive(&m2, 1_100).unwrap(), Vec::<Vec<u8>>::new());
        let delivered = b.receive(&m1, 1_200).unwrap();
        assert_eq!(delivered, vec![b"one".to_vec(), b"two".to_vec()]);

        // Replaying seq=1's packet: stale seq (and its nonce is cached).
        assert!(matches!(
            b.receive(&m1, 1_300).unwrap_err(),
            KktpError::StaleSequence { .. }
        ));
        assert_eq!(b.inbound.replay.len(), 3);
        assert_eq!(b.state(), SessionState::Active);
    }

    #[test]
    fn replayed_nonce_at_future_seq_rejected() {
        let (mut a, mut b) = pair();
        let m0 = a.send_message(b"zero").unwrap();
        b.receive(&m0, 0).unwrap();
        // Same nonce re-sent under a fresh (future) seq.
        let mut forged = m0.clone();
        forged.seq = 5;
        assert!(matches!(b.receive(&forged, 0).unwrap_err(), KktpError::NonceReplay));
    }

    #[test]
    fn tampered_ciphertext_faults_session() {
        let (mut a, mut b) = pair();
        let mut m0 = a.send_message(b"zero").unwrap();
        m0.ciphertext = {
            let mut raw = hex::decode(&m0.ciphertext).unwrap();
            raw[0] ^= 0xFF;
            hex::encode(raw)
        };
        assert!(matches!(b.receive(&m0, 0).unwrap_err(), KktpError::AeadFailure));
        assert_eq!(b.state(), SessionState::Faulted);
        // A faulted session accepts nothing and signs no end anchor.
        assert!(b.send_message(b"x").is_err());
        assert!(b.create_end_anchor("bye").is_err());
    }

    #[test]
    fn gap_timeout_faults() {
        let (mut a, mut b) = pair();
        let _m0 = a.send_message(b"zero").unwrap();
        let m1 = a.send_message(b"one").unwrap();

        // m0 lost; m1 buffers and opens the gap at t=1000.
        assert!(b.receive(&m1, 1_000).unwrap().is_empty());
        assert!(b.poll_gap(30_000).is_ok());
        assert!(matches!(
            b.poll_gap(62_000).unwrap_err(),
            KktpError::GapTimeout { expected: 0 }
        ));
        assert_eq!(b.state(), SessionState::Faulted);
    }

    #[test]
    fn reassembly_overflow_faults() {
        let (mut a, mut b) = pair();
        let _m0 = a.send_message(b"lost").unwrap();
        let mut messages = Vec::new();
        for i in 0..=REASSEMBLY_MAX {
            messages.push(a.send_message(format!("m{i}").as_bytes()).unwrap());
        }
        for (i, m) in messages.iter().enumerate() {
            match b.receive(m, 1_000 + i as i64) {
                Ok(delivered) => assert!(delivered.is_empty()),
                Err(KktpError::ReassemblyOverflow) => {
                    assert_eq!(i, REASSEMBLY_MAX);
                    assert_eq!(b.state(), SessionState::Faulted);
                    return;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        panic!("overflow never hit");
    }

    #[test]
    fn wrong_sid_faults() {
        let (mut a, mut b) = pair();
        let mut m0 = a.send_message(b"zero").unwrap();
        m0.sid = Sid::from_bytes([7; 32]).to_hex();
        // AAD check would also fail, but the sid gate trips first.
        assert!(matches!(
            b.receive(&m0, 0).unwrap_err(),
            KktpError::UnexpectedSid { .. }
        ));
        assert_eq!(b.state(), SessionState::Faulted);
    }

    #[test]
    fn close_zeroises_session_key() {
        let (mut a, _b) = pair();
        a.close();
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(a.k_session, [0u8; 32]);
        assert!(a.my_sig.is_none());
        assert!(a.send_message(b"x").is_err());
    }

    #[test]
    fn end_anchor_from_stranger_rejected() {
        let (a, mut b) = pair();
        let end = a.create_end_anchor("done").unwrap();
        // Peer accepts the genuine end.
        b.accept_end_anchor(&end).unwrap();
        assert_eq!(b.state(), SessionState::Closed);

        let (_a2, mut b2) = pair();
        let stranger = SigKeypair::from_secret_bytes([42; 32]);
        let forged =
            SessionEndAnchor::build(&Sid::from_bytes([1; 32]), &stranger, "gotcha").unwrap();
        assert!(b2.accept_end_anchor(&forged).is_err());
        assert_eq!(b2.state(), SessionState::Active);
    }

    #[test]
    fn snapshot_resume_preserves_counters() {
        let (mut a, mut b) = pair();
        a.send_message(b"one").unwrap();
        a.send_message(b"two").unwrap();
        let m = a.send_message(b"three").unwrap();
        b.receive(&m, 0).ok(); // buffered (0,1 never arrived)

        let snapshot = a.snapshot();
        assert_eq!(snapshot.outbound_seq, 3);

        let resumed_sig = SigKeypair::from_secret_bytes([2; 32]);
        let resumed_dh = DhKeypair::from_secret_bytes([4; 32]);
        let mut resumed =
            Session::resume(snapshot, resumed_sig, resumed_dh, EventSink::disconnected()).unwrap();
        assert_eq!(resumed.state(), SessionState::Active);

        // The next message continues the exported counter.
        let next = resumed.send_message(b"four").unwrap();
        assert_eq!(next.seq, 3);
    }
}

use std::collections::HashMap;

use rand::RngCore;
use tracing::{debug, info};

use kktp_core::constants::{KKTP_ANCHOR_PREFIX, KKTP_GROUP_PREFIX, KKTP_MAILBOX_PREFIX};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::jcs;
use kktp_core::types::{now_ms, MailboxId, PubSig, SessionState, Sid, Timestamp};
use kktp_crypto::hash::session_mailbox_id;
use kktp_crypto::kdf::derive_session_key;

use crate::anchors::{
    parse_anchor_payload, to_anchor_payload, DiscoveryAnchor, DiscoveryMeta, KktpAnchor,
    ResponseAnchor, SessionEndAnchor,
};
use crate::identity::IdentityManager;
use crate::session::{Session, SessionSnapshot};
use crate::transport::SessionMessage;

/// A pending offer we published. Branch keys re-derive from the index, so a
/// lobby discovery can accept any number of responders.
struct PendingDiscovery {
    base_index: u32,
    key_index: u32,
    created_at: Timestamp,
}

/// What became of one inbound `KKTP:ANCHOR:` payload.
#[derive(Debug)]
pub enum AnchorOutcome {
    /// A handshake completed; the session is ACTIVE under this mailbox.
    Established(MailboxId),
    /// Someone else's session offer; policy above decides whether to respond.
    DiscoveryObserved(Box<DiscoveryAnchor>),
    /// A verified session-end closed one of our sessions.
    Closed(MailboxId),
    /// Not addressed to us (response without a pending discovery, etc).
    Ignored,
}

/// Owns every 1:1 session plus the pending-discovery table; routes inbound
/// payloads by mailbox and drives both sides of the handshake.
///
/// Sessions are keyed by mailbox id: a lobby host holds one session per
/// member, all sharing the discovery sid.
pub struct SessionManager {
    identity: IdentityManager,
    sink: EventSink,
    pending: HashMap<Sid, PendingDiscovery>,
    sessions: HashMap<MailboxId, Session>,
}

impl SessionManager {
    pub fn new(identity: IdentityManager, sink: EventSink) -> Self {
        Self { identity, sink, pending: HashMap::new(), sessions: HashMap::new() }
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn session(&self, handle: &MailboxId) -> Option<&Session> {
        self.sessions.get(handle)
    }

    pub fn session_mut(&mut self, handle: &MailboxId) -> Option<&mut Session> {
        self.sessions.get_mut(handle)
    }

    pub fn active_handles(&self) -> Vec<MailboxId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Active)
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    pub fn handle_for_peer(&self, peer: &PubSig) -> Option<MailboxId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.peer() == peer && s.state() == SessionState::Active)
            .map(|(handle, _)| handle.clone())
    }

    /// The single ACTIVE session for a sid, if unambiguous (1:1 flows).
    pub fn handle_for_sid(&self, sid: &Sid) -> Option<MailboxId> {
        let mut found = None;
        for (handle, session) in &self.sessions {
            if session.sid() == sid && session.state() == SessionState::Active {
                if found.is_some() {
                    return None;
                }
                found = Some(handle.clone());
            }
        }
        found
    }

    // ── Initiator side ───────────────────────────────────────────────────────

    /// Create and sign a session offer. Burns a fresh key branch; the branch
    /// stays burned even if nobody ever responds.
    pub fn create_discovery(
        &mut self,
        meta: DiscoveryMeta,
    ) -> Result<(Sid, DiscoveryAnchor, String), KktpError> {
        let mut sid_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut sid_bytes);
        let sid = Sid::from_bytes(sid_bytes);

        let base_index = self.identity.allocate_base_index()?;
        let key_index = IdentityManager::key_index(base_index, true);
        let (sig, dh) = self.identity.keys_at(key_index);

        let anchor = DiscoveryAnchor::build(&sid, &sig, &dh.public, meta)?;
        let payload = to_anchor_payload(&KktpAnchor::Discovery(anchor.clone()))?;
        self.pending
            .insert(sid.clone(), PendingDiscovery { base_index, key_index, created_at: now_ms() });
        info!(sid = %sid, base_index, "discovery created");
        Ok((sid, anchor, payload))
    }

    /// Complete the handshake from a verified response to our discovery.
    /// The pending entry stays armed: a lobby discovery accepts many
    /// responders, each yielding its own session.
    pub fn process_response(&mut self, response: &ResponseAnchor) -> Result<MailboxId, KktpError> {
        let sid = response.sid()?;
        let Some(pending) = self.pending.get(&sid) else {
            return Err(KktpError::UnknownSession(format!("no pending discovery for {sid}")));
        };
        response.verify()?;

        let (sig, dh) = self.identity.keys_at(pending.key_index);
        let responder_pub = PubSig::from_hex(&response.pub_sig_resp)?;
        let shared = dh.diffie_hellman(&response.dh_pub_bytes()?);
        let k_session = derive_session_key(&sid, &sig.public, &responder_pub, &shared);
        let mailbox = session_mailbox_id(&sid, &sig.public, &responder_pub);

        if self.sessions.contains_key(&mailbox) {
            debug!(sid = %sid, peer = %responder_pub, "duplicate response ignored");
            return Ok(mailbox);
        }

        self.identity.bind_peer(&responder_pub, pending.base_index)?;
        let session = Session::establish(
            sid.clone(),
            true,
            pending.base_index,
            pending.key_index,
            sig,
            dh,
            responder_pub.clone(),
            *k_session,
            mailbox.clone(),
            pending.created_at,
            self.sink.clone(),
        );
        self.sessions.insert(mailbox.clone(), session);
        info!(sid = %sid, peer = %responder_pub, "session established (initiator)");
        self.sink
            .emit(GameEvent::SessionEstablished { sid, peer: responder_pub });
        Ok(mailbox)
    }

    /// Forget a published offer (nobody may respond to it any more).
    pub fn abandon_discovery(&mut self, sid: &Sid) {
        self.pending.remove(sid);
    }

    // ── Responder side ───────────────────────────────────────────────────────

    /// Verify a session offer, derive the symmetric state, and produce the
    /// signed response payload to publish.
    pub fn accept_discovery(
        &mut self,
        discovery: &DiscoveryAnchor,
    ) -> Result<(MailboxId, ResponseAnchor, String), KktpError> {
        discovery.verify()?;
        let sid = discovery.sid()?;
        let initiator_pub = PubSig::from_hex(&discovery.pub_sig)?;

        let base_index = self.identity.base_index_for_peer(&initiator_pub)?;
        let key_index = IdentityManager::key_index(base_index, false);
        let (sig, dh) = self.identity.keys_at(key_index);

        let shared = dh.diffie_hellman(&discovery.dh_pub_bytes()?);
        let k_session = derive_session_key(&sid, &initiator_pub, &sig.public, &shared);
        let mailbox = session_mailbox_id(&sid, &initiator_pub, &sig.public);

        let response = ResponseAnchor::build(&sid, &sig, &dh.public)?;
        let payload = to_anchor_payload(&KktpAnchor::Response(response.clone()))?;

        let session = Session::establish(
            sid.clone(),
            false,
            base_index,
            key_index,
            sig,
            dh,
            initiator_pub.clone(),
            *k_session,
            mailbox.clone(),
            now_ms(),
            self.sink.clone(),
        );
        self.sessions.insert(mailbox.clone(), session);
        info!(sid = %sid, peer = %initiator_pub, "session established (responder)");
        self.sink
            .emit(GameEvent::SessionEstablished { sid, peer: initiator_pub });
        Ok((mailbox, response, payload))
    }

    // ── Transport ────────────────────────────────────────────────────────────

    /// Seal a message on an ACTIVE session and assemble its mailbox payload.
    pub fn send(
        &mut self,
        handle: &MailboxId,
        plaintext: &[u8],
    ) -> Result<(SessionMessage, String), KktpError> {
        let session = self
            .sessions
            .get_mut(handle)
            .ok_or_else(|| KktpError::UnknownSession(handle.to_hex()))?;
        let message = session.send_message(plaintext)?;
        let payload = format!(
            "{}{}:{}",
            KKTP_MAILBOX_PREFIX,
            handle.to_hex(),
            jcs::to_canonical_string(&message)?
        );
        Ok((message, payload))
    }

    /// Route a `KKTP:<mailbox>:` payload to its session. `Ok(None)` when the
    /// mailbox is not ours.
    pub fn handle_mailbox_payload(
        &mut self,
        text: &str,
        now: Timestamp,
    ) -> Result<Option<(MailboxId, Vec<Vec<u8>>)>, KktpError> {
        // Group and anchor payloads share the outer prefix; they are not ours.
        if text.starts_with(KKTP_ANCHOR_PREFIX) || text.starts_with(KKTP_GROUP_PREFIX) {
            return Ok(None);
        }
        let Some(rest) = text.strip_prefix(KKTP_MAILBOX_PREFIX) else {
            return Ok(None);
        };
        let Some((mailbox_hex, json)) = rest.split_once(':') else {
            return Ok(None);
        };
        let Ok(mailbox) = MailboxId::from_hex(mailbox_hex) else {
            return Ok(None);
        };
        let Some(session) = self.sessions.get_mut(&mailbox) else {
            return Ok(None);
        };

        let message: SessionMessage =
            serde_json::from_str(json).map_err(|e| KktpError::InvalidMessage(e.to_string()))?;
        let delivered = session.receive(&message, now)?;
        Ok(Some((mailbox, delivered)))
    }

    /// Dispatch a `KKTP:ANCHOR:` payload.
    pub fn handle_anchor_payload(&mut self, text: &str) -> Result<AnchorOutcome, KktpError> {
        let anchor = parse_anchor_payload(text)?;
        match anchor {
            KktpAnchor::Discovery(discovery) => {
                debug!(sid = %discovery.sid, "discovery observed");
                Ok(AnchorOutcome::DiscoveryObserved(Box::new(discovery)))
            }
            KktpAnchor::Response(response) => match self.process_response(&response) {
                Ok(handle) => Ok(AnchorOutcome::Established(handle)),
                Err(KktpError::UnknownSession(_)) => Ok(AnchorOutcome::Ignored),
                Err(e) => Err(e),
            },
            KktpAnchor::SessionEnd(end) => {
                let sid = Sid::from_hex(&end.sid)?;
                let signer = end.signer()?;
                // The end applies to the session with that sid whose parties
                // include the signer.
                let target = self.sessions.iter().find_map(|(handle, s)| {
                    (s.sid() == &sid
                        && (s.peer() == &signer || s.my_pub_sig() == &signer)
                        && s.state() == SessionState::Active)
                        .then(|| handle.clone())
                });
                match target {
                    Some(handle) => {
                        let session = self.sessions.get_mut(&handle).expect("handle just found");
                        session.accept_end_anchor(&end)?;
                        Ok(AnchorOutcome::Closed(handle))
                    }
                    None => Ok(AnchorOutcome::Ignored),
                }
            }
        }
    }

    /// Sign a session-end, close the local side, and return the payload.
    pub fn end_session(
        &mut self,
        handle: &MailboxId,
        reason: &str,
    ) -> Result<(SessionEndAnchor, String), KktpError> {
        let session = self
            .sessions
            .get_mut(handle)
            .ok_or_else(|| KktpError::UnknownSession(handle.to_hex()))?;
        let anchor = session.create_end_anchor(reason)?;
        let payload = to_anchor_payload(&KktpAnchor::SessionEnd(anchor.clone()))?;
        session.close();
        Ok((anchor, payload))
    }

    /// Gap-timer sweep across all ACTIVE sessions.
    pub fn poll_gaps(&mut self, now: Timestamp) {
        for session in self.sessions.values_mut() {
            let _ = session.poll_gap(now);
        }
    }

    /// Close everything (shutdown). Keys zeroise per session.
    pub fn close_all(&mut self) {
        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Active {
                session.close();
            }
        }
    }

    // ── Resume ───────────────────────────────────────────────────────────────

    /// Export all ACTIVE sessions and persist them in the session store.
    pub fn export_sessions(&self) -> Result<Vec<SessionSnapshot>, KktpError> {
        let store = self.identity.store();
        let mut snapshots = Vec::new();
        for session in self.sessions.values() {
            if session.state() != SessionState::Active {
                continue;
            }
            let snapshot = session.snapshot();
            let bytes = bincode::serialize(&snapshot)
                .map_err(|e| KktpError::Serialization(e.to_string()))?;
            store.put_session(
                &snapshot.mailbox_id,
                &snapshot.sid,
                KKTP_MAILBOX_PREFIX,
                now_ms(),
                bytes,
            )?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    /// Rebuild one session from its snapshot; keys re-derive from the branch
    /// index, and the restored counters ensure no prior message replays.
    pub fn resume_session(&mut self, snapshot: SessionSnapshot) -> Result<MailboxId, KktpError> {
        // The peer must be known to the registry (it was bound at handshake).
        if self.identity.lookup_peer(&snapshot.peer_pub_sig)?.is_none() {
            return Err(KktpError::UnknownPeer(snapshot.peer_pub_sig.to_hex()));
        }
        let key_index = IdentityManager::key_index(snapshot.base_index, snapshot.is_initiator);
        if key_index != snapshot.key_index {
            return Err(KktpError::InvalidMessage("snapshot key index mismatch".into()));
        }
        let (sig, dh) = self.identity.keys_at(key_index);
        let mailbox = snapshot.mailbox_id.clone();
        let session = Session::resume(snapshot, sig, dh, self.sink.clone())?;
        self.sessions.insert(mailbox.clone(), session);
        info!(mailbox = %mailbox, "session resumed");
        Ok(mailbox)
    }

    /// Restore every persisted session from the store.
    pub fn restore_all(&mut self) -> Result<Vec<MailboxId>, KktpError> {
        let store = self.identity.store();
        let mut restored = Vec::new();
        for (_, snapshot_bytes) in store.iter_sessions()? {
            let snapshot: SessionSnapshot = bincode::deserialize(&snapshot_bytes)
                .map_err(|e| KktpError::Serialization(e.to_string()))?;
            restored.push(self.resume_session(snapshot)?);
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_crypto::keys::MasterKey;

    fn manager(seed: u8) -> SessionManager {
        let dir = std::env::temp_dir().join(format!(
            "kktp_mgr_{}_{}_{}",
            seed,
            std::process::id(),
            rand::random::<u64>()
        ));
        let store = std::sync::Arc::new(crate::store::SessionStore::open(dir).unwrap());
        SessionManager::new(
            IdentityManager::new(MasterKey::from_bytes([seed; 32]), store),
            EventSink::disconnected(),
        )
    }

    fn meta() -> DiscoveryMeta {
        DiscoveryMeta {
            game: "slap-jack".into(),
            version: "1".into(),
            expected_uptime_secs: 60,
            lobby: None,
            lobby_name: None,
            max_members: None,
        }
    }

    fn handshake(alice: &mut SessionManager, bob: &mut SessionManager) -> MailboxId {
        let (_sid, discovery, _payload) = alice.create_discovery(meta()).unwrap();
        let (handle_b, response, _resp_payload) = bob.accept_discovery(&discovery).unwrap();
        let handle_a = alice.process_response(&response).unwrap();
        assert_eq!(handle_a, handle_b, "both sides derive the same mailbox");
        handle_a
    }

    #[test]
    fn two_party_handshake_and_messaging() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let handle = handshake(&mut alice, &mut bob);

        // Alice → Bob over the mailbox payload path.
        let (_msg, payload) = alice.send(&handle, b"ping").unwrap();
        let (got, delivered) = bob.handle_mailbox_payload(&payload, 0).unwrap().unwrap();
        assert_eq!(got, handle);
        assert_eq!(delivered, vec![b"ping".to_vec()]);

        // And back.
        let (_msg, payload) = bob.send(&handle, b"pong").unwrap();
        let (_, delivered) = alice.handle_mailbox_payload(&payload, 0).unwrap().unwrap();
        assert_eq!(delivered, vec![b"pong".to_vec()]);
    }

    #[test]
    fn one_discovery_accepts_many_responders() {
        let mut host = manager(1);
        let mut alice = manager(2);
        let mut bob = manager(3);

        let (_sid, discovery, _) = host.create_discovery(meta()).unwrap();
        let (h_alice, resp_a, _) = alice.accept_discovery(&discovery).unwrap();
        let (h_bob, resp_b, _) = bob.accept_discovery(&discovery).unwrap();
        assert_ne!(h_alice, h_bob, "per-member mailboxes differ");

        assert_eq!(host.process_response(&resp_a).unwrap(), h_alice);
        assert_eq!(host.process_response(&resp_b).unwrap(), h_bob);
        assert_eq!(host.active_handles().len(), 2);

        // Messages route independently.
        let (_m, p) = host.send(&h_alice, b"to alice").unwrap();
        assert!(bob.handle_mailbox_payload(&p, 0).unwrap().is_none());
        let (_, delivered) = alice.handle_mailbox_payload(&p, 0).unwrap().unwrap();
        assert_eq!(delivered, vec![b"to alice".to_vec()]);
    }

    #[test]
    fn out_of_order_scenario_via_payload_route() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let handle = handshake(&mut alice, &mut bob);

        let (_m0, p0) = alice.send(&handle, b"zero").unwrap();
        let (_m1, p1) = alice.send(&handle, b"one").unwrap();
        let (_m2, p2) = alice.send(&handle, b"two").unwrap();

        assert_eq!(
            bob.handle_mailbox_payload(&p0, 0).unwrap().unwrap().1,
            vec![b"zero".to_vec()]
        );
        assert!(bob.handle_mailbox_payload(&p2, 0).unwrap().unwrap().1.is_empty());
        let (_, delivered) = bob.handle_mailbox_payload(&p1, 0).unwrap().unwrap();
        assert_eq!(delivered, vec![b"one".to_vec(), b"two".to_vec()]);

        // Replay of p1 is rejected at the session layer.
        assert!(bob.handle_mailbox_payload(&p1, 0).is_err());
    }

    #[test]
    fn foreign_mailboxes_are_ignored() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let mut carol = manager(3);
        let handle = handshake(&mut alice, &mut bob);

        let (_msg, payload) = alice.send(&handle, b"for bob only").unwrap();
        // Carol shares no session; the payload is simply not hers.
        assert!(carol.handle_mailbox_payload(&payload, 0).unwrap().is_none());
    }

    #[test]
    fn response_without_pending_discovery_ignored() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let (_sid, discovery, _) = alice.create_discovery(meta()).unwrap();
        let (_handle, response, _) = bob.accept_discovery(&discovery).unwrap();

        let mut carol = manager(3);
        let payload = to_anchor_payload(&KktpAnchor::Response(response)).unwrap();
        assert!(matches!(
            carol.handle_anchor_payload(&payload).unwrap(),
            AnchorOutcome::Ignored
        ));
    }

    #[test]
    fn session_end_closes_remote() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let handle = handshake(&mut alice, &mut bob);

        let (_anchor, payload) = alice.end_session(&handle, "all done").unwrap();
        assert_eq!(alice.session(&handle).unwrap().state(), SessionState::Closed);

        match bob.handle_anchor_payload(&payload).unwrap() {
            AnchorOutcome::Closed(closed) => assert_eq!(closed, handle),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(bob.session(&handle).unwrap().state(), SessionState::Closed);
    }

    #[test]
    fn export_resume_continues_counters() {
        let mut alice = manager(1);
        let mut bob = manager(2);
        let handle = handshake(&mut alice, &mut bob);
        let (_m, p0) = alice.send(&handle, b"one").unwrap();
        let (_m, p1) = alice.send(&handle, b"two").unwrap();
        bob.handle_mailbox_payload(&p0, 0).unwrap();
        bob.handle_mailbox_payload(&p1, 0).unwrap();

        let snapshots = alice.export_sessions().unwrap();
        assert_eq!(snapshots.len(), 1);

        // A fresh manager over the same store and master key resumes.
        let store = alice.identity.store();
        let mut alice2 = SessionManager::new(
            IdentityManager::new(MasterKey::from_bytes([1; 32]), store),
            EventSink::disconnected(),
        );
        alice2.restore_all().unwrap();

        let (msg, _payload) = alice2.send(&handle, b"three").unwrap();
        assert_eq!(msg.seq, 2, "resumed outbound counter continues");
        // Bob can still decrypt: same key, expected seq.
        let delivered = bob
            .session_mut(&handle)
            .unwrap()
            .receive(&msg, 0)
            .unwrap();
        assert_eq!(delivered, vec![b"three".to_vec()]);
    }
}

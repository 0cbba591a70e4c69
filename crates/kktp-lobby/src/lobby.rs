use std::collections::{HashMap, HashSet, VecDeque};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kktp_core::constants::{JOIN_CODE_TX_PREFIX_LEN, KKTP_GROUP_PREFIX};
use kktp_core::error::KktpError;
use kktp_core::events::{EventSink, GameEvent};
use kktp_core::jcs;
use kktp_core::types::{now_ms, KeyVersion, LobbyState, MailboxId, PubSig, Sid, Timestamp, TxId};
use kktp_crypto::hash::group_mailbox_id;
use kktp_session::anchors::{DiscoveryAnchor, DiscoveryMeta};
use kktp_session::manager::SessionManager;

use crate::vault::{DecryptOutcome, GroupKeyVault, GroupMessage};

// ── Wire forms ───────────────────────────────────────────────────────────────

/// Direct messages inside a host↔member session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyDm {
    LobbyJoinRequest {
        display_name: String,
    },
    LobbyJoinResponse {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        lobby_name: String,
        host_pub_sig: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_key: Option<String>,
        key_version: KeyVersion,
        members: Vec<MemberInfo>,
    },
    LobbyKeyRotation {
        group_key: String,
        key_version: KeyVersion,
    },
    LobbyKick {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    pub pub_sig: String,
    pub display_name: String,
}

/// Records riding the shared group mailbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupWire {
    GroupMessage(GroupMessage),
    LobbyMemberEvent { event: String, pub_sig: String, display_name: String },
    /// Unencrypted control record; members verify it came over the lobby's
    /// own mailbox.
    LobbyClose { lobby_id: String },
}

#[derive(Clone, Debug)]
pub struct Member {
    pub pub_sig: PubSig,
    pub display_name: String,
    /// The host's DM session with this member (host side only).
    pub dm: Option<MailboxId>,
    pub joined_at: Timestamp,
}

pub struct Lobby {
    pub lobby_id: Sid,
    pub lobby_name: String,
    pub host_pub_sig: PubSig,
    pub my_pub_sig: PubSig,
    pub members: HashMap<PubSig, Member>,
    pub vault: GroupKeyVault,
    pub group_mailbox: MailboxId,
    pub max_members: usize,
    pub created_at: Timestamp,
    pub state: LobbyState,
    /// Block hash of the hosting discovery plus a short txid prefix.
    pub join_code: Option<String>,
    /// Member side: the DM session to the host.
    pub host_dm: Option<MailboxId>,
}

impl Lobby {
    pub fn is_host(&self) -> bool {
        self.my_pub_sig == self.host_pub_sig
    }
}

fn fresh_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn group_payload(mailbox: &MailboxId, wire: &GroupWire) -> Result<String, KktpError> {
    Ok(format!("{}{}:{}", KKTP_GROUP_PREFIX, mailbox.to_hex(), jcs::to_canonical_string(wire)?))
}

fn dm_bytes(dm: &LobbyDm) -> Result<Vec<u8>, KktpError> {
    jcs::to_canonical_bytes(dm)
}

// ── Lobby manager ────────────────────────────────────────────────────────────

/// The N-party layer: one lobby at a time, per-member DM sessions, a shared
/// group mailbox, and versioned group-key rotation.
///
/// All ledger writes are returned as payload strings for the owner to
/// publish; the manager itself never touches the adapter.
pub struct LobbyManager {
    sink: EventSink,
    lobby: Option<Lobby>,
    /// Duplicate suppression for group messages by `(sender, nonce)`.
    seen_nonces: HashSet<(String, String)>,
    /// Join requests processed strictly one at a time.
    join_queue: VecDeque<(MailboxId, String)>,
    join_in_progress: bool,
    auto_accept: bool,
}

impl LobbyManager {
    pub fn new(sink: EventSink, auto_accept: bool) -> Self {
        Self {
            sink,
            lobby: None,
            seen_nonces: HashSet::new(),
            join_queue: VecDeque::new(),
            join_in_progress: false,
            auto_accept,
        }
    }

    pub fn lobby(&self) -> Option<&Lobby> {
        self.lobby.as_ref()
    }

    pub fn state(&self) -> LobbyState {
        self.lobby.as_ref().map(|l| l.state).unwrap_or(LobbyState::Idle)
    }

    fn lobby_mut(&mut self, op: &'static str) -> Result<&mut Lobby, KktpError> {
        match self.lobby.as_mut() {
            Some(lobby) => Ok(lobby),
            None => {
                debug!(op, "no active lobby");
                Err(KktpError::LobbyBadState("IDLE"))
            }
        }
    }

    fn reset(&mut self) {
        self.lobby = None;
        self.seen_nonces.clear();
        self.join_queue.clear();
        self.join_in_progress = false;
    }

    // ── Host flow ────────────────────────────────────────────────────────────

    /// Create a lobby: broadcast a lobby-flagged discovery and initialise the
    /// group key at version 1. Returns the lobby id, the discovery anchor
    /// (members need it to respond), and the payload to publish.
    pub fn create_lobby(
        &mut self,
        sessions: &mut SessionManager,
        lobby_name: &str,
        max_members: usize,
        game: &str,
        version: &str,
    ) -> Result<(Sid, DiscoveryAnchor, String), KktpError> {
        if self.lobby.is_some() {
            return Err(KktpError::LobbyBadState("already in a lobby"));
        }
        let meta = DiscoveryMeta {
            game: game.to_string(),
            version: version.to_string(),
            expected_uptime_secs: 3_600,
            lobby: Some(true),
            lobby_name: Some(lobby_name.to_string()),
            max_members: Some(max_members),
        };
        let (lobby_id, anchor, payload) = sessions.create_discovery(meta)?;
        let my_pub = PubSig::from_hex(&anchor.pub_sig)?;

        self.lobby = Some(Lobby {
            lobby_id: lobby_id.clone(),
            lobby_name: lobby_name.to_string(),
            host_pub_sig: my_pub.clone(),
            my_pub_sig: my_pub,
            members: HashMap::new(),
            vault: GroupKeyVault::new(fresh_key(), 1),
            group_mailbox: group_mailbox_id(&lobby_id),
            max_members,
            created_at: now_ms(),
            state: LobbyState::Hosting,
            join_code: None,
            host_dm: None,
        });
        info!(lobby_id = %lobby_id, lobby_name, "lobby created");
        Ok((lobby_id, anchor, payload))
    }

    /// Record the join code once the discovery's containing block is known:
    /// the block hash suffixed with a short txid prefix for disambiguation.
    pub fn set_join_code(&mut self, block_hash_hex: &str, tx_id: &TxId) -> Result<String, KktpError> {
        let sink = self.sink.clone();
        let lobby = self.lobby_mut("set_join_code")?;
        let code = format!(
            "{}:{}",
            block_hash_hex,
            &tx_id.to_hex()[..JOIN_CODE_TX_PREFIX_LEN]
        );
        lobby.join_code = Some(code.clone());
        sink.emit(GameEvent::LobbyCreated {
            lobby_id: lobby.lobby_id.clone(),
            join_code: code.clone(),
        });
        Ok(code)
    }

    /// Split a join code into `(block hash hex, txid prefix)`.
    pub fn parse_join_code(code: &str) -> Result<(String, String), KktpError> {
        let (block_hex, tx_prefix) = code
            .split_once(':')
            .ok_or_else(|| KktpError::InvalidMessage("malformed join code".into()))?;
        if block_hex.len() != 64 || tx_prefix.len() != JOIN_CODE_TX_PREFIX_LEN {
            return Err(KktpError::InvalidMessage("malformed join code".into()));
        }
        Ok((block_hex.to_string(), tx_prefix.to_string()))
    }

    /// True when there is a queued join and none is mid-flight.
    pub fn join_ready(&self) -> bool {
        !self.join_in_progress && !self.join_queue.is_empty()
    }

    /// Process exactly one queued join. `decision` overrides the auto-accept
    /// policy bit when given. Returns the payloads to publish, in order; the
    /// caller runs its UTXO refresh and then calls [`join_step_done`].
    pub fn process_next_join(
        &mut self,
        sessions: &mut SessionManager,
        decision: Option<bool>,
        now: Timestamp,
    ) -> Result<Vec<String>, KktpError> {
        if self.join_in_progress {
            return Err(KktpError::LobbyBadState("join already in progress"));
        }
        let auto = self.auto_accept;
        let Some((dm, display_name)) = self.join_queue.pop_front() else {
            return Ok(Vec::new());
        };
        let sink = self.sink.clone();
        let lobby = self.lobby_mut("process_next_join")?;
        if !lobby.is_host() {
            return Err(KktpError::NotHost);
        }

        let accept = decision.unwrap_or(auto) && lobby.members.len() < lobby.max_members;
        let mut payloads = Vec::new();

        let peer = sessions
            .session(&dm)
            .ok_or_else(|| KktpError::UnknownSession(dm.to_hex()))?
            .peer()
            .clone();

        if accept {
            let response = LobbyDm::LobbyJoinResponse {
                accepted: true,
                reason: None,
                lobby_name: lobby.lobby_name.clone(),
                host_pub_sig: lobby.host_pub_sig.to_hex(),
                group_key: Some(hex::encode(lobby.vault.current_key())),
                key_version: lobby.vault.current_version(),
                members: lobby
                    .members
                    .values()
                    .map(|m| MemberInfo {
                        pub_sig: m.pub_sig.to_hex(),
                        display_name: m.display_name.clone(),
                    })
                    .collect(),
            };
            let (_msg, dm_payload) = sessions.send(&dm, &dm_bytes(&response)?)?;
            payloads.push(dm_payload);

            lobby.members.insert(
                peer.clone(),
                Member {
                    pub_sig: peer.clone(),
                    display_name: display_name.clone(),
                    dm: Some(dm.clone()),
                    joined_at: now,
                },
            );
            // Announce over the group mailbox.
            payloads.push(group_payload(
                &lobby.group_mailbox,
                &GroupWire::LobbyMemberEvent {
                    event: "join".into(),
                    pub_sig: peer.to_hex(),
                    display_name: display_name.clone(),
                },
            )?);
            info!(member = %peer, display_name, "member joined");
            sink.emit(GameEvent::LobbyMemberJoined { member: peer, display_name });
        } else {
            let reason = if lobby.members.len() >= lobby.max_members {
                format!("lobby is full (max {})", lobby.max_members)
            } else {
                "join declined".to_string()
            };
            let response = LobbyDm::LobbyJoinResponse {
                accepted: false,
                reason: Some(reason),
                lobby_name: lobby.lobby_name.clone(),
                host_pub_sig: lobby.host_pub_sig.to_hex(),
                group_key: None,
                key_version: 0,
                members: Vec::new(),
            };
            let (_msg, dm_payload) = sessions.send(&dm, &dm_bytes(&response)?)?;
            payloads.push(dm_payload);
        }

        self.join_in_progress = true;
        Ok(payloads)
    }

    /// The caller finished publishing (and refreshing UTXOs); the next queued
    /// join may proceed.
    pub fn join_step_done(&mut self) {
        self.join_in_progress = false;
    }

    /// Rotate the group key: DM the new key to every member, then swap the
    /// local vault. Aborts (vault untouched) when no member is reachable.
    pub fn rotate_key(
        &mut self,
        sessions: &mut SessionManager,
        now: Timestamp,
    ) -> Result<Vec<String>, KktpError> {
        let sink = self.sink.clone();
        let lobby = self.lobby_mut("rotate_key")?;
        if !lobby.is_host() {
            return Err(KktpError::NotHost);
        }
        let new_key = fresh_key();
        let new_version = lobby.vault.current_version() + 1;
        let dm = LobbyDm::LobbyKeyRotation {
            group_key: hex::encode(new_key),
            key_version: new_version,
        };
        let dm_encoded = dm_bytes(&dm)?;

        let mut payloads = Vec::new();
        for member in lobby.members.values() {
            let Some(dm) = &member.dm else { continue };
            match sessions.send(dm, &dm_encoded) {
                Ok((_msg, payload)) => payloads.push(payload),
                Err(e) => warn!(member = %member.pub_sig, error = %e, "rotation DM failed"),
            }
        }
        if payloads.is_empty() {
            warn!("key rotation aborted: no member reachable");
            return Err(KktpError::RotationAborted);
        }

        lobby.vault.rotate_to(new_key, new_version, now)?;
        info!(version = new_version, members = payloads.len(), "group key rotated");
        sink.emit(GameEvent::GroupKeyRotated { version: new_version });
        Ok(payloads)
    }

    /// Kick a member: DM the kick, announce the leave, drop the roster entry.
    pub fn kick(
        &mut self,
        sessions: &mut SessionManager,
        member_pub: &PubSig,
        reason: &str,
    ) -> Result<Vec<String>, KktpError> {
        let sink = self.sink.clone();
        let lobby = self.lobby_mut("kick")?;
        if !lobby.is_host() {
            return Err(KktpError::NotHost);
        }
        let Some(member) = lobby.members.remove(member_pub) else {
            return Err(KktpError::UnknownPeer(member_pub.to_hex()));
        };
        let mut payloads = Vec::new();
        if let Some(dm) = &member.dm {
            let kick = LobbyDm::LobbyKick { reason: reason.to_string() };
            let (_msg, payload) = sessions.send(dm, &dm_bytes(&kick)?)?;
            payloads.push(payload);
        }
        payloads.push(group_payload(
            &lobby.group_mailbox,
            &GroupWire::LobbyMemberEvent {
                event: "leave".into(),
                pub_sig: member.pub_sig.to_hex(),
                display_name: member.display_name,
            },
        )?);
        sink.emit(GameEvent::LobbyMemberLeft { member: member.pub_sig });
        Ok(payloads)
    }

    /// Close the lobby: one unencrypted control record on the group mailbox.
    pub fn close_lobby(&mut self) -> Result<Vec<String>, KktpError> {
        let sink = self.sink.clone();
        let lobby = self.lobby_mut("close_lobby")?;
        if !lobby.is_host() {
            return Err(KktpError::NotHost);
        }
        let payload = group_payload(
            &lobby.group_mailbox,
            &GroupWire::LobbyClose { lobby_id: lobby.lobby_id.to_hex() },
        )?;
        let lobby_id = lobby.lobby_id.clone();
        self.reset();
        sink.emit(GameEvent::LobbyClosed { lobby_id });
        Ok(vec![payload])
    }

    // ── Member flow ──────────────────────────────────────────────────────────

    /// Begin joining after the DM session to the host is established.
    /// Returns the join-request DM payload to publish.
    pub fn begin_join(
        &mut self,
        sessions: &mut SessionManager,
        discovery: &DiscoveryAnchor,
        host_dm: &MailboxId,
        display_name: &str,
    ) -> Result<String, KktpError> {
        if self.lobby.is_some() {
            return Err(KktpError::LobbyBadState("already in a lobby"));
        }
        if !discovery.is_lobby() {
            return Err(KktpError::InvalidAnchor("discovery is not a lobby offer".into()));
        }
        let lobby_id = discovery.sid()?;
        let host_pub = PubSig::from_hex(&discovery.pub_sig)?;
        let my_pub = sessions
            .session(host_dm)
            .ok_or_else(|| KktpError::UnknownSession(host_dm.to_hex()))?
            .my_pub_sig()
            .clone();

        self.lobby = Some(Lobby {
            lobby_id: lobby_id.clone(),
            lobby_name: discovery.meta.lobby_name.clone().unwrap_or_default(),
            host_pub_sig: host_pub,
            my_pub_sig: my_pub,
            members: HashMap::new(),
            // Placeholder until the join response delivers the real key.
            vault: GroupKeyVault::new([0u8; 32], 0),
            group_mailbox: group_mailbox_id(&lobby_id),
            max_members: discovery.meta.max_members.unwrap_or(2),
            created_at: now_ms(),
            state: LobbyState::Joining,
            join_code: None,
            host_dm: Some(host_dm.clone()),
        });

        let dm = LobbyDm::LobbyJoinRequest { display_name: display_name.to_string() };
        let (_msg, payload) = sessions.send(host_dm, &dm_bytes(&dm)?)?;
        Ok(payload)
    }

    /// Handle one decrypted DM from a lobby session (either role). Returns
    /// payloads to publish in reaction, if any.
    pub fn handle_dm(
        &mut self,
        sessions: &mut SessionManager,
        dm_handle: &MailboxId,
        plaintext: &[u8],
        now: Timestamp,
    ) -> Result<Vec<String>, KktpError> {
        let dm: LobbyDm = serde_json::from_slice(plaintext)
            .map_err(|e| KktpError::InvalidMessage(e.to_string()))?;
        match dm {
            // Host side: queue, strictly serialised.
            LobbyDm::LobbyJoinRequest { display_name } => {
                debug!(dm = %dm_handle, display_name, "join request queued");
                self.join_queue.push_back((dm_handle.clone(), display_name));
                Ok(Vec::new())
            }

            // Member side.
            LobbyDm::LobbyJoinResponse {
                accepted,
                reason,
                lobby_name,
                group_key,
                key_version,
                members,
                ..
            } => {
                let sink = self.sink.clone();
                let lobby = self.lobby_mut("join response")?;
                if lobby.state != LobbyState::Joining {
                    return Err(KktpError::LobbyBadState("not joining"));
                }
                if !accepted {
                    let reason = reason.unwrap_or_else(|| "join declined".into());
                    self.reset();
                    return Err(KktpError::JoinRejected(reason));
                }
                let key_hex =
                    group_key.ok_or_else(|| KktpError::InvalidMessage("missing group key".into()))?;
                let key_raw =
                    hex::decode(&key_hex).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
                let key: [u8; 32] =
                    key_raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
                        what: "group key",
                        expected: 32,
                        got: key_raw.len(),
                    })?;
                lobby.vault = GroupKeyVault::new(key, key_version);
                lobby.lobby_name = lobby_name;
                for info in members {
                    let pub_sig = PubSig::from_hex(&info.pub_sig)?;
                    lobby.members.insert(
                        pub_sig.clone(),
                        Member {
                            pub_sig,
                            display_name: info.display_name,
                            dm: None,
                            joined_at: now,
                        },
                    );
                }
                lobby.state = LobbyState::Member;
                let lobby_id = lobby.lobby_id.clone();
                info!(lobby_id = %lobby_id, "joined lobby");
                sink.emit(GameEvent::LobbyJoined { lobby_id });
                Ok(Vec::new())
            }

            LobbyDm::LobbyKeyRotation { group_key, key_version } => {
                let sink = self.sink.clone();
                let lobby = self.lobby_mut("key rotation")?;
                let key_raw =
                    hex::decode(&group_key).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
                let key: [u8; 32] =
                    key_raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
                        what: "group key",
                        expected: 32,
                        got: key_raw.len(),
                    })?;
                let drained = lobby.vault.rotate_to(key, key_version, now)?;
                sink.emit(GameEvent::GroupKeyRotated { version: key_version });
                // Buffered future messages are deliverable now.
                for (message, plaintext) in drained {
                    let sender = PubSig::from_hex(&message.sender_pub_sig)?;
                    sink.emit(GameEvent::GroupMessage { sender, plaintext });
                }
                Ok(Vec::new())
            }

            LobbyDm::LobbyKick { reason } => {
                let sink = self.sink.clone();
                info!(reason, "kicked from lobby");
                let payloads = match self.lobby.as_ref().and_then(|l| l.host_dm.clone()) {
                    Some(host_dm) => {
                        let (_anchor, payload) = sessions.end_session(&host_dm, "kicked")?;
                        vec![payload]
                    }
                    None => Vec::new(),
                };
                self.reset();
                sink.emit(GameEvent::LobbyKicked);
                Ok(payloads)
            }
        }
    }

    /// Leave the lobby (member): announce, end the host DM, reset.
    pub fn leave_lobby(&mut self, sessions: &mut SessionManager) -> Result<Vec<String>, KktpError> {
        let lobby = self.lobby_mut("leave_lobby")?;
        if lobby.is_host() {
            return Err(KktpError::LobbyBadState("host closes, not leaves"));
        }
        let mut payloads = vec![group_payload(
            &lobby.group_mailbox,
            &GroupWire::LobbyMemberEvent {
                event: "leave".into(),
                pub_sig: lobby.my_pub_sig.to_hex(),
                display_name: String::new(),
            },
        )?];
        if let Some(host_dm) = lobby.host_dm.clone() {
            let (_anchor, payload) = sessions.end_session(&host_dm, "leaving lobby")?;
            payloads.push(payload);
        }
        self.reset();
        Ok(payloads)
    }

    // ── Group transport ──────────────────────────────────────────────────────

    /// Seal a group message under the current key and assemble its payload.
    pub fn send_group_message(&mut self, plaintext: &[u8], now: Timestamp) -> Result<String, KktpError> {
        let lobby = self.lobby_mut("send_group_message")?;
        if !matches!(lobby.state, LobbyState::Hosting | LobbyState::Member) {
            return Err(KktpError::LobbyBadState("not in a lobby"));
        }
        let message = lobby.vault.encrypt(&lobby.my_pub_sig.to_hex(), plaintext, now)?;
        group_payload(&lobby.group_mailbox, &GroupWire::GroupMessage(message))
    }

    /// Route one `KKTP:GROUP:` payload. Payloads for other mailboxes return
    /// `Ok(false)` untouched.
    pub fn handle_group_payload(&mut self, text: &str, now: Timestamp) -> Result<bool, KktpError> {
        let Some(rest) = text.strip_prefix(KKTP_GROUP_PREFIX) else {
            return Ok(false);
        };
        let Some((mailbox_hex, json)) = rest.split_once(':') else {
            return Ok(false);
        };
        let sink = self.sink.clone();
        {
            let Some(lobby) = self.lobby.as_ref() else {
                return Ok(false);
            };
            if mailbox_hex != lobby.group_mailbox.to_hex() {
                return Ok(false);
            }
        }

        let wire: GroupWire =
            serde_json::from_str(json).map_err(|e| KktpError::InvalidMessage(e.to_string()))?;
        match wire {
            GroupWire::GroupMessage(message) => {
                let my_hex = self.lobby.as_ref().expect("checked above").my_pub_sig.to_hex();
                if message.sender_pub_sig == my_hex {
                    return Ok(true); // own echo
                }
                let dedup_key = (message.sender_pub_sig.clone(), message.nonce.clone());
                if !self.seen_nonces.insert(dedup_key) {
                    debug!("duplicate group message suppressed");
                    return Ok(true);
                }
                let outcome = self
                    .lobby
                    .as_mut()
                    .expect("checked above")
                    .vault
                    .try_decrypt(&message, now)?;
                match outcome {
                    DecryptOutcome::Plaintext(plaintext) => {
                        let sender = PubSig::from_hex(&message.sender_pub_sig)?;
                        sink.emit(GameEvent::GroupMessage { sender, plaintext });
                    }
                    DecryptOutcome::Buffered => {
                        debug!(version = message.key_version, "future-keyed message buffered");
                    }
                    DecryptOutcome::DroppedOld => {
                        debug!(version = message.key_version, "stale-keyed message dropped");
                    }
                }
                Ok(true)
            }
            GroupWire::LobbyMemberEvent { event, pub_sig, display_name } => {
                let member_pub = PubSig::from_hex(&pub_sig)?;
                let lobby = self.lobby.as_mut().expect("checked above");
                match event.as_str() {
                    "join" => {
                        lobby.members.entry(member_pub.clone()).or_insert(Member {
                            pub_sig: member_pub.clone(),
                            display_name: display_name.clone(),
                            dm: None,
                            joined_at: now,
                        });
                        sink.emit(GameEvent::LobbyMemberJoined {
                            member: member_pub,
                            display_name,
                        });
                    }
                    "leave" => {
                        lobby.members.remove(&member_pub);
                        sink.emit(GameEvent::LobbyMemberLeft { member: member_pub });
                    }
                    other => debug!(event = other, "unknown member event"),
                }
                Ok(true)
            }
            GroupWire::LobbyClose { lobby_id } => {
                let (is_host, our_id) = {
                    let lobby = self.lobby.as_ref().expect("checked above");
                    (lobby.is_host(), lobby.lobby_id.clone())
                };
                if is_host {
                    return Ok(true); // our own close echo
                }
                let id = Sid::from_hex(&lobby_id)?;
                if id != our_id {
                    return Ok(true);
                }
                info!(lobby_id = %id, "lobby closed by host");
                self.reset();
                sink.emit(GameEvent::LobbyClosed { lobby_id: id });
                Ok(true)
            }
        }
    }

    /// TTL sweep for the future-message buffer.
    pub fn purge_buffers(&mut self, now: Timestamp) {
        if let Some(lobby) = self.lobby.as_mut() {
            lobby.vault.purge_expired(now);
        }
    }
}

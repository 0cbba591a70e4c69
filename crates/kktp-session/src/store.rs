use std::path::Path;

use serde::{Deserialize, Serialize};

use kktp_core::constants::BASE_INDEX_START;
use kktp_core::error::KktpError;
use kktp_core::types::{MailboxId, PubSig, Sid, Timestamp};

/// Optional at-rest protection for session snapshots. When installed, the
/// `data` column of a resume record is opaque ciphertext.
pub trait SnapshotCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KktpError>;
}

/// One persisted session resume record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub sid: Sid,
    pub prefix: String,
    pub saved_at: Timestamp,
    /// Bincode snapshot, or ciphertext when a cipher hook is installed.
    pub data: Vec<u8>,
}

/// One known peer, keyed by pub_sig. `base_index` is unique across peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_pub_sig: PubSig,
    pub base_index: u32,
    pub updated_at: Timestamp,
}

/// Persistent session-layer state backed by sled.
///
/// Named trees:
///   sessions       — mailbox bytes     → bincode(SessionRecord, carries sid)
///   peer_registry  — PubSig bytes      → bincode(PeerRecord)
///   peer_by_index  — base_index be u32 → PubSig bytes (uniqueness index)
///   meta           — utf8 key bytes    → raw bytes
pub struct SessionStore {
    _db: sled::Db,
    sessions: sled::Tree,
    peer_registry: sled::Tree,
    peer_by_index: sled::Tree,
    meta: sled::Tree,
    cipher: Option<Box<dyn SnapshotCipher>>,
}

impl SessionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KktpError> {
        let db = sled::open(path).map_err(|e| KktpError::Fatal(format!("session store open: {e}")))?;
        let sessions = db
            .open_tree("sessions")
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        let peer_registry = db
            .open_tree("peer_registry")
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        let peer_by_index = db
            .open_tree("peer_by_index")
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        let meta = db.open_tree("meta").map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(Self { _db: db, sessions, peer_registry, peer_by_index, meta, cipher: None })
    }

    pub fn with_cipher(mut self, cipher: Box<dyn SnapshotCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn put_session(
        &self,
        mailbox: &MailboxId,
        sid: &Sid,
        prefix: &str,
        saved_at: Timestamp,
        snapshot_bytes: Vec<u8>,
    ) -> Result<(), KktpError> {
        let data = match &self.cipher {
            Some(cipher) => cipher.encrypt(&snapshot_bytes),
            None => snapshot_bytes,
        };
        let record = SessionRecord { sid: sid.clone(), prefix: prefix.to_string(), saved_at, data };
        let bytes =
            bincode::serialize(&record).map_err(|e| KktpError::Serialization(e.to_string()))?;
        self.sessions
            .insert(mailbox.as_bytes(), bytes)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_session(
        &self,
        mailbox: &MailboxId,
    ) -> Result<Option<(SessionRecord, Vec<u8>)>, KktpError> {
        let Some(bytes) = self
            .sessions
            .get(mailbox.as_bytes())
            .map_err(|e| KktpError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let record: SessionRecord =
            bincode::deserialize(&bytes).map_err(|e| KktpError::Serialization(e.to_string()))?;
        let snapshot_bytes = match &self.cipher {
            Some(cipher) => cipher.decrypt(&record.data)?,
            None => record.data.clone(),
        };
        Ok(Some((record, snapshot_bytes)))
    }

    pub fn iter_sessions(&self) -> Result<Vec<(SessionRecord, Vec<u8>)>, KktpError> {
        let mut out = Vec::new();
        for item in self.sessions.iter() {
            let (_, bytes) = item.map_err(|e| KktpError::Storage(e.to_string()))?;
            let record: SessionRecord =
                bincode::deserialize(&bytes).map_err(|e| KktpError::Serialization(e.to_string()))?;
            let snapshot_bytes = match &self.cipher {
                Some(cipher) => cipher.decrypt(&record.data)?,
                None => record.data.clone(),
            };
            out.push((record, snapshot_bytes));
        }
        Ok(out)
    }

    pub fn remove_session(&self, mailbox: &MailboxId) -> Result<(), KktpError> {
        self.sessions
            .remove(mailbox.as_bytes())
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }

    // ── Peer registry ────────────────────────────────────────────────────────

    pub fn get_peer(&self, pub_sig: &PubSig) -> Result<Option<PeerRecord>, KktpError> {
        match self
            .peer_registry
            .get(pub_sig.as_bytes())
            .map_err(|e| KktpError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| KktpError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put_peer(&self, record: &PeerRecord) -> Result<(), KktpError> {
        // base_index is unique: a different peer on the same index is a bug.
        if let Some(existing) = self
            .peer_by_index
            .get(record.base_index.to_be_bytes())
            .map_err(|e| KktpError::Storage(e.to_string()))?
        {
            if existing.as_ref() != record.peer_pub_sig.as_bytes() {
                return Err(KktpError::Storage(format!(
                    "base index {} already bound to another peer",
                    record.base_index
                )));
            }
        }
        let bytes =
            bincode::serialize(record).map_err(|e| KktpError::Serialization(e.to_string()))?;
        self.peer_registry
            .insert(record.peer_pub_sig.as_bytes(), bytes)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        self.peer_by_index
            .insert(record.base_index.to_be_bytes(), record.peer_pub_sig.as_bytes().as_slice())
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }

    // ── Branch index allocation ──────────────────────────────────────────────

    /// Allocate the next base index. Strictly increasing across restarts;
    /// an index is burned the moment it is handed out.
    pub fn next_base_index(&self, stride: u32) -> Result<u32, KktpError> {
        let key = "next_base_index";
        let current = self
            .meta
            .get(key)
            .map_err(|e| KktpError::Storage(e.to_string()))?
            .map(|bytes| {
                let mut arr = [0u8; 4];
                arr.copy_from_slice(&bytes[..4]);
                u32::from_be_bytes(arr)
            })
            .unwrap_or(BASE_INDEX_START);
        self.meta
            .insert(key, &(current + stride).to_be_bytes()[..])
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(current)
    }

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), KktpError> {
        self.meta
            .insert(key.as_bytes(), value)
            .map_err(|e| KktpError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, KktpError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| KktpError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kktp_core::constants::BRANCHES_PER_CONTACT;

    fn temp_store() -> SessionStore {
        let dir = std::env::temp_dir().join(format!(
            "kktp_session_store_{}_{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        SessionStore::open(dir).unwrap()
    }

    #[test]
    fn base_index_is_monotone_and_persists() {
        let dir = std::env::temp_dir().join(format!(
            "kktp_store_monotone_{}_{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let i1;
        let i2;
        {
            let store = SessionStore::open(&dir).unwrap();
            i1 = store.next_base_index(BRANCHES_PER_CONTACT).unwrap();
            i2 = store.next_base_index(BRANCHES_PER_CONTACT).unwrap();
        }
        assert_eq!(i1, BASE_INDEX_START);
        assert_eq!(i2, BASE_INDEX_START + BRANCHES_PER_CONTACT);
        // Reopen: allocation continues past everything handed out before.
        let store = SessionStore::open(&dir).unwrap();
        let i3 = store.next_base_index(BRANCHES_PER_CONTACT).unwrap();
        assert!(i3 > i2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn peer_index_uniqueness_enforced() {
        let store = temp_store();
        let a = PeerRecord {
            peer_pub_sig: PubSig::from_bytes([1; 32]),
            base_index: 100,
            updated_at: 0,
        };
        store.put_peer(&a).unwrap();
        // Same peer, same index: fine (idempotent update).
        store.put_peer(&a).unwrap();
        // Different peer on the same index: rejected.
        let b = PeerRecord {
            peer_pub_sig: PubSig::from_bytes([2; 32]),
            base_index: 100,
            updated_at: 0,
        };
        assert!(store.put_peer(&b).is_err());
    }

    #[test]
    fn session_record_round_trip() {
        let store = temp_store();
        let sid = Sid::from_bytes([9; 32]);
        let mailbox = MailboxId::from_bytes([10; 32]);
        store
            .put_session(&mailbox, &sid, "kktp", 1_234, b"snapshot-bytes".to_vec())
            .unwrap();
        let (record, snapshot) = store.get_session(&mailbox).unwrap().unwrap();
        assert_eq!(record.prefix, "kktp");
        assert_eq!(record.saved_at, 1_234);
        assert_eq!(record.sid, sid);
        assert_eq!(snapshot, b"snapshot-bytes");
        store.remove_session(&mailbox).unwrap();
        assert!(store.get_session(&mailbox).unwrap().is_none());
    }

    #[test]
    fn cipher_hook_makes_data_opaque() {
        struct Xor;
        impl SnapshotCipher for Xor {
            fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
                plaintext.iter().map(|b| b ^ 0x5A).collect()
            }
            fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KktpError> {
                Ok(ciphertext.iter().map(|b| b ^ 0x5A).collect())
            }
        }
        let store = temp_store().with_cipher(Box::new(Xor));
        let sid = Sid::from_bytes([8; 32]);
        let mailbox = MailboxId::from_bytes([7; 32]);
        store.put_session(&mailbox, &sid, "kktp", 0, b"secret".to_vec()).unwrap();
        let (record, snapshot) = store.get_session(&mailbox).unwrap().unwrap();
        assert_ne!(record.data, b"secret");
        assert_eq!(snapshot, b"secret");
    }
}

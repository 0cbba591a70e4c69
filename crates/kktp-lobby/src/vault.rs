use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use kktp_core::constants::{GROUP_FUTURE_BUFFER_MAX, GROUP_FUTURE_TTL_MS, NONCE_LEN};
use kktp_core::error::KktpError;
use kktp_core::types::{KeyVersion, Timestamp};
use kktp_crypto::aead;

/// One versioned group key.
#[derive(Clone)]
pub struct GroupKey {
    pub key: [u8; 32],
    pub version: KeyVersion,
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupKey {{ version: {} }}", self.version)
    }
}

/// An encrypted group message as it rides the group mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub key_version: KeyVersion,
    /// 24-byte nonce, hex.
    pub nonce: String,
    pub ciphertext: String,
    pub sender_pub_sig: String,
    pub timestamp: Timestamp,
}

/// What the vault did with one inbound group message.
#[derive(Debug, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(Vec<u8>),
    /// Future key version; held until a matching rotation arrives.
    Buffered,
    /// Older than the previous key version; dropped by policy.
    DroppedOld,
}

struct BufferedFuture {
    message: GroupMessage,
    buffered_at: Timestamp,
}

/// AAD binds the sender identity and the claimed key version.
fn aad_for(message_sender_hex: &str, key_version: KeyVersion) -> Vec<u8> {
    let mut aad = message_sender_hex.as_bytes().to_vec();
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad
}

/// `{current, previous}` group-key pair with a bounded buffer for messages
/// encrypted under a key version we have not received yet.
pub struct GroupKeyVault {
    current: GroupKey,
    previous: Option<GroupKey>,
    future: Vec<BufferedFuture>,
}

impl GroupKeyVault {
    pub fn new(key: [u8; 32], version: KeyVersion) -> Self {
        Self { current: GroupKey { key, version }, previous: None, future: Vec::new() }
    }

    pub fn current_version(&self) -> KeyVersion {
        self.current.version
    }

    pub fn previous_version(&self) -> Option<KeyVersion> {
        self.previous.as_ref().map(|p| p.version)
    }

    pub fn current_key(&self) -> &[u8; 32] {
        &self.current.key
    }

    /// Seal a payload under the current key.
    pub fn encrypt(
        &self,
        sender_pub_sig_hex: &str,
        plaintext: &[u8],
        now: Timestamp,
    ) -> Result<GroupMessage, KktpError> {
        let (nonce, ciphertext) = aead::seal(
            &self.current.key,
            &aad_for(sender_pub_sig_hex, self.current.version),
            plaintext,
        )?;
        Ok(GroupMessage {
            key_version: self.current.version,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
            sender_pub_sig: sender_pub_sig_hex.to_string(),
            timestamp: now,
        })
    }

    fn open_with(key: &GroupKey, message: &GroupMessage) -> Result<Vec<u8>, KktpError> {
        let nonce_raw =
            hex::decode(&message.nonce).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
        let nonce: [u8; NONCE_LEN] =
            nonce_raw.as_slice().try_into().map_err(|_| KktpError::InvalidLength {
                what: "group nonce",
                expected: NONCE_LEN,
                got: nonce_raw.len(),
            })?;
        let ciphertext =
            hex::decode(&message.ciphertext).map_err(|e| KktpError::InvalidHex(e.to_string()))?;
        aead::open(
            &key.key,
            &nonce,
            &aad_for(&message.sender_pub_sig, message.key_version),
            &ciphertext,
        )
    }

    /// Epoch-tolerant decrypt: current, previous, future-buffer, or drop.
    pub fn try_decrypt(
        &mut self,
        message: &GroupMessage,
        now: Timestamp,
    ) -> Result<DecryptOutcome, KktpError> {
        if message.key_version == self.current.version {
            return Ok(DecryptOutcome::Plaintext(Self::open_with(&self.current, message)?));
        }
        if let Some(previous) = &self.previous {
            if message.key_version == previous.version {
                return Ok(DecryptOutcome::Plaintext(Self::open_with(previous, message)?));
            }
            if message.key_version < previous.version {
                debug!(version = message.key_version, "group message older than previous key");
                return Ok(DecryptOutcome::DroppedOld);
            }
        } else if message.key_version < self.current.version {
            return Ok(DecryptOutcome::DroppedOld);
        }

        // Future version: rotation propagation is still in flight.
        self.purge_expired(now);
        if self.future.len() >= GROUP_FUTURE_BUFFER_MAX {
            self.future.remove(0);
        }
        self.future.push(BufferedFuture { message: message.clone(), buffered_at: now });
        Ok(DecryptOutcome::Buffered)
    }

    /// Install a rotated key. Returns buffered messages that the new key can
    /// now decrypt, in arrival order.
    pub fn rotate_to(
        &mut self,
        key: [u8; 32],
        version: KeyVersion,
        now: Timestamp,
    ) -> Result<Vec<(GroupMessage, Vec<u8>)>, KktpError> {
        if version <= self.current.version {
            return Err(KktpError::GroupVersionTooOld {
                version,
                previous: self.current.version,
            });
        }
        self.previous = Some(std::mem::replace(&mut self.current, GroupKey { key, version }));

        self.purge_expired(now);
        let mut drained = Vec::new();
        let mut kept = Vec::new();
        for buffered in self.future.drain(..) {
            if buffered.message.key_version == version {
                match Self::open_with(&self.current, &buffered.message) {
                    Ok(plaintext) => drained.push((buffered.message, plaintext)),
                    // Undecryptable under the claimed version: forged; drop.
                    Err(_) => {}
                }
            } else if buffered.message.key_version > version {
                kept.push(buffered);
            }
        }
        self.future = kept;
        Ok(drained)
    }

    /// Evict future-buffered messages past their TTL.
    pub fn purge_expired(&mut self, now: Timestamp) {
        self.future.retain(|b| now - b.buffered_at <= GROUP_FUTURE_TTL_MS);
    }

    pub fn buffered_count(&self) -> usize {
        self.future.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str = "aa11";

    #[test]
    fn current_and_previous_decrypt() {
        let mut vault = GroupKeyVault::new([1; 32], 5);
        let old = vault.encrypt(SENDER, b"old epoch", 0).unwrap();

        vault.rotate_to([2; 32], 6, 0).unwrap();
        let new = vault.encrypt(SENDER, b"new epoch", 0).unwrap();

        assert_eq!(
            vault.try_decrypt(&new, 0).unwrap(),
            DecryptOutcome::Plaintext(b"new epoch".to_vec())
        );
        // Rotation propagation: the previous key still decrypts.
        assert_eq!(
            vault.try_decrypt(&old, 0).unwrap(),
            DecryptOutcome::Plaintext(b"old epoch".to_vec())
        );
        assert_eq!(vault.current_version(), 6);
        assert_eq!(vault.previous_version(), Some(5));
    }

    #[test]
    fn future_version_buffers_then_drains_on_rotation() {
        // Member A already rotated to v6 and sent; member B is still on v5.
        let mut sender_vault = GroupKeyVault::new([1; 32], 5);
        sender_vault.rotate_to([2; 32], 6, 0).unwrap();
        let from_future = sender_vault.encrypt(SENDER, b"early bird", 0).unwrap();

        let mut vault = GroupKeyVault::new([1; 32], 5);
        assert_eq!(vault.try_decrypt(&from_future, 0).unwrap(), DecryptOutcome::Buffered);
        assert_eq!(vault.buffered_count(), 1);

        // The rotation DM arrives: the buffered message decrypts immediately.
        let drained = vault.rotate_to([2; 32], 6, 100).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, b"early bird");
        assert_eq!(vault.buffered_count(), 0);
        assert_eq!(vault.previous_version(), Some(5));
    }

    #[test]
    fn versions_older_than_previous_drop() {
        let mut vault = GroupKeyVault::new([1; 32], 5);
        let ancient_vault = GroupKeyVault::new([0; 32], 3);
        let ancient = ancient_vault.encrypt(SENDER, b"stale", 0).unwrap();

        vault.rotate_to([2; 32], 6, 0).unwrap();
        assert_eq!(vault.try_decrypt(&ancient, 0).unwrap(), DecryptOutcome::DroppedOld);
    }

    #[test]
    fn buffer_is_bounded_and_ttl_evicted() {
        let mut sender = GroupKeyVault::new([1; 32], 5);
        sender.rotate_to([2; 32], 6, 0).unwrap();

        let mut vault = GroupKeyVault::new([1; 32], 5);
        for i in 0..(GROUP_FUTURE_BUFFER_MAX + 5) {
            let msg = sender.encrypt(SENDER, format!("m{i}").as_bytes(), 0).unwrap();
            vault.try_decrypt(&msg, i as i64).unwrap();
        }
        assert_eq!(vault.buffered_count(), GROUP_FUTURE_BUFFER_MAX);

        // Everything buffered at t≈0 expires 60 s later.
        vault.purge_expired(GROUP_FUTURE_TTL_MS + 100);
        assert_eq!(vault.buffered_count(), 0);
    }

    #[test]
    fn rotation_must_increase_version() {
        let mut vault = GroupKeyVault::new([1; 32], 5);
        assert!(vault.rotate_to([2; 32], 5, 0).is_err());
        assert!(vault.rotate_to([2; 32], 4, 0).is_err());
        assert!(vault.rotate_to([2; 32], 7, 0).is_ok());
    }

    #[test]
    fn tampered_sender_fails_aead() {
        let vault = GroupKeyVault::new([1; 32], 5);
        let mut msg = vault.encrypt(SENDER, b"hello", 0).unwrap();
        msg.sender_pub_sig = "bb22".into();
        let mut vault = vault;
        assert!(vault.try_decrypt(&msg, 0).is_err());
    }
}

pub mod aead;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod vrf;

pub use aead::{open, seal};
pub use hash::{blake2b_256, fnv1a_32, game_id_tag_hex, group_mailbox_id, sha256, session_mailbox_id};
pub use kdf::derive_session_key;
pub use keys::{DhKeypair, MasterKey, SigKeypair};
pub use vrf::{fold, prove_fold, verify_fold, VrfProof};

pub mod audit;
pub mod codec;
pub mod entropy;
pub mod merkle;
pub mod processor;
pub mod strategy;
pub mod vault;
pub mod vrf;

pub use audit::{AuditVerdict, DagAuditor, ReconstructedChain};
pub use codec::{
    classify, encode_coord14, verify_payload_signature, ActionRegistry, AnchorKind, FinalAnchor,
    GenesisAnchor, HeartbeatAnchor, PackedEntry,
};
pub use entropy::{BeaconInfo, EntropyProvider};
pub use merkle::{root_of_leaves, verify_proof, MerkleAccumulator, MerkleAppend};
pub use processor::{
    leaf_bytes, AuditData, MoveProcessor, OpponentMove, ProcessedMove, ValidationOutcome,
};
pub use strategy::{AnchorState, AnchorStrategy, FinalState, GenesisSeedParams};
pub use vault::{GameEventRecord, MoveRecord, MoveVault, VaultSnapshot};
pub use vrf::{VrfManager, VrfMoveResult};

pub mod lobby;
pub mod vault;

pub use lobby::{GroupWire, Lobby, LobbyDm, LobbyManager, Member};
pub use vault::{DecryptOutcome, GroupKey, GroupKeyVault, GroupMessage};

pub mod anchors;
pub mod identity;
pub mod manager;
pub mod session;
pub mod store;
pub mod transport;

pub use anchors::{DiscoveryAnchor, DiscoveryMeta, KktpAnchor, ResponseAnchor, SessionEndAnchor};
pub use identity::IdentityManager;
pub use manager::{AnchorOutcome, SessionManager};
pub use session::{Session, SessionSnapshot};
pub use store::SessionStore;
pub use transport::{open_message, seal_message, DirectionState, SessionMessage};

pub mod constants;
pub mod error;
pub mod events;
pub mod jcs;
pub mod types;

pub use constants::*;
pub use error::KktpError;
pub use events::{EventSink, GameEvent};
pub use types::*;

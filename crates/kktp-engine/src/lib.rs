pub mod engine;
pub mod pump;

pub use engine::{
    EngineConfig, GameEnd, GameEngine, GameStart, InitResult, LobbyListing, RandomResult,
    StartParams, Timeouts,
};

// Order book reconstruction - price ladders and the sync state machine

pub mod engine;
pub mod ladder;

pub use engine::{BookEngine, BookEngineStats, BookError};
pub use ladder::BookSide;

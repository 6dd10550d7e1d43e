pub mod assets;
pub mod events;
pub mod fees;
pub mod flusher;
pub mod history;
pub mod matching;
pub mod orders;
pub mod recovery;
pub mod sequence;
pub mod ticker;
pub mod writeback;

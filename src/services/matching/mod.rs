//! Order Matching Module
//!
//! Price-time priority matching with inline settlement.
//!
//! # Architecture
//!
//! ```text
//! API / WebSocket handlers
//!   ↓
//! MatchingEngine (per-symbol serialisation point)
//!   ├→ OrderBook   (price ladders, one per symbol)
//!   ├→ AssetLedger (freeze / settle / release collateral)
//!   ├→ OrderStore  (lifecycle state machine)
//!   ├→ WriteQueue  (durable intents, drained by the sync worker)
//!   └→ EventPublisher (ticker, deltas, trades, user updates)
//! ```

mod book;
mod engine;
mod types;

pub use book::OrderBook;
pub use engine::{EngineConfig, MatchingEngine, SubmitRequest};
pub use types::*;

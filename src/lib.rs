//! Exit-side risk management for automated memecoin positions
//!
//! Takes over a position the moment a buy fills and owns everything until
//! the tokens are gone: the take-profit ladder, the stop-loss chain, rug
//! detection over pool reserves, on-chain activity monitors, and a sell
//! path that assumes the RPC layer fails at the worst possible moment.
//! Transaction building, persistence and log subscriptions stay outside,
//! behind the [`exec::Executor`], [`persist::PersistSink`],
//! [`feed::ReserveSource`] and [`monitor::ActivitySubscriber`] boundaries.

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod feed;
pub mod monitor;
pub mod persist;
pub mod position;
pub mod signals;

// Re-export commonly used types
pub use config::Config;
pub use engine::{EngineHandle, ExitEngine, OpenRequest};
pub use error::{Error, Result};
pub use position::{ExitReason, Position, PositionStatus, Venue};

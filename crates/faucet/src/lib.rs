//! Rate-limited, pausable token dispenser
//!
//! The [`Dispenser`] hands a fixed amount of one ledger asset to direct
//! callers, at most once per interval and only while their balance is
//! below that amount. An owner can pause it, refill it and hand over
//! ownership. The service exposes it over HTTP with:
//! - secp256k1 request credentials
//! - per-IP rate limiting
//! - sled-backed request history
//! - Prometheus metrics

pub mod api;
pub mod clock;
pub mod config;
pub mod credential;
pub mod database;
pub mod dispenser;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod ownership;
pub mod pause;
pub mod rpc;

pub use config::{FaucetConfig, LedgerMode};
pub use database::{DistributionRecord, FaucetDatabase, FaucetStatistics};
pub use dispenser::{Dispensed, Dispenser, DispenserParams, FaucetStatus};
pub use error::{FaucetError, FaucetResult};
pub use events::FaucetEvent;
pub use identity::CallContext;
pub use ledger::{Ledger, LedgerError, MemoryLedger};

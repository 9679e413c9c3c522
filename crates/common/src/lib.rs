//! Shared types and utilities for the Drip token dispenser.

pub mod types;
pub mod utils;

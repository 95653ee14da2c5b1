//! # outpost-core
//!
//! Core types shared by the outpost agent and upstream crates.
//!
//! This crate provides:
//! - The event queue model and its claim-time retry policy
//! - [`PushData`], the bundle of rows moved between agent and upstream
//! - Reconciliation page digests
//! - Fixed-capacity status rings for recent history

pub mod defaults;
pub mod error;
pub mod models;
pub mod push;
pub mod status_ring;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use push::{PushData, PushFkError, Row, SyncTable};
pub use status_ring::{RingKey, StatusRing, StatusRingManager};

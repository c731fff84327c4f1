//! SQLite Replication Engine
//!
//! This crate handles:
//! - Serialized access to one embedded database file (gateway)
//! - Trigger-based change capture on the master (capture)
//! - Per-slave replication: seeding, incremental sync, convergence repair (engine)

pub mod capture;
pub mod engine;
pub mod gateway;

pub use capture::ChangeCapture;
pub use engine::{EngineOptions, SyncEngine};
pub use gateway::{DbGateway, Record};

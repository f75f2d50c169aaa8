//! Lava LIM - Load Information Manager
//!
//! Collects host load from the OS and an optional ELIM probe, turns it into
//! a per-host load index vector with busy flags, reconciles shared resource
//! values across hosts and broadcasts the result to its peers.

pub mod broadcast;
pub mod config;
pub mod elim;
pub mod engine;
pub mod error;
pub mod host;
pub mod index;
pub mod metrics;
pub mod resources;
pub mod shared;
pub mod supervisor;

pub use config::LimConfig;
pub use engine::LoadEngine;
pub use error::{LimError, Result};

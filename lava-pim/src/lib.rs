//! Lava PIM - Process Information Manager
//!
//! Scans the host's process table, publishes it atomically to
//! `<infodir>/pim.info.<host>` and rescans on demand when a client sends a
//! refresh header to its TCP port.

pub mod client;
pub mod config;
pub mod error;
pub mod process;
pub mod protocol;
pub mod server;
pub mod snapshot;

pub use config::PimConfig;
pub use error::{PimError, Result};
pub use server::PimServer;

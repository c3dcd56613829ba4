//! Hearthvisor Core - Platform-independent supervision building blocks
//!
//! This crate provides the service registry, restart policy, health classification,
//! status model and the process traits that platform crates implement.

mod child;
mod config;
mod error;
mod health;
mod logs;
pub mod mock;
mod port;
mod process;
mod restart;
mod status;

pub use child::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use logs::*;
pub use port::*;
pub use process::*;
pub use restart::*;
pub use status::*;

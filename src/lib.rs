//! rdeploy library
//!
//! Directory deployment over a persistent duplex channel: the client archives a
//! tree, streams it to an agent, and the agent unpacks it into one or more
//! destinations while reporting progress back.

pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod journal;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod transport;
pub mod url;

pub use error::{DeployError, Result};

//! # Lodestone Configuration
//!
//! This crate provides configuration parsing and validation for the Lodestone
//! quorum light client.
//!
//! All client settings live in one `lodestone.toml` file. The light client
//! consumes the parsed [`Config`] once, at construction.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lodestone_config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("lodestone.toml"))?;
//! config.logging.init_tracing()?;
//!
//! println!("Chain ID: {}", config.chain.chain_id);
//! println!("Checkpoint: {}", config.trust.checkpoint_height);
//! ```
//!
//! ## Configuration Sections
//!
//! - `[chain]` - Chain identity
//! - `[trust]` - Trust period, clock drift and the out-of-band checkpoint
//! - `[peers]` - Primary, witnesses, fault threshold, timeouts and retries
//! - `[verification]` - Verification mode, pruning and overall deadline
//! - `[quorum_rotations]` - Declared quorum rotation schedule (height -> quorum hash)
//! - `[logging]` - Log level and format

mod config;
mod error;

pub use config::*;
pub use error::*;

/// 32-byte hash type shared with the light client
pub type Hash = [u8; 32];

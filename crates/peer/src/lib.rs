//! # SecureChat Peer Library
//!
//! Runs SecureChat channels on top of a relay.
//!
//! ## Overview
//!
//! - **Relay**: an in-process two-member room that forwards public keys and
//!   sealed envelopes and validates what passes through it
//! - **Runner**: feeds a channel its inbound events until shutdown
//! - **Configuration**: TOML file with environment overrides
//! - **Demo**: a complete local session between two peers
//!
//! ```text
//!   alice                 Relay                  bob
//! ┌──────────┐   key / envelope   ┌──────────┐   ┌──────────┐
//! │ Channel  │ ─────────────────▶ │  Room    │ ─▶│  Runner  │
//! │ + Runner │ ◀───────────────── │ (2 max)  │ ◀─│ + Channel│
//! └──────────┘                    └──────────┘   └──────────┘
//! ```

pub mod config;
pub mod demo;
pub mod relay;
pub mod runner;

pub use config::{Config, ConfigError};
pub use demo::{run_demo, DemoReport};
pub use relay::{Relay, RelayConfig, RelayEndpoint, RelayError};
pub use runner::{PeerRunner, RunnerStats};

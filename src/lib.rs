#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! sectun library — tunnel lifecycle management building blocks.
//!
//! The crate splits along the data flow: a Controller opens a tunnel and
//! writes a start directive to a device's shadow; the Agent on the device
//! reacts to shadow notifications, spawns the local tunnel proxy under a
//! bounded lease, and supervises it until the lease ends.
//!
//! - `config` — TOML + env-var configuration
//! - `shadow` — state-store transport, topics, event classification
//! - `directive` — start-directive extraction and validation
//! - `lease` — lifetime adjustment, clamping, expiry arithmetic
//! - `registry` — the supervised-process table and its sweep
//! - `launcher` — proxy spawn, output capture, lease tracking
//! - `supervisor` — the periodic supervision loop
//! - `handlers` — delta / get-response / update-ack dispatch
//! - `agent` — device-side lifecycle (startup, signals, shutdown)
//! - `controller` — tunnel brokering and source-side proxy

pub mod agent;
pub mod config;
pub mod controller;
pub mod directive;
pub mod handlers;
pub mod launcher;
pub mod lease;
pub mod registry;
pub mod shadow;
pub mod supervisor;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use directive::{DocumentKind, TunnelDirective};
pub use registry::Registry;
pub use shadow::{Channel, MockChannel, MqttChannel, ShadowEvent, Topics};

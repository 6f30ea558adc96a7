//! # Rotation Director Library
//!
//! This library drives a dedicated game server through its line-based control
//! socket. It keeps a map rotation going, rates kills from chat telemetry and
//! archives every finished match.
//!
//! ## Architecture Overview
//!
//! One TCP connection carries everything. Outbound commands are plain text
//! lines; inbound lines are JSON objects whose `src` field acts as a
//! correlation tag. A reader task decodes lines and hands them to the
//! router, which decides where each message goes:
//!
//! ### Correlation
//! A caller that expects a reply registers a waiter for one or more tags
//! before the command leaves the socket. The first matching message wakes the
//! waiter; if none arrives before the deadline the waiter times out, and
//! `send_and_wait` resends a bounded number of times.
//!
//! ### Auto-processing
//! Tags such as chat telemetry are handled on the reader task by an
//! `AutoProcessor`. The telemetry engine is one: it tracks who is online and
//! prices every kill through the rating table.
//!
//! ### Rotation
//! The rotation driver walks the configured map list. Lobby and match
//! durations run on named timers that post phase continuations back to the
//! driver, so no timer callback ever blocks on the network.
//!
//! ## Module Organization
//!
//! ### Protocol (`transport`, `waiter`, `router`, `network`)
//! - Line framing with byte-order-mark and partial-line handling
//! - Waiter registry with deadlines, consumption and disconnect release
//! - Routing by tag to waiters, auto-processors or the general inbox
//! - `Client`, the connection handle everything else shares
//!
//! ### Scheduling (`timer`, `rotation`)
//! - Named one-shot and repeating timers plus stopwatches
//! - The map rotation state machine
//!
//! ### Match data (`roster`, `telemetry`, `flightlog`, `store`, `archive`)
//! - Online roster and per-session rating deltas
//! - Flight log retrieval and de-duplication
//! - Player and session persistence
//! - Replay bundling
//!
//! ### Setup (`config`, `error`)
//! - TOML configuration with defaults for every field
//! - The crate-wide error type
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::config::DirectorConfig;
//! use client::network::{Client, ClientOptions};
//! use shared::{Command, TAG_HOST_CONFIG};
//!
//! # async fn run() -> client::error::Result<()> {
//! let config = DirectorConfig::default();
//! let client = Client::connect("127.0.0.1:23232", ClientOptions::default()).await?;
//! let reply = client
//!     .send_and_wait(
//!         &Command::CheckHost,
//!         &[TAG_HOST_CONFIG],
//!         config.timing.request_timeout(),
//!         config.timing.retries,
//!     )
//!     .await?;
//! println!("{}", reply.msg);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod flightlog;
pub mod network;
pub mod roster;
pub mod rotation;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod timer;
pub mod transport;
pub mod waiter;

pub use error::{DirectorError, Result};
pub use network::{Client, ClientOptions};
pub use rotation::{RotationDriver, RotationMode};

//! # Scripted Host
//!
//! A stand-in for the dedicated game server's control socket, used to test the
//! rotation director end to end and to dry-run a rotation locally.
//!
//! ## Behaviour
//!
//! The host accepts any number of director connections and answers the
//! control commands the way the real server does:
//!
//! | Command            | Reply tag      |
//! |--------------------|----------------|
//! | `checkhost`        | `HostConfig`   |
//! | `host`, `restart`  | `LobbyReady`   |
//! | `skip`             | `SaveComplete` |
//! | `flightlog`        | `GetFlightLog` |
//!
//! Everything else (`sethost ...`, `config`, `start`, `sendlog ...`) is
//! recorded without a reply. `sethost` values are remembered and echoed back
//! in the `HostConfig` payload.
//!
//! A `Behaviour` can delay, drop or withhold replies per command, which is
//! how the director's timeout and retry paths are exercised. Arbitrary lines,
//! chat telemetry included, can be pushed to connected directors with
//! `MockHost::inject`.

pub mod network;

pub use network::{chat_line, Behaviour, MockHost};

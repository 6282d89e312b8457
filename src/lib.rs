//! # Virtual Capability Runtime
//!
//! This crate implements the runtime for "virtual capability" devices: small
//! processes that expose named operations (capabilities) to a controller
//! over a single persistent TCP connection, speaking a JSON-framed
//! trigger/response protocol. A device can itself act as a caller, invoking
//! other devices' capabilities synchronously or asynchronously, including
//! periodic (streaming) re-invocation.
//!
//! ## Crate Structure
//!
//! - **`capability`**: the `Capability` handler trait and the name-keyed
//!   registry a device is built from.
//! - **`config`**: `Settings` loaded from defaults, an optional TOML file
//!   and `VCAP_*` environment variables.
//! - **`device`**: `Device` assembly and lifecycle — the serve loop that
//!   routes frames between transport, dispatcher and invocation table — plus
//!   `DeviceContext`, the handle capabilities use to invoke sub-capabilities.
//! - **`error`**: the `VcapError` enum for centralized error handling.
//! - **`invocation`**: pending-invocation slots keyed by correlation id,
//!   with sync/async waits and global cancellation.
//! - **`led`**: the demo LED device used by the CLI and end-to-end tests.
//! - **`protocol`**: wire envelopes and the brace-balance JSON framer.
//! - **`runtime`**: the command dispatch loop, one concurrent handler per
//!   incoming command.
//! - **`streaming`**: periodic re-invocation timers, one per capability
//!   name.
//! - **`transport`**: the single-peer framed TCP transport.

pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod invocation;
pub mod led;
pub mod protocol;
pub mod runtime;
pub mod streaming;
pub mod transport;

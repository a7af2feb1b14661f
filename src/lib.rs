//! # Meshlink - client driver for Meshtastic radios over Bluetooth LE
//!
//! Meshlink owns a single session with a paired Meshtastic radio reachable through
//! the three mesh characteristics (to-radio, from-radio and the from-num doorbell).
//! It performs the want-config handshake, drains inbound frames whenever the
//! doorbell rings, reconciles node information into a live registry and lets the
//! host broadcast text messages.
//!
//! ## Features
//!
//! - **Session State Machine**: Scan, connect, attribute discovery, handshake and steady-state drain with a single fixed-delay retry after link timeouts.
//! - **Doorbell Drain**: One pull per doorbell, repeated until the radio reports an empty queue, never more than one read in flight.
//! - **Node Registry**: Monotonic freshness merge of node snapshots and packet metadata, with the local radio tracked as a pointer into the same map.
//! - **Message Ledger**: Append-only log of inbound and outbound chat messages.
//! - **Recoverable Decoding**: Malformed frames are counted and dropped, never fatal to the session.
//! - **Async Design**: Built with Tokio; the state machine itself is synchronous and fully testable without a radio.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshlink::config::{Config, SupervisorConfig};
//! use meshlink::supervisor::{ConnectionSupervisor, LinkState};
//! use meshlink::transport::{DeviceHandle, ReplayLink};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!
//!     let (link, events) = ReplayLink::new(DeviceHandle::new("AA:BB", "Meshtastic_aabb", -60));
//!     link.set_powered(true);
//!     let (supervisor, handle) =
//!         ConnectionSupervisor::new(link, events, SupervisorConfig::from(&config));
//!     let task = supervisor.spawn();
//!
//!     handle.start_scanning();
//!     while handle.discovered().is_empty() {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!     handle.connect_to("AA:BB".into());
//!     handle.wait_for_state(LinkState::Ready).await;
//!     println!("{} nodes known", handle.nodes().len());
//!
//!     handle.shutdown();
//!     task.await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`supervisor`] - Session state machine, runtime loop and host-facing handle
//! - [`transport`] - Radio link boundary and the serialised frame transport
//! - [`codec`] - Encoding of outbound requests and decoding of radio frames
//! - [`registry`] - Node records and the reconciliation rules
//! - [`ledger`] - Chat message log
//! - [`capture`] - Hex frame capture files used by the command-line tool
//! - [`config`] - Configuration management and validation
//! - [`metrics`] - Diagnostic counters
//! - [`protobuf`] - Protocol buffer definitions for Meshtastic integration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ SupervisorHandle│ ← Host application API
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Supervisor    │ ← SessionMachine + run loop
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌──────────────────┐
//! │ Codec  │ │ Registry, Ledger │ ← Decoded frames applied here
//! └────────┘ └──────────────────┘
//!          │
//! ┌─────────────────┐
//! │ FrameTransport  │ ← RadioLink (BLE stack or ReplayLink)
//! └─────────────────┘
//! ```
//!
//! The `meshlink` binary in `src/main.rs` runs captures through the full stack
//! offline; see its `replay` command.

pub mod capture;
pub mod codec;
pub mod config;
pub mod ledger;
pub mod logutil;
pub mod metrics;
pub mod protobuf;
pub mod registry;
pub mod supervisor;
pub mod transport;

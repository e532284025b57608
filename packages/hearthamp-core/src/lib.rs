//! Hearthamp Core - shared library for the Hearthamp multi-zone amplifier
//! daemon.
//!
//! This crate owns the amplifier's single source of truth (`State`), the
//! hardware register protocol, the per-protocol streamer lifecycle shells,
//! and the HTTP surface that exposes all of it. It is used by both the
//! standalone server binary and the test suite.
//!
//! # Architecture
//!
//! - [`state`]: Persisted configuration tree and its update payloads
//! - [`hardware`]: Register-level bus access and one-shot profile discovery
//! - [`allocator`]: Virtual audio slot pool
//! - [`supervisor`]: Exponential-backoff subprocess lifecycle management
//! - [`bridge`]: Loopback audio routing between a virtual slot and a
//!   physical output
//! - [`streamer`]: Per-protocol lifecycle shells built on the supervisor
//!   and bridge
//! - [`stream_manager`]: Reconciles configured streams/sources against the
//!   live streamer fleet
//! - [`controller`]: The state machine - single owner of `State`, serialized
//!   by one read-write lock
//! - [`config_store`]: Debounced, atomic persistence of `State` to disk
//! - [`events`]: Publish/subscribe fan-out of committed state snapshots
//! - [`maintenance`]: Periodic background workers (reachability, release
//!   checks, backups)
//! - [`bootstrap`]: Composition root wiring every service together
//! - [`api`]: The HTTP binding
//! - [`error`]: Centralized error type
//!
//! # Abstraction traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks without
//!   hard-wiring to a specific async runtime entry point
//! - [`HardwareBus`](hardware::HardwareBus): register read/write, real or mock
//! - [`Streamer`](streamer::Streamer): per-protocol process lifecycle
//! - [`ReleaseChecker`](maintenance::ReleaseChecker) /
//!   [`BackupSink`](maintenance::BackupSink): maintenance worker collaborators

#![warn(clippy::all)]

pub mod allocator;
pub mod api;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod config_store;
pub mod controller;
pub mod error;
pub mod events;
pub mod hardware;
pub mod maintenance;
pub mod runtime;
pub mod state;
pub mod stream_manager;
pub mod streamer;
pub mod supervisor;

pub use bootstrap::{bootstrap, Services};
pub use config::Config;
pub use config_store::ConfigStore;
pub use controller::Controller;
pub use error::{HearthampError, HearthampResult};
pub use events::EventBus;
pub use hardware::{HardwareBus, MockBus, Profile, RealBus};
pub use maintenance::{BackupSink, MaintenanceScheduler, ReleaseChecker};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use state::State;
pub use stream_manager::StreamManager;

//! # nettune-core
//!
//! Core library for nettune - a network-tuning control plane for Linux
//! hosts.
//!
//! This crate provides the building blocks for applying curated bundles of
//! kernel network settings (TCP congestion control, queueing disciplines,
//! socket buffer sizing, persistence units) as an atomic, reversible
//! transaction:
//!
//! - **Host adapters**: read/write sysctl, traffic-control qdiscs, and
//!   systemd units, and collect host facts
//! - **Profile store**: declarative tuning profiles from disk plus built-in
//!   defaults
//! - **Snapshot store**: durable captures of the mutable host surface with
//!   verbatim backups of managed files
//! - **History journal**: append-only audit log with last-apply recovery
//! - **Apply engine**: plan/mutate/verify/rollback under a single-writer
//!   lock, with a cancellable auto-rollback timer
//!
//! The HTTP surface lives in `nettune-daemon`; the client-side measurement
//! probes live in `nettune-cli`. Nothing in this crate depends on which
//! transport carries its requests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod apply;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod history;
pub mod profile;
pub mod snapshot;
pub mod state;

pub use adapter::HostAdapter;
pub use apply::ApplyEngine;
pub use config::{ManagedPaths, StatePaths};
pub use error::{CoreError, HostError};
pub use history::HistoryJournal;
pub use profile::{Profile, ProfileStore};
pub use snapshot::SnapshotStore;
pub use state::{Snapshot, SystemState};

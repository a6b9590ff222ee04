//! # mesh-core
//!
//! Pure logic for prepper-mesh (no I/O, instant tests).
//!
//! This crate holds the state machines and algorithms of the mesh engine
//! without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//!
//! The actual I/O (network, disk) is performed by `mesh-client`, which
//! interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod latch;
pub mod lifecycle;
pub mod lww;
pub mod registry;
pub mod sync_clock;

pub use latch::{SingleFlight, SingleFlightGuard};
pub use lifecycle::{Action, EngineState, LifecycleEvent};
pub use lww::{normalize_updated_at, parse_updated_at, resolve, Resolution, TimestampError};
pub use registry::{ConnectOutcome, PeerRecord, PeerRegistry};
pub use sync_clock::SyncClock;

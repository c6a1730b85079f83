//! Shmgate Core - Shared-memory buffer-descriptor ports
//!
//! This library provides named rendezvous points ("ports") through which
//! multiple writer processes publish fixed-size buffer descriptors to one or
//! more reader processes on the same host. A descriptor only *references* a
//! payload living in some other shared-memory segment; the port transports
//! descriptors, never payload bytes.
//!
//! A port survives writer/reader churn: a per-process watchdog detects
//! listeners whose heartbeat counter has frozen (crashed or deadlocked
//! peers), marks the port dead, and hands the still-enqueued descriptors to
//! a failure handler so their payloads can be reclaimed.

/// Typed error surface for every fallible operation.
pub mod error;

/// The port: shared header, open modes, push/pop, health checking.
pub mod port;

/// Port factory: domain validation, name derivation, open/create/recover.
pub mod registry;

/// MPMC descriptor ring with per-listener read cursors.
pub mod ring;

/// Shared segment, named cross-process lock, in-segment mutex/condvar.
pub mod segment;

/// Background task reclaiming ports abandoned by dead peers.
pub mod watchdog;

pub use error::PortError;
pub use port::{OpenMode, Port, PushStatus};
pub use registry::{PortRegistry, MAX_DOMAIN_NAME_LENGTH};
pub use ring::{BufferDescriptor, Listener};
pub use watchdog::{FailureHandler, Watchdog};

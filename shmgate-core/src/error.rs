//! Error types for port operations.
//!
//! Every fallible operation in this crate returns [`PortError`]. Ring
//! overflow is special-cased: [`Port::try_push`](crate::port::Port::try_push)
//! swallows [`PortError::RingFull`], counts it, and reports
//! [`PushStatus::BufferFull`](crate::port::PushStatus::BufferFull) instead.

use std::io;

use thiserror::Error;

/// Errors raised by segments, rings, ports and the registry.
#[derive(Debug, Error)]
pub enum PortError {
    /// The domain name exceeds the OS-safe length limit.
    #[error("domain name `{0}` is longer than {} characters", crate::registry::MAX_DOMAIN_NAME_LENGTH)]
    DomainNameTooLong(String),

    /// The OS refused to create the segment mapping.
    #[error("failed to create shared segment `{name}`")]
    SegmentCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The OS refused to open an existing segment mapping.
    #[error("failed to open shared segment `{name}`")]
    SegmentOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The segment exists but its header or object directory is not valid.
    #[error("shared segment `{name}` is corrupt")]
    SegmentCorrupt { name: String },

    /// The port has been marked dead; all operations fail fast.
    #[error("port {port_id} is marked dead")]
    PortDead { port_id: u32 },

    /// No free cell at the write cursor.
    #[error("descriptor ring is full")]
    RingFull,

    /// Pop with no descriptor at the listener's read cursor.
    #[error("no descriptor at the listener's read cursor")]
    RingEmpty,

    /// Waiting listeners made no progress within the health timeout.
    #[error("port {port_id} failed its health check")]
    Unhealthy { port_id: u32 },

    /// The open-mode compatibility matrix rejected the request.
    #[error("cannot open port {port_id}: {reason}")]
    OpenModeConflict { port_id: u32, reason: String },

    /// The per-port listener table is exhausted.
    #[error("port cannot register more than {} listeners", crate::port::MAX_LISTENERS)]
    TooManyListeners,
}

//! Error taxonomy shared across the transport core (§7).
//!
//! These are kinds, not layers: ring and pool primitives return them
//! directly, the node process loop recovers locally from a subset of them,
//! and endpoint construction errors are terminal and bubble to the owning
//! process. No variant here is retried internally — retries are always a
//! caller's choice.

use transport_mmap::MmapError;
use transport_ring::RingError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),

    #[error("out of memory")]
    NoMemory(#[source] std::io::Error),

    #[error("ring has no space for {needed} bytes ({avail} available)")]
    NoSpace { needed: u32, avail: u32 },

    /// Not a real error: end-of-iteration sentinel for `next_event`.
    #[error("no further events")]
    EnumEnd,

    #[error("mmap failed while attaching to peer region")]
    MapFailed(#[source] std::io::Error),

    #[error("peer area header does not match expected layout")]
    Protocol,

    /// Not a real error: `Buffer Pool::acquire` during a flush.
    #[error("pool is flushing")]
    Flushing,
}

impl From<RingError> for TransportError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::NoSpace { needed, avail } => TransportError::NoSpace { needed, avail },
            RingError::Empty { .. } => TransportError::EnumEnd,
        }
    }
}

impl From<MmapError> for TransportError {
    fn from(e: MmapError) -> Self {
        match e {
            MmapError::MapFailed(source) => TransportError::MapFailed(source),
            MmapError::MemfdCreate(source) | MmapError::Seal(source) => TransportError::NoMemory(source),
            MmapError::Truncate { source, .. } => TransportError::NoMemory(source),
        }
    }
}

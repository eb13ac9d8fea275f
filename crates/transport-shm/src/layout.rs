//! Bit-exact shared region layout (§3).
//!
//! Order: area header, input port I/O array, output port I/O array, input
//! ring header + data, output ring header + data. Offsets are rounded up to
//! 8 bytes so every sub-structure starts aligned for its atomics.

use std::mem::size_of;
use std::sync::atomic::AtomicU32;
use transport_ring::RingHeader;

/// Ring data payload size. The source uses 4096 bytes per ring (§3.5).
pub const RING_DATA_SIZE: u32 = 4096;

/// Sentinel meaning "no buffer presented" for a port I/O slot (§3).
pub const INVALID_BUFFER_ID: u32 = u32::MAX;

/// Current area header format. Bumped on incompatible layout changes; an
/// attaching client rejects a mismatched version with `Protocol` (§3.2
/// Open Question: the source has no such field, this port adds one).
pub const AREA_VERSION: u32 = 1;

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Fixed header at offset 0 of the shared region.
#[repr(C)]
pub struct AreaHeader {
    pub version: u32,
    pub max_inputs: u32,
    pub n_inputs: AtomicU32,
    pub max_outputs: u32,
    pub n_outputs: AtomicU32,
    pub ring_size: u32,
}

impl AreaHeader {
    pub fn init(max_inputs: u32, max_outputs: u32, ring_size: u32) -> Self {
        Self {
            version: AREA_VERSION,
            max_inputs,
            n_inputs: AtomicU32::new(0),
            max_outputs,
            n_outputs: AtomicU32::new(0),
            ring_size,
        }
    }
}

/// Per-port status code (§3 "Port I/O Slot").
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortStatus {
    Ok = 0,
    Error = 1,
}

impl PortStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => PortStatus::Error,
            _ => PortStatus::Ok,
        }
    }
}

/// A port slot's add/remove lifecycle (§3 "Port I/O Slot"): a slot index is
/// inert until the node adds a port there, live while the port exists, and
/// permanently retired once removed — a retired index ignores further
/// `buffer_id` writes rather than silently going back to being reusable.
const LIFECYCLE_NOT_ADDED: u32 = 0;
const LIFECYCLE_ADDED: u32 = 1;
const LIFECYCLE_RETIRED: u32 = 2;

/// One port's `{status, buffer_id}` slot plus its add/remove lifecycle.
/// Mutated only by the producing side, read by the other; the partition
/// means no lock is needed, but the fields are atomics so cross-process
/// visibility is well-defined (§5).
#[repr(C)]
pub struct PortIo {
    status: AtomicU32,
    buffer_id: AtomicU32,
    lifecycle: AtomicU32,
}

impl PortIo {
    pub fn status(&self) -> PortStatus {
        PortStatus::from_u32(self.status.load(std::sync::atomic::Ordering::Acquire))
    }

    pub fn set_status(&self, status: PortStatus) {
        self.status.store(status as u32, std::sync::atomic::Ordering::Release);
    }

    /// `None` when no buffer is currently presented on this port.
    pub fn buffer_id(&self) -> Option<u32> {
        match self.buffer_id.load(std::sync::atomic::Ordering::Acquire) {
            INVALID_BUFFER_ID => None,
            id => Some(id),
        }
    }

    /// No-op once the slot has been retired, or before it has been added
    /// (§3: "subsequent buffer_id writes are ignored").
    pub fn set_buffer_id(&self, id: Option<u32>) {
        if self.lifecycle.load(std::sync::atomic::Ordering::Acquire) != LIFECYCLE_ADDED {
            return;
        }
        self.write_buffer_id_raw(id);
    }

    fn write_buffer_id_raw(&self, id: Option<u32>) {
        self.buffer_id
            .store(id.unwrap_or(INVALID_BUFFER_ID), std::sync::atomic::Ordering::Release);
    }

    pub fn is_added(&self) -> bool {
        self.lifecycle.load(std::sync::atomic::Ordering::Acquire) == LIFECYCLE_ADDED
    }

    pub fn is_retired(&self) -> bool {
        self.lifecycle.load(std::sync::atomic::Ordering::Acquire) == LIFECYCLE_RETIRED
    }

    /// Transitions `NotAdded -> Added`. Returns `false` (no-op) if the slot
    /// is already added or has been retired.
    pub(crate) fn mark_added(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                LIFECYCLE_NOT_ADDED,
                LIFECYCLE_ADDED,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transitions `Added -> Retired`, clearing any presented buffer id.
    /// Returns `false` (no-op) if the slot was not currently added.
    pub(crate) fn mark_retired(&self) -> bool {
        let retired = self
            .lifecycle
            .compare_exchange(
                LIFECYCLE_ADDED,
                LIFECYCLE_RETIRED,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok();
        if retired {
            self.write_buffer_id_raw(None);
        }
        retired
    }

    /// Resets a slot to its pre-add state: idle status, no buffer, not yet
    /// added. Used once at region construction (§4.2 step 4).
    pub(crate) fn reset_slot(&self) {
        self.set_status(PortStatus::Ok);
        self.write_buffer_id_raw(None);
        self.lifecycle.store(LIFECYCLE_NOT_ADDED, std::sync::atomic::Ordering::Release);
    }
}

/// Computed byte offsets of every sub-region, given the port counts and
/// ring size. `total_size` is what the factory allocates (§4.2 step 1).
pub struct RegionLayout {
    pub max_inputs: u32,
    pub max_outputs: u32,
    pub ring_size: u32,
    pub header_off: usize,
    pub input_io_off: usize,
    pub output_io_off: usize,
    pub ring_a_header_off: usize,
    pub ring_a_data_off: usize,
    pub ring_b_header_off: usize,
    pub ring_b_data_off: usize,
    pub total_size: usize,
}

impl RegionLayout {
    /// Computes the layout for `ring_size` bytes per ring. `ring_size` must
    /// already be validated as a positive power of two by the caller — this
    /// function trusts its inputs rather than asserting on them, since one
    /// caller (`SharedRegion::attach`) derives `ring_size` from a peer's
    /// shared memory and must be able to reject a bad value as
    /// `TransportError::Protocol` instead of panicking the process.
    pub fn new(max_inputs: u32, max_outputs: u32, ring_size: u32) -> Self {
        let header_off = 0usize;
        let mut off = align_up(header_off + size_of::<AreaHeader>(), 8);

        let input_io_off = off;
        off = align_up(off + max_inputs as usize * size_of::<PortIo>(), 8);

        let output_io_off = off;
        off = align_up(off + max_outputs as usize * size_of::<PortIo>(), 8);

        let ring_a_header_off = off;
        off = align_up(off + size_of::<RingHeader>(), 8);

        let ring_a_data_off = off;
        off += ring_size as usize;

        let ring_b_header_off = off;
        off = align_up(off + size_of::<RingHeader>(), 8);

        let ring_b_data_off = off;
        let total_size = off + ring_size as usize;

        Self {
            max_inputs,
            max_outputs,
            ring_size,
            header_off,
            input_io_off,
            output_io_off,
            ring_a_header_off,
            ring_a_data_off,
            ring_b_header_off,
            ring_b_data_off,
            total_size,
        }
    }
}

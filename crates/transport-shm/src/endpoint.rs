//! Shared region construction and the direction-neutral transport endpoint
//! (§4.2).
//!
//! [`SharedRegion`] owns the mapping and knows the *physical* layout: two
//! port I/O arrays and two rings (`ring_a`, `ring_b`), neither port arrays
//! nor ring data ever move. [`TransportEndpoint`] adds the *role*: which
//! physical ring is this side's outgoing ring and which is its incoming
//! one. Port I/O arrays are never swapped — only the rings are, matching
//! the source's behavior of swapping buffer/data pointers on client attach
//! but leaving the `inputs`/`outputs` port arrays alone.

use crate::layout::{AreaHeader, PortIo, RegionLayout, INVALID_BUFFER_ID, RING_DATA_SIZE};
use crate::record::{RecordHeader, RECORD_HEADER_SIZE};
use std::mem::size_of;
use std::os::fd::OwnedFd;
use std::ptr;
use std::sync::atomic::Ordering;
use transport_error::TransportError;
use transport_mmap::{AttachedMmap, MappedRegion, SealedMemfd};
use transport_ring::RingHeader;

enum Backing {
    Owned(SealedMemfd),
    Attached(AttachedMmap),
}

impl Backing {
    fn base_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Owned(m) => m.base_ptr(),
            Backing::Attached(m) => m.base_ptr(),
        }
    }
}

/// Which side of the pair this endpoint is. Determines which physical ring
/// is "outgoing" vs "incoming"; port I/O arrays are unaffected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Triple suitable for transmission to a peer over a side-channel (§4.7,
/// §6). `memfd` is dup-able; the receiver calls [`SharedRegion::attach`].
pub struct TransportInfo {
    pub memfd: OwnedFd,
    pub offset: u64,
    pub size: u64,
}

/// Owns the mapped region and exposes raw (but safe-to-call) accessors for
/// port I/O slots and the two physical rings. Does not know about roles;
/// that's [`TransportEndpoint`]'s job.
pub struct SharedRegion {
    backing: Backing,
    layout: RegionLayout,
    base: *mut u8,
}

// SAFETY: `base` points into a mapping that outlives this struct (owned by
// `backing`); the region is designed for cross-thread/cross-process access
// partitioned as described in §5, so moving the handle between threads is sound.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Server-side construction (§4.2 steps 1-4) with the source's default
    /// per-ring data size (§3.5).
    pub fn create(max_inputs: u32, max_outputs: u32) -> Result<Self, TransportError> {
        Self::create_with_ring_size(max_inputs, max_outputs, RING_DATA_SIZE)
    }

    /// As [`SharedRegion::create`], but with an explicit per-ring data size.
    /// Rejects a non-power-of-two `ring_size` as `InvalidArguments` rather
    /// than handing it to `RegionLayout::new`, which trusts its caller.
    pub fn create_with_ring_size(max_inputs: u32, max_outputs: u32, ring_size: u32) -> Result<Self, TransportError> {
        if max_inputs == 0 && max_outputs == 0 {
            return Err(TransportError::InvalidArguments("max_inputs and max_outputs are both zero"));
        }
        if ring_size == 0 || !ring_size.is_power_of_two() {
            return Err(TransportError::InvalidArguments("ring_size must be a positive power of two"));
        }
        let layout = RegionLayout::new(max_inputs, max_outputs, ring_size);
        let memfd = SealedMemfd::create(layout.total_size as u64).map_err(TransportError::from)?;
        let mut region = Self::from_backing(Backing::Owned(memfd), layout);
        region.init_area();
        Ok(region)
    }

    /// Client-side attach (§4.2 step 5, §4.7 `new_from_info`). Validates the
    /// area header before trusting anything else in the region.
    pub fn attach(fd: OwnedFd, offset: u64, size: u64) -> Result<Self, TransportError> {
        if (size as usize) < size_of::<AreaHeader>() {
            return Err(TransportError::Protocol);
        }
        let mut mm = AttachedMmap::from_fd(fd, offset, size).map_err(TransportError::from)?;
        let base = mm.base_ptr();

        // SAFETY: base is valid for `size` bytes per from_fd's mapping contract,
        // which is at least size_of::<AreaHeader>() per the check above.
        let header = unsafe { &*(base as *const AreaHeader) };
        if header.version != crate::layout::AREA_VERSION {
            return Err(TransportError::Protocol);
        }
        if header.ring_size == 0 || !header.ring_size.is_power_of_two() {
            return Err(TransportError::Protocol);
        }
        let layout = RegionLayout::new(header.max_inputs, header.max_outputs, header.ring_size);
        if layout.total_size != size as usize {
            return Err(TransportError::Protocol);
        }

        Ok(Self { backing: Backing::Attached(mm), layout, base })
    }

    /// Returns the `(memfd, offset, size)` triple for handing to a peer.
    /// Only meaningful for a server-created region.
    pub fn info(&self) -> Result<TransportInfo, TransportError> {
        match &self.backing {
            Backing::Owned(m) => Ok(TransportInfo {
                memfd: m.dup_fd().map_err(TransportError::NoMemory)?,
                offset: 0,
                size: self.layout.total_size as u64,
            }),
            Backing::Attached(_) => Err(TransportError::InvalidArguments("info() is only valid on a server-created region")),
        }
    }

    fn from_backing(mut backing: Backing, layout: RegionLayout) -> Self {
        let base = backing.base_ptr();
        Self { backing, layout, base }
    }

    fn init_area(&mut self) {
        // SAFETY: this region was just allocated exclusively by `create` and
        // sized for `layout.total_size`; every offset below is in range.
        unsafe {
            ptr::write(
                self.base.add(self.layout.header_off) as *mut AreaHeader,
                AreaHeader::init(self.layout.max_inputs, self.layout.max_outputs, self.layout.ring_size),
            );
            for i in 0..self.layout.max_inputs {
                self.input_io_ptr(i).as_ref().unwrap().reset_slot();
            }
            for i in 0..self.layout.max_outputs {
                self.output_io_ptr(i).as_ref().unwrap().reset_slot();
            }
            ptr::write(
                self.base.add(self.layout.ring_a_header_off) as *mut RingHeader,
                RingHeader::init(self.layout.ring_size),
            );
            ptr::write(
                self.base.add(self.layout.ring_b_header_off) as *mut RingHeader,
                RingHeader::init(self.layout.ring_size),
            );
        }
    }

    fn input_io_ptr(&self, idx: u32) -> *const PortIo {
        // SAFETY: caller-facing methods bounds-check idx against max_inputs first.
        unsafe { self.base.add(self.layout.input_io_off + idx as usize * size_of::<PortIo>()) as *const PortIo }
    }

    fn output_io_ptr(&self, idx: u32) -> *const PortIo {
        unsafe { self.base.add(self.layout.output_io_off + idx as usize * size_of::<PortIo>()) as *const PortIo }
    }

    pub fn input_port(&self, idx: u32) -> Option<&PortIo> {
        if idx >= self.layout.max_inputs {
            return None;
        }
        // SAFETY: idx is in bounds; the slot was initialized by init_area.
        Some(unsafe { &*self.input_io_ptr(idx) })
    }

    pub fn output_port(&self, idx: u32) -> Option<&PortIo> {
        if idx >= self.layout.max_outputs {
            return None;
        }
        Some(unsafe { &*self.output_io_ptr(idx) })
    }

    fn area(&self) -> &AreaHeader {
        // SAFETY: header_off is always in bounds and was initialized by init_area.
        unsafe { &*(self.base.add(self.layout.header_off) as *const AreaHeader) }
    }

    /// Adds a port at `idx` (§3: "created when the port is added... visible
    /// in the area immediately"). Errors if `idx` is out of range or the
    /// slot is already added or has been retired.
    pub fn add_input_port(&self, idx: u32) -> Result<(), TransportError> {
        let port = self.input_port(idx).ok_or(TransportError::InvalidArguments("input port index out of range"))?;
        if !port.mark_added() {
            return Err(TransportError::InvalidArguments("input port already added or retired"));
        }
        self.area().n_inputs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn add_output_port(&self, idx: u32) -> Result<(), TransportError> {
        let port = self.output_port(idx).ok_or(TransportError::InvalidArguments("output port index out of range"))?;
        if !port.mark_added() {
            return Err(TransportError::InvalidArguments("output port already added or retired"));
        }
        self.area().n_outputs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes the port at `idx` (§3: "destroyed when the port is removed
    /// (slot index retired; subsequent buffer_id writes are ignored)").
    /// Errors if `idx` is out of range or the slot is not currently added.
    pub fn remove_input_port(&self, idx: u32) -> Result<(), TransportError> {
        let port = self.input_port(idx).ok_or(TransportError::InvalidArguments("input port index out of range"))?;
        if !port.mark_retired() {
            return Err(TransportError::InvalidArguments("input port is not currently added"));
        }
        self.area().n_inputs.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove_output_port(&self, idx: u32) -> Result<(), TransportError> {
        let port = self.output_port(idx).ok_or(TransportError::InvalidArguments("output port index out of range"))?;
        if !port.mark_retired() {
            return Err(TransportError::InvalidArguments("output port is not currently added"));
        }
        self.area().n_outputs.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn ring(&self, header_off: usize, data_off: usize) -> (&RingHeader, &mut [u8]) {
        // SAFETY: header_off/data_off come from RegionLayout and are always
        // in bounds; RingHeader's own atomics make concurrent header access
        // sound, and §5's partition (one writer, one reader) makes the data
        // slice sound despite the shared &mut.
        unsafe {
            let hdr = &*(self.base.add(header_off) as *const RingHeader);
            let data = std::slice::from_raw_parts_mut(self.base.add(data_off), self.layout.ring_size as usize);
            (hdr, data)
        }
    }

    fn ring_a(&self) -> (&RingHeader, &mut [u8]) {
        self.ring(self.layout.ring_a_header_off, self.layout.ring_a_data_off)
    }

    fn ring_b(&self) -> (&RingHeader, &mut [u8]) {
        self.ring(self.layout.ring_b_header_off, self.layout.ring_b_data_off)
    }
}

/// Owns a [`SharedRegion`] plus the role that picks which physical ring is
/// outgoing vs incoming, and the "currently peeked" event state that ties
/// `next_event` to the following `parse_event` (§4.2).
pub struct TransportEndpoint {
    region: SharedRegion,
    role: Role,
    current: Option<(RecordHeader, u32)>,
}

impl TransportEndpoint {
    pub fn new_server(max_inputs: u32, max_outputs: u32) -> Result<Self, TransportError> {
        Ok(Self { region: SharedRegion::create(max_inputs, max_outputs)?, role: Role::Server, current: None })
    }

    pub fn new_server_with_ring_size(max_inputs: u32, max_outputs: u32, ring_size: u32) -> Result<Self, TransportError> {
        Ok(Self {
            region: SharedRegion::create_with_ring_size(max_inputs, max_outputs, ring_size)?,
            role: Role::Server,
            current: None,
        })
    }

    pub fn attach_client(fd: OwnedFd, offset: u64, size: u64) -> Result<Self, TransportError> {
        Ok(Self { region: SharedRegion::attach(fd, offset, size)?, role: Role::Client, current: None })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn info(&self) -> Result<TransportInfo, TransportError> {
        self.region.info()
    }

    pub fn input_port(&self, idx: u32) -> Option<&PortIo> {
        self.region.input_port(idx)
    }

    pub fn output_port(&self, idx: u32) -> Option<&PortIo> {
        self.region.output_port(idx)
    }

    pub fn add_input_port(&self, idx: u32) -> Result<(), TransportError> {
        self.region.add_input_port(idx)
    }

    pub fn add_output_port(&self, idx: u32) -> Result<(), TransportError> {
        self.region.add_output_port(idx)
    }

    pub fn remove_input_port(&self, idx: u32) -> Result<(), TransportError> {
        self.region.remove_input_port(idx)
    }

    pub fn remove_output_port(&self, idx: u32) -> Result<(), TransportError> {
        self.region.remove_output_port(idx)
    }

    /// Bytes currently readable on this side's incoming ring — the real
    /// Shared Region state a node process loop reads each cycle in place of
    /// a synthetic fill level.
    pub fn incoming_filled(&self) -> u32 {
        let (header, _) = self.incoming();
        header.get_read_index().0
    }

    /// This side's outgoing ring: server writes `ring_b`, client writes
    /// `ring_a` (the server's incoming ring), matching the source's swap.
    fn outgoing(&self) -> (&RingHeader, &mut [u8]) {
        match self.role {
            Role::Server => self.region.ring_b(),
            Role::Client => self.region.ring_a(),
        }
    }

    fn incoming(&self) -> (&RingHeader, &mut [u8]) {
        match self.role {
            Role::Server => self.region.ring_a(),
            Role::Client => self.region.ring_b(),
        }
    }

    /// Reserves `8 + body.len()` contiguous bytes on the outgoing ring and
    /// publishes them as one record. Both the header and the body are
    /// written before the write index advances, so a peer never observes a
    /// header without its matching body (§4.2).
    pub fn add_event(&mut self, ty: u32, body: &[u8]) -> Result<(), TransportError> {
        let total = RECORD_HEADER_SIZE as u32 + body.len() as u32;
        let (header, data) = self.outgoing();
        let (filled, index) = header.get_write_index();
        let avail = header.size - filled;
        if avail < total {
            return Err(TransportError::NoSpace { needed: total, avail });
        }
        let record = RecordHeader { ty, size: body.len() as u32 };
        transport_ring::write_data(data, header.mask, index, &record.to_bytes());
        transport_ring::write_data(data, header.mask, index + RECORD_HEADER_SIZE as u32, body);
        header.write_update(index.wrapping_add(total));
        Ok(())
    }

    /// Non-destructively peeks the next record's header. `Err(EnumEnd)` if
    /// fewer than 8 bytes are readable; the header is cached so the
    /// following `parse_event` can consume the matching body.
    pub fn next_event(&mut self) -> Result<RecordHeader, TransportError> {
        let (header, data) = self.incoming();
        let (filled, index) = header.get_read_index();
        if filled < RECORD_HEADER_SIZE as u32 {
            return Err(TransportError::EnumEnd);
        }
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        transport_ring::read_data(data, header.mask, index, &mut bytes);
        let record = RecordHeader::from_bytes(bytes);
        self.current = Some((record, index));
        Ok(record)
    }

    /// Copies the body of the last-peeked event into `dst` and advances the
    /// read index past header + body. Must be called at most once per
    /// `next_event` and with a `dst` sized to the peeked header's `size`.
    pub fn parse_event(&mut self, dst: &mut [u8]) -> Result<(), TransportError> {
        let (record, index) = self
            .current
            .take()
            .ok_or(TransportError::InvalidArguments("parse_event called without a preceding next_event"))?;
        if dst.len() != record.size as usize {
            return Err(TransportError::InvalidArguments("dst length does not match the peeked event size"));
        }
        let (header, data) = self.incoming();
        transport_ring::read_data(data, header.mask, index + RECORD_HEADER_SIZE as u32, dst);
        header.read_update(index.wrapping_add(RECORD_HEADER_SIZE as u32).wrapping_add(record.size));
        Ok(())
    }
}

#[allow(dead_code)]
const fn _assert_invalid_is_all_ones() {
    assert!(INVALID_BUFFER_ID == u32::MAX);
}

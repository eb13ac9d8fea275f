//! Node Process Loop (§4.5): one cycle of producer or consumer bookkeeping
//! against the Buffer Pool and the DLL Clock Adjuster.
//!
//! Deliberately decoupled from the concrete ring/port types in
//! `transport-shm`: a cycle is driven by plain counts (`avail`,
//! `requested`, `maxsize`, `stride`) that the owning endpoint reads out of
//! its own ring/port state before calling in. This keeps the scheduling
//! and xrun policy testable without a mapped region.

use std::time::Duration;
use transport_dll::DllState;
use transport_error::TransportError;
use transport_pool::BufferPool;

/// The graph's authoritative clock, as read from the position structure
/// each cycle (§4.5 step 1).
#[derive(Clone, Copy, Debug)]
pub struct Position {
    pub clock_id: u64,
    pub position: u64,
    pub duration: u64,
    pub rate: u32,
}

/// Scheduler-facing role tag (§9: "a tagged-variant `NodeKind`" in place of
/// an inheritance tree).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Producer,
    Consumer,
    Filter,
}

/// A buffer's data descriptor, set by the producer before queuing it back
/// (§4.5 step 4). `flags` is opaque to the transport core — producer- and
/// consumer-defined bits (e.g. "discontinuity", "corrupted") that ride along
/// with the chunk rather than being interpreted here (§3 Data Model).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub offset: u32,
    pub size: u32,
    pub stride: u32,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Produced {
    pub buffer: u32,
    pub chunk: ChunkDescriptor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Consumed {
    pub buffer: u32,
    pub correction: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CycleOutcome {
    Produced(Produced),
    Consumed(Consumed),
    /// `avail < target_buffer`: output was filled with silence by the caller.
    Underrun,
    /// `avail > 8 * target_buffer`: caller should advance its read index by
    /// `dropped_frames`.
    Overrun { dropped_frames: u32 },
    NoBufferAvailable,
}

/// Per-node cycle state: clock tracking, DLL, and underrun/overrun
/// hysteresis.
pub struct NodeCycle {
    kind: NodeKind,
    target_buffer: u32,
    dll: DllState,
    last_clock_id: Option<u64>,
    local_position: u64,
    offset: i64,
    sync_lost: bool,
    first_cycle: bool,
}

impl NodeCycle {
    pub fn new(kind: NodeKind, target_buffer: u32, dll_bandwidth: f32, period: u32, rate: u32) -> Self {
        let mut dll = DllState::new();
        dll.set_bw(dll_bandwidth, period, rate as f32);
        Self {
            kind,
            target_buffer,
            dll,
            last_clock_id: None,
            local_position: 0,
            offset: 0,
            sync_lost: false,
            first_cycle: true,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Current offset between the graph clock and this node's own running
    /// position, valid after the first `observe_position` call.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Consults the position structure (§4.5 step 1-2). A changed
    /// `clock_id` resets the DLL and recomputes `offset` so a wall-clock
    /// discontinuity never reads as an xrun.
    pub fn observe_position(&mut self, position: &Position) {
        if self.last_clock_id != Some(position.clock_id) {
            self.dll.init();
            self.offset = position.position as i64 - self.local_position as i64;
            self.last_clock_id = Some(position.clock_id);
            tracing::debug!(clock_id = position.clock_id, offset = self.offset, "clock id changed, dll reset");
        }
    }

    /// Producer cycle (§4.5 steps 3-6): dequeue a buffer, fill up to
    /// `min(requested, maxsize / stride)` frames, queue it back. `flags` is
    /// passed through to the chunk descriptor unexamined — the caller's
    /// concern, not the scheduler's.
    pub fn producer_cycle(
        &mut self,
        pool: &BufferPool,
        requested: u32,
        maxsize: u32,
        stride: u32,
        flags: u32,
    ) -> CycleOutcome {
        let buffer = match self.try_acquire(pool) {
            Some(b) => b,
            None => return CycleOutcome::NoBufferAvailable,
        };

        let max_frames = if stride == 0 { 0 } else { maxsize / stride };
        let frames = requested.min(max_frames);
        let chunk = ChunkDescriptor { offset: 0, size: frames * stride, stride, flags };

        pool.release(buffer);
        self.local_position += frames as u64;

        CycleOutcome::Produced(Produced { buffer, chunk })
    }

    /// Whether the main loop's refill event should be signaled, given the
    /// ring's remaining capacity and a caller-chosen watermark (§4.5 step 6).
    pub fn needs_refill(remaining_capacity: u32, watermark: u32) -> bool {
        remaining_capacity < watermark
    }

    /// Consumer cycle (§4.5 steps 3-6, symmetric): dequeue, consume, queue
    /// back, and feed `target_buffer - avail` to the DLL. Overrun is
    /// checked before underrun since an overrun implies there was never a
    /// shortage this cycle.
    pub fn consumer_cycle(&mut self, pool: &BufferPool, avail: u32) -> CycleOutcome {
        if avail > 8 * self.target_buffer {
            let dropped_frames = avail - self.target_buffer;
            tracing::warn!(dropped_frames, avail, "overrun, dropping oldest samples");
            return CycleOutcome::Overrun { dropped_frames };
        }

        if avail < self.target_buffer {
            if self.sync_lost {
                tracing::debug!(avail, target = self.target_buffer, "still out of sync");
            } else {
                tracing::warn!(avail, target = self.target_buffer, "underrun, lost sync");
                self.sync_lost = true;
            }
            return CycleOutcome::Underrun;
        }

        if self.sync_lost {
            self.sync_lost = false;
            tracing::debug!("sync reacquired");
        }

        let buffer = match self.try_acquire(pool) {
            Some(b) => b,
            None => return CycleOutcome::NoBufferAvailable,
        };

        // First-cycle skip (§4.5): discard the excess above target without
        // feeding it to the DLL, so steady state is reached without a
        // latency bump.
        let fill_error = if self.first_cycle {
            self.first_cycle = false;
            0.0
        } else {
            self.target_buffer as f32 - avail as f32
        };
        let correction = self.dll.update(fill_error);
        pool.release(buffer);

        CycleOutcome::Consumed(Consumed { buffer, correction })
    }

    fn try_acquire(&self, pool: &BufferPool) -> Option<u32> {
        match pool.acquire(Some(Duration::ZERO)) {
            Ok(Some(buffer)) => Some(buffer),
            Ok(None) => {
                tracing::warn!("no buffer available, underflow");
                None
            }
            Err(TransportError::Flushing) => None,
            Err(error) => {
                tracing::error!(%error, "unexpected pool error in process cycle");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(kind: NodeKind) -> NodeCycle {
        NodeCycle::new(kind, 1024, 0.5, 1024, 48000)
    }

    #[test]
    fn producer_cycle_without_buffers_reports_no_buffer_available() {
        let pool = BufferPool::new();
        let mut node = cycle(NodeKind::Producer);
        assert_eq!(node.producer_cycle(&pool, 256, 4096, 4, 0), CycleOutcome::NoBufferAvailable);
    }

    #[test]
    fn producer_cycle_clamps_to_maxsize_over_stride() {
        let pool = BufferPool::new();
        pool.add(1);
        let mut node = cycle(NodeKind::Producer);
        let outcome = node.producer_cycle(&pool, 2000, 4096, 4, 0);
        assert_eq!(
            outcome,
            CycleOutcome::Produced(Produced {
                buffer: 1,
                chunk: ChunkDescriptor { offset: 0, size: 4096, stride: 4, flags: 0 }
            })
        );
        // Buffer was queued back, not consumed.
        assert_eq!(pool.acquire(Some(Duration::ZERO)).unwrap(), Some(1));
    }

    #[test]
    fn consumer_cycle_flags_underrun_once_then_debug_on_repeat() {
        let pool = BufferPool::new();
        let mut node = cycle(NodeKind::Consumer);
        assert_eq!(node.consumer_cycle(&pool, 10), CycleOutcome::Underrun);
        assert!(node.sync_lost);
        assert_eq!(node.consumer_cycle(&pool, 10), CycleOutcome::Underrun);
    }

    #[test]
    fn consumer_cycle_flags_overrun_above_eight_times_target() {
        let pool = BufferPool::new();
        pool.add(9);
        let mut node = cycle(NodeKind::Consumer);
        let outcome = node.consumer_cycle(&pool, 1024 * 9);
        assert_eq!(outcome, CycleOutcome::Overrun { dropped_frames: 1024 * 8 });
    }

    #[test]
    fn consumer_cycle_reacquires_sync_once_avail_meets_target() {
        let pool = BufferPool::new();
        let mut node = cycle(NodeKind::Consumer);
        node.consumer_cycle(&pool, 0);
        assert!(node.sync_lost);

        pool.add(1);
        node.consumer_cycle(&pool, 1024);
        assert!(!node.sync_lost);
    }

    #[test]
    fn observe_position_resets_dll_on_clock_id_change() {
        let mut node = cycle(NodeKind::Consumer);
        node.observe_position(&Position { clock_id: 1, position: 1000, duration: 1024, rate: 48000 });
        assert_eq!(node.offset(), 1000);
        node.observe_position(&Position { clock_id: 1, position: 2000, duration: 1024, rate: 48000 });
        // Same clock id: offset does not recompute.
        assert_eq!(node.offset(), 1000);
        node.observe_position(&Position { clock_id: 2, position: 5000, duration: 1024, rate: 48000 });
        assert_eq!(node.offset(), 5000 - node.local_position as i64);
    }
}

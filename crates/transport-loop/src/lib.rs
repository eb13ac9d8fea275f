//! Scheduler / Main Loop (§4.6): a single-threaded cooperative event loop
//! multiplexing I/O, idle, event, timer, and signal sources on top of
//! `mio`.
//!
//! `enter()`/`leave()` bracket a run of `iterate()` calls; `signal_event`
//! (via a cloned [`LoopHandle`]) is the one API meant to be called from a
//! thread other than the loop's own.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use transport_error::TransportError;

/// Readiness mask for an I/O source, matching §4.6's `IN`/`OUT`/`HUP`/`ERR`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoMask {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub err: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

const WAKE_TOKEN: Token = Token(usize::MAX);

struct IoEntry {
    fd: RawFd,
    handler: Box<dyn FnMut(SourceId, RawFd, IoMask)>,
}

struct IdleEntry {
    handler: Box<dyn FnMut(SourceId)>,
}

struct EventEntry {
    handler: Box<dyn FnMut(SourceId, u64)>,
}

struct TimerEntry {
    deadline: Instant,
    interval: Option<Duration>,
    handler: Box<dyn FnMut(SourceId)>,
}

struct SignalEntry {
    signum: i32,
    handler: Box<dyn FnMut(SourceId, i32)>,
}

struct PendingEvents {
    waker: Waker,
    counts: Mutex<HashMap<usize, u64>>,
}

/// The one thread-safe handle into a [`MainLoop`]: wakes the loop and
/// records that an event source fired, from any thread (§4.6, §5).
#[derive(Clone)]
pub struct LoopHandle {
    pending: Arc<PendingEvents>,
}

impl LoopHandle {
    pub fn signal_event(&self, source: SourceId) {
        let mut counts = self.pending.counts.lock().unwrap();
        *counts.entry(source.0).or_insert(0) += 1;
        drop(counts);
        // A failed wake means the loop is gone or its waker fd is full;
        // either way there is nothing more this handle can do.
        let _ = self.pending.waker.wake();
    }
}

pub struct MainLoop {
    poll: Poll,
    events: Events,
    pending: Arc<PendingEvents>,
    next_id: usize,
    io: HashMap<usize, IoEntry>,
    idle: HashMap<usize, IdleEntry>,
    event_sources: HashMap<usize, EventEntry>,
    timers: HashMap<usize, TimerEntry>,
    timer_order: BinaryHeap<Reverse<(Instant, usize)>>,
    signals: HashMap<usize, SignalEntry>,
    entered: bool,
}

impl MainLoop {
    pub fn new() -> Result<Self, TransportError> {
        let poll = Poll::new().map_err(TransportError::NoMemory)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(TransportError::NoMemory)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            pending: Arc::new(PendingEvents { waker, counts: Mutex::new(HashMap::new()) }),
            next_id: 0,
            io: HashMap::new(),
            idle: HashMap::new(),
            event_sources: HashMap::new(),
            timers: HashMap::new(),
            timer_order: BinaryHeap::new(),
            signals: HashMap::new(),
            entered: false,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { pending: Arc::clone(&self.pending) }
    }

    fn alloc_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Brackets reentrant use (§4.6). Calling `enter` again before a
    /// matching `leave` — including from inside a source callback — fails.
    pub fn enter(&mut self) -> Result<(), TransportError> {
        if self.entered {
            return Err(TransportError::InvalidArguments("main loop entered reentrantly"));
        }
        self.entered = true;
        Ok(())
    }

    pub fn leave(&mut self) {
        self.entered = false;
    }

    pub fn add_io_source(
        &mut self,
        fd: RawFd,
        mask: IoMask,
        handler: impl FnMut(SourceId, RawFd, IoMask) + 'static,
    ) -> Result<SourceId, TransportError> {
        let id = self.alloc_id();
        let interest = mask_to_interest(mask);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id), interest)
            .map_err(TransportError::NoMemory)?;
        self.io.insert(id, IoEntry { fd, handler: Box::new(handler) });
        Ok(SourceId(id))
    }

    pub fn remove_io_source(&mut self, id: SourceId) -> bool {
        match self.io.remove(&id.0) {
            Some(entry) => {
                let _ = self.poll.registry().deregister(&mut SourceFd(&entry.fd));
                true
            }
            None => false,
        }
    }

    pub fn add_idle_source(&mut self, handler: impl FnMut(SourceId) + 'static) -> SourceId {
        let id = self.alloc_id();
        self.idle.insert(id, IdleEntry { handler: Box::new(handler) });
        SourceId(id)
    }

    pub fn remove_idle_source(&mut self, id: SourceId) -> bool {
        self.idle.remove(&id.0).is_some()
    }

    pub fn add_event_source(&mut self, handler: impl FnMut(SourceId, u64) + 'static) -> SourceId {
        let id = self.alloc_id();
        self.event_sources.insert(id, EventEntry { handler: Box::new(handler) });
        SourceId(id)
    }

    pub fn remove_event_source(&mut self, id: SourceId) -> bool {
        self.event_sources.remove(&id.0).is_some()
    }

    pub fn add_timer_source(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        handler: impl FnMut(SourceId) + 'static,
    ) -> SourceId {
        let id = self.alloc_id();
        self.timers.insert(id, TimerEntry { deadline, interval, handler: Box::new(handler) });
        self.timer_order.push(Reverse((deadline, id)));
        SourceId(id)
    }

    pub fn remove_timer_source(&mut self, id: SourceId) -> bool {
        self.timers.remove(&id.0).is_some()
    }

    pub fn add_signal_source(&mut self, signum: i32, handler: impl FnMut(SourceId, i32) + 'static) -> SourceId {
        let id = self.alloc_id();
        self.signals.insert(id, SignalEntry { signum, handler: Box::new(handler) });
        SourceId(id)
    }

    pub fn remove_signal_source(&mut self, id: SourceId) -> bool {
        self.signals.remove(&id.0).is_some()
    }

    /// Delivers a POSIX signal previously observed outside the loop (e.g.
    /// via a self-pipe) to every registered handler for `signum`. Installing
    /// an actual `sigaction` is out of scope; this is the dispatch half of
    /// the contract.
    pub fn dispatch_signal(&mut self, signum: i32) {
        let matching: Vec<usize> = self.signals.iter().filter(|(_, e)| e.signum == signum).map(|(id, _)| *id).collect();
        for id in matching {
            if let Some(entry) = self.signals.get_mut(&id) {
                (entry.handler)(SourceId(id), signum);
            }
        }
    }

    /// Next deadline among pending timers, skipping ids removed since they
    /// were pushed onto the heap.
    fn next_timer_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.timer_order.peek().copied() {
            if self.timers.contains_key(&id) {
                return Some(deadline);
            }
            self.timer_order.pop();
        }
        None
    }

    fn fire_due_timers(&mut self) -> bool {
        let now = Instant::now();
        let mut fired = false;
        loop {
            let due = match self.timer_order.peek().copied() {
                Some(Reverse((deadline, id))) if deadline <= now && self.timers.contains_key(&id) => id,
                Some(Reverse((_, id))) if !self.timers.contains_key(&id) => {
                    self.timer_order.pop();
                    continue;
                }
                _ => break,
            };
            self.timer_order.pop();
            fired = true;
            let reschedule = if let Some(entry) = self.timers.get_mut(&due) {
                (entry.handler)(SourceId(due));
                entry.interval
            } else {
                None
            };
            if let Some(interval) = reschedule {
                if let Some(entry) = self.timers.get_mut(&due) {
                    entry.deadline = now + interval;
                    self.timer_order.push(Reverse((entry.deadline, due)));
                }
            } else {
                self.timers.remove(&due);
            }
        }
        fired
    }

    fn drain_event_sources(&mut self) -> bool {
        let drained: Vec<(usize, u64)> = std::mem::take(&mut *self.pending.counts.lock().unwrap()).into_iter().collect();
        let mut dispatched = false;
        for (id, count) in drained {
            if let Some(entry) = self.event_sources.get_mut(&id) {
                (entry.handler)(SourceId(id), count);
                dispatched = true;
            }
        }
        dispatched
    }

    /// Runs at most one dispatch pass (§4.6). `timeout = None` blocks until
    /// any source fires; `Some(d)` returns after at most `d`. Idle sources
    /// only run on a pass where nothing else fired.
    pub fn iterate(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        if !self.entered {
            return Err(TransportError::InvalidArguments("iterate called outside enter/leave"));
        }

        let poll_timeout = match (timeout, self.next_timer_deadline()) {
            (Some(t), Some(deadline)) => Some(t.min(deadline.saturating_duration_since(Instant::now()))),
            (Some(t), None) => Some(t),
            (None, Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
            (None, None) => None,
        };

        self.poll.poll(&mut self.events, poll_timeout).map_err(TransportError::NoMemory)?;

        let ready: Vec<(Token, IoMask)> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKE_TOKEN)
            .map(|e| {
                (
                    e.token(),
                    IoMask {
                        readable: e.is_readable(),
                        writable: e.is_writable(),
                        hup: e.is_read_closed() || e.is_write_closed(),
                        err: e.is_error(),
                    },
                )
            })
            .collect();

        let mut dispatched = !ready.is_empty();
        for (token, mask) in ready {
            if let Some(entry) = self.io.get_mut(&token.0) {
                let fd = entry.fd;
                (entry.handler)(SourceId(token.0), fd, mask);
            }
        }

        dispatched |= self.drain_event_sources();
        dispatched |= self.fire_due_timers();

        if !dispatched {
            let ids: Vec<usize> = self.idle.keys().copied().collect();
            for id in ids {
                if let Some(entry) = self.idle.get_mut(&id) {
                    (entry.handler)(SourceId(id));
                }
            }
        }

        Ok(())
    }
}

fn mask_to_interest(mask: IoMask) -> Interest {
    match (mask.readable, mask.writable) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn enter_rejects_reentry() {
        let mut lp = MainLoop::new().unwrap();
        lp.enter().unwrap();
        assert!(lp.enter().is_err());
        lp.leave();
        lp.enter().unwrap();
    }

    #[test]
    fn idle_source_runs_when_nothing_else_fires() {
        let mut lp = MainLoop::new().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        lp.add_idle_source(move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        lp.enter().unwrap();
        lp.iterate(Some(Duration::from_millis(5))).unwrap();
        lp.leave();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn timer_source_fires_after_its_deadline() {
        let mut lp = MainLoop::new().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        lp.add_timer_source(Instant::now(), None, move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        lp.enter().unwrap();
        lp.iterate(Some(Duration::from_millis(50))).unwrap();
        lp.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_event_from_another_thread_wakes_and_dispatches() {
        let mut lp = MainLoop::new().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        let id = lp.add_event_source(move |_, count| {
            fired_cb.fetch_add(count as u32, Ordering::SeqCst);
        });
        let handle = lp.handle();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.signal_event(id);
        });

        lp.enter().unwrap();
        lp.iterate(Some(Duration::from_secs(2))).unwrap();
        lp.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn io_source_fires_on_a_readable_pipe() {
        let (mut reader, mut writer) = os_pipe();
        let mut lp = MainLoop::new().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = Arc::clone(&fired);
        lp.add_io_source(reader.as_raw_fd(), IoMask { readable: true, ..Default::default() }, move |_, _, mask| {
            if mask.readable {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        use std::io::Write;
        writer.write_all(b"x").unwrap();

        lp.enter().unwrap();
        lp.iterate(Some(Duration::from_secs(2))).unwrap();
        lp.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        use std::io::Read;
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
    }

    fn os_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        // SAFETY: fds is a valid 2-element buffer for pipe(2).
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // SAFETY: both fds were just returned by pipe(2) and are owned here.
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }
}

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport_factory::TransportFactory;
use transport_loop::MainLoop;
use transport_node::{CycleOutcome, NodeCycle, NodeKind};
use transport_pool::BufferPool;
use transport_shm::TransportInfo;

const SAMPLE_RATE: u32 = 48_000;
const CYCLE_PERIOD_FRAMES: u32 = 1024;
const SERVICE_ITERATIONS: u32 = 10;

/// Reads the transport handoff out of the environment, the way a spawned
/// child inherits `PIPEWIRE_REMOTE` from its parent (§6). A real deployment
/// would pass these over the control socket instead; wiring that socket is
/// out of scope for the core.
fn transport_info_from_env() -> Option<TransportInfo> {
    let fd: RawFd = std::env::var("GRAPHD_MEMFD_FD").ok()?.parse().ok()?;
    let offset: u64 = std::env::var("GRAPHD_MEMFD_OFFSET").ok()?.parse().ok()?;
    let size: u64 = std::env::var("GRAPHD_MEMFD_SIZE").ok()?.parse().ok()?;
    // SAFETY: the spawning graphd process is documented to pass an owned,
    // inherited fd via GRAPHD_MEMFD_FD; this process does not use it for
    // anything else.
    let memfd: OwnedFd = unsafe { OwnedFd::from_raw_fd(fd) };
    Some(TransportInfo { memfd, offset, size })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let info = match transport_info_from_env() {
        Some(info) => info,
        None => {
            error!("GRAPHD_MEMFD_FD/OFFSET/SIZE not set; nothing to attach to");
            std::process::exit(1);
        }
    };

    let mut endpoint = match TransportFactory::new_from_info(info) {
        Ok(endpoint) => endpoint,
        Err(error) => {
            error!(%error, "failed to attach to transport region");
            std::process::exit(1);
        }
    };

    let pool = BufferPool::new();
    for id in 0..4 {
        pool.add(id);
    }
    let mut cycle = NodeCycle::new(NodeKind::Consumer, CYCLE_PERIOD_FRAMES, 0.5, CYCLE_PERIOD_FRAMES, SAMPLE_RATE);

    let mut main_loop = match MainLoop::new() {
        Ok(main_loop) => main_loop,
        Err(error) => {
            error!(%error, "failed to construct main loop");
            std::process::exit(1);
        }
    };

    let period = Duration::from_secs_f64(CYCLE_PERIOD_FRAMES as f64 / SAMPLE_RATE as f64);
    main_loop.add_timer_source(Instant::now(), Some(period), move |_| {
        while let Ok(header) = endpoint.next_event() {
            let mut body = vec![0u8; header.size as usize];
            if let Err(error) = endpoint.parse_event(&mut body) {
                warn!(%error, "failed to parse peeked event");
                break;
            }
            info!(ty = header.ty, size = header.size, "received event");
        }

        match cycle.consumer_cycle(&pool, endpoint.incoming_filled()) {
            CycleOutcome::Consumed(c) => info!(buffer = c.buffer, correction = c.correction, "consumed"),
            CycleOutcome::Underrun => warn!("underrun"),
            CycleOutcome::Overrun { dropped_frames } => warn!(dropped_frames, "overrun"),
            CycleOutcome::NoBufferAvailable => warn!("no buffer available"),
            CycleOutcome::Produced(_) => unreachable!("consumer node never produces"),
        }
    });

    if let Err(error) = main_loop.enter() {
        error!(%error, "failed to enter main loop");
        std::process::exit(1);
    }
    for _ in 0..SERVICE_ITERATIONS {
        if let Err(error) = main_loop.iterate(Some(period)) {
            error!(%error, "main loop iteration failed");
            break;
        }
    }
    main_loop.leave();
    info!("noded shutting down");
}

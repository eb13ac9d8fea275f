use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport_config::{DaemonConfig, NodeKind as ConfigNodeKind};
use transport_factory::TransportFactory;
use transport_loop::MainLoop;
use transport_node::{CycleOutcome, NodeCycle, NodeKind};
use transport_pool::BufferPool;
use transport_shm::TransportEndpoint;

const SAMPLE_RATE: u32 = 48_000;
const CYCLE_PERIOD_FRAMES: u32 = 1024;
const SERVICE_ITERATIONS: u32 = 10;

fn config_path() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        }
    }
    std::env::var("GRAPHD_CONFIG_FILE").unwrap_or_else(|_| "/etc/graphd/config.toml".into())
}

fn to_node_kind(kind: ConfigNodeKind) -> NodeKind {
    match kind {
        ConfigNodeKind::Producer => NodeKind::Producer,
        ConfigNodeKind::Consumer => NodeKind::Consumer,
        ConfigNodeKind::Filter => NodeKind::Filter,
    }
}

struct RunningNode {
    name: String,
    kind: NodeKind,
    pool: BufferPool,
    cycle: NodeCycle,
    // Also the source of each cycle's real ring fill level; the daemon
    // process is the server side of the pair and must hold the mapping open
    // for the node's lifetime regardless.
    endpoint: TransportEndpoint,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = config_path();
    let config = match DaemonConfig::load(&path) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, path, "failed to load daemon config");
            std::process::exit(1);
        }
    };

    if let Err(error) = transport_rt::request_realtime(0, 10) {
        warn!(%error, "continuing without realtime scheduling");
    }

    let mut nodes = Vec::new();
    for node_config in &config.node {
        let endpoint = match TransportFactory::new_with_ring_size(config.max_inputs, config.max_outputs, config.ring_size) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                error!(%error, node = node_config.name, "failed to construct transport endpoint");
                std::process::exit(1);
            }
        };
        match endpoint.info() {
            Ok(info) => info!(node = node_config.name, memfd = info.memfd.as_raw_fd(), size = info.size, "endpoint ready for handoff"),
            Err(error) => error!(%error, node = node_config.name, "failed to read endpoint info"),
        }

        let pool = BufferPool::new();
        for id in 0..4 {
            pool.add(id);
        }

        let cycle = NodeCycle::new(
            to_node_kind(node_config.kind),
            node_config.target_buffer,
            node_config.dll_bandwidth,
            CYCLE_PERIOD_FRAMES,
            SAMPLE_RATE,
        );

        nodes.push(RunningNode {
            name: node_config.name.clone(),
            kind: to_node_kind(node_config.kind),
            pool,
            cycle,
            endpoint,
        });
    }

    let mut main_loop = match MainLoop::new() {
        Ok(main_loop) => main_loop,
        Err(error) => {
            error!(%error, "failed to construct main loop");
            std::process::exit(1);
        }
    };

    let period = Duration::from_secs_f64(CYCLE_PERIOD_FRAMES as f64 / SAMPLE_RATE as f64);
    main_loop.add_timer_source(Instant::now(), Some(period), move |_| {
        for node in &mut nodes {
            let outcome = match node.kind {
                NodeKind::Producer => node.cycle.producer_cycle(&node.pool, 256, 4096, 4, 0),
                NodeKind::Consumer | NodeKind::Filter => node.cycle.consumer_cycle(&node.pool, node.endpoint.incoming_filled()),
            };
            match outcome {
                CycleOutcome::Produced(p) => info!(node = node.name, buffer = p.buffer, size = p.chunk.size, "produced"),
                CycleOutcome::Consumed(c) => info!(node = node.name, buffer = c.buffer, correction = c.correction, "consumed"),
                CycleOutcome::Underrun => warn!(node = node.name, "underrun"),
                CycleOutcome::Overrun { dropped_frames } => warn!(node = node.name, dropped_frames, "overrun"),
                CycleOutcome::NoBufferAvailable => warn!(node = node.name, "no buffer available"),
            }
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
    info!("graphd shutting down");
}

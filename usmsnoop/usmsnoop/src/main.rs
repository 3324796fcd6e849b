use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aya::{
    maps::RingBuf,
    programs::{tc, SchedClassifier, TcAttachType},
};
use clap::Parser;
#[rustfmt::skip]
use log::{debug, info, trace, warn};
use tokio::signal;
use tokio::sync::mpsc;
use usm_common::{ConnTuple, Http2StreamEvent, RawSegment};
use usmsnoop::config::{KAFKA_MAX_SUPPORTED_API_KEY, KAFKA_MAX_SUPPORTED_API_VERSION};
use usmsnoop::{
    BatchConsumer, Config, CpuContext, Http2Transaction, PerfBufferSink, RingBufferSink, Sinks,
    Usm,
};

mod ringbuf;
use ringbuf::{handle_ringbuf, RingBufEventHandler};

const WORKER_QUEUE_LEN: usize = 1024;
const OUTPUT_QUEUE_LEN: usize = 64;

#[derive(Debug, Parser)]
struct Opt {
    #[clap(short, long, default_value = "eth0")]
    iface: String,

    /// Compiled classifier object
    #[clap(long, default_value = "target/bpfel-unknown-none/release/usmsnoop")]
    ebpf_object: PathBuf,

    /// Emit pages on per-CPU queues instead of one shared queue
    #[clap(long)]
    perf_buffer: bool,

    #[clap(long)]
    disable_http2: bool,

    #[clap(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    #[clap(long, default_value_t = KAFKA_MAX_SUPPORTED_API_KEY)]
    kafka_max_api_key: u16,

    #[clap(long, default_value_t = KAFKA_MAX_SUPPORTED_API_VERSION)]
    kafka_max_api_version: u16,
}

/// A captured frame: its first bytes and its length on the wire.
struct Captured {
    data: Vec<u8>,
    wire_len: usize,
}

/// Forwards captured segments to a worker picked by connection, so both
/// directions of a connection are processed by the same worker whichever
/// CPUs saw them.
struct SegmentForwarder {
    usm: Arc<Usm>,
    workers: Vec<mpsc::Sender<Captured>>,
}

impl RingBufEventHandler for SegmentForwarder {
    fn handle_event(&mut self, data: &[u8]) {
        if data.len() < RawSegment::LEN {
            debug!("short segment record: {} bytes", data.len());
            return;
        }
        let raw: RawSegment = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const RawSegment) };
        if raw.uncaptured_len() > 0 {
            trace!("cpu {}: {} bytes past the capture limit", raw.cpu, raw.uncaptured_len());
        }
        let worker = self.usm.worker_for(raw.payload(), self.workers.len());
        let captured = Captured {
            data: raw.payload().to_vec(),
            wire_len: raw.wire_len as usize,
        };
        if let Err(e) = self.workers[worker].try_send(captured) {
            debug!("worker {worker}: dropping segment: {e}");
        }
    }
}

fn nr_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

async fn consume_streams(mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut consumer = BatchConsumer::<Http2StreamEvent>::new();
    while let Some(record) = rx.recv().await {
        match consumer.consume(&record) {
            Ok(events) => {
                for event in &events {
                    info!("{}", Http2Transaction::from(event));
                }
            }
            Err(e) => warn!("bad http2 page: {e}"),
        }
    }
    let stats = consumer.stats();
    if stats.dropped_events > 0 || stats.failed_flushes > 0 {
        warn!(
            "http2 streams lost: {} dropped events, {} failed flushes",
            stats.dropped_events, stats.failed_flushes
        );
    }
}

async fn consume_terminated(mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut consumer = BatchConsumer::<ConnTuple>::new();
    while let Some(record) = rx.recv().await {
        match consumer.consume(&record) {
            Ok(tuples) => {
                for tuple in tuples {
                    debug!("connection closed: {tuple}");
                }
            }
            Err(e) => warn!("bad terminated-connections page: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    env_logger::init();

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }

    let mut ebpf = aya::Ebpf::load_file(&opt.ebpf_object)
        .with_context(|| format!("cannot load {}", opt.ebpf_object.display()))?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        // This can happen if you remove all log statements from your eBPF program.
        warn!("failed to initialize eBPF logger: {e}");
    }

    let iface = &opt.iface;
    println!("Interface: {iface}");
    // error adding clsact to the interface if it is already added is harmless
    // the full cleanup can be done with 'sudo tc qdisc del dev eth0 clsact'.
    let _ = tc::qdisc_add_clsact(iface);
    let program: &mut SchedClassifier = ebpf
        .program_mut("usmsnoop")
        .context("usmsnoop program not found")?
        .try_into()?;
    program.load()?;
    for attach_type in [TcAttachType::Ingress, TcAttachType::Egress] {
        program
            .attach(iface, attach_type)
            .with_context(|| format!("cannot attach to {iface} ({attach_type:?})"))?;
    }

    let config = Config {
        use_ring_buffer: !opt.perf_buffer,
        http2_monitoring_enabled: !opt.disable_http2,
        kafka_max_api_key: opt.kafka_max_api_key,
        kafka_max_api_version: opt.kafka_max_api_version,
        ..Config::default()
    };
    let cpus = nr_cpus();

    let sinks = if config.use_ring_buffer {
        let (streams, streams_rx) = RingBufferSink::new(OUTPUT_QUEUE_LEN);
        let (terminated, terminated_rx) = RingBufferSink::new(OUTPUT_QUEUE_LEN);
        tokio::spawn(consume_streams(streams_rx));
        tokio::spawn(consume_terminated(terminated_rx));
        Sinks {
            http2_streams: Arc::new(streams),
            http2_terminated: Arc::new(terminated),
        }
    } else {
        let (streams, streams_rx) = PerfBufferSink::new(cpus, OUTPUT_QUEUE_LEN);
        let (terminated, terminated_rx) = PerfBufferSink::new(cpus, OUTPUT_QUEUE_LEN);
        for rx in streams_rx {
            tokio::spawn(consume_streams(rx));
        }
        for rx in terminated_rx {
            tokio::spawn(consume_terminated(rx));
        }
        Sinks {
            http2_streams: Arc::new(streams),
            http2_terminated: Arc::new(terminated),
        }
    };

    let usm = Arc::new(Usm::new(config, sinks));
    let flush_interval = Duration::from_millis(opt.flush_interval_ms.max(1));

    let mut workers = Vec::with_capacity(cpus);
    for cpu in 0..cpus {
        let (tx, mut rx) = mpsc::channel::<Captured>(WORKER_QUEUE_LEN);
        workers.push(tx);
        let usm = usm.clone();
        tokio::spawn(async move {
            let mut ctx = CpuContext::new(cpu as u16);
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    captured = rx.recv() => match captured {
                        Some(captured) => {
                            usm.process_captured(&mut ctx, &captured.data, captured.wire_len);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        usm.flush(&mut ctx);
                        usm.sync(&mut ctx);
                    }
                }
            }
            usm.flush(&mut ctx);
            usm.sync(&mut ctx);
        });
    }

    // Receive segments
    let ring_buf = RingBuf::try_from(
        ebpf.take_map("SEGMENTS")
            .context("SEGMENTS map not found")?,
    )?;
    let mut forwarder = SegmentForwarder {
        usm: usm.clone(),
        workers,
    };
    tokio::spawn(async move {
        if let Err(e) = handle_ringbuf(ring_buf, &mut forwarder).await {
            warn!("segment reader stopped: {e:#}");
        }
    });

    let ctrl_c = signal::ctrl_c();
    println!("Waiting for Ctrl-C...");
    ctrl_c.await?;
    println!("Exiting...");

    let snapshot = usm.telemetry().snapshot();
    println!("{snapshot:#?}");

    Ok(())
}

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{debug, trace};
use usm_common::{ConnTuple, Http2StreamEvent, Protocol};

use crate::batch::{BatchSink, BatchWriter};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::dedup::Deduper;
use crate::dispatcher::{Dispatcher, SkbInfo};
use crate::error::PacketError;
use crate::http2::{Http2Parser, Http2Scratch};
use crate::network::parse_ether;
use crate::telemetry::{inc, Telemetry};

/// Everything one CPU owns: decoder scratch space and its batch pages.
pub struct CpuContext {
    pub(crate) cpu: u16,
    pub(crate) http2_scratch: Http2Scratch,
    pub(crate) http2_streams: BatchWriter<Http2StreamEvent>,
    pub(crate) http2_terminated: BatchWriter<ConnTuple>,
}

impl CpuContext {
    pub fn new(cpu: u16) -> Self {
        CpuContext {
            cpu,
            http2_scratch: Http2Scratch::default(),
            http2_streams: BatchWriter::new(cpu),
            http2_terminated: BatchWriter::new(cpu),
        }
    }

    pub fn cpu(&self) -> u16 {
        self.cpu
    }

    pub fn http2_scratch(&self) -> &Http2Scratch {
        &self.http2_scratch
    }

    pub fn http2_streams(&self) -> &BatchWriter<Http2StreamEvent> {
        &self.http2_streams
    }

    pub fn http2_terminated(&self) -> &BatchWriter<ConnTuple> {
        &self.http2_terminated
    }
}

/// Output of each event type.
#[derive(Clone)]
pub struct Sinks {
    pub http2_streams: Arc<dyn BatchSink>,
    pub http2_terminated: Arc<dyn BatchSink>,
}

/// The packet pipeline: dedupe, classify, dispatch.
///
/// Shared state lives in here and is safe to use from every worker; each
/// worker passes its own [`CpuContext`].
pub struct Usm {
    config: Config,
    telemetry: Telemetry,
    deduper: Deduper,
    classifier: Classifier,
    dispatcher: Dispatcher,
    http2: Option<Arc<Http2Parser>>,
    sinks: Sinks,
}

impl Usm {
    pub fn new(config: Config, sinks: Sinks) -> Self {
        let mut dispatcher = Dispatcher::new();
        let http2 = config.http2_monitoring_enabled.then(|| {
            let parser = Arc::new(Http2Parser::new(&config));
            dispatcher.register(Box::new(parser.clone()));
            parser
        });
        Usm {
            telemetry: Telemetry::default(),
            deduper: Deduper::new(config.maps.tcp_seq),
            classifier: Classifier::new(&config),
            dispatcher,
            http2,
            sinks,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn http2(&self) -> Option<&Http2Parser> {
        self.http2.as_deref()
    }

    /// Runs a captured ethernet frame through the pipeline. Returns the
    /// protocol of its connection, or `None` when the frame was dropped.
    pub fn process_packet(&self, cpu: &mut CpuContext, packet: &[u8]) -> Option<Protocol> {
        self.process_captured(cpu, packet, packet.len())
    }

    /// Like [`Usm::process_packet`] for a frame of `wire_len` bytes of which
    /// only the first `packet.len()` were copied.
    pub fn process_captured(
        &self,
        cpu: &mut CpuContext,
        packet: &[u8],
        wire_len: usize,
    ) -> Option<Protocol> {
        let tel = &self.telemetry.pipeline;
        inc(&tel.packets_seen);
        let (tuple, mut segment) = match parse_ether(packet) {
            Ok(parsed) => parsed,
            Err(e @ PacketError::Malformed(_)) => {
                trace!("dropping packet: {e}");
                inc(&tel.malformed_dropped);
                return None;
            }
            Err(e) => {
                trace!("dropping packet: {e}");
                inc(&tel.non_tcp_dropped);
                return None;
            }
        };
        if segment.data_end == packet.len() {
            segment.uncaptured_len = wire_len.saturating_sub(packet.len());
        }
        self.process_segment(
            cpu,
            &SkbInfo {
                tuple,
                segment,
                packet,
            },
        )
    }

    /// Picks one of `workers` for a captured frame.
    ///
    /// Both directions of a connection hash to the same worker, so the
    /// connection's classification, streams and HPACK state are only ever
    /// read and written back by one thread. Frames that do not parse go to
    /// worker 0, which drops and counts them.
    pub fn worker_for(&self, packet: &[u8], workers: usize) -> usize {
        if workers <= 1 {
            return 0;
        }
        let Ok((tuple, _)) = parse_ether(packet) else {
            return 0;
        };
        let mut hasher = DefaultHasher::new();
        tuple
            .normalize(self.config.ephemeral_port_start)
            .hash(&mut hasher);
        (hasher.finish() % workers as u64) as usize
    }

    pub fn process_segment(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>) -> Option<Protocol> {
        if !self.deduper.accept(&skb.tuple, &skb.segment, &self.telemetry.pipeline) {
            return None;
        }

        let protocol = self
            .classifier
            .classify(&skb.tuple, skb.payload(), &self.telemetry.pipeline);
        self.dispatcher.dispatch(protocol, cpu, skb, &self.telemetry);

        if skb.segment.is_termination() {
            self.classifier.forget(&skb.tuple);
            self.deduper.forget(&skb.tuple);
            self.flush(cpu);
        }
        Some(protocol)
    }

    /// Sends every full page of this CPU.
    pub fn flush(&self, cpu: &mut CpuContext) {
        if !self.config.http2_monitoring_enabled {
            return;
        }
        cpu.http2_streams.flush(self.sinks.http2_streams.as_ref());
        cpu.http2_terminated.flush(self.sinks.http2_terminated.as_ref());
    }

    /// Sends a snapshot of the partially filled pages of this CPU.
    pub fn sync(&self, cpu: &mut CpuContext) {
        if !self.config.http2_monitoring_enabled {
            return;
        }
        if let Err(e) = cpu.http2_streams.sync(self.sinks.http2_streams.as_ref()) {
            debug!("cpu {}: cannot sync http2 streams: {e}", cpu.cpu);
        }
        if let Err(e) = cpu.http2_terminated.sync(self.sinks.http2_terminated.as_ref()) {
            debug!("cpu {}: cannot sync terminated connections: {e}", cpu.cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RingBufferSink;
    use etherparse::PacketBuilder;
    use proptest::prelude::*;

    fn sinks() -> Sinks {
        let (sink, _rx) = RingBufferSink::new(8);
        Sinks {
            http2_streams: Arc::new(sink.clone()),
            http2_terminated: Arc::new(sink),
        }
    }

    #[test]
    fn counts_non_tcp_and_malformed() {
        let usm = Usm::new(Config::default(), sinks());
        let mut cpu = CpuContext::new(0);

        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(53, 53);
        let mut udp = Vec::new();
        builder.write(&mut udp, b"dns").unwrap();

        assert_eq!(usm.process_packet(&mut cpu, &udp), None);
        assert_eq!(usm.process_packet(&mut cpu, &[0; 3]), None);
        let snapshot = usm.telemetry().snapshot();
        assert_eq!(snapshot.packets_seen, 2);
        assert_eq!(snapshot.non_tcp_dropped, 1);
        assert_eq!(snapshot.malformed_dropped, 1);
    }

    fn tcp(src: ([u8; 4], u16), dst: ([u8; 4], u16)) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(src.0, dst.0, 64)
            .tcp(src.1, dst.1, 1, 65535);
        let mut out = Vec::new();
        builder.write(&mut out, b"x").unwrap();
        out
    }

    proptest! {
        #[test]
        fn both_directions_go_to_one_worker(
            client in any::<[u8; 4]>(),
            server in any::<[u8; 4]>(),
            client_port in any::<u16>(),
            server_port in any::<u16>(),
            workers in 1usize..16,
        ) {
            let usm = Usm::new(Config::default(), sinks());
            let request = tcp((client, client_port), (server, server_port));
            let response = tcp((server, server_port), (client, client_port));
            let worker = usm.worker_for(&request, workers);
            prop_assert!(worker < workers);
            prop_assert_eq!(worker, usm.worker_for(&response, workers));
        }
    }

    #[test]
    fn unparsable_frames_go_to_first_worker() {
        let usm = Usm::new(Config::default(), sinks());
        assert_eq!(usm.worker_for(&[0; 3], 8), 0);
    }

    #[test]
    fn http2_switch_leaves_slot_empty() {
        let config = Config {
            http2_monitoring_enabled: false,
            ..Config::default()
        };
        let usm = Usm::new(config, sinks());
        assert!(usm.http2().is_none());
    }
}

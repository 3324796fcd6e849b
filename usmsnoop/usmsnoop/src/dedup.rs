use log::trace;
use usm_common::ConnTuple;

use crate::maps::LruMap;
use crate::network::Segment;
use crate::telemetry::{inc, PipelineTelemetry};

/// Drops segments that were already seen for a directional tuple.
///
/// Loopback traffic is captured twice and retransmits carry a sequence
/// number we already processed; either way the segment must contribute at
/// most once.
pub struct Deduper {
    last_tcp_seq: LruMap<ConnTuple, u32>,
}

impl Deduper {
    pub fn new(max_entries: usize) -> Self {
        Deduper {
            last_tcp_seq: LruMap::with_max_entries("tcp_seq", max_entries),
        }
    }

    /// Returns true when the segment should be processed.
    pub fn accept(&self, tuple: &ConnTuple, segment: &Segment, tel: &PipelineTelemetry) -> bool {
        if segment.payload_len() == 0 && !segment.is_termination() {
            inc(&tel.empty_payload_dropped);
            return false;
        }

        if self.last_tcp_seq.lookup(tuple) == Some(segment.tcp_seq) {
            trace!("dropping duplicate segment seq={} on {tuple}", segment.tcp_seq);
            inc(&tel.duplicates_dropped);
            return false;
        }

        self.last_tcp_seq.update(*tuple, segment.tcp_seq);
        true
    }

    /// Forgets the connection, both directions.
    pub fn forget(&self, tuple: &ConnTuple) {
        self.last_tcp_seq.delete(tuple);
        self.last_tcp_seq.delete(&tuple.flip());
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use usm_common::Protocol;

pub const HTTP2_TELEMETRY_MAX_PATH_LEN: usize = 120;
pub const HTTP2_TELEMETRY_PATH_BUCKETS: usize = 7;
pub const HTTP2_TELEMETRY_PATH_BUCKETS_SIZE: usize = 10;

#[inline]
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Counters for the capture, dedupe and classification stages.
#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    pub packets_seen: AtomicU64,
    pub non_tcp_dropped: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub empty_payload_dropped: AtomicU64,
    pub classified: [AtomicU64; Protocol::COUNT],
}

/// Counters for the HTTP/2 decoder.
#[derive(Debug, Default)]
pub struct Http2Telemetry {
    pub request_seen: AtomicU64,
    pub response_seen: AtomicU64,
    pub end_of_stream: AtomicU64,
    pub end_of_stream_rst: AtomicU64,
    pub literal_value_exceeds_frame: AtomicU64,
    pub exceeding_max_interesting_frames: AtomicU64,
    pub exceeding_max_frames_to_filter: AtomicU64,
    pub path_exceeds_frame: AtomicU64,
    pub failed_lookup: AtomicU64,
    pub path_size_bucket: [AtomicU64; HTTP2_TELEMETRY_PATH_BUCKETS + 1],
}

impl Http2Telemetry {
    /// Paths up to 120 bytes land in bucket 0; longer ones are spread over
    /// 7 buckets of 10 bytes, the last one open ended.
    pub fn record_path_size(&self, size: usize) {
        let over = size.saturating_sub(HTTP2_TELEMETRY_MAX_PATH_LEN);
        let bucket = over
            .div_ceil(HTTP2_TELEMETRY_PATH_BUCKETS_SIZE)
            .min(HTTP2_TELEMETRY_PATH_BUCKETS);
        inc(&self.path_size_bucket[bucket]);
    }
}

#[derive(Debug, Default)]
pub struct Telemetry {
    pub pipeline: PipelineTelemetry,
    pub http2: Http2Telemetry,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub packets_seen: u64,
    pub non_tcp_dropped: u64,
    pub malformed_dropped: u64,
    pub duplicates_dropped: u64,
    pub empty_payload_dropped: u64,
    pub classified: [u64; Protocol::COUNT],
    pub http2: Http2TelemetrySnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2TelemetrySnapshot {
    pub request_seen: u64,
    pub response_seen: u64,
    pub end_of_stream: u64,
    pub end_of_stream_rst: u64,
    pub literal_value_exceeds_frame: u64,
    pub exceeding_max_interesting_frames: u64,
    pub exceeding_max_frames_to_filter: u64,
    pub path_exceeds_frame: u64,
    pub failed_lookup: u64,
    pub path_size_bucket: [u64; HTTP2_TELEMETRY_PATH_BUCKETS + 1],
}

impl Telemetry {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let p = &self.pipeline;
        let h = &self.http2;
        TelemetrySnapshot {
            packets_seen: load(&p.packets_seen),
            non_tcp_dropped: load(&p.non_tcp_dropped),
            malformed_dropped: load(&p.malformed_dropped),
            duplicates_dropped: load(&p.duplicates_dropped),
            empty_payload_dropped: load(&p.empty_payload_dropped),
            classified: std::array::from_fn(|i| load(&p.classified[i])),
            http2: Http2TelemetrySnapshot {
                request_seen: load(&h.request_seen),
                response_seen: load(&h.response_seen),
                end_of_stream: load(&h.end_of_stream),
                end_of_stream_rst: load(&h.end_of_stream_rst),
                literal_value_exceeds_frame: load(&h.literal_value_exceeds_frame),
                exceeding_max_interesting_frames: load(&h.exceeding_max_interesting_frames),
                exceeding_max_frames_to_filter: load(&h.exceeding_max_frames_to_filter),
                path_exceeds_frame: load(&h.path_exceeds_frame),
                failed_lookup: load(&h.failed_lookup),
                path_size_bucket: std::array::from_fn(|i| load(&h.path_size_bucket[i])),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_sizes_fall_in_expected_buckets() {
        let t = Http2Telemetry::default();
        t.record_path_size(5);
        t.record_path_size(120);
        t.record_path_size(121);
        t.record_path_size(125);
        t.record_path_size(130);
        t.record_path_size(131);
        t.record_path_size(189);
        t.record_path_size(10_000);

        let buckets: Vec<u64> = t.path_size_bucket.iter().map(load).collect();
        assert_eq!(buckets, vec![2, 3, 1, 0, 0, 0, 0, 2]);
    }
}

use log::trace;
use usm_common::{ConnTuple, Http2Stream, Http2StreamEvent};

use super::frame::{FrameHeader, FrameType};
use crate::batch::BatchWriter;
use crate::ktime::ktime_get_ns;
use crate::maps::LruMap;
use crate::telemetry::{inc, Http2Telemetry};

/// Streams are keyed by the normalized tuple, so both directions of a
/// connection land on the same record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub tuple: ConnTuple,
    pub stream_id: u32,
}

/// In-flight streams, plus which stream ids are open on each connection so
/// they can be dropped when the connection goes away.
pub struct InFlightStreams {
    streams: LruMap<StreamKey, Http2Stream>,
    by_connection: LruMap<ConnTuple, Vec<u32>>,
}

impl InFlightStreams {
    pub fn new(max_entries: usize) -> Self {
        InFlightStreams {
            streams: LruMap::with_max_entries("http2_in_flight", max_entries),
            by_connection: LruMap::with_max_entries("http2_in_flight_by_conn", max_entries),
        }
    }

    pub fn lookup(&self, key: &StreamKey) -> Option<Http2Stream> {
        self.streams.lookup(key)
    }

    /// Returns the stream, creating it with `request_started` set to now.
    pub fn get_or_create(&self, key: &StreamKey) -> Http2Stream {
        if let Some(stream) = self.streams.lookup(key) {
            return stream;
        }
        let stream = Http2Stream {
            request_started: ktime_get_ns(),
            ..Default::default()
        };
        self.streams.update(*key, stream);

        // drop ids whose stream the LRU already evicted
        let mut ids = self.by_connection.lookup(&key.tuple).unwrap_or_default();
        ids.retain(|&stream_id| {
            stream_id != key.stream_id
                && self
                    .streams
                    .lookup(&StreamKey {
                        tuple: key.tuple,
                        stream_id,
                    })
                    .is_some()
        });
        ids.push(key.stream_id);
        self.by_connection.update(key.tuple, ids);
        stream
    }

    pub fn update(&self, key: &StreamKey, stream: Http2Stream) {
        self.streams.update(*key, stream);
    }

    pub fn delete(&self, key: &StreamKey) -> Option<Http2Stream> {
        if let Some(mut ids) = self.by_connection.lookup(&key.tuple) {
            ids.retain(|&id| id != key.stream_id);
            if ids.is_empty() {
                self.by_connection.delete(&key.tuple);
            } else {
                self.by_connection.update(key.tuple, ids);
            }
        }
        self.streams.delete(key)
    }

    /// Drops every stream of a normalized tuple. Returns how many were open.
    pub fn purge(&self, tuple: &ConnTuple) -> usize {
        let Some(ids) = self.by_connection.delete(tuple) else {
            return 0;
        };
        ids.iter()
            .filter(|&&stream_id| {
                self.streams
                    .delete(&StreamKey {
                        tuple: *tuple,
                        stream_id,
                    })
                    .is_some()
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Applies an RST_STREAM or END_STREAM frame to its stream.
    ///
    /// A reset before the request and response headers are all known
    /// discards the stream. Otherwise the frame counts as one end of
    /// stream; the second one completes the stream, which is then emitted
    /// and removed.
    pub fn handle_end_of_stream(
        &self,
        key: &StreamKey,
        header: &FrameHeader,
        batch: &mut BatchWriter<Http2StreamEvent>,
        tel: &Http2Telemetry,
    ) {
        let Some(mut stream) = self.streams.lookup(key) else {
            inc(&tel.failed_lookup);
            return;
        };

        if header.frame_type == FrameType::RstStream {
            if !stream.is_complete() {
                trace!("stream {} reset before completion", key.stream_id);
                self.delete(key);
                return;
            }
            inc(&tel.end_of_stream_rst);
        } else {
            inc(&tel.end_of_stream);
        }

        if !stream.request_end_of_stream {
            stream.request_end_of_stream = true;
            self.streams.update(*key, stream);
            return;
        }

        stream.response_last_seen = ktime_get_ns();
        batch.enqueue(&Http2StreamEvent {
            tuple: key.tuple,
            stream_id: key.stream_id,
            stream,
        });
        self.delete(key);
    }
}

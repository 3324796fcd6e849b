mod common;

use std::sync::Mutex;

use common::*;
use proptest::prelude::*;
use usm_common::batch::decode_page;
use usm_common::{BatchEvent, BatchPageHeader, ConnTuple, Http2StreamEvent, Protocol};
use usmsnoop::dispatcher::SkbInfo;
use usmsnoop::http2::dynamic_table::{
    HTTP2_DYNAMIC_TABLE_CLEANUP_ITERATIONS, HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD,
};
use usmsnoop::network::Segment;
use usmsnoop::{BatchConsumer, BatchSink, BatchWriter, SinkError};

/// Stream events with the timestamps blanked, for comparing runs.
fn comparable(mut events: Vec<Http2StreamEvent>) -> Vec<Http2StreamEvent> {
    for event in &mut events {
        event.stream.request_started = 0;
        event.stream.response_last_seen = 0;
    }
    events
}

#[derive(Debug, Clone)]
enum Step {
    Client(Vec<u8>),
    Server(Vec<u8>),
}

/// A connection worth of exchanges, each request/response cut into chunks.
fn exchanges_strategy() -> impl Strategy<Value = Vec<Step>> {
    (1usize..8, prop::collection::vec(1usize..12, 1..8)).prop_map(|(count, cuts)| {
        let mut client = Vec::new();
        let mut server = Vec::new();
        for i in 0..count {
            let stream_id = 2 * i as u32 + 1;
            let mut request = vec![0x82, 0x44, 4];
            request.extend_from_slice(format!("/p{i:02}").as_bytes());
            client.extend(frame(HEADERS, EOS_EH, stream_id, &request));
            server.extend(frame(HEADERS, EOS_EH, stream_id, STATUS_200));
        }
        let mut steps = Vec::new();
        for (bytes, is_client) in [(client, true), (server, false)] {
            let mut rest = &bytes[..];
            let mut cut = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = (*cut.next().unwrap() * 7).min(rest.len());
                let chunk = rest[..n].to_vec();
                steps.push(if is_client {
                    Step::Client(chunk)
                } else {
                    Step::Server(chunk)
                });
                rest = &rest[n..];
            }
        }
        steps
    })
}

fn run(steps: &[Step], replay: bool) -> Vec<Http2StreamEvent> {
    let mut h = Harness::new().open();
    for step in steps {
        let packet = match step {
            Step::Client(bytes) => h.client_packet(bytes),
            Step::Server(bytes) => h.server_packet(bytes),
        };
        h.feed(&packet);
        if replay {
            h.feed(&packet);
        }
    }
    h.events()
}

// ---------------------------------------------------------------------------
// Property: replaying every segment changes nothing
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replayed_segments_yield_same_events(steps in exchanges_strategy()) {
        let once = comparable(run(&steps, false));
        let twice = comparable(run(&steps, true));
        prop_assert!(!once.is_empty());
        prop_assert_eq!(once, twice);
    }
}

// ---------------------------------------------------------------------------
// Property: classification never goes back
// ---------------------------------------------------------------------------

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(b"GET / HTTP/1.1\r\n".to_vec()),
        Just(preface_and_settings()),
        Just(vec![0x16, 0x03, 0x01, 0x00, 0x20]),
        Just(b"*1\r\n$4\r\nPING\r\n".to_vec()),
        prop::collection::vec(any::<u8>(), 1..64),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn classification_is_monotone(
        payloads in prop::collection::vec((any::<bool>(), payload_strategy()), 1..12),
    ) {
        let mut h = Harness::new();
        let mut last = Protocol::Unclassified;
        for (from_client, payload) in payloads {
            if from_client {
                h.client(&payload);
            } else {
                h.server(&payload);
            }
            let now = h.usm.classifier().protocol(&client_tuple());
            if last != Protocol::Unclassified {
                prop_assert_ne!(now, Protocol::Unclassified);
            }
            if last.is_classified() && from_client {
                prop_assert_eq!(now, last);
            }
            last = now;
        }
    }
}

// ---------------------------------------------------------------------------
// Property: the dynamic table stays bounded
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn dynamic_table_stays_bounded(
        per_packet in 1usize..40,
        packets in 1usize..30,
    ) {
        let mut h = Harness::new().open();
        let mut stream_id = 1;
        for _ in 0..packets {
            let mut payload = Vec::new();
            for _ in 0..per_packet {
                // literal :path with incremental indexing
                let block = [0x82, 0x44, 2, b'/', b'x'];
                payload.extend(frame(HEADERS, EOS_EH, stream_id, &block));
                stream_id += 2;
            }
            h.client(&payload);

            let live = h
                .usm
                .http2()
                .unwrap()
                .maps()
                .dynamic_table
                .live_entries(&client_tuple());
            prop_assert!(
                live as u64
                    <= HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD + HTTP2_DYNAMIC_TABLE_CLEANUP_ITERATIONS
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Property: every enqueued event is delivered, dropped or still pending
// ---------------------------------------------------------------------------

struct FlakySink {
    fail: Mutex<Vec<bool>>,
    pages: Mutex<Vec<Vec<u8>>>,
}

impl BatchSink for FlakySink {
    fn output(&self, _cpu: u16, record: &[u8]) -> Result<(), SinkError> {
        if self.fail.lock().unwrap().pop().unwrap_or(false) {
            return Err(SinkError::Full);
        }
        self.pages.lock().unwrap().push(record.to_vec());
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn batch_events_are_conserved(
        ops in prop::collection::vec(prop_oneof![3 => Just(None), 1 => any::<bool>().prop_map(Some)], 1..600),
    ) {
        let mut writer = BatchWriter::<ConnTuple>::new(0);
        let sink = FlakySink {
            fail: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
        };
        let mut produced = 0u64;
        for (i, op) in ops.into_iter().enumerate() {
            match op {
                None => {
                    writer.enqueue(&ConnTuple { sport: i as u16, ..Default::default() });
                    produced += 1;
                }
                Some(fail) => {
                    sink.fail.lock().unwrap().push(fail);
                    writer.flush(&sink);
                }
            }
        }

        let mut consumer = BatchConsumer::<ConnTuple>::new();
        for page in sink.pages.lock().unwrap().iter() {
            consumer.consume(page).unwrap();
        }
        let stats = consumer.stats();
        prop_assert_eq!(
            produced,
            stats.events + stats.dropped_events + writer.dropped_events() + writer.pending_events() as u64
        );
        prop_assert!(writer.idx() - writer.idx_to_flush() <= usm_common::BATCH_PAGES_PER_CPU as u64);
    }
}

// ---------------------------------------------------------------------------
// Property: the decoder never panics on arbitrary payloads
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn decoder_survives_garbage(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..6),
    ) {
        let mut h = Harness::new().open();
        for (i, chunk) in chunks.iter().enumerate() {
            let skb = SkbInfo {
                tuple: client_tuple(),
                segment: Segment {
                    data_off: 0,
                    data_end: chunk.len(),
                    uncaptured_len: 0,
                    tcp_seq: 10_000 + i as u32,
                    tcp_flags: 0,
                },
                packet: chunk,
            };
            h.usm.process_segment(&mut h.cpu, &skb);
        }
        h.events();
    }

    #[test]
    fn garbage_after_valid_frames(
        garbage in prop::collection::vec(any::<u8>(), 1..100),
    ) {
        let mut h = Harness::new().open();
        let mut payload = frame(HEADERS, EOS_EH, 1, GET_ROOT);
        payload.extend_from_slice(&garbage);
        h.client(&payload);
        h.server(&frame(HEADERS, EOS_EH, 1, STATUS_200));
        // the valid frame ahead of the garbage is still decoded
        prop_assert_eq!(h.events().len(), 1);
    }

    #[test]
    fn pages_decode_without_panicking(record in prop::collection::vec(any::<u8>(), 0..BatchPageHeader::PAGE_LEN)) {
        if let Ok((_, events)) = decode_page::<Http2StreamEvent>(&record) {
            for event in events {
                let _ = event.map(|e| e.stream.is_complete());
            }
        }
        let _ = Http2StreamEvent::decode(&record);
    }
}

//! HTTP/2 decoder.
//!
//! A packet goes through a fixed chain of stages: the first frame (with any
//! remainder from the previous packet), the frame filter, the HEADERS
//! parser, the dynamic table cleaner and finally the end-of-stream parser.
//! Each stage returns the next one; stages that run out of budget return
//! themselves, up to a fixed number of times. Interesting frames are
//! collected once into the per-CPU [`Http2Scratch`] and walked by the later
//! stages.

pub mod dynamic_table;
pub mod frame;
pub mod headers;
pub mod hpack;
pub mod remainder;
pub mod stream;
pub mod transaction;

use log::{debug, trace};
use usm_common::{ConnTuple, Protocol};

use crate::config::Config;
use crate::dispatcher::{ProtocolParser, SkbInfo};
use crate::maps::LruMap;
use crate::pipeline::CpuContext;
use crate::telemetry::{inc, Telemetry};

use dynamic_table::DynamicTable;
use frame::{starts_with_preface, FrameHeader, FrameType, HTTP2_FRAME_HEADER_SIZE, HTTP2_MARKER_SIZE};
use headers::{filter_relevant_headers, header_block_bounds, process_headers};
use remainder::{resume, FrameHeaderRemainder, Resumed};
use stream::{InFlightStreams, StreamKey};

pub const HTTP2_MAX_FRAMES_ITERATIONS: usize = 120;
pub const HTTP2_MAX_FRAMES_TO_FILTER: usize = 240;
pub const HTTP2_MAX_TAIL_CALLS_FOR_FRAMES_FILTER: u8 = 1;
pub const HTTP2_MAX_FRAMES_FOR_HEADERS_PARSER_PER_TAIL_CALL: usize = 15;
pub const HTTP2_MAX_TAIL_CALLS_FOR_HEADERS_PARSER: u8 = 8;

/// An interesting frame and where its payload starts in the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterestingFrame {
    pub header: FrameHeader,
    pub payload_off: usize,
}

/// Progress of one packet through the stage chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TailCallState {
    pub data_off: usize,
    pub data_end: usize,
    pub filter_tail_calls: u8,
    pub headers_iteration: usize,
    pub headers_tail_calls: u8,
}

/// Per-CPU working memory of the decoder.
#[derive(Debug)]
pub struct Http2Scratch {
    frames_array: Vec<InterestingFrame>,
    state: TailCallState,
}

impl Default for Http2Scratch {
    fn default() -> Self {
        Http2Scratch {
            frames_array: Vec::with_capacity(HTTP2_MAX_FRAMES_ITERATIONS),
            state: TailCallState::default(),
        }
    }
}

impl Http2Scratch {
    fn reset(&mut self, data_off: usize, data_end: usize) {
        self.frames_array.clear();
        self.state = TailCallState {
            data_off,
            data_end,
            ..Default::default()
        };
    }

    pub fn frames(&self) -> &[InterestingFrame] {
        &self.frames_array
    }

    pub fn state(&self) -> &TailCallState {
        &self.state
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    FrameFilter,
    HeadersParser,
    DynamicTableCleaner,
    EosParser,
}

/// State shared by every CPU.
pub struct Http2Maps {
    pub remainders: LruMap<ConnTuple, FrameHeaderRemainder>,
    pub dynamic_table: DynamicTable,
    pub streams: InFlightStreams,
}

impl Http2Maps {
    pub fn new(config: &Config) -> Self {
        let maps = &config.maps;
        Http2Maps {
            remainders: LruMap::with_max_entries("http2_remainder", maps.http2_remainders),
            dynamic_table: DynamicTable::new(maps.http2_dynamic_table, maps.http2_dynamic_counters),
            streams: InFlightStreams::new(maps.http2_in_flight),
        }
    }
}

pub struct Http2Parser {
    maps: Http2Maps,
    ephemeral_port_start: u16,
}

impl Http2Parser {
    pub fn new(config: &Config) -> Self {
        Http2Parser {
            maps: Http2Maps::new(config),
            ephemeral_port_start: config.ephemeral_port_start,
        }
    }

    pub fn maps(&self) -> &Http2Maps {
        &self.maps
    }

    pub fn stream_key(&self, tuple: &ConnTuple, stream_id: u32) -> StreamKey {
        StreamKey {
            tuple: tuple.normalize(self.ephemeral_port_start),
            stream_id,
        }
    }

    /// Runs the stage chain over one packet.
    pub fn run(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>, tel: &Telemetry) {
        let mut next = self.handle_first_frame(&mut cpu.http2_scratch, skb, tel);
        while let Some(stage) = next {
            next = match stage {
                Stage::FrameFilter => self.frame_filter(&mut cpu.http2_scratch, skb, tel),
                Stage::HeadersParser => self.headers_parser(&mut cpu.http2_scratch, skb, tel),
                Stage::DynamicTableCleaner => self.dynamic_table_cleaner(skb),
                Stage::EosParser => self.eos_parser(cpu, skb, tel),
            };
        }
    }

    fn handle_first_frame(
        &self,
        scratch: &mut Http2Scratch,
        skb: &SkbInfo<'_>,
        tel: &Telemetry,
    ) -> Option<Stage> {
        scratch.reset(skb.segment.data_off, skb.segment.data_end);
        let packet = skb.packet;
        let data_end = scratch.state.data_end;

        let mut current = None;
        match self.maps.remainders.delete(&skb.tuple) {
            None => {
                if starts_with_preface(&packet[scratch.state.data_off..data_end]) {
                    scratch.state.data_off += HTTP2_MARKER_SIZE;
                }
            }
            Some(rem) => match resume(
                &rem,
                packet,
                &mut scratch.state.data_off,
                data_end,
                skb.segment.uncaptured_len,
            ) {
                Resumed::Fresh => {}
                Resumed::Pending(rem) => {
                    self.maps.remainders.update(skb.tuple, rem);
                    return None;
                }
                Resumed::Lost => {
                    debug!("{}: split frame header cut by capture limit", skb.tuple);
                    return None;
                }
                Resumed::Invalid => {
                    debug!("{}: dropping invalid frame header remainder", skb.tuple);
                    return None;
                }
                Resumed::Deferred {
                    header,
                    payload_off,
                } => scratch.frames_array.push(InterestingFrame {
                    header,
                    payload_off,
                }),
                Resumed::Completed(header) => current = Some(header),
            },
        }

        let header = match current {
            Some(header) => header,
            None => match self.read_frame_header(scratch, skb) {
                Some(header) => header,
                None => return Some(Stage::HeadersParser),
            },
        };
        let payload_off = scratch.state.data_off;
        if !self.advance_frame(scratch, skb, header, payload_off, tel) {
            return Some(Stage::HeadersParser);
        }
        Some(Stage::FrameFilter)
    }

    /// Reads the header at `data_off` and moves past it.
    ///
    /// `None` when the packet ended (a partial header is saved as a
    /// remainder) or the header is invalid; either way nothing more is read
    /// from this packet.
    fn read_frame_header(&self, scratch: &mut Http2Scratch, skb: &SkbInfo<'_>) -> Option<FrameHeader> {
        let st = &mut scratch.state;
        if st.data_off >= st.data_end {
            return None;
        }
        if st.data_off + HTTP2_FRAME_HEADER_SIZE > st.data_end {
            if skb.segment.uncaptured_len > 0 {
                // the rest of the header was on the wire but not copied
                debug!("{}: frame header cut by capture limit", skb.tuple);
            } else {
                let partial =
                    FrameHeaderRemainder::partial_header(&skb.packet[st.data_off..st.data_end]);
                self.maps.remainders.update(skb.tuple, partial);
            }
            st.data_off = st.data_end;
            return None;
        }
        let Some(header) = FrameHeader::parse(&skb.packet[st.data_off..st.data_end]) else {
            trace!("{}: invalid frame header at {}", skb.tuple, st.data_off);
            st.data_off = st.data_end;
            return None;
        };
        st.data_off += HTTP2_FRAME_HEADER_SIZE;
        Some(header)
    }

    /// Records the frame if interesting and moves past its payload. Returns
    /// false once the packet is exhausted or the scratch is full.
    fn advance_frame(
        &self,
        scratch: &mut Http2Scratch,
        skb: &SkbInfo<'_>,
        header: FrameHeader,
        payload_off: usize,
        tel: &Telemetry,
    ) -> bool {
        let data_end = scratch.state.data_end;
        let frame_end = payload_off + header.length as usize;
        let interesting = header.is_interesting();

        if frame_end > data_end {
            let uncaptured = skb.segment.uncaptured_len;
            let unread = frame_end - data_end;
            if uncaptured > 0 && unread <= uncaptured {
                // the frame ends inside this packet, past the capture limit
                if interesting {
                    self.push_frame(scratch, header, payload_off, tel);
                }
                if unread < uncaptured {
                    debug!("{}: frames past the capture limit are lost", skb.tuple);
                }
                scratch.state.data_off = data_end;
                return false;
            }
            // bytes still to come in later packets
            let unread = unread - uncaptured;
            let rem = if interesting && header.frame_type != FrameType::Headers {
                // registered once its payload is complete
                FrameHeaderRemainder::deferred(&header, unread)
            } else {
                if interesting {
                    self.push_frame(scratch, header, payload_off, tel);
                }
                FrameHeaderRemainder::skip(unread)
            };
            self.maps.remainders.update(skb.tuple, rem);
            scratch.state.data_off = data_end;
            return false;
        }

        scratch.state.data_off = frame_end;
        if interesting && !self.push_frame(scratch, header, payload_off, tel) {
            scratch.state.data_off = data_end;
            return false;
        }
        true
    }

    fn push_frame(
        &self,
        scratch: &mut Http2Scratch,
        header: FrameHeader,
        payload_off: usize,
        tel: &Telemetry,
    ) -> bool {
        if scratch.frames_array.len() >= HTTP2_MAX_FRAMES_ITERATIONS {
            inc(&tel.http2.exceeding_max_interesting_frames);
            return false;
        }
        scratch.frames_array.push(InterestingFrame {
            header,
            payload_off,
        });
        true
    }

    fn frame_filter(&self, scratch: &mut Http2Scratch, skb: &SkbInfo<'_>, tel: &Telemetry) -> Option<Stage> {
        for _ in 0..HTTP2_MAX_FRAMES_TO_FILTER {
            let Some(header) = self.read_frame_header(scratch, skb) else {
                return Some(Stage::HeadersParser);
            };
            let payload_off = scratch.state.data_off;
            if !self.advance_frame(scratch, skb, header, payload_off, tel) {
                return Some(Stage::HeadersParser);
            }
        }

        let st = &mut scratch.state;
        if st.data_off < st.data_end {
            if st.filter_tail_calls < HTTP2_MAX_TAIL_CALLS_FOR_FRAMES_FILTER {
                st.filter_tail_calls += 1;
                return Some(Stage::FrameFilter);
            }
            inc(&tel.http2.exceeding_max_frames_to_filter);
            debug!("{}: frame filter budget exhausted at {}", skb.tuple, st.data_off);
        }
        Some(Stage::HeadersParser)
    }

    fn headers_parser(&self, scratch: &mut Http2Scratch, skb: &SkbInfo<'_>, tel: &Telemetry) -> Option<Stage> {
        let start = scratch.state.headers_iteration;
        let end = (start + HTTP2_MAX_FRAMES_FOR_HEADERS_PARSER_PER_TAIL_CALL)
            .min(scratch.frames_array.len());

        for frame in &scratch.frames_array[start..end] {
            if frame.header.frame_type == FrameType::Headers {
                self.parse_headers_frame(frame, skb, tel);
            }
        }

        let st = &mut scratch.state;
        st.headers_iteration = end;
        if end < scratch.frames_array.len() && st.headers_tail_calls < HTTP2_MAX_TAIL_CALLS_FOR_HEADERS_PARSER {
            st.headers_tail_calls += 1;
            return Some(Stage::HeadersParser);
        }
        Some(Stage::DynamicTableCleaner)
    }

    fn parse_headers_frame(&self, frame: &InterestingFrame, skb: &SkbInfo<'_>, tel: &Telemetry) {
        let Some((start, end)) =
            header_block_bounds(&frame.header, skb.packet, frame.payload_off, skb.segment.data_end)
        else {
            trace!("{}: HEADERS frame too short for its flags", skb.tuple);
            return;
        };

        let table = &self.maps.dynamic_table;
        let mut counter = table.counter(&skb.tuple);
        let headers = filter_relevant_headers(
            &skb.packet[start..end],
            start,
            &skb.tuple,
            table,
            &mut counter,
            &tel.http2,
        );
        table.set_counter(&skb.tuple, counter);

        let key = self.stream_key(&skb.tuple, frame.header.stream_id);
        let mut stream = self.maps.streams.get_or_create(&key);
        if headers.is_empty() {
            return;
        }
        process_headers(&headers, skb.packet, &skb.tuple, table, &mut stream, &tel.http2);
        self.maps.streams.update(&key, stream);
    }

    fn dynamic_table_cleaner(&self, skb: &SkbInfo<'_>) -> Option<Stage> {
        let retired = self.maps.dynamic_table.clean(&skb.tuple);
        if retired > 0 {
            trace!("{}: retired {retired} dynamic table entries", skb.tuple);
        }
        Some(Stage::EosParser)
    }

    fn eos_parser(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>, tel: &Telemetry) -> Option<Stage> {
        let CpuContext {
            http2_scratch,
            http2_streams,
            ..
        } = cpu;
        for frame in &http2_scratch.frames_array {
            let header = &frame.header;
            let ends_stream = header.frame_type == FrameType::RstStream || header.end_of_stream();
            if !ends_stream {
                continue;
            }
            let key = self.stream_key(&skb.tuple, header.stream_id);
            self.maps
                .streams
                .handle_end_of_stream(&key, header, http2_streams, &tel.http2);
        }
        None
    }

    /// Drops everything known about the connection, in both directions,
    /// and reports it on the terminated-connections batch.
    pub fn terminate(&self, cpu: &mut CpuContext, tuple: &ConnTuple) {
        let flipped = tuple.flip();
        for t in [tuple, &flipped] {
            self.maps.remainders.delete(t);
            self.maps.dynamic_table.purge(t);
        }
        let normalized = tuple.normalize(self.ephemeral_port_start);
        let dropped = self.maps.streams.purge(&normalized);
        debug!("{normalized}: connection closed, {dropped} streams dropped");
        cpu.http2_terminated.enqueue(&normalized);
    }
}

impl ProtocolParser for Http2Parser {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn process(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>, tel: &Telemetry) {
        if skb.segment.payload_len() > 0 {
            self.run(cpu, skb, tel);
        }
        if skb.segment.is_termination() {
            self.terminate(cpu, &skb.tuple);
        }
    }
}

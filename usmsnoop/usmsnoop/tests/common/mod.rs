//! Helpers shared by the integration tests: a client/server connection
//! driven through a [`Usm`] on one CPU, and HTTP/2 frame builders.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use etherparse::PacketBuilder;
use tokio::sync::mpsc;
use usm_common::{ConnTuple, Http2StreamEvent, Protocol, MAX_SEGMENT_LEN};
use usmsnoop::config::MapCapacities;
use usmsnoop::http2::frame::{HTTP2_END_OF_HEADERS, HTTP2_END_OF_STREAM, HTTP2_PREFACE};
use usmsnoop::{BatchConsumer, Config, CpuContext, RingBufferSink, Sinks, Usm};

pub const CLIENT_IP: [u8; 4] = [10, 0, 0, 1];
pub const SERVER_IP: [u8; 4] = [10, 0, 0, 2];
pub const CLIENT_PORT: u16 = 40000;
pub const SERVER_PORT: u16 = 8080;

pub const HEADERS: u8 = 1;
pub const RST_STREAM: u8 = 3;
pub const SETTINGS: u8 = 4;
pub const EOS_EH: u8 = HTTP2_END_OF_STREAM | HTTP2_END_OF_HEADERS;

/// `:method GET`, `:path /`, `:scheme http`, `:authority x`
pub const GET_ROOT: &[u8] = &[0x82, 0x84, 0x86, 0x41, 0x01, b'x'];
/// `:status 200`
pub const STATUS_200: &[u8] = &[0x88];

pub fn small_config() -> Config {
    Config {
        maps: MapCapacities {
            classification: 1024,
            tcp_seq: 1024,
            http2_dynamic_table: 2048,
            http2_dynamic_counters: 256,
            http2_in_flight: 1024,
            http2_remainders: 256,
        },
        ..Config::default()
    }
}

pub fn client_tuple() -> ConnTuple {
    ConnTuple::tcp(
        IpAddr::V4(Ipv4Addr::from(CLIENT_IP)),
        CLIENT_PORT,
        IpAddr::V4(Ipv4Addr::from(SERVER_IP)),
        SERVER_PORT,
    )
}

pub fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, frame_type, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn preface_and_settings() -> Vec<u8> {
    let mut out = HTTP2_PREFACE.to_vec();
    out.extend(frame(SETTINGS, 0, 0, &[]));
    out
}

#[derive(Clone, Copy)]
enum Flags {
    Push,
    Fin,
}

fn tcp_frame(
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    seq: u32,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
        .ipv4(src.0, dst.0, 64)
        .tcp(src.1, dst.1, seq, 65535)
        .ack(1);
    let builder = match flags {
        Flags::Push => builder.psh(),
        Flags::Fin => builder.fin(),
    };
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

/// One connection, both directions, processed on CPU 0.
pub struct Harness {
    pub usm: Usm,
    pub cpu: CpuContext,
    client_seq: u32,
    server_seq: u32,
    streams_rx: mpsc::Receiver<Vec<u8>>,
    terminated_rx: mpsc::Receiver<Vec<u8>>,
    streams: BatchConsumer<Http2StreamEvent>,
    terminated: BatchConsumer<ConnTuple>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: Config) -> Self {
        let (streams, streams_rx) = RingBufferSink::new(64);
        let (terminated, terminated_rx) = RingBufferSink::new(64);
        let sinks = Sinks {
            http2_streams: Arc::new(streams),
            http2_terminated: Arc::new(terminated),
        };
        Harness {
            usm: Usm::new(config, sinks),
            cpu: CpuContext::new(0),
            client_seq: 1000,
            server_seq: 5000,
            streams_rx,
            terminated_rx,
            streams: BatchConsumer::new(),
            terminated: BatchConsumer::new(),
        }
    }

    /// Opens the connection with the client preface.
    pub fn open(mut self) -> Self {
        assert_eq!(self.client(&preface_and_settings()), Some(Protocol::Http2));
        self
    }

    pub fn client_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = tcp_frame(
            (CLIENT_IP, CLIENT_PORT),
            (SERVER_IP, SERVER_PORT),
            self.client_seq,
            Flags::Push,
            payload,
        );
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        packet
    }

    pub fn server_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = tcp_frame(
            (SERVER_IP, SERVER_PORT),
            (CLIENT_IP, CLIENT_PORT),
            self.server_seq,
            Flags::Push,
            payload,
        );
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        packet
    }

    pub fn feed(&mut self, packet: &[u8]) -> Option<Protocol> {
        self.usm.process_packet(&mut self.cpu, packet)
    }

    /// Feeds a client frame the way the capture program hands it over: cut
    /// to `MAX_SEGMENT_LEN` bytes, with its full length on the wire.
    pub fn client_captured(&mut self, payload: &[u8]) -> Option<Protocol> {
        let packet = self.client_packet(payload);
        let captured = &packet[..packet.len().min(MAX_SEGMENT_LEN)];
        self.usm.process_captured(&mut self.cpu, captured, packet.len())
    }

    pub fn client(&mut self, payload: &[u8]) -> Option<Protocol> {
        let packet = self.client_packet(payload);
        self.feed(&packet)
    }

    pub fn server(&mut self, payload: &[u8]) -> Option<Protocol> {
        let packet = self.server_packet(payload);
        self.feed(&packet)
    }

    pub fn client_fin(&mut self) -> Option<Protocol> {
        let packet = tcp_frame(
            (CLIENT_IP, CLIENT_PORT),
            (SERVER_IP, SERVER_PORT),
            self.client_seq,
            Flags::Fin,
            &[],
        );
        self.client_seq = self.client_seq.wrapping_add(1);
        self.feed(&packet)
    }

    /// One request/response exchange on `stream_id`.
    pub fn exchange(&mut self, stream_id: u32, request: &[u8], response: &[u8]) {
        self.client(&frame(HEADERS, EOS_EH, stream_id, request));
        self.server(&frame(HEADERS, EOS_EH, stream_id, response));
    }

    /// Flushes and syncs the CPU's pages, then returns the stream events
    /// not seen before.
    pub fn events(&mut self) -> Vec<Http2StreamEvent> {
        self.usm.flush(&mut self.cpu);
        self.usm.sync(&mut self.cpu);
        self.drain_streams()
    }

    /// Stream events already handed to the sink, without flushing.
    pub fn drain_streams(&mut self) -> Vec<Http2StreamEvent> {
        let mut out = Vec::new();
        while let Ok(record) = self.streams_rx.try_recv() {
            out.extend(self.streams.consume(&record).unwrap());
        }
        out
    }

    pub fn terminated(&mut self) -> Vec<ConnTuple> {
        self.usm.flush(&mut self.cpu);
        self.usm.sync(&mut self.cpu);
        let mut out = Vec::new();
        while let Ok(record) = self.terminated_rx.try_recv() {
            out.extend(self.terminated.consume(&record).unwrap());
        }
        out
    }

    pub fn stream_stats(&self) -> usmsnoop::ConsumerStats {
        self.streams.stats()
    }
}

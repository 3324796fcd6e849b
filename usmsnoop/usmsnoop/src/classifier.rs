//! Assigns an application protocol to a connection from a payload prefix.

use log::debug;
use usm_common::{ConnTuple, Protocol};

use crate::config::Config;
use crate::http2::frame::{
    starts_with_preface, FrameHeader, FrameType, HTTP2_SETTINGS_SIZE,
};
use crate::maps::LruMap;
use crate::telemetry::{inc, PipelineTelemetry};

pub const CLASSIFICATION_MAX_BUFFER: usize = 64;

/// The payload prefix the predicates look at.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationBuffer {
    buf: [u8; CLASSIFICATION_MAX_BUFFER],
    len: usize,
}

impl ClassificationBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Copies at most `CLASSIFICATION_MAX_BUFFER` bytes from the payload start.
pub fn read_into_buffer_for_classification(payload: &[u8]) -> ClassificationBuffer {
    let len = payload.len().min(CLASSIFICATION_MAX_BUFFER);
    let mut buf = [0u8; CLASSIFICATION_MAX_BUFFER];
    buf[..len].copy_from_slice(&payload[..len]);
    ClassificationBuffer { buf, len }
}

pub fn is_http2_preface(buf: &[u8]) -> bool {
    starts_with_preface(buf)
}

/// A server opens with a SETTINGS frame on stream 0.
pub fn is_http2_server_settings(buf: &[u8]) -> bool {
    match FrameHeader::parse(buf) {
        Some(header) => {
            header.frame_type == FrameType::Settings
                && header.stream_id == 0
                && header.length % HTTP2_SETTINGS_SIZE == 0
        }
        None => false,
    }
}

pub fn is_http(buf: &[u8]) -> bool {
    const METHODS: &[(&[u8], &[u8])] = &[
        (b"GET ", b"/"),
        (b"POST ", b"/"),
        (b"PUT ", b"/"),
        (b"DELETE ", b"/"),
        (b"HEAD ", b"/"),
        (b"OPTIONS ", b"/*"),
        (b"PATCH ", b"/"),
    ];

    if buf.starts_with(b"HTTP") {
        return true;
    }
    METHODS.iter().any(|(method, next)| {
        buf.starts_with(method)
            && buf
                .get(method.len())
                .is_some_and(|c| next.contains(c))
    })
}

const TLS_CHANGE_CIPHER_SPEC: u8 = 0x14;
const TLS_APPLICATION_DATA: u8 = 0x17;
const SSL_VERSION30: u16 = 0x0300;
const TLS_VERSION13: u16 = 0x0304;
const TLS_MAX_RECORD_LEN: u16 = (1 << 14) + 2048;

/// A TLS record header: known content type, SSL 3.0 to TLS 1.3, sane length.
pub fn is_tls(buf: &[u8]) -> bool {
    let [content_type, v1, v2, l1, l2, ..] = *buf else {
        return false;
    };
    let version = u16::from_be_bytes([v1, v2]);
    let length = u16::from_be_bytes([l1, l2]);
    (TLS_CHANGE_CIPHER_SPEC..=TLS_APPLICATION_DATA).contains(&content_type)
        && (SSL_VERSION30..=TLS_VERSION13).contains(&version)
        && length <= TLS_MAX_RECORD_LEN
}

/// A Kafka request header: size, api key, api version, correlation id,
/// then a nullable client id string.
pub fn is_kafka(buf: &[u8], max_api_key: u16, max_api_version: u16) -> bool {
    const HEADER_LEN: usize = 14;
    if buf.len() < HEADER_LEN {
        return false;
    }
    let size = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let api_key = i16::from_be_bytes([buf[4], buf[5]]);
    let api_version = i16::from_be_bytes([buf[6], buf[7]]);
    let correlation_id = i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let client_id_len = i16::from_be_bytes([buf[12], buf[13]]);

    if size < (HEADER_LEN - 4) as i32 || correlation_id <= 0 {
        return false;
    }
    if api_key < 0 || api_key as u16 > max_api_key {
        return false;
    }
    if api_version < 0 || api_version as u16 > max_api_version {
        return false;
    }
    if client_id_len < -1 {
        return false;
    }
    // check whatever part of the client id made it into the buffer
    let client_id = &buf[HEADER_LEN..];
    let visible = client_id.len().min(client_id_len.max(0) as usize);
    client_id[..visible]
        .iter()
        .all(|c| c.is_ascii_alphanumeric() || b"._-".contains(c))
}

/// A RESP array: `*<digits>\r\n`.
pub fn is_redis(buf: &[u8]) -> bool {
    let Some(rest) = buf.strip_prefix(b"*") else {
        return false;
    };
    let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    rest[digits..].starts_with(b"\r\n")
}

/// Reconciles what the socket side and the inverted skb side believe.
///
/// | socket       | inverted            | result   |
/// |--------------|---------------------|----------|
/// | UNCLASSIFIED | *                   | inverted |
/// | UNKNOWN      | classified/UNKNOWN  | inverted |
/// | classified   | *                   | socket   |
pub fn choose_protocol(socket: Protocol, inverted: Protocol) -> Protocol {
    match socket {
        Protocol::Unclassified => inverted,
        Protocol::Unknown if inverted != Protocol::Unclassified => inverted,
        _ => socket,
    }
}

pub struct Classifier {
    protocols: LruMap<ConnTuple, Protocol>,
    kafka_max_api_key: u16,
    kafka_max_api_version: u16,
}

impl Classifier {
    pub fn new(config: &Config) -> Self {
        Classifier {
            protocols: LruMap::with_max_entries("connection_protocol", config.maps.classification),
            kafka_max_api_key: config.kafka_max_api_key,
            kafka_max_api_version: config.kafka_max_api_version,
        }
    }

    pub fn protocol(&self, tuple: &ConnTuple) -> Protocol {
        self.protocols.lookup(tuple).unwrap_or_default()
    }

    /// Runs the predicates in order; first match wins.
    pub fn detect(&self, buf: &ClassificationBuffer) -> Protocol {
        let buf = buf.as_bytes();
        if is_http2_preface(buf) || is_http2_server_settings(buf) {
            Protocol::Http2
        } else if is_http(buf) {
            Protocol::Http
        } else if is_tls(buf) {
            Protocol::Tls
        } else if is_kafka(buf, self.kafka_max_api_key, self.kafka_max_api_version) {
            Protocol::Kafka
        } else if is_redis(buf) {
            Protocol::Redis
        } else {
            Protocol::Unknown
        }
    }

    /// Classifies the connection owning `tuple` unless it already has a
    /// concrete protocol, then writes the result for both the socket tuple
    /// and the inverted skb tuple.
    pub fn classify(&self, tuple: &ConnTuple, payload: &[u8], tel: &PipelineTelemetry) -> Protocol {
        let current = self.protocol(tuple);
        if current.is_classified() || payload.is_empty() {
            return current;
        }

        let detected = self.detect(&read_into_buffer_for_classification(payload));
        let inverted_tuple = tuple.flip().without_socket_identity();
        let inverted = self.protocols.lookup(&inverted_tuple).unwrap_or_default();

        let chosen = choose_protocol(detected, inverted);
        if chosen != current {
            debug!("{tuple}: {current} -> {chosen}");
            inc(&tel.classified[chosen.index()]);
        }
        self.protocols.update(*tuple, chosen);
        if inverted != chosen {
            self.protocols.update(inverted_tuple, chosen);
        }
        chosen
    }

    /// Drops what we know about the connection, both directions.
    pub fn forget(&self, tuple: &ConnTuple) {
        self.protocols.delete(tuple);
        self.protocols.delete(&tuple.flip().without_socket_identity());
    }
}

//! HTTP/2 stream record and the event emitted once a stream completes.

use crate::batch::BatchEvent;
use crate::codec::{Decoder, Encoder};
use crate::tuple::ConnTuple;
use crate::DecodeError;

pub const HTTP2_MAX_PATH_LEN: usize = 160;
pub const HTTP2_METHOD_MAX_LEN: usize = 7;
pub const HTTP2_STATUS_CODE_MAX_LEN: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCode {
    pub raw: [u8; HTTP2_STATUS_CODE_MAX_LEN],
    pub is_huffman_encoded: bool,
    pub static_entry: u8,
    pub finalized: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestMethod {
    pub raw: [u8; HTTP2_METHOD_MAX_LEN],
    pub is_huffman_encoded: bool,
    pub static_entry: u8,
    pub length: u8,
    pub finalized: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestPath {
    pub raw: [u8; HTTP2_MAX_PATH_LEN],
    pub is_huffman_encoded: bool,
    pub static_entry: u8,
    pub length: u8,
    pub finalized: bool,
}

impl Default for RequestPath {
    fn default() -> Self {
        RequestPath {
            raw: [0; HTTP2_MAX_PATH_LEN],
            is_huffman_encoded: false,
            static_entry: 0,
            length: 0,
            finalized: false,
        }
    }
}

impl RequestPath {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..(self.length as usize).min(HTTP2_MAX_PATH_LEN)]
    }
}

impl RequestMethod {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..(self.length as usize).min(HTTP2_METHOD_MAX_LEN)]
    }
}

/// In-flight state of one HTTP/2 stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Http2Stream {
    pub response_last_seen: u64,
    pub request_started: u64,
    pub status_code: StatusCode,
    pub request_method: RequestMethod,
    pub path: RequestPath,
    pub request_end_of_stream: bool,
}

impl Http2Stream {
    pub const LEN: usize = 8 + 8 + 6 + 11 + 5 + HTTP2_MAX_PATH_LEN;

    /// Request and response headers have all been recorded.
    pub fn is_complete(&self) -> bool {
        self.status_code.finalized && self.request_method.finalized && self.path.finalized
    }

    fn write(&self, enc: &mut Encoder<'_>) {
        let sc = &self.status_code;
        let rm = &self.request_method;
        enc.u64(self.response_last_seen)
            .u64(self.request_started)
            .bytes(&sc.raw)
            .bool(sc.is_huffman_encoded)
            .u8(sc.static_entry)
            .bool(sc.finalized)
            .bytes(&rm.raw)
            .bool(rm.is_huffman_encoded)
            .u8(rm.static_entry)
            .u8(rm.length)
            .bool(rm.finalized)
            .u8(self.path.length)
            .bool(self.request_end_of_stream)
            .bool(self.path.is_huffman_encoded)
            .u8(self.path.static_entry)
            .bool(self.path.finalized)
            .bytes(&self.path.raw);
    }

    fn read(dec: &mut Decoder<'_>) -> Http2Stream {
        let response_last_seen = dec.u64();
        let request_started = dec.u64();
        let status_code = StatusCode {
            raw: dec.array(),
            is_huffman_encoded: dec.bool(),
            static_entry: dec.u8(),
            finalized: dec.bool(),
        };
        let request_method = RequestMethod {
            raw: dec.array(),
            is_huffman_encoded: dec.bool(),
            static_entry: dec.u8(),
            length: dec.u8(),
            finalized: dec.bool(),
        };
        let length = dec.u8();
        let request_end_of_stream = dec.bool();
        let is_huffman_encoded = dec.bool();
        let static_entry = dec.u8();
        let finalized = dec.bool();
        let raw = dec.array();
        Http2Stream {
            response_last_seen,
            request_started,
            status_code,
            request_method,
            path: RequestPath {
                raw,
                is_huffman_encoded,
                static_entry,
                length,
                finalized,
            },
            request_end_of_stream,
        }
    }
}

/// A completed stream, as delivered to user space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Http2StreamEvent {
    pub tuple: ConnTuple,
    pub stream_id: u32,
    pub stream: Http2Stream,
}

impl BatchEvent for Http2StreamEvent {
    const EVENT_SIZE: usize = ConnTuple::LEN + 4 + Http2Stream::LEN;

    fn encode(&self, out: &mut [u8]) {
        let mut enc = Encoder::new(out);
        self.tuple.write(&mut enc);
        enc.u32(self.stream_id);
        self.stream.write(&mut enc);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf, Self::EVENT_SIZE)?;
        let tuple = ConnTuple::read(&mut dec);
        let stream_id = dec.u32();
        let stream = Http2Stream::read(&mut dec);
        Ok(Http2StreamEvent {
            tuple,
            stream_id,
            stream,
        })
    }
}

//! Data shared between the `usmsnoop` TC classifier and its user-space engine.
//!
//! Everything in here is `no_std`. Records that cross a buffer boundary
//! (captured segments, batch pages, the events they hold) have a fixed size
//! and an explicit little-endian layout, so both sides agree on them
//! byte-for-byte.

#![no_std]

use core::mem;

pub mod batch;
mod codec;
pub mod http2;
mod tuple;

pub use batch::{BatchEvent, BatchPageHeader, BATCH_BUFFER_SIZE, BATCH_PAGES_PER_CPU};
pub use http2::{Http2Stream, Http2StreamEvent, RequestMethod, RequestPath, StatusCode};
pub use tuple::{ConnTuple, CONN_TYPE_TCP, CONN_V6};

/// Largest frame the classifier copies to user space.
pub const MAX_SEGMENT_LEN: usize = 3000;

/// A captured L2 frame along with the CPU that received it.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RawSegment {
    /// Fix size allocation for packet data
    pub data: [u8; MAX_SEGMENT_LEN],
    /// Bytes copied into `data`.
    pub len: u32,
    pub cpu: u32,
    /// Length of the frame on the wire, which may exceed `len`.
    pub wire_len: u32,
}

impl RawSegment {
    pub const LEN: usize = mem::size_of::<RawSegment>();

    /// The captured bytes, clamped to the buffer in case `len` is bogus.
    pub fn payload(&self) -> &[u8] {
        let len = (self.len as usize).min(MAX_SEGMENT_LEN);
        &self.data[..len]
    }

    /// Bytes of the frame that did not fit in `data`.
    pub fn uncaptured_len(&self) -> usize {
        (self.wire_len as usize).saturating_sub(self.payload().len())
    }
}

/// Errors raised while decoding fixed-layout records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("event size mismatch: expected {expected}, page says {found}")]
    EventSizeMismatch { expected: usize, found: usize },
    #[error("page claims {len} events but capacity is {cap}")]
    LengthOverflow { len: usize, cap: usize },
}

/// Application protocol assigned to a connection.
///
/// Packed in one byte. A tuple starts `Unclassified`; once it moves away it
/// only ever becomes `Unknown` or a concrete protocol.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[default]
    Unclassified = 0,
    Unknown = 1,
    Http = 2,
    Http2 = 3,
    Tls = 4,
    Kafka = 5,
    Redis = 6,
}

impl Protocol {
    pub const COUNT: usize = 7;

    pub const ALL: [Protocol; Protocol::COUNT] = [
        Protocol::Unclassified,
        Protocol::Unknown,
        Protocol::Http,
        Protocol::Http2,
        Protocol::Tls,
        Protocol::Kafka,
        Protocol::Redis,
    ];

    pub fn from_u8(value: u8) -> Option<Protocol> {
        Protocol::ALL.get(value as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// True for a concrete protocol, i.e. neither `Unclassified` nor `Unknown`.
    pub fn is_classified(self) -> bool {
        !matches!(self, Protocol::Unclassified | Protocol::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Unclassified => "unclassified",
            Protocol::Unknown => "unknown",
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Tls => "tls",
            Protocol::Kafka => "kafka",
            Protocol::Redis => "redis",
        }
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_u8() {
        for protocol in Protocol::ALL {
            assert_eq!(Protocol::from_u8(protocol as u8), Some(protocol));
        }
        assert_eq!(Protocol::from_u8(7), None);
    }

    #[test]
    fn only_concrete_protocols_are_classified() {
        assert!(!Protocol::Unclassified.is_classified());
        assert!(!Protocol::Unknown.is_classified());
        assert!(Protocol::Http2.is_classified());
        assert!(Protocol::Tls.is_classified());
    }

    #[test]
    fn raw_segment_payload_is_clamped() {
        let mut segment = RawSegment {
            data: [0xab; MAX_SEGMENT_LEN],
            len: 10,
            cpu: 0,
            wire_len: 10,
        };
        assert_eq!(segment.payload().len(), 10);
        assert_eq!(segment.uncaptured_len(), 0);
        segment.len = u32::MAX;
        assert_eq!(segment.payload().len(), MAX_SEGMENT_LEN);
    }

    #[test]
    fn oversized_frame_reports_uncaptured_bytes() {
        let segment = RawSegment {
            data: [0; MAX_SEGMENT_LEN],
            len: MAX_SEGMENT_LEN as u32,
            cpu: 1,
            wire_len: 4078,
        };
        assert_eq!(segment.uncaptured_len(), 4078 - MAX_SEGMENT_LEN);
    }
}

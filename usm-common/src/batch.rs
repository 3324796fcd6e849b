//! Batch page layout.
//!
//! A page is a 24-byte header followed by a `BATCH_BUFFER_SIZE` data area
//! holding `len` events of `event_size` bytes each.

use crate::codec::{Decoder, Encoder};
use crate::DecodeError;

pub const BATCH_BUFFER_SIZE: usize = 4096;
pub const BATCH_PAGES_PER_CPU: usize = 3;

/// A fixed-size, plain-data record that can be stored in a batch page.
pub trait BatchEvent: Sized + 'static {
    const EVENT_SIZE: usize;

    /// Number of events one page holds.
    const BATCH_SIZE: usize = BATCH_BUFFER_SIZE / Self::EVENT_SIZE;

    /// Writes exactly `EVENT_SIZE` bytes at the start of `out`.
    fn encode(&self, out: &mut [u8]);

    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchPageHeader {
    pub idx: u64,
    pub cpu: u16,
    pub len: u16,
    pub cap: u16,
    pub event_size: u16,
    pub dropped_events: u32,
    pub failed_flushes: u32,
}

impl BatchPageHeader {
    pub const LEN: usize = 24;

    /// Size of a serialized page: header plus the whole data area.
    pub const PAGE_LEN: usize = Self::LEN + BATCH_BUFFER_SIZE;

    pub fn encode(&self, out: &mut [u8]) {
        Encoder::new(out)
            .u64(self.idx)
            .u16(self.cpu)
            .u16(self.len)
            .u16(self.cap)
            .u16(self.event_size)
            .u32(self.dropped_events)
            .u32(self.failed_flushes);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf, Self::LEN)?;
        let header = BatchPageHeader {
            idx: dec.u64(),
            cpu: dec.u16(),
            len: dec.u16(),
            cap: dec.u16(),
            event_size: dec.u16(),
            dropped_events: dec.u32(),
            failed_flushes: dec.u32(),
        };
        if header.len > header.cap {
            return Err(DecodeError::LengthOverflow {
                len: header.len as usize,
                cap: header.cap as usize,
            });
        }
        Ok(header)
    }

    pub fn is_full(&self) -> bool {
        self.len == self.cap
    }
}

/// Splits a serialized page into its header and the events it holds.
pub fn decode_page<'a, E: BatchEvent + 'a>(
    record: &'a [u8],
) -> Result<(BatchPageHeader, impl Iterator<Item = Result<E, DecodeError>> + 'a), DecodeError> {
    let header = BatchPageHeader::decode(record)?;
    if header.event_size as usize != E::EVENT_SIZE {
        return Err(DecodeError::EventSizeMismatch {
            expected: E::EVENT_SIZE,
            found: header.event_size as usize,
        });
    }
    let needed = BatchPageHeader::LEN + header.len as usize * E::EVENT_SIZE;
    if record.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: record.len(),
        });
    }
    let data = &record[BatchPageHeader::LEN..needed];
    Ok((header, data.chunks_exact(E::EVENT_SIZE).map(E::decode)))
}

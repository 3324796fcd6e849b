//! HEADERS frame decoding: find the interesting fields of one HPACK block,
//! then copy them into the stream record.

use log::trace;
use usm_common::http2::{HTTP2_MAX_PATH_LEN, HTTP2_METHOD_MAX_LEN, HTTP2_STATUS_CODE_MAX_LEN};
use usm_common::{ConnTuple, Http2Stream};

use super::dynamic_table::{DynamicCounter, DynamicTable, DynamicTableEntry};
use super::frame::{FrameHeader, HTTP2_PADDED, HTTP2_PRIORITY};
use super::hpack::{
    is_interesting_index, is_method_index, is_path_index, is_status_index, parse_hpack_int,
    parse_string_len, FieldKind, StaticHeader, MAX_STATIC_TABLE_INDEX,
};
use crate::telemetry::{inc, Http2Telemetry};

pub const HTTP2_MAX_PSEUDO_HEADERS_COUNT_FOR_FILTERING: usize = 4;
pub const HTTP2_MAX_HEADERS_COUNT_FOR_FILTERING: usize = 33;
pub const HTTP2_MAX_HEADERS_COUNT_FOR_PROCESSING: usize = 2;

const HTTP2_PRIORITY_FIELDS_SIZE: usize = 5;

/// A literal value located in the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteralValue {
    pub original_index: u8,
    pub offset: usize,
    pub length: usize,
    pub is_huffman_encoded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderToProcess {
    Static(StaticHeader),
    ExistingDynamic(DynamicTableEntry),
    /// Inserted into the dynamic table under insertion number `index`.
    NewDynamic { value: LiteralValue, index: u64 },
    NewDynamicNotIndexed(LiteralValue),
}

/// Bounded list of the fields worth promoting.
#[derive(Debug, Default)]
pub struct HeadersToProcess {
    headers: [Option<HeaderToProcess>; HTTP2_MAX_HEADERS_COUNT_FOR_PROCESSING],
    len: usize,
}

impl HeadersToProcess {
    fn push(&mut self, header: HeaderToProcess) {
        if self.len < HTTP2_MAX_HEADERS_COUNT_FOR_PROCESSING {
            self.headers[self.len] = Some(header);
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderToProcess> {
        self.headers[..self.len].iter().flatten()
    }
}

/// Payload bounds of a HEADERS frame with padding and priority stripped.
/// `None` when the frame is too short for what its flags announce.
pub fn header_block_bounds(
    header: &FrameHeader,
    packet: &[u8],
    payload_off: usize,
    data_end: usize,
) -> Option<(usize, usize)> {
    let mut start = payload_off;
    let mut end = payload_off + header.length as usize;
    if header.flags & HTTP2_PADDED != 0 {
        let pad = *packet.get(start)? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if header.flags & HTTP2_PRIORITY != 0 {
        start += HTTP2_PRIORITY_FIELDS_SIZE;
    }
    let end = end.min(data_end).min(packet.len());
    (start <= end).then_some((start, end))
}

/// Scans one HPACK block and collects up to two interesting fields.
///
/// Every insertion the peer makes bumps `counter`, interesting or not.
/// Parsing stops at the first field that cannot be decoded.
pub fn filter_relevant_headers(
    block: &[u8],
    block_off: usize,
    tuple: &ConnTuple,
    table: &DynamicTable,
    counter: &mut DynamicCounter,
    tel: &Http2Telemetry,
) -> HeadersToProcess {
    let mut out = HeadersToProcess::default();
    let mut pos = 0;

    for _ in 0..HTTP2_MAX_PSEUDO_HEADERS_COUNT_FOR_FILTERING + HTTP2_MAX_HEADERS_COUNT_FOR_FILTERING {
        let Some(&first) = block.get(pos) else {
            break;
        };
        let kind = FieldKind::classify(first);
        let Some((index, next)) = parse_hpack_int(block, pos, kind.prefix_bits()) else {
            trace!("{tuple}: hpack integer too large, giving up on frame");
            break;
        };
        pos = next;

        match kind {
            FieldKind::SizeUpdate => continue,
            FieldKind::Indexed => {
                if index <= MAX_STATIC_TABLE_INDEX {
                    if let Some(header) = StaticHeader::from_index(index) {
                        out.push(HeaderToProcess::Static(header));
                    }
                } else if let Some(entry) = counter
                    .internal_index(index)
                    .and_then(|internal| table.lookup(tuple, internal))
                {
                    out.push(HeaderToProcess::ExistingDynamic(entry));
                }
                continue;
            }
            FieldKind::LiteralIncrementalIndexing | FieldKind::LiteralWithoutIndexing => {}
        }

        let indexed = kind == FieldKind::LiteralIncrementalIndexing;
        if index == 0 {
            // literal name
            let Some((name_len, _, next)) = parse_string_len(block, pos) else {
                break;
            };
            pos = next + name_len as usize;
        }

        let Some((value_len, is_huffman_encoded, next)) = parse_string_len(block, pos) else {
            break;
        };
        pos = next;
        let value_len = value_len as usize;

        let insertion = if indexed {
            counter.value += 1;
            Some(counter.value - 1)
        } else {
            None
        };

        if pos + value_len > block.len() {
            inc(&tel.literal_value_exceeds_frame);
            if is_path_index(index) {
                inc(&tel.path_exceeds_frame);
            }
            break;
        }

        if is_interesting_index(index) {
            let value = LiteralValue {
                original_index: index as u8,
                offset: block_off + pos,
                length: value_len,
                is_huffman_encoded,
            };
            out.push(match insertion {
                Some(index) => HeaderToProcess::NewDynamic { value, index },
                None => HeaderToProcess::NewDynamicNotIndexed(value),
            });
        }
        pos += value_len;
    }

    out
}

fn copy_capped(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// Writes the collected fields into `stream`, inserting new indexed values
/// into the dynamic table.
pub fn process_headers(
    headers: &HeadersToProcess,
    packet: &[u8],
    tuple: &ConnTuple,
    table: &DynamicTable,
    stream: &mut Http2Stream,
    tel: &Http2Telemetry,
) {
    for header in headers.iter() {
        match *header {
            HeaderToProcess::Static(header) => {
                let index = header.index();
                match header {
                    StaticHeader::Method(_) => {
                        stream.request_method.static_entry = index;
                        stream.request_method.finalized = true;
                        inc(&tel.request_seen);
                    }
                    StaticHeader::Path(_) => {
                        stream.path.static_entry = index;
                        stream.path.finalized = true;
                    }
                    StaticHeader::Status(_) => {
                        stream.status_code.static_entry = index;
                        stream.status_code.finalized = true;
                        inc(&tel.response_seen);
                    }
                }
            }
            HeaderToProcess::ExistingDynamic(entry) => {
                update_stream(stream, entry.original_index, entry.value(), entry.is_huffman_encoded, tel);
            }
            HeaderToProcess::NewDynamic { value, index } => {
                let Some(bytes) = packet.get(value.offset..value.offset + value.length) else {
                    continue;
                };
                if is_path_index(value.original_index as u64) {
                    tel.record_path_size(value.length);
                }
                update_stream(stream, value.original_index, bytes, value.is_huffman_encoded, tel);
                table.insert(
                    tuple,
                    index,
                    DynamicTableEntry::new(value.original_index, bytes, value.is_huffman_encoded),
                );
            }
            HeaderToProcess::NewDynamicNotIndexed(value) => {
                let Some(bytes) = packet.get(value.offset..value.offset + value.length) else {
                    continue;
                };
                if is_path_index(value.original_index as u64) {
                    tel.record_path_size(value.length);
                }
                update_stream(stream, value.original_index, bytes, value.is_huffman_encoded, tel);
            }
        }
    }
}

fn update_stream(
    stream: &mut Http2Stream,
    original_index: u8,
    value: &[u8],
    is_huffman_encoded: bool,
    tel: &Http2Telemetry,
) {
    let original_index = original_index as u64;
    if is_method_index(original_index) {
        let method = &mut stream.request_method;
        method.raw = [0; HTTP2_METHOD_MAX_LEN];
        method.length = copy_capped(&mut method.raw, value) as u8;
        method.is_huffman_encoded = is_huffman_encoded;
        method.finalized = true;
        inc(&tel.request_seen);
    } else if is_path_index(original_index) {
        let path = &mut stream.path;
        path.raw = [0; HTTP2_MAX_PATH_LEN];
        path.length = copy_capped(&mut path.raw, value) as u8;
        path.is_huffman_encoded = is_huffman_encoded;
        path.finalized = true;
    } else if is_status_index(original_index) {
        let status = &mut stream.status_code;
        status.raw = [0; HTTP2_STATUS_CODE_MAX_LEN];
        copy_capped(&mut status.raw, value);
        status.is_huffman_encoded = is_huffman_encoded;
        status.finalized = true;
        inc(&tel.response_seen);
    }
}

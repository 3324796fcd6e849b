//! The slice of HPACK (RFC 7541) the decoder needs.
//!
//! Only a handful of static-table entries matter downstream, so they are
//! modelled as [`StaticHeader`] rather than carried around as raw indices.

pub const MAX_STATIC_TABLE_INDEX: u64 = 61;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticPath {
    Root,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    S200,
    S204,
    S206,
    S304,
    S400,
    S404,
    S500,
}

/// Static-table entries whose value is worth recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticHeader {
    Method(Method),
    Path(StaticPath),
    Status(Status),
}

impl StaticHeader {
    pub fn from_index(index: u64) -> Option<StaticHeader> {
        use StaticHeader::*;
        Some(match index {
            2 => Method(self::Method::Get),
            3 => Method(self::Method::Post),
            4 => Path(StaticPath::Root),
            5 => Path(StaticPath::Index),
            8 => Status(self::Status::S200),
            9 => Status(self::Status::S204),
            10 => Status(self::Status::S206),
            11 => Status(self::Status::S304),
            12 => Status(self::Status::S400),
            13 => Status(self::Status::S404),
            14 => Status(self::Status::S500),
            _ => return None,
        })
    }

    pub fn index(self) -> u8 {
        match self {
            StaticHeader::Method(Method::Get) => 2,
            StaticHeader::Method(Method::Post) => 3,
            StaticHeader::Path(StaticPath::Root) => 4,
            StaticHeader::Path(StaticPath::Index) => 5,
            StaticHeader::Status(Status::S200) => 8,
            StaticHeader::Status(Status::S204) => 9,
            StaticHeader::Status(Status::S206) => 10,
            StaticHeader::Status(Status::S304) => 11,
            StaticHeader::Status(Status::S400) => 12,
            StaticHeader::Status(Status::S404) => 13,
            StaticHeader::Status(Status::S500) => 14,
        }
    }

    pub fn value(self) -> &'static str {
        match self {
            StaticHeader::Method(Method::Get) => "GET",
            StaticHeader::Method(Method::Post) => "POST",
            StaticHeader::Path(StaticPath::Root) => "/",
            StaticHeader::Path(StaticPath::Index) => "/index.html",
            StaticHeader::Status(Status::S200) => "200",
            StaticHeader::Status(Status::S204) => "204",
            StaticHeader::Status(Status::S206) => "206",
            StaticHeader::Status(Status::S304) => "304",
            StaticHeader::Status(Status::S400) => "400",
            StaticHeader::Status(Status::S404) => "404",
            StaticHeader::Status(Status::S500) => "500",
        }
    }
}

pub fn is_method_index(index: u64) -> bool {
    matches!(index, 2 | 3)
}

pub fn is_path_index(index: u64) -> bool {
    matches!(index, 4 | 5)
}

pub fn is_status_index(index: u64) -> bool {
    (8..=14).contains(&index)
}

/// Names one of `:method`, `:path` or `:status`.
pub fn is_interesting_index(index: u64) -> bool {
    is_method_index(index) || is_path_index(index) || is_status_index(index)
}

/// How a header field is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `1xxxxxxx`
    Indexed,
    /// `01xxxxxx`
    LiteralIncrementalIndexing,
    /// `001xxxxx`
    SizeUpdate,
    /// `0000xxxx` or `0001xxxx`
    LiteralWithoutIndexing,
}

impl FieldKind {
    pub fn classify(first: u8) -> FieldKind {
        if first & 0x80 != 0 {
            FieldKind::Indexed
        } else if first & 0xc0 == 0x40 {
            FieldKind::LiteralIncrementalIndexing
        } else if first & 0xe0 == 0x20 {
            FieldKind::SizeUpdate
        } else {
            FieldKind::LiteralWithoutIndexing
        }
    }

    pub fn prefix_bits(self) -> u8 {
        match self {
            FieldKind::Indexed => 7,
            FieldKind::LiteralIncrementalIndexing => 6,
            FieldKind::SizeUpdate => 5,
            FieldKind::LiteralWithoutIndexing => 4,
        }
    }
}

/// Decodes an HPACK integer starting at `pos`, returning the value and the
/// position after it.
///
/// At most one continuation byte is accepted: anything deeper returns
/// `None` and the caller gives up on the frame.
pub fn parse_hpack_int(buf: &[u8], pos: usize, prefix_bits: u8) -> Option<(u64, usize)> {
    let mask = ((1u16 << prefix_bits) - 1) as u8;
    let primer = *buf.get(pos)? & mask;
    if primer < mask {
        return Some((primer as u64, pos + 1));
    }
    let next = *buf.get(pos + 1)?;
    if next & 0x80 != 0 {
        return None;
    }
    Some((mask as u64 + (next & 0x7f) as u64, pos + 2))
}

/// Decodes a string length (7-bit prefix), returning the length, the
/// Huffman flag and the position of the string itself.
pub fn parse_string_len(buf: &[u8], pos: usize) -> Option<(u64, bool, usize)> {
    let is_huffman = *buf.get(pos)? & 0x80 != 0;
    let (len, next) = parse_hpack_int(buf, pos, 7)?;
    Some((len, is_huffman, next))
}

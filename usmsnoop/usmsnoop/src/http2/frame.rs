//! HTTP/2 frame header: `length:24 | type:8 | flags:8 | R:1 | stream_id:31`.

pub const HTTP2_FRAME_HEADER_SIZE: usize = 9;
pub const HTTP2_MAX_FRAME_LEN: u32 = 16384;
pub const HTTP2_MARKER_SIZE: usize = 24;
pub const HTTP2_PREFACE: &[u8; HTTP2_MARKER_SIZE] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const HTTP2_SETTINGS_SIZE: u32 = 6;

pub const HTTP2_END_OF_STREAM: u8 = 0x1;
pub const HTTP2_END_OF_HEADERS: u8 = 0x4;
pub const HTTP2_PADDED: u8 = 0x8;
pub const HTTP2_PRIORITY: u8 = 0x20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0,
    Headers = 1,
    Priority = 2,
    RstStream = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<FrameType> {
        Some(match value {
            0 => FrameType::Data,
            1 => FrameType::Headers,
            2 => FrameType::Priority,
            3 => FrameType::RstStream,
            4 => FrameType::Settings,
            5 => FrameType::PushPromise,
            6 => FrameType::Ping,
            7 => FrameType::GoAway,
            8 => FrameType::WindowUpdate,
            9 => FrameType::Continuation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parses and validates a header. `None` when fewer than 9 bytes are
    /// available or the header is not plausible: unknown type, length above
    /// 16 KiB, or an even non-zero stream id.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        let raw: &[u8; HTTP2_FRAME_HEADER_SIZE] = buf.get(..HTTP2_FRAME_HEADER_SIZE)?.try_into().ok()?;
        let length = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
        let frame_type = FrameType::from_u8(raw[3])?;
        let stream_id = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7fff_ffff;

        if length > HTTP2_MAX_FRAME_LEN {
            return None;
        }
        if stream_id != 0 && stream_id % 2 == 0 {
            return None;
        }

        Some(FrameHeader {
            length,
            frame_type,
            flags: raw[4],
            stream_id,
        })
    }

    pub fn encode(&self) -> [u8; HTTP2_FRAME_HEADER_SIZE] {
        let len = self.length.to_be_bytes();
        let id = (self.stream_id & 0x7fff_ffff).to_be_bytes();
        [
            len[1],
            len[2],
            len[3],
            self.frame_type as u8,
            self.flags,
            id[0],
            id[1],
            id[2],
            id[3],
        ]
    }

    pub fn end_of_stream(&self) -> bool {
        self.flags & HTTP2_END_OF_STREAM != 0
    }

    /// HEADERS, RST_STREAM, or DATA carrying END_STREAM.
    pub fn is_interesting(&self) -> bool {
        if self.stream_id == 0 {
            return false;
        }
        match self.frame_type {
            FrameType::Headers | FrameType::RstStream => true,
            FrameType::Data => self.end_of_stream(),
            _ => false,
        }
    }
}

pub fn starts_with_preface(buf: &[u8]) -> bool {
    buf.starts_with(HTTP2_PREFACE)
}

use super::frame::{FrameHeader, HTTP2_FRAME_HEADER_SIZE};

/// What is left of a frame that did not fit in the previous packet.
///
/// `header_length == 9` means the whole header was cached because the frame
/// is interesting and its payload straddled the packet; `remainder` is then
/// the payload still to come. `0 < header_length < 9` is a header split
/// across packets. `header_length == 0` is plain payload to skip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeaderRemainder {
    pub remainder: u32,
    pub header_length: u32,
    pub buf: [u8; HTTP2_FRAME_HEADER_SIZE],
}

impl FrameHeaderRemainder {
    pub fn skip(remainder: usize) -> Self {
        FrameHeaderRemainder {
            remainder: remainder as u32,
            ..Default::default()
        }
    }

    pub fn partial_header(bytes: &[u8]) -> Self {
        let mut out = FrameHeaderRemainder::default();
        let n = bytes.len().min(HTTP2_FRAME_HEADER_SIZE);
        out.buf[..n].copy_from_slice(&bytes[..n]);
        out.header_length = n as u32;
        out
    }

    pub fn deferred(header: &FrameHeader, remainder: usize) -> Self {
        FrameHeaderRemainder {
            remainder: remainder as u32,
            header_length: HTTP2_FRAME_HEADER_SIZE as u32,
            buf: header.encode(),
        }
    }
}

/// Outcome of applying a cached remainder to the start of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resumed {
    /// No frame carried over; read headers from `data_off`.
    Fresh,
    /// The packet was swallowed whole; keep this remainder for the next one.
    Pending(FrameHeaderRemainder),
    /// A cached interesting frame whose payload now ended inside this packet.
    Deferred { header: FrameHeader, payload_off: usize },
    /// A split header was completed; its payload starts at `data_off`.
    Completed(FrameHeader),
    /// The rest of a split header lies past the capture limit.
    Lost,
    /// The reconstructed header is not plausible.
    Invalid,
}

/// Applies `rem` to `packet[*data_off..data_end]`, advancing `data_off`
/// past whatever belonged to the previous frame.
///
/// `uncaptured` payload bytes followed `data_end` on the wire. They count
/// toward the carried-over frame even though they cannot be read.
pub fn resume(
    rem: &FrameHeaderRemainder,
    packet: &[u8],
    data_off: &mut usize,
    data_end: usize,
    uncaptured: usize,
) -> Resumed {
    let available = data_end.saturating_sub(*data_off);
    let on_wire = available + uncaptured;
    let header_length = rem.header_length as usize;

    if header_length >= HTTP2_FRAME_HEADER_SIZE {
        let Some(header) = FrameHeader::parse(&rem.buf) else {
            return Resumed::Invalid;
        };
        let remainder = rem.remainder as usize;
        if remainder > on_wire {
            *data_off = data_end;
            return Resumed::Pending(FrameHeaderRemainder {
                remainder: (remainder - on_wire) as u32,
                ..*rem
            });
        }
        let payload_off = *data_off;
        *data_off = (*data_off + remainder).min(data_end);
        return Resumed::Deferred {
            header,
            payload_off,
        };
    }

    if header_length > 0 {
        let missing = HTTP2_FRAME_HEADER_SIZE - header_length;
        if available < missing {
            *data_off = data_end;
            if uncaptured > 0 {
                return Resumed::Lost;
            }
            let mut pending = *rem;
            pending.buf[header_length..header_length + available]
                .copy_from_slice(&packet[data_end - available..data_end]);
            pending.header_length += available as u32;
            return Resumed::Pending(pending);
        }
        let mut buf = rem.buf;
        buf[header_length..].copy_from_slice(&packet[*data_off..*data_off + missing]);
        let Some(header) = FrameHeader::parse(&buf) else {
            return Resumed::Invalid;
        };
        *data_off += missing;
        return Resumed::Completed(header);
    }

    let remainder = rem.remainder as usize;
    if remainder > on_wire {
        *data_off = data_end;
        return Resumed::Pending(FrameHeaderRemainder::skip(remainder - on_wire));
    }
    *data_off = (*data_off + remainder).min(data_end);
    Resumed::Fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::frame::{FrameType, HTTP2_END_OF_HEADERS, HTTP2_END_OF_STREAM};

    fn headers(stream_id: u32, length: u32) -> FrameHeader {
        FrameHeader {
            length,
            frame_type: FrameType::Headers,
            flags: HTTP2_END_OF_STREAM | HTTP2_END_OF_HEADERS,
            stream_id,
        }
    }

    #[test]
    fn completes_split_header() {
        let raw = headers(3, 4).encode();
        let rem = FrameHeaderRemainder::partial_header(&raw[..5]);

        let mut packet = raw[5..].to_vec();
        packet.extend_from_slice(&[0x82, 0x84, 0x86, 0x41]);
        let mut off = 0;
        let resumed = resume(&rem, &packet, &mut off, packet.len(), 0);
        assert_eq!(resumed, Resumed::Completed(headers(3, 4)));
        assert_eq!(off, 4);
    }

    #[test]
    fn header_split_over_three_packets() {
        let raw = headers(1, 0).encode();
        let rem = FrameHeaderRemainder::partial_header(&raw[..2]);
        let mut off = 0;
        let Resumed::Pending(rem) = resume(&rem, &raw[2..5], &mut off, 3, 0) else {
            panic!("expected pending");
        };
        assert_eq!(rem.header_length, 5);
        let mut off = 0;
        assert_eq!(
            resume(&rem, &raw[5..], &mut off, 4, 0),
            Resumed::Completed(headers(1, 0))
        );
    }

    #[test]
    fn skips_leftover_payload() {
        let rem = FrameHeaderRemainder::skip(10);
        let packet = [0u8; 6];
        let mut off = 0;
        assert_eq!(
            resume(&rem, &packet, &mut off, packet.len(), 0),
            Resumed::Pending(FrameHeaderRemainder::skip(4))
        );
        assert_eq!(off, 6);

        let rem = FrameHeaderRemainder::skip(4);
        let mut off = 0;
        assert_eq!(resume(&rem, &packet, &mut off, packet.len(), 0), Resumed::Fresh);
        assert_eq!(off, 4);
    }

    #[test]
    fn deferred_frame_completes() {
        let rst = FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: 5,
        };
        let rem = FrameHeaderRemainder::deferred(&rst, 2);
        let packet = [0u8, 8, 0, 0, 0, 0];
        let mut off = 0;
        assert_eq!(
            resume(&rem, &packet, &mut off, packet.len(), 0),
            Resumed::Deferred {
                header: rst,
                payload_off: 0
            }
        );
        assert_eq!(off, 2);
    }

    #[test]
    fn uncaptured_bytes_count_toward_remainders() {
        let packet = [0u8; 6];

        // 6 captured plus 10 cut off, 4 left for the next packet
        let mut off = 0;
        assert_eq!(
            resume(&FrameHeaderRemainder::skip(20), &packet, &mut off, 6, 10),
            Resumed::Pending(FrameHeaderRemainder::skip(4))
        );
        assert_eq!(off, 6);

        // ends exactly at the end of the frame on the wire
        let mut off = 0;
        assert_eq!(
            resume(&FrameHeaderRemainder::skip(16), &packet, &mut off, 6, 10),
            Resumed::Fresh
        );
        assert_eq!(off, 6);

        let data = FrameHeader {
            length: 30,
            frame_type: FrameType::Data,
            flags: HTTP2_END_OF_STREAM,
            stream_id: 1,
        };
        let mut off = 0;
        assert_eq!(
            resume(&FrameHeaderRemainder::deferred(&data, 12), &packet, &mut off, 6, 10),
            Resumed::Deferred {
                header: data,
                payload_off: 0
            }
        );
        assert_eq!(off, 6);

        let raw = headers(1, 0).encode();
        let mut off = 0;
        assert_eq!(
            resume(&FrameHeaderRemainder::partial_header(&raw[..2]), &packet[..3], &mut off, 3, 100),
            Resumed::Lost
        );
    }

    #[test]
    fn garbage_header_is_invalid() {
        let rem = FrameHeaderRemainder::partial_header(&[0xff, 0xff, 0xff, 0xff]);
        let packet = [0xffu8; 8];
        let mut off = 0;
        assert_eq!(resume(&rem, &packet, &mut off, 8, 0), Resumed::Invalid);
    }
}

use std::fmt;

use usm_common::{ConnTuple, Http2StreamEvent};

use super::hpack::StaticHeader;

/// A completed stream rendered for display.
///
/// Huffman-coded values are left encoded; only their size is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Transaction {
    pub tuple: ConnTuple,
    pub stream_id: u32,
    pub method: String,
    pub path: String,
    pub status: String,
    pub latency_ns: u64,
}

fn render(static_entry: u8, raw: &[u8], is_huffman_encoded: bool) -> String {
    if let Some(header) = StaticHeader::from_index(static_entry as u64) {
        return header.value().to_string();
    }
    if is_huffman_encoded {
        return format!("<huffman {} bytes>", raw.len());
    }
    String::from_utf8_lossy(raw).into_owned()
}

impl From<&Http2StreamEvent> for Http2Transaction {
    fn from(event: &Http2StreamEvent) -> Self {
        let stream = &event.stream;
        let status = &stream.status_code;
        let status_len = status.raw.iter().take_while(|&&b| b != 0).count();
        Http2Transaction {
            tuple: event.tuple,
            stream_id: event.stream_id,
            method: render(
                stream.request_method.static_entry,
                stream.request_method.as_bytes(),
                stream.request_method.is_huffman_encoded,
            ),
            path: render(
                stream.path.static_entry,
                stream.path.as_bytes(),
                stream.path.is_huffman_encoded,
            ),
            status: render(
                status.static_entry,
                &status.raw[..status_len],
                status.is_huffman_encoded,
            ),
            latency_ns: stream
                .response_last_seen
                .saturating_sub(stream.request_started),
        }
    }
}

impl fmt::Display for Http2Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} {} {} -> {} ({}us)",
            self.tuple,
            self.stream_id,
            self.method,
            self.path,
            self.status,
            self.latency_ns / 1000
        )
    }
}

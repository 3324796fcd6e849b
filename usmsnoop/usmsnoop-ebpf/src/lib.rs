#![no_std]

use aya_ebpf::helpers::bpf_get_smp_processor_id;
use aya_ebpf::macros::map;
use aya_ebpf::maps::RingBuf;
use aya_ebpf::programs::TcContext;
use aya_log_ebpf::debug;
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr, Ipv6Hdr},
};
use usm_common::RawSegment;

// power of two page multiple; 4 MiB holds ~1400 segments
#[map]
static SEGMENTS: RingBuf = RingBuf::with_byte_size(1 << 22, 0);

/// True when the frame carries TCP over IPv4 or IPv6.
#[inline]
pub fn is_tcp(ctx: &TcContext) -> Result<bool, i64> {
    let ethhdr: EthHdr = ctx.load(0)?;

    let proto = match ethhdr.ether_type {
        EtherType::Ipv4 => ctx.load::<Ipv4Hdr>(EthHdr::LEN)?.proto,
        EtherType::Ipv6 => ctx.load::<Ipv6Hdr>(EthHdr::LEN)?.next_hdr,
        _ => return Ok(false),
    };

    Ok(matches!(proto, IpProto::Tcp))
}

/// Copies the head of the frame, its wire length and the current CPU id
/// into `SEGMENTS`. Frames longer than `MAX_SEGMENT_LEN` are cut.
#[inline]
pub fn capture_segment(ctx: &TcContext) -> bool {
    let Some(mut buf) = SEGMENTS.reserve::<RawSegment>(0) else {
        debug!(ctx, "SEGMENTS full, dropping {} bytes", ctx.len());
        return false;
    };

    let segment = unsafe { buf.assume_init_mut() };

    // let ebpf verifier know that there's at least a single byte in skbuff's data
    // which would be a requirement for bpf_skb_load_bytes() to work
    if ctx.len() < 2 {
        buf.discard(0);
        return false;
    }

    segment.len = match ctx.load_bytes(0, &mut segment.data) {
        Ok(len) => len as u32,
        Err(_) => 0,
    };
    segment.cpu = unsafe { bpf_get_smp_processor_id() };
    segment.wire_len = ctx.len();

    // usage of RingBufEntry requires us to submit or discard after reserving
    buf.submit(0);
    true
}

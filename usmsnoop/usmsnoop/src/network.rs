use std::net::IpAddr;

use etherparse::{LaxNetSlice, LaxSlicedPacket, TransportSlice};
use usm_common::ConnTuple;

use crate::error::PacketError;

pub const TCPHDR_FIN: u8 = 0x01;
pub const TCPHDR_SYN: u8 = 0x02;
pub const TCPHDR_RST: u8 = 0x04;
pub const TCPHDR_PSH: u8 = 0x08;
pub const TCPHDR_ACK: u8 = 0x10;

/// Where the TCP payload sits in the captured buffer, and the TCP fields
/// the pipeline needs. Only lives for the packet being processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub data_off: usize,
    /// End of the captured payload.
    pub data_end: usize,
    /// Payload bytes past `data_end` that were on the wire but not copied.
    pub uncaptured_len: usize,
    pub tcp_seq: u32,
    pub tcp_flags: u8,
}

impl Segment {
    pub fn payload_len(&self) -> usize {
        self.data_end.saturating_sub(self.data_off)
    }

    /// FIN or RST: the connection is being torn down.
    pub fn is_termination(&self) -> bool {
        self.tcp_flags & (TCPHDR_FIN | TCPHDR_RST) != 0
    }
}

/// Parses a captured frame from the ethernet header down to TCP.
///
/// The frame may be cut short of what its IP header announces; the TCP
/// payload then ends at the end of the buffer.
pub fn parse_ether(packet: &[u8]) -> Result<(ConnTuple, Segment), PacketError> {
    let ether = LaxSlicedPacket::from_ethernet(packet)
        .map_err(|e| PacketError::Malformed(e.to_string()))?;
    extract(packet, ether)
}

/// Same as [`parse_ether`] for buffers starting at the IP header.
pub fn parse_ip(packet: &[u8]) -> Result<(ConnTuple, Segment), PacketError> {
    let ip = LaxSlicedPacket::from_ip(packet).map_err(|e| PacketError::Malformed(e.to_string()))?;
    extract(packet, ip)
}

fn stopped(sliced: &LaxSlicedPacket<'_>, otherwise: PacketError) -> PacketError {
    match &sliced.stop_err {
        Some((e, layer)) => PacketError::Malformed(format!("{layer:?}: {e}")),
        None => otherwise,
    }
}

fn extract(packet: &[u8], sliced: LaxSlicedPacket<'_>) -> Result<(ConnTuple, Segment), PacketError> {
    let (src, dst): (IpAddr, IpAddr) = match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => (
            ipv4.header().source_addr().into(),
            ipv4.header().destination_addr().into(),
        ),
        Some(LaxNetSlice::Ipv6(ipv6)) => (
            ipv6.header().source_addr().into(),
            ipv6.header().destination_addr().into(),
        ),
        Some(LaxNetSlice::Arp(_)) => return Err(PacketError::NotIp),
        None => return Err(stopped(&sliced, PacketError::NotIp)),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        Some(_) => return Err(PacketError::NotTcp),
        None => return Err(stopped(&sliced, PacketError::NotTcp)),
    };

    let tuple = ConnTuple::tcp(src, tcp.source_port(), dst, tcp.destination_port());

    let mut tcp_flags = 0;
    for (set, flag) in [
        (tcp.fin(), TCPHDR_FIN),
        (tcp.syn(), TCPHDR_SYN),
        (tcp.rst(), TCPHDR_RST),
        (tcp.psh(), TCPHDR_PSH),
        (tcp.ack(), TCPHDR_ACK),
    ] {
        if set {
            tcp_flags |= flag;
        }
    }

    // payload() borrows from `packet`, so its offset is a pointer difference
    let payload = tcp.payload();
    let data_off = payload.as_ptr() as usize - packet.as_ptr() as usize;
    let segment = Segment {
        data_off,
        data_end: data_off + payload.len(),
        uncaptured_len: 0,
        tcp_seq: tcp.sequence_number(),
        tcp_flags,
    };

    Ok((tuple, segment))
}

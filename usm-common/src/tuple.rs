use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::batch::BatchEvent;
use crate::codec::{Decoder, Encoder};
use crate::DecodeError;

pub const CONN_TYPE_TCP: u32 = 1;
pub const CONN_V6: u32 = 1 << 1;

/// Connection 5-tuple plus namespace identity.
///
/// Addresses are split in two u64 halves; IPv4 addresses live in the low
/// half. Tuples are directional as captured; use [`ConnTuple::normalize`]
/// for a key that is the same for both directions.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    pub saddr_h: u64,
    pub saddr_l: u64,
    pub daddr_h: u64,
    pub daddr_l: u64,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub metadata: u32,
}

fn split_v6(addr: Ipv6Addr) -> (u64, u64) {
    let bits = u128::from(addr);
    ((bits >> 64) as u64, bits as u64)
}

fn join_v6(h: u64, l: u64) -> Ipv6Addr {
    Ipv6Addr::from(((h as u128) << 64) | l as u128)
}

impl ConnTuple {
    pub const LEN: usize = 48;

    pub fn tcp(src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Self {
        let mut tuple = ConnTuple {
            sport,
            dport,
            metadata: CONN_TYPE_TCP,
            ..Default::default()
        };
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                tuple.saddr_l = u32::from(s) as u64;
                tuple.daddr_l = u32::from(d) as u64;
            }
            (s, d) => {
                (tuple.saddr_h, tuple.saddr_l) = split_v6(to_v6(s));
                (tuple.daddr_h, tuple.daddr_l) = split_v6(to_v6(d));
                tuple.metadata |= CONN_V6;
            }
        }
        tuple
    }

    pub fn is_tcp(&self) -> bool {
        self.metadata & CONN_TYPE_TCP != 0
    }

    pub fn is_ipv6(&self) -> bool {
        self.metadata & CONN_V6 != 0
    }

    pub fn source_addr(&self) -> IpAddr {
        self.addr(self.saddr_h, self.saddr_l)
    }

    pub fn dest_addr(&self) -> IpAddr {
        self.addr(self.daddr_h, self.daddr_l)
    }

    fn addr(&self, h: u64, l: u64) -> IpAddr {
        if self.is_ipv6() {
            IpAddr::V6(join_v6(h, l))
        } else {
            IpAddr::V4(Ipv4Addr::from(l as u32))
        }
    }

    /// Swaps source and destination.
    pub fn flip(&self) -> ConnTuple {
        ConnTuple {
            saddr_h: self.daddr_h,
            saddr_l: self.daddr_l,
            daddr_h: self.saddr_h,
            daddr_l: self.saddr_l,
            sport: self.dport,
            dport: self.sport,
            ..*self
        }
    }

    /// Canonical orientation: the client side becomes the source.
    ///
    /// When exactly one port is ephemeral that side is the client. Otherwise
    /// the side with the greater `(port, address)` is used, which keeps
    /// `t.normalize() == t.flip().normalize()`.
    pub fn normalize(&self, ephemeral_port_start: u16) -> ConnTuple {
        let src_ephemeral = self.sport >= ephemeral_port_start;
        let dst_ephemeral = self.dport >= ephemeral_port_start;
        let keep = match (src_ephemeral, dst_ephemeral) {
            (true, false) => true,
            (false, true) => false,
            _ => {
                (self.sport, self.saddr_h, self.saddr_l)
                    >= (self.dport, self.daddr_h, self.daddr_l)
            }
        };
        if keep {
            *self
        } else {
            self.flip()
        }
    }

    /// The skb-side view of a socket tuple: no pid, no namespace.
    pub fn without_socket_identity(&self) -> ConnTuple {
        ConnTuple {
            pid: 0,
            netns: 0,
            ..*self
        }
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.source_addr(), self.dest_addr()) {
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                write!(f, "[{s}]:{} -> [{d}]:{}", self.sport, self.dport)
            }
            (s, d) => write!(f, "{s}:{} -> {d}:{}", self.sport, self.dport),
        }
    }
}

impl ConnTuple {
    pub(crate) fn write(&self, enc: &mut Encoder<'_>) {
        enc.u64(self.saddr_h)
            .u64(self.saddr_l)
            .u64(self.daddr_h)
            .u64(self.daddr_l)
            .u16(self.sport)
            .u16(self.dport)
            .u32(self.netns)
            .u32(self.pid)
            .u32(self.metadata);
    }

    pub(crate) fn read(dec: &mut Decoder<'_>) -> ConnTuple {
        ConnTuple {
            saddr_h: dec.u64(),
            saddr_l: dec.u64(),
            daddr_h: dec.u64(),
            daddr_l: dec.u64(),
            sport: dec.u16(),
            dport: dec.u16(),
            netns: dec.u32(),
            pid: dec.u32(),
            metadata: dec.u32(),
        }
    }
}

/// Terminated connections are reported as bare tuples.
impl BatchEvent for ConnTuple {
    const EVENT_SIZE: usize = ConnTuple::LEN;

    fn encode(&self, out: &mut [u8]) {
        self.write(&mut Encoder::new(out));
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf, Self::EVENT_SIZE)?;
        Ok(ConnTuple::read(&mut dec))
    }
}

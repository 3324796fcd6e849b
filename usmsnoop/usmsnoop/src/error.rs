/// Why a captured frame did not yield a TCP tuple.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("cannot parse ethernet frame: {0}")]
    Malformed(String),
    #[error("no ip layer")]
    NotIp,
    #[error("not tcp")]
    NotTcp,
}

/// Output buffer failures while flushing a batch page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("output buffer is full")]
    Full,
    #[error("output buffer consumer is gone")]
    Closed,
    #[error("no perf buffer for cpu {0}")]
    NoSuchCpu(u16),
}

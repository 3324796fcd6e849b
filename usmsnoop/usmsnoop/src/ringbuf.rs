use std::borrow::Borrow;

use anyhow::Context;
use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;

pub trait RingBufEventHandler {
    fn handle_event(&mut self, data: &[u8]);
}

pub async fn handle_ringbuf<T: Borrow<MapData>>(
    ring_buf: RingBuf<T>,
    handler: &mut impl RingBufEventHandler,
) -> anyhow::Result<()> {
    let mut async_fd = AsyncFd::new(ring_buf).context("cannot poll ring buffer")?;

    loop {
        let mut guard = async_fd
            .readable_mut()
            .await
            .context("ring buffer poll failed")?;
        let rb = guard.get_inner_mut();
        while let Some(read) = rb.next() {
            handler.handle_event(&read);
        }
        guard.clear_ready();
    }
}

use std::collections::HashMap;
use std::marker::PhantomData;

use log::debug;
use usm_common::batch::decode_page;
use usm_common::{BatchEvent, DecodeError};

/// Loss accounting gathered from the pages seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub pages: u64,
    pub events: u64,
    pub dropped_events: u64,
    pub failed_flushes: u64,
}

/// Turns page records back into events.
///
/// A page can arrive more than once: first as one or more partial
/// snapshots, then full. The consumer remembers, per CPU, which page it is
/// on and how many of its events were already returned, so every event is
/// yielded exactly once.
pub struct BatchConsumer<E> {
    offsets: HashMap<u16, (u64, u16)>,
    stats: ConsumerStats,
    _event: PhantomData<fn() -> E>,
}

impl<E: BatchEvent> Default for BatchConsumer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BatchEvent> BatchConsumer<E> {
    pub fn new() -> Self {
        BatchConsumer {
            offsets: HashMap::new(),
            stats: ConsumerStats::default(),
            _event: PhantomData,
        }
    }

    pub fn consume(&mut self, record: &[u8]) -> Result<Vec<E>, DecodeError> {
        let (header, events) = decode_page::<E>(record)?;
        let (idx, consumed) = self
            .offsets
            .get(&header.cpu)
            .copied()
            .unwrap_or((header.idx, 0));

        if header.idx < idx {
            debug!("cpu {}: stale page {} (at {idx})", header.cpu, header.idx);
            return Ok(Vec::new());
        }
        let skip = if header.idx == idx { consumed as usize } else { 0 };
        let out = events.skip(skip).collect::<Result<Vec<E>, _>>()?;

        self.stats.pages += 1;
        self.stats.events += out.len() as u64;
        if header.is_full() {
            self.stats.dropped_events += header.dropped_events as u64;
            self.stats.failed_flushes += header.failed_flushes as u64;
            self.offsets.insert(header.cpu, (header.idx + 1, 0));
        } else {
            self.offsets.insert(header.cpu, (header.idx, header.len));
        }
        Ok(out)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchSink, BatchWriter};
    use crate::error::SinkError;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use usm_common::ConnTuple;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    impl BatchSink for Recorder {
        fn output(&self, _cpu: u16, record: &[u8]) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(record.to_vec());
            Ok(())
        }
    }

    fn tuple(port: u16) -> ConnTuple {
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        ConnTuple::tcp(lo, port, lo, 80)
    }

    #[test]
    fn snapshots_and_full_page_yield_each_event_once() {
        let mut writer = BatchWriter::<ConnTuple>::new(1);
        let sink = Recorder::default();
        let mut consumer = BatchConsumer::<ConnTuple>::new();
        let mut seen = Vec::new();

        writer.enqueue(&tuple(1));
        writer.sync(&sink).unwrap();
        writer.enqueue(&tuple(2));
        writer.sync(&sink).unwrap();
        for port in 3..=ConnTuple::BATCH_SIZE as u16 {
            writer.enqueue(&tuple(port));
        }
        writer.flush(&sink);

        for record in sink.0.lock().unwrap().iter() {
            seen.extend(consumer.consume(record).unwrap());
        }
        let ports: Vec<u16> = seen.iter().map(|t| t.sport).collect();
        let expected: Vec<u16> = (1..=ConnTuple::BATCH_SIZE as u16).collect();
        assert_eq!(ports, expected);
        assert_eq!(consumer.stats().events, ConnTuple::BATCH_SIZE as u64);
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let mut writer = BatchWriter::<ConnTuple>::new(0);
        let sink = Recorder::default();
        writer.enqueue(&tuple(1));
        writer.sync(&sink).unwrap();
        let snapshot = sink.0.lock().unwrap()[0].clone();

        for port in 2..=ConnTuple::BATCH_SIZE as u16 {
            writer.enqueue(&tuple(port));
        }
        writer.flush(&sink);
        let full = sink.0.lock().unwrap()[1].clone();

        let mut consumer = BatchConsumer::<ConnTuple>::new();
        assert_eq!(consumer.consume(&full).unwrap().len(), ConnTuple::BATCH_SIZE);
        assert!(consumer.consume(&snapshot).unwrap().is_empty());
    }
}

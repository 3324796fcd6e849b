//! Per-CPU batching of fixed-size events into pages.

use std::marker::PhantomData;

use log::warn;
use tokio::sync::mpsc::{self, error::TrySendError};
use usm_common::{BatchEvent, BatchPageHeader, BATCH_BUFFER_SIZE, BATCH_PAGES_PER_CPU};

use crate::error::SinkError;

/// Where flushed pages go.
pub trait BatchSink: Send + Sync {
    fn output(&self, cpu: u16, record: &[u8]) -> Result<(), SinkError>;
}

fn try_send(tx: &mpsc::Sender<Vec<u8>>, record: &[u8]) -> Result<(), SinkError> {
    tx.try_send(record.to_vec()).map_err(|e| match e {
        TrySendError::Full(_) => SinkError::Full,
        TrySendError::Closed(_) => SinkError::Closed,
    })
}

/// One bounded queue shared by every CPU.
#[derive(Clone)]
pub struct RingBufferSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl RingBufferSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (RingBufferSink { tx }, rx)
    }
}

impl BatchSink for RingBufferSink {
    fn output(&self, _cpu: u16, record: &[u8]) -> Result<(), SinkError> {
        try_send(&self.tx, record)
    }
}

/// One bounded queue per CPU; a page goes to the queue of the CPU that
/// filled it.
#[derive(Clone)]
pub struct PerfBufferSink {
    per_cpu: Vec<mpsc::Sender<Vec<u8>>>,
}

impl PerfBufferSink {
    pub fn new(cpus: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<Vec<u8>>>) {
        let (per_cpu, receivers) = (0..cpus).map(|_| mpsc::channel(capacity.max(1))).unzip();
        (PerfBufferSink { per_cpu }, receivers)
    }
}

impl BatchSink for PerfBufferSink {
    fn output(&self, cpu: u16, record: &[u8]) -> Result<(), SinkError> {
        let tx = self
            .per_cpu
            .get(cpu as usize)
            .ok_or(SinkError::NoSuchCpu(cpu))?;
        try_send(tx, record)
    }
}

struct BatchPage {
    header: BatchPageHeader,
    data: Box<[u8; BATCH_BUFFER_SIZE]>,
}

impl BatchPage {
    fn new(cpu: u16, cap: usize, event_size: usize) -> Self {
        BatchPage {
            header: BatchPageHeader {
                cpu,
                cap: cap as u16,
                event_size: event_size as u16,
                ..Default::default()
            },
            data: Box::new([0; BATCH_BUFFER_SIZE]),
        }
    }

    fn to_record(&self) -> Vec<u8> {
        let mut record = vec![0; BatchPageHeader::PAGE_LEN];
        self.header.encode(&mut record[..BatchPageHeader::LEN]);
        record[BatchPageHeader::LEN..].copy_from_slice(&self.data[..]);
        record
    }

    fn reset(&mut self) {
        self.header.len = 0;
        self.header.dropped_events = 0;
        self.header.failed_flushes = 0;
    }
}

/// A small ring of pages for one event type on one CPU.
///
/// `idx` is the page being filled, `idx_to_flush` the oldest page not yet
/// handed to the sink. At most `BATCH_PAGES_PER_CPU` pages are outstanding;
/// events arriving while the ring is full are counted as dropped on the
/// page that would have been overwritten.
pub struct BatchWriter<E> {
    cpu: u16,
    idx: u64,
    idx_to_flush: u64,
    pages: Vec<BatchPage>,
    _event: PhantomData<fn(&E)>,
}

impl<E: BatchEvent> BatchWriter<E> {
    pub fn new(cpu: u16) -> Self {
        BatchWriter {
            cpu,
            idx: 0,
            idx_to_flush: 0,
            pages: (0..BATCH_PAGES_PER_CPU)
                .map(|_| BatchPage::new(cpu, E::BATCH_SIZE, E::EVENT_SIZE))
                .collect(),
            _event: PhantomData,
        }
    }

    fn slot(idx: u64) -> usize {
        (idx % BATCH_PAGES_PER_CPU as u64) as usize
    }

    /// Returns false when the event was dropped.
    pub fn enqueue(&mut self, event: &E) -> bool {
        let idx = self.idx;
        let page = &mut self.pages[Self::slot(idx)];
        if page.header.is_full() {
            page.header.dropped_events += 1;
            return false;
        }
        if page.header.len == 0 {
            page.header.idx = idx;
        }
        let start = page.header.len as usize * E::EVENT_SIZE;
        event.encode(&mut page.data[start..start + E::EVENT_SIZE]);
        page.header.len += 1;
        if page.header.is_full() {
            self.idx += 1;
        }
        true
    }

    /// Hands every full page to `sink`, oldest first. Stops at the first
    /// failure; that page is retried on the next flush. Returns the number
    /// of pages sent.
    pub fn flush(&mut self, sink: &dyn BatchSink) -> usize {
        let mut flushed = 0;
        while self.idx_to_flush < self.idx && flushed < BATCH_PAGES_PER_CPU {
            let page = &mut self.pages[Self::slot(self.idx_to_flush)];
            if let Err(e) = sink.output(self.cpu, &page.to_record()) {
                page.header.failed_flushes += 1;
                warn!("cpu {}: cannot flush batch page {}: {e}", self.cpu, self.idx_to_flush);
                break;
            }
            page.reset();
            self.idx_to_flush += 1;
            flushed += 1;
        }
        flushed
    }

    /// Sends a snapshot of the page being filled, so events reach the
    /// consumer before the page is full. Only done once every full page
    /// has been flushed, which keeps pages in order for the consumer.
    pub fn sync(&mut self, sink: &dyn BatchSink) -> Result<bool, SinkError> {
        if self.idx_to_flush != self.idx {
            return Ok(false);
        }
        let page = &self.pages[Self::slot(self.idx)];
        if page.header.len == 0 {
            return Ok(false);
        }
        sink.output(self.cpu, &page.to_record())?;
        Ok(true)
    }

    pub fn cpu(&self) -> u16 {
        self.cpu
    }

    pub fn idx(&self) -> u64 {
        self.idx
    }

    pub fn idx_to_flush(&self) -> u64 {
        self.idx_to_flush
    }

    /// Header of the page `idx` currently maps to.
    pub fn page_header(&self, idx: u64) -> BatchPageHeader {
        self.pages[Self::slot(idx)].header
    }

    /// Events sitting in pages that have not been flushed.
    pub fn pending_events(&self) -> usize {
        self.pages.iter().map(|p| p.header.len as usize).sum()
    }

    /// Events dropped on pages that have not been flushed.
    pub fn dropped_events(&self) -> u64 {
        self.pages
            .iter()
            .map(|p| p.header.dropped_events as u64)
            .sum()
    }
}

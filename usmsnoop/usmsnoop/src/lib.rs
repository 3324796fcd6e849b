//! Protocol classification and HTTP/2 decoding for captured TCP traffic.
//!
//! Captured frames go through [`Usm::process_packet`]: the tuple is
//! extracted, duplicate segments are dropped, the connection is
//! classified and, for protocols with a parser, the payload is decoded.
//! Completed HTTP/2 streams are batched per CPU into pages that a
//! [`BatchConsumer`] turns back into events.

pub mod batch;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod http2;
pub mod ktime;
pub mod maps;
pub mod network;
pub mod pipeline;
pub mod telemetry;

pub use batch::{BatchSink, BatchWriter, PerfBufferSink, RingBufferSink};
pub use classifier::Classifier;
pub use config::Config;
pub use consumer::{BatchConsumer, ConsumerStats};
pub use dispatcher::{Dispatcher, ProtocolParser, SkbInfo};
pub use error::{PacketError, SinkError};
pub use http2::transaction::Http2Transaction;
pub use http2::Http2Parser;
pub use pipeline::{CpuContext, Sinks, Usm};
pub use telemetry::{Telemetry, TelemetrySnapshot};

use std::sync::Arc;

use log::trace;
use usm_common::{ConnTuple, Protocol};

use crate::network::Segment;
use crate::pipeline::CpuContext;
use crate::telemetry::Telemetry;

/// A packet as seen by protocol parsers: the directional tuple, where the
/// payload lies and the captured bytes.
#[derive(Debug, Clone, Copy)]
pub struct SkbInfo<'a> {
    pub tuple: ConnTuple,
    pub segment: Segment,
    pub packet: &'a [u8],
}

impl<'a> SkbInfo<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.packet[self.segment.data_off..self.segment.data_end]
    }
}

/// A protocol decoder reachable from the dispatcher.
///
/// Parsers get the whole packet and re-read it from `segment.data_off`;
/// the dispatcher makes no promise that the payload is theirs.
pub trait ProtocolParser: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn process(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>, tel: &Telemetry);
}

impl<P: ProtocolParser + ?Sized> ProtocolParser for Arc<P> {
    fn protocol(&self) -> Protocol {
        (**self).protocol()
    }

    fn process(&self, cpu: &mut CpuContext, skb: &SkbInfo<'_>, tel: &Telemetry) {
        (**self).process(cpu, skb, tel)
    }
}

/// Program array keyed by protocol.
pub struct Dispatcher {
    programs: [Option<Box<dyn ProtocolParser>>; Protocol::COUNT],
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            programs: std::array::from_fn(|_| None),
        }
    }

    /// Installs `parser` in its protocol's slot, replacing any previous one.
    pub fn register(&mut self, parser: Box<dyn ProtocolParser>) {
        let slot = parser.protocol().index();
        self.programs[slot] = Some(parser);
    }

    pub fn parser(&self, protocol: Protocol) -> Option<&dyn ProtocolParser> {
        self.programs[protocol.index()].as_deref()
    }

    /// Hands the packet to the parser registered for `protocol`. Returns
    /// false when the slot is empty.
    pub fn dispatch(
        &self,
        protocol: Protocol,
        cpu: &mut CpuContext,
        skb: &SkbInfo<'_>,
        tel: &Telemetry,
    ) -> bool {
        let Some(parser) = self.parser(protocol) else {
            trace!("{}: no parser for {protocol}", skb.tuple);
            return false;
        };
        parser.process(cpu, skb, tel);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl ProtocolParser for Counting {
        fn protocol(&self) -> Protocol {
            Protocol::Redis
        }

        fn process(&self, _cpu: &mut CpuContext, _skb: &SkbInfo<'_>, _tel: &Telemetry) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_slot_returns_silently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(Counting(calls.clone())));

        let mut cpu = CpuContext::new(0);
        let tel = Telemetry::default();
        let skb = SkbInfo {
            tuple: ConnTuple::default(),
            segment: Segment::default(),
            packet: &[],
        };
        assert!(!dispatcher.dispatch(Protocol::Kafka, &mut cpu, &skb, &tel));
        assert!(dispatcher.dispatch(Protocol::Redis, &mut cpu, &skb, &tel));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}

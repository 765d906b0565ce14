//! Handoff of reassembled units to a consumer
//!
//! The dissector pushes every unit it completes, abandons or closes at end
//! of capture into a [`UnitSink`]. Units are reference counted so the frame
//! cache and the consumer share one copy of the payload.

use std::sync::Arc;

use crate::reassembly::ReassembledUnit;

/// Receiver of reassembled units
pub trait UnitSink {
    /// Take ownership of one unit
    fn deliver(&mut self, unit: Arc<ReassembledUnit>);
}

/// Collect units in memory
impl UnitSink for Vec<Arc<ReassembledUnit>> {
    fn deliver(&mut self, unit: Arc<ReassembledUnit>) {
        self.push(unit);
    }
}

/// Forward units to a thread through a std channel
impl UnitSink for std::sync::mpsc::Sender<Arc<ReassembledUnit>> {
    fn deliver(&mut self, unit: Arc<ReassembledUnit>) {
        if self.send(unit).is_err() {
            log::debug!("Unit receiver dropped, discarding unit");
        }
    }
}

/// Forward units to an async task
impl UnitSink for tokio::sync::mpsc::UnboundedSender<Arc<ReassembledUnit>> {
    fn deliver(&mut self, unit: Arc<ReassembledUnit>) {
        if self.send(unit).is_err() {
            log::debug!("Async unit receiver dropped, discarding unit");
        }
    }
}

/// Drop every unit
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl UnitSink for NullSink {
    fn deliver(&mut self, _unit: Arc<ReassembledUnit>) {}
}

/// Adapt a closure into a sink
pub struct FnSink<F>(pub F);

impl<F> UnitSink for FnSink<F>
where
    F: FnMut(Arc<ReassembledUnit>),
{
    fn deliver(&mut self, unit: Arc<ReassembledUnit>) {
        (self.0)(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{GoverningRecord, SelectorRecord};
    use crate::packet::ConversationId;
    use crate::reassembly::{Completeness, StreamKey};

    fn unit(seq: u64) -> Arc<ReassembledUnit> {
        Arc::new(ReassembledUnit {
            conversation: ConversationId(1),
            endpoint: 0x02,
            key: StreamKey::Session(0),
            origin_sequence: seq,
            closing_sequence: seq,
            record: Arc::new(GoverningRecord::Trigger6(SelectorRecord::whole(0, 3))),
            declared_len: 3,
            accounted_len: 3,
            data: vec![1, 2, 3],
            status: Completeness::Complete,
            truncated: false,
        })
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<Arc<ReassembledUnit>> = Vec::new();
        sink.deliver(unit(1));
        sink.deliver(unit(2));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].origin_sequence, 2);
    }

    #[test]
    fn test_std_channel_sink() {
        let (mut tx, rx) = std::sync::mpsc::channel();
        tx.deliver(unit(4));
        assert_eq!(rx.recv().unwrap().origin_sequence, 4);

        drop(rx);
        // Receiver gone: delivery is silently dropped
        tx.deliver(unit(5));
    }

    #[test]
    fn test_tokio_channel_sink() {
        let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.deliver(unit(6));
        assert_eq!(rx.try_recv().unwrap().origin_sequence, 6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fn_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = FnSink(|u: Arc<ReassembledUnit>| seen.push(u.origin_sequence));
            sink.deliver(unit(7));
            sink.deliver(unit(8));
        }
        assert_eq!(seen, vec![7, 8]);
        NullSink.deliver(unit(9));
    }
}

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use bytes::Bytes;

// === Seam === //

/// Outbound half of the framed-packet contract: the core hands the
/// transport one framed packet at a time together with its reliability
/// flag; delivery, retransmission and ordering are the transport's
/// problem.
pub trait PacketSink {
    fn send(&mut self, framed: Bytes, reliable: bool);
}

/// Inbound half, drained on the simulation thread. The transport must
/// never deliver concurrently with a tick.
pub trait PacketSource {
    fn poll(&mut self) -> Option<(Bytes, bool)>;
}

// === Loopback === //

type SharedQueue = Rc<RefCell<VecDeque<(Bytes, bool)>>>;

/// One end of an in-process transport pair: whatever one endpoint sends,
/// the other polls back in FIFO order. Used by tests and local sessions.
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    tx: SharedQueue,
    rx: SharedQueue,
}

pub fn loopback_pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
    let a_to_b = SharedQueue::default();
    let b_to_a = SharedQueue::default();

    (
        LoopbackEndpoint {
            tx: Rc::clone(&a_to_b),
            rx: Rc::clone(&b_to_a),
        },
        LoopbackEndpoint {
            tx: b_to_a,
            rx: a_to_b,
        },
    )
}

impl PacketSink for LoopbackEndpoint {
    fn send(&mut self, framed: Bytes, reliable: bool) {
        self.tx.borrow_mut().push_back((framed, reliable));
    }
}

impl PacketSource for LoopbackEndpoint {
    fn poll(&mut self) -> Option<(Bytes, bool)> {
        self.rx.borrow_mut().pop_front()
    }
}

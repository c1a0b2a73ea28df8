pub mod listener;
pub mod origin;
pub mod worker;

use tether_core::CorrelationId;

use crate::tunnel::FrameSink;

/// The one write path for the currently active uplink connection. Workers
/// hold a clone and submit their framed responses through it; a single
/// task drains the other end and owns the uplink's write half, so frame
/// writes from concurrent workers never interleave on the wire.
#[derive(Clone)]
pub struct UplinkSink {
    tx: async_channel::Sender<(CorrelationId, Vec<u8>)>,
}

impl UplinkSink {
    pub fn new() -> (Self, async_channel::Receiver<(CorrelationId, Vec<u8>)>) {
        let (tx, rx) = async_channel::unbounded();
        (UplinkSink { tx }, rx)
    }
}

impl FrameSink for UplinkSink {
    async fn send_frame(&self, id: CorrelationId, payload: Vec<u8>) -> bool {
        self.tx.send((id, payload)).await.is_ok()
    }
}

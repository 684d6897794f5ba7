//! Bus wrapper that emits packet events.

use std::sync::Arc;

use super::traits::{BusType, TcmBus, TransportError};
use crate::events::{PacketDirection, TcmEvent, TcmObserver};

/// Bytes of each transfer copied into the event.
const PACKET_PREVIEW: usize = 32;

pub struct ObservableBus {
    inner: Arc<dyn TcmBus>,
    observer: Arc<dyn TcmObserver>,
}

impl ObservableBus {
    pub fn new(inner: Arc<dyn TcmBus>, observer: Arc<dyn TcmObserver>) -> Self {
        Self { inner, observer }
    }
}

impl TcmBus for ObservableBus {
    fn read(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let res = self.inner.read(buf);
        if res.is_ok() && !buf.is_empty() {
            self.observer.on_event(&TcmEvent::Packet {
                direction: PacketDirection::Rx,
                length: buf.len(),
                data: Some(buf.iter().take(PACKET_PREVIEW).cloned().collect()),
            });
        }
        res
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.observer.on_event(&TcmEvent::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
                data: Some(data.iter().take(PACKET_PREVIEW).cloned().collect()),
            });
        }
        res
    }

    fn bus_type(&self) -> BusType {
        self.inner.bus_type()
    }
}

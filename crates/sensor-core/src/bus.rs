use std::sync::Arc;

use sensor_common::{EventSender, TransportError};
use tokio::sync::broadcast;

use crate::event::SensorMessage;

/// Broadcast transport: every subscriber receives every message. A slow
/// subscriber lags and loses the oldest messages, the sensor never waits.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Arc<SensorMessage>>,
}

const BUFFER_SIZE: usize = 1000;

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUFFER_SIZE);
        Self { tx }
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<Arc<SensorMessage>> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSender<SensorMessage> for Bus {
    fn send(&self, message: SensorMessage) -> Result<(), TransportError> {
        if let SensorMessage::Event(event) = &message {
            log::trace!(
                target: &format!("event::{}", event.header().event_type),
                "{:?} [{}:{}] {:?}",
                event.header().timestamp,
                event.context().process.pid,
                event.context().process.image,
                event.payload()
            );
        }
        // Sending only fails when nobody is subscribed
        self.tx
            .send(Arc::new(message))
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }
}

//! The [`EventSender`] trait is the transport boundary of the sensor: hook
//! handlers hand it fully built messages for delivery to the consumer.
//!
//! [`EventSender::send`] must not block since it's called from hook handlers.
//! There's no retry: a message which can't be delivered is dropped and the
//! caller counts it.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport queue is full")]
    Full,
    #[error("transport is closed")]
    Closed,
}

pub trait EventSender<T>: Clone + Send + Sync + 'static {
    /// Must not block since it can be used by hook handlers
    fn send(&self, data: T) -> Result<(), TransportError>;
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl<T: Send + 'static> EventSender<T> for mpsc::Sender<T> {
    fn send(&self, data: T) -> Result<(), TransportError> {
        self.try_send(data).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

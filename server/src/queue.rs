//! Hand-off queue between the network thread and the consumer.
//!
//! The network thread is the only producer; the dispatcher is the only
//! consumer. Neither end is `Clone`, which keeps the queue single-producer,
//! single-consumer even though the underlying channel would allow more.
//! Entries come out in the order frames finished arriving.

use log::debug;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Creates a connected producer/consumer pair.
pub fn inbound_queue() -> (InboundProducer, InboundConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InboundProducer { tx }, InboundConsumer { rx })
}

#[derive(Debug)]
pub struct InboundProducer {
    tx: mpsc::UnboundedSender<String>,
}

impl InboundProducer {
    /// Enqueues one decoded message. Returns `false` once the consumer is gone.
    pub fn push(&self, message: String) -> bool {
        if self.tx.send(message).is_err() {
            debug!("Inbound consumer dropped, discarding message");
            return false;
        }
        true
    }
}

#[derive(Debug)]
pub struct InboundConsumer {
    rx: mpsc::UnboundedReceiver<String>,
}

impl InboundConsumer {
    /// Removes the oldest entry without blocking.
    pub fn try_pop(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Removes every entry available right now, oldest first.
    pub fn drain_available(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(message) = self.try_pop() {
            messages.push(message);
        }
        messages
    }
}

//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::frame::CanFrame;
use crate::message::IdsMessage;
use crate::transport::{Transport, TransportError};

/// Transport stub decoding every sent frame back into a message and
/// handing it to a test channel.
pub struct MockTransport {
    tx: Sender<IdsMessage>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn pair() -> (Arc<MockTransport>, Receiver<IdsMessage>) {
        let (tx, rx) = unbounded();
        (
            Arc::new(MockTransport {
                tx,
                connected: AtomicBool::new(true),
            }),
            rx,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let msg = IdsMessage::from_frame(frame).expect("well formed test frame");
        self.tx.send(msg).unwrap();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

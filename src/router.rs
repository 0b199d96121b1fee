//! Inbound frame dispatch.
//!
//! Runs on the transport reader thread and never lets a failure escape
//! back into it: frames that do not decode, or that nobody cares about,
//! are logged and skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::frame::CanFrame;
use crate::message::{IdsMessage, MessageType};
use crate::registry::DeviceRegistry;
use crate::session::SessionMap;

/// Invoked for every DEVICE_STATUS from a subscribed address.
pub type StatusHandler = Box<dyn Fn(&IdsMessage) + Send + Sync>;

pub struct Router {
    local: u8,
    registry: Mutex<Option<Arc<DeviceRegistry>>>,
    sessions: Mutex<Option<Arc<SessionMap>>>,
    subscribers: Mutex<HashMap<u8, Vec<StatusHandler>>>,
}

impl Router {
    pub fn new(local: u8) -> Router {
        Router {
            local,
            registry: Mutex::new(None),
            sessions: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    // The transport callback needs the router before registry and sessions
    // can exist (both hold the transport), so those two arrive later.
    pub fn set_registry(&self, registry: Arc<DeviceRegistry>) {
        *self.registry.lock().unwrap() = Some(registry);
    }

    pub fn set_sessions(&self, sessions: Arc<SessionMap>) {
        *self.sessions.lock().unwrap() = Some(sessions);
    }

    /// Registers a handler for DEVICE_STATUS messages from one address.
    pub fn subscribe(&self, addr: u8, handler: StatusHandler) {
        self.subscribers
            .lock()
            .unwrap()
            .entry(addr)
            .or_insert_with(Vec::new)
            .push(handler);
    }

    /// Demultiplexes one inbound frame.
    pub fn dispatch(&self, frame: CanFrame) {
        let msg = match IdsMessage::from_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("undecodable frame {}: {}", frame, e);
                return;
            }
        };

        if let Some(registry) = self.registry.lock().unwrap().as_ref() {
            registry.observe(msg.src());
        }

        match msg.message_type() {
            MessageType::DeviceStatus => {
                if let Some(sessions) = self.sessions.lock().unwrap().as_ref() {
                    sessions.touch(msg.src());
                }
                let subscribers = self.subscribers.lock().unwrap();
                if let Some(handlers) = subscribers.get(&msg.src()) {
                    for handler in handlers {
                        handler(&msg);
                    }
                }
            }
            MessageType::DeviceId => {
                if let Some(registry) = self.registry.lock().unwrap().as_ref() {
                    registry.handle_device_id(&msg);
                }
            }
            MessageType::Response if msg.tgt() == self.local => {
                if let Some(sessions) = self.sessions.lock().unwrap().as_ref() {
                    sessions.handle_response(&msg);
                }
            }
            // we are never a device
            MessageType::Command if msg.tgt() == self.local => {
                trace!("ignoring command addressed to the controller")
            }
            MessageType::TextConsole | MessageType::ProductStatus => {
                trace!("ignoring {:?} from {}", msg.message_type(), msg.src())
            }
            other => trace!("no route for {:?} from {}", other, msg.src()),
        }
    }
}

//! Periodic NETWORK presence broadcast.
//!
//! Every live participant on an IDS-CAN bus announces itself once a
//! second; devices eventually drop sessions owned by a controller that
//! goes quiet. The broadcast piggybacks on the regular send path, so a
//! disconnected transport simply suspends it until the reader reconnects.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::message::{IdsMessage, MessageType};
use crate::timer::PeriodicTimer;
use crate::transport::Transport;

pub const ANNOUNCE_PERIOD: Duration = Duration::from_millis(1000);

pub const PROTOCOL_VERSION: u8 = 8;

/// Identity of the controller on the bus.
#[derive(Debug, Clone)]
pub struct LocalDeviceConfig {
    pub source_address: u8,
    pub mac: [u8; 6],
    pub protocol_version: u8,
}

impl LocalDeviceConfig {
    pub fn new(source_address: u8, mac: [u8; 6]) -> LocalDeviceConfig {
        LocalDeviceConfig {
            source_address,
            mac,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Builds the presence broadcast: `[status, protocol version, mac 0..5]`.
pub fn network_message(config: &LocalDeviceConfig) -> IdsMessage {
    let mut payload = [0u8; 8];
    payload[1] = config.protocol_version;
    payload[2..8].copy_from_slice(&config.mac);
    IdsMessage::broadcast(MessageType::Network, config.source_address, &payload)
        .expect("presence payload is 8 bytes")
}

/// Emits the presence broadcast on a fixed one second period.
pub struct GatewayAnnouncer {
    timer: PeriodicTimer,
}

impl GatewayAnnouncer {
    pub fn start(config: LocalDeviceConfig, transport: Arc<dyn Transport>) -> GatewayAnnouncer {
        let timer = PeriodicTimer::spawn("idscan-announce", ANNOUNCE_PERIOD, move || {
            if !transport.is_connected() {
                return;
            }
            let msg = network_message(&config);
            if let Err(e) = transport.send(&msg.to_frame()) {
                debug!("presence broadcast failed: {}", e);
            }
        });
        GatewayAnnouncer { timer }
    }

    pub fn stop(mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BROADCAST_ADDR;
    use crate::testutil::MockTransport;

    #[test]
    fn network_payload_layout() {
        let config = LocalDeviceConfig::new(5, [0x02, 0x42, 0xc0, 0xa8, 0x00, 0x07]);
        let msg = network_message(&config);
        assert_eq!(msg.message_type(), MessageType::Network);
        assert_eq!(msg.src(), 5);
        assert_eq!(msg.tgt(), BROADCAST_ADDR);
        assert_eq!(
            msg.payload(),
            &[0x00, 0x08, 0x02, 0x42, 0xc0, 0xa8, 0x00, 0x07]
        );
    }

    #[test]
    fn announcer_broadcasts_while_connected() {
        let (transport, rx) = MockTransport::pair();
        let announcer = GatewayAnnouncer::start(
            LocalDeviceConfig::new(1, [0u8; 6]),
            transport.clone() as Arc<dyn Transport>,
        );

        let msg = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(msg.message_type(), MessageType::Network);
        announcer.stop();
    }

    #[test]
    fn announcer_suspends_when_disconnected() {
        let (transport, rx) = MockTransport::pair();
        transport.set_connected(false);
        let announcer = GatewayAnnouncer::start(
            LocalDeviceConfig::new(1, [0u8; 6]),
            transport.clone() as Arc<dyn Transport>,
        );

        assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
        announcer.stop();
    }
}

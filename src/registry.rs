//! Device discovery and tracking.
//!
//! The registry records every unicast source address seen on the bus and
//! chases each one for a DEVICE_ID. On bridge ready it additionally sweeps
//! the whole address space with staggered probes, then keeps re-requesting
//! from addresses that have not identified themselves. Devices with a
//! known type are published to the host's discovery channel exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace};

use crate::command::{self, MSG_REQUEST_DEVICE_ID};
use crate::device::DeviceType;
use crate::frame::is_unicast;
use crate::message::IdsMessage;
use crate::transport::Transport;

/// Spacing between probes during the address sweep.
pub const SWEEP_STEP: Duration = Duration::from_millis(10);

/// Settle time between the full sweep and the first re-probe round.
pub const SWEEP_SETTLE: Duration = Duration::from_secs(3);

/// Minimum spacing of repeated DEVICE_ID requests to one address.
pub const REPROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Everything known about one bus address.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub addr: u8,
    pub device_type: DeviceType,
    pub function_name: u16,
    pub instance: u8,
    pub capabilities: Option<u8>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_id_probe: Option<Instant>,
    pub published: bool,
    pub has_device_id: bool,
}

impl DiscoveredDevice {
    fn new(addr: u8) -> DiscoveredDevice {
        let now = Instant::now();
        DiscoveredDevice {
            addr,
            device_type: DeviceType::Unknown,
            function_name: 0,
            instance: 0,
            capabilities: None,
            first_seen: now,
            last_seen: now,
            last_id_probe: None,
            published: false,
            has_device_id: false,
        }
    }
}

/// Record published to the host's discovery inbox, once per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub bridge_id: String,
    pub device_id: String,
    pub addr: u8,
    pub device_type: DeviceType,
    pub device_type_name: &'static str,
    pub function_name: u16,
    pub device_name: String,
    pub instance: u8,
    pub capabilities: Option<u8>,
}

pub struct DeviceRegistry {
    bridge_id: String,
    local: u8,
    transport: Arc<dyn Transport>,
    devices: Mutex<HashMap<u8, DiscoveredDevice>>,
    publish_tx: Sender<DeviceRecord>,
    stop: AtomicBool,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(
        bridge_id: &str,
        local: u8,
        transport: Arc<dyn Transport>,
    ) -> (Arc<DeviceRegistry>, Receiver<DeviceRecord>) {
        let (publish_tx, publish_rx) = unbounded();
        (
            Arc::new(DeviceRegistry {
                bridge_id: bridge_id.to_string(),
                local,
                transport,
                devices: Mutex::new(HashMap::new()),
                publish_tx,
                stop: AtomicBool::new(false),
                sweep: Mutex::new(None),
            }),
            publish_rx,
        )
    }

    /// Notes a source address seen in inbound traffic. First sightings are
    /// immediately probed for a DEVICE_ID.
    pub fn observe(&self, src: u8) {
        if !is_unicast(src) || src == self.local {
            return;
        }
        let first_sighting = {
            let mut devices = self.devices.lock().unwrap();
            match devices.get_mut(&src) {
                Some(device) => {
                    device.last_seen = Instant::now();
                    false
                }
                None => {
                    devices.insert(src, DiscoveredDevice::new(src));
                    true
                }
            }
        };
        if first_sighting {
            debug!("new bus participant at address {}", src);
            self.probe(src);
        }
    }

    /// Digests a DEVICE_ID broadcast.
    ///
    /// Payload layout: bytes 0..=2 product data (unused here), byte 3
    /// device type, bytes 4..=5 function name, byte 6 high nibble instance,
    /// byte 7 capability flags when present. A function name of zero marks
    /// an empty port and is discarded.
    pub fn handle_device_id(&self, msg: &IdsMessage) {
        let payload = msg.payload();
        if payload.len() < 7 {
            trace!("short device id from {}: {}", msg.src(), hex::encode(payload));
            return;
        }
        let device_type = DeviceType::from_raw(payload[3]);
        let function_name = ((payload[4] as u16) << 8) | payload[5] as u16;
        let instance = payload[6] >> 4;
        let capabilities = payload.get(7).copied();

        let record = {
            let mut devices = self.devices.lock().unwrap();
            let device = devices
                .entry(msg.src())
                .or_insert_with(|| DiscoveredDevice::new(msg.src()));
            device.last_seen = Instant::now();
            device.has_device_id = true;

            if function_name == 0 {
                trace!("address {} reports an empty port", msg.src());
                return;
            }

            device.device_type = device_type;
            device.function_name = function_name;
            device.instance = instance;
            device.capabilities = capabilities;

            if !device_type.is_known() {
                debug!(
                    "address {} has unsupported device type {:#04x}",
                    msg.src(),
                    payload[3]
                );
                return;
            }
            if device.published {
                return;
            }
            device.published = true;
            DeviceRecord {
                bridge_id: self.bridge_id.clone(),
                device_id: format!("device_{}", msg.src()),
                addr: msg.src(),
                device_type,
                device_type_name: device_type.name(),
                function_name,
                device_name: format!("{} {}", device_type.name(), instance),
                instance,
                capabilities,
            }
        };

        info!(
            "discovered {} at address {} (function {:#06x})",
            record.device_type_name, record.addr, record.function_name
        );
        // a dropped receiver only means the host stopped listening
        let _ = self.publish_tx.send(record);
    }

    /// Snapshot of everything seen so far.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn device(&self, addr: u8) -> Option<DiscoveredDevice> {
        self.devices.lock().unwrap().get(&addr).cloned()
    }

    /// Starts the background sweep of the whole address space. A second
    /// call is a no-op.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock().unwrap();
        if sweep.is_some() {
            return;
        }
        let registry = self.clone();
        *sweep = Some(
            std::thread::Builder::new()
                .name("idscan-discovery".into())
                .spawn(move || registry.sweep_loop())
                .expect("spawning the discovery thread"),
        );
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweep.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Sleeps for `dur`, waking up early (in `SWEEP_STEP` increments) if
    /// `stop` is set so shutdown isn't held up by a long sleep.
    fn sleep_unless_stopped(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(std::cmp::min(SWEEP_STEP, deadline - now));
        }
    }

    fn sweep_loop(&self) {
        info!("sweeping addresses 1..=254 for devices");
        for addr in 1..=254u8 {
            if self.stop.load(Ordering::SeqCst) || !self.transport.is_connected() {
                return;
            }
            if addr == self.local {
                continue;
            }
            self.probe(addr);
            std::thread::sleep(SWEEP_STEP);
        }

        // let the answers settle before chasing stragglers
        self.sleep_unless_stopped(SWEEP_SETTLE);
        while !self.stop.load(Ordering::SeqCst) {
            self.reprobe_unidentified();
            self.sleep_unless_stopped(Duration::from_secs(1));
        }
    }

    fn reprobe_unidentified(&self) {
        if !self.transport.is_connected() {
            return;
        }
        let now = Instant::now();
        let due: Vec<u8> = {
            let devices = self.devices.lock().unwrap();
            devices
                .values()
                .filter(|d| {
                    !d.has_device_id
                        && d.last_id_probe
                            .map_or(true, |probed| now.duration_since(probed) >= REPROBE_INTERVAL)
                })
                .map(|d| d.addr)
                .collect()
        };
        for addr in due {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            self.probe(addr);
            std::thread::sleep(SWEEP_STEP);
        }
    }

    fn probe(&self, addr: u8) {
        {
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.get_mut(&addr) {
                device.last_id_probe = Some(Instant::now());
            }
        }
        let msg = command::request(self.local, addr, MSG_REQUEST_DEVICE_ID);
        if let Err(e) = self.transport.send(&msg.to_frame()) {
            trace!("device id probe to {} failed: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BROADCAST_ADDR;
    use crate::message::MessageType;
    use crate::testutil::MockTransport;

    fn device_id_broadcast(src: u8, payload: &[u8]) -> IdsMessage {
        IdsMessage::broadcast(MessageType::DeviceId, src, payload).unwrap()
    }

    #[test]
    fn first_sighting_triggers_a_probe() {
        let (transport, rx) = MockTransport::pair();
        let (registry, _discovered) = DeviceRegistry::new("gw-test", 1, transport);

        registry.observe(92);
        let probe = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(probe.message_type(), MessageType::Request);
        assert_eq!(probe.tgt(), 92);
        assert_eq!(probe.msg_data(), MSG_REQUEST_DEVICE_ID);

        // a second sighting stays quiet
        registry.observe(92);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_and_own_addresses_are_not_tracked() {
        let (transport, rx) = MockTransport::pair();
        let (registry, _discovered) = DeviceRegistry::new("gw-test", 1, transport);

        registry.observe(BROADCAST_ADDR);
        registry.observe(1);
        registry.observe(0xff);
        assert!(rx.try_recv().is_err());
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn known_device_is_published_once() {
        let (transport, _rx) = MockTransport::pair();
        let (registry, discovered) = DeviceRegistry::new("gw-test", 1, transport);

        let msg = device_id_broadcast(92, &[0, 0, 0, 0x14, 0x01, 0x02, 0x30, 0x05]);
        registry.handle_device_id(&msg);
        registry.handle_device_id(&msg);

        let record = discovered.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.addr, 92);
        assert_eq!(record.device_type, DeviceType::DimmableLight);
        assert_eq!(record.function_name, 0x0102);
        assert_eq!(record.instance, 3);
        assert_eq!(record.capabilities, Some(0x05));
        assert_eq!(record.device_id, "device_92");
        assert!(discovered.try_recv().is_err());

        let device = registry.device(92).unwrap();
        assert!(device.published);
        assert!(device.has_device_id);
    }

    #[test]
    fn empty_port_is_discarded() {
        let (transport, _rx) = MockTransport::pair();
        let (registry, discovered) = DeviceRegistry::new("gw-test", 1, transport);

        registry.handle_device_id(&device_id_broadcast(17, &[0, 0, 0, 0x14, 0, 0, 0x10]));
        assert!(discovered.try_recv().is_err());

        let device = registry.device(17).unwrap();
        assert!(device.has_device_id);
        assert!(!device.published);
    }

    #[test]
    fn unknown_type_is_remembered_but_not_published() {
        let (transport, _rx) = MockTransport::pair();
        let (registry, discovered) = DeviceRegistry::new("gw-test", 1, transport);

        registry.handle_device_id(&device_id_broadcast(40, &[0, 0, 0, 0x77, 0x00, 0x09, 0x20]));
        assert!(discovered.try_recv().is_err());

        let device = registry.device(40).unwrap();
        assert_eq!(device.device_type, DeviceType::Unknown);
        assert_eq!(device.function_name, 0x0009);
        assert!(device.has_device_id);
        assert!(!device.published);
    }

    #[test]
    fn short_device_id_is_ignored() {
        let (transport, _rx) = MockTransport::pair();
        let (registry, discovered) = DeviceRegistry::new("gw-test", 1, transport);
        registry.handle_device_id(&device_id_broadcast(8, &[0, 0, 0, 0x14]));
        assert!(discovered.try_recv().is_err());
    }
}

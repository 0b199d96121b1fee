//! Bridge assembly: configuration, component wiring, and the command
//! surface the integration host calls.
//!
//! The bridge owns the transport, discovery and sessions. Ownership is
//! strictly one-way: the transport gets a callback into the router at
//! construction, and every component that emits frames holds a clonable
//! handle to the transport, never a pointer back to the bridge.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::info;
use thiserror::Error;

use crate::announce::{GatewayAnnouncer, LocalDeviceConfig};
use crate::beacon::{BeaconListener, BEACON_FRESHNESS};
use crate::command::{self, HBridgeAction, MSG_REQUEST_DEVICE_STATUS};
use crate::device::LightMode;
use crate::err::ConfigError;
use crate::frame::is_unicast;
use crate::registry::{DeviceRecord, DeviceRegistry, DiscoveredDevice};
use crate::router::{Router, StatusHandler};
use crate::session::{SessionError, SessionMap};
use crate::socketcan::SocketCanTransport;
use crate::tcp::TcpTransport;
use crate::timer::PeriodicTimer;
use crate::transport::{FrameHandler, Transport, TransportError};
use crate::logging;

const SESSION_TICK: Duration = Duration::from_secs(1);

/// Which kind of bus attachment to use.
#[derive(Debug, Clone)]
pub enum Connection {
    /// CAN-over-Ethernet gateway. Port 0 means "resolve through the
    /// gateway's UDP beacon".
    Tcp { host: String, port: u16 },
    /// Local SocketCAN interface, e.g. `can0`.
    SocketCan { interface: String },
}

/// Host-supplied bridge configuration, validated at construction.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connection: Connection,
    pub source_address: u8,
    pub mac: [u8; 6],
    pub verbose: bool,
}

impl BridgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !is_unicast(self.source_address) {
            return Err(ConfigError::SourceAddressOutOfRange(self.source_address));
        }
        match &self.connection {
            Connection::Tcp { host, .. } if host.is_empty() => Err(ConfigError::EmptyHost),
            Connection::SocketCan { interface } if interface.is_empty() => {
                Err(ConfigError::EmptyInterface)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Target address {0} is not a device address.")]
    InvalidTarget(u8),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The assembled IDS-CAN driver.
pub struct IdsCanBridge {
    local: LocalDeviceConfig,
    bridge_id: String,
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionMap>,
    announcer: Mutex<Option<GatewayAnnouncer>>,
    session_timer: Mutex<Option<PeriodicTimer>>,
    discovered: Receiver<DeviceRecord>,
}

impl IdsCanBridge {
    pub fn new(config: BridgeConfig) -> Result<IdsCanBridge, ConfigError> {
        config.validate()?;
        if config.verbose {
            logging::init(true);
        }

        let router = Arc::new(Router::new(config.source_address));
        let dispatch_router = router.clone();
        let handler: FrameHandler = Box::new(move |frame| dispatch_router.dispatch(frame));

        let (bridge_id, transport): (String, Arc<dyn Transport>) = match &config.connection {
            Connection::Tcp { host, port } => {
                let port = if *port == 0 {
                    resolve_gateway_port()?
                } else {
                    *port
                };
                (
                    format!("gw-{}-{}", host, port),
                    Arc::new(TcpTransport::new(host, port, handler)),
                )
            }
            Connection::SocketCan { interface } => (
                format!("can-{}", interface),
                Arc::new(SocketCanTransport::new(interface, handler)),
            ),
        };

        let sessions = Arc::new(SessionMap::new(config.source_address, transport.clone()));
        let (registry, discovered) =
            DeviceRegistry::new(&bridge_id, config.source_address, transport.clone());
        router.set_sessions(sessions.clone());
        router.set_registry(registry.clone());

        Ok(IdsCanBridge {
            local: LocalDeviceConfig::new(config.source_address, config.mac),
            bridge_id,
            transport,
            router,
            registry,
            sessions,
            announcer: Mutex::new(None),
            session_timer: Mutex::new(None),
            discovered,
        })
    }

    /// Connects the transport and starts the periodic machinery: presence
    /// broadcast, session maintenance and the discovery sweep.
    pub fn start(&self) -> Result<(), TransportError> {
        self.transport.connect()?;
        info!("bridge {} online", self.bridge_id);

        let mut announcer = self.announcer.lock().unwrap();
        if announcer.is_none() {
            *announcer = Some(GatewayAnnouncer::start(
                self.local.clone(),
                self.transport.clone(),
            ));
        }
        let mut timer = self.session_timer.lock().unwrap();
        if timer.is_none() {
            let sessions = self.sessions.clone();
            *timer = Some(PeriodicTimer::spawn("idscan-session-tick", SESSION_TICK, move || {
                sessions.tick_all()
            }));
        }
        self.registry.start_sweep();
        Ok(())
    }

    /// Permanent teardown: stops timers and discovery, ends sessions and
    /// closes the transport.
    pub fn shutdown(&self) {
        self.registry.stop();
        if let Some(announcer) = self.announcer.lock().unwrap().take() {
            announcer.stop();
        }
        if let Some(mut timer) = self.session_timer.lock().unwrap().take() {
            timer.cancel();
        }
        self.sessions.close_all();
        self.transport.close();
        info!("bridge {} offline", self.bridge_id);
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Channel of newly identified devices, published once each.
    pub fn discovered(&self) -> Receiver<DeviceRecord> {
        self.discovered.clone()
    }

    /// Snapshot of every address seen on the bus.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.devices()
    }

    /// Registers a handler for DEVICE_STATUS broadcasts from one device.
    pub fn subscribe_status(&self, addr: u8, handler: StatusHandler) {
        self.router.subscribe(addr, handler);
    }

    pub fn set_light_on(&self, target: u8, brightness_percent: i32) -> Result<(), BridgeError> {
        self.send_command(target, &command::light_on(brightness_percent))
    }

    pub fn set_light_off(&self, target: u8) -> Result<(), BridgeError> {
        self.send_command(target, &command::light_off())
    }

    pub fn set_light_blink(
        &self,
        target: u8,
        brightness_percent: i32,
        on_time: u16,
        off_time: u16,
    ) -> Result<(), BridgeError> {
        self.send_command(
            target,
            &command::light_blink(brightness_percent, on_time, off_time),
        )
    }

    pub fn set_light_swell(
        &self,
        target: u8,
        brightness_percent: i32,
        ramp_up: u16,
        ramp_down: u16,
    ) -> Result<(), BridgeError> {
        self.send_command(
            target,
            &command::light_swell(brightness_percent, ramp_up, ramp_down),
        )
    }

    pub fn set_rgb(
        &self,
        target: u8,
        mode: LightMode,
        r: u8,
        g: u8,
        b: u8,
        brightness_percent: i32,
    ) -> Result<(), BridgeError> {
        self.send_command(target, &command::rgb_command(mode, r, g, b, brightness_percent))
    }

    pub fn set_relay(&self, target: u8, on: bool) -> Result<(), BridgeError> {
        self.send_command(target, &command::relay_command(on))
    }

    pub fn set_hbridge(&self, target: u8, action: HBridgeAction) -> Result<(), BridgeError> {
        self.send_command(target, &command::hbridge_command(action))
    }

    pub fn set_hvac(
        &self,
        target: u8,
        heat_mode: u8,
        heat_source: u8,
        fan_mode: u8,
        low_trip: u8,
        high_trip: u8,
    ) -> Result<(), BridgeError> {
        self.send_command(
            target,
            &command::hvac_command(heat_mode, heat_source, fan_mode, low_trip, high_trip),
        )
    }

    /// Asks a device to broadcast its DEVICE_STATUS. No session required.
    pub fn request_device_status(&self, target: u8) -> Result<(), BridgeError> {
        if !is_unicast(target) {
            return Err(BridgeError::InvalidTarget(target));
        }
        let msg = command::request(self.local.source_address, target, MSG_REQUEST_DEVICE_STATUS);
        self.transport.send(&msg.to_frame())?;
        Ok(())
    }

    /// Commands require an open session with the target; one is opened
    /// lazily on the first command and kept alive while commands flow.
    fn send_command(&self, target: u8, payload: &[u8]) -> Result<(), BridgeError> {
        if !is_unicast(target) {
            return Err(BridgeError::InvalidTarget(target));
        }
        let session = self.sessions.get_or_create(target);
        session.ensure_open()?;
        let msg = command::device_command(self.local.source_address, target, payload);
        self.transport.send(&msg.to_frame())?;
        session.touch();
        Ok(())
    }
}

fn resolve_gateway_port() -> Result<u16, ConfigError> {
    let listener = BeaconListener::start().map_err(|_| ConfigError::GatewayNotDiscovered)?;
    let endpoint = listener.wait_for_gateway(BEACON_FRESHNESS);
    listener.stop();
    match endpoint {
        Some(endpoint) => {
            info!(
                "gateway {:?} announced at {}:{}",
                endpoint.name, endpoint.ip, endpoint.port
            );
            Ok(endpoint.port)
        }
        None => Err(ConfigError::GatewayNotDiscovered),
    }
}

//! IDS-CAN client driver.
//!
//! IDS-CAN is an application protocol spoken on recreational-vehicle CAN
//! buses by devices such as dimmable and RGB lights, tank sensors,
//! latching relays, H-bridges and HVAC units. This crate implements the
//! controller side of that protocol: it observes the bus, discovers and
//! classifies devices, and commands them inside authenticated sessions.
//!
//! # Reaching the bus
//!
//! The bus is reached one of two ways, behind the same [`Transport`]
//! trait:
//!
//! * a remote CAN-over-Ethernet gateway, speaking CAN frames wrapped in a
//!   byte-stuffed, CRC-protected TCP stream. Gateways announce themselves
//!   with UDP beacons that the [`beacon`] module can listen for.
//! * a local Linux SocketCAN interface (see
//!   https://www.kernel.org/doc/Documentation/networking/can.txt), read
//!   and written as raw kernel frames.
//!
//! Both transports keep one dedicated reader thread alive across
//! disconnects and deliver inbound frames to a handler; sends are safe
//! from any thread.
//!
//! # An introduction to IDS-CAN
//!
//! Every frame consists of an ID and a payload of up to 8 bytes. IDS-CAN
//! splits its message types across the two CAN ID widths: broadcasts
//! (presence, device identification, device status) travel on 11 bit
//! standard IDs, while point-to-point traffic (requests, responses,
//! commands) packs source, target and a message byte into 29 bit extended
//! IDs.
//!
//! Commands are only honored inside a session, opened with a seed/key
//! exchange and kept alive by heartbeats. Every live participant also
//! broadcasts a NETWORK presence frame once a second; the
//! [`announce::GatewayAnnouncer`] takes care of ours.
//!
//! # Putting it together
//!
//! [`IdsCanBridge`] wires the whole stack up from a [`BridgeConfig`]:
//! transport, dispatch, discovery sweep, presence broadcast and session
//! maintenance. Hosts that need finer control can assemble the pieces
//! themselves.

pub mod announce;
pub mod beacon;
pub mod bridge;
pub mod cobs;
pub mod command;
pub mod crc;
pub mod device;
pub mod err;
pub mod frame;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;
pub mod socketcan;
pub mod tcp;
pub mod timer;
pub mod transport;

mod logging;
mod retry;
mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::bridge::{BridgeConfig, BridgeError, Connection, IdsCanBridge};
pub use crate::device::DeviceType;
pub use crate::err::{ConfigError, ProtocolCode};
pub use crate::frame::{CanFrame, CanId, BROADCAST_ADDR};
pub use crate::message::{IdsMessage, MessageType};
pub use crate::registry::{DeviceRecord, DiscoveredDevice};
pub use crate::session::{SessionError, SessionManager};
pub use crate::transport::{Transport, TransportError};

//! Device classification and status payload decoding.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Device types reported in DEVICE_ID payloads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    LatchingRelay,
    MomentaryHBridge,
    TankSensor,
    RgbLight,
    HvacControl,
    DimmableLight,
    LatchingRelayType2,
    MomentaryHBridgeType2,
    Unknown,
}

impl DeviceType {
    pub fn from_raw(raw: u8) -> DeviceType {
        match raw {
            0x03 => DeviceType::LatchingRelay,
            0x04 => DeviceType::MomentaryHBridge,
            0x0a => DeviceType::TankSensor,
            0x0d => DeviceType::RgbLight,
            0x10 => DeviceType::HvacControl,
            0x14 => DeviceType::DimmableLight,
            0x1e => DeviceType::LatchingRelayType2,
            0x1f => DeviceType::MomentaryHBridgeType2,
            _ => DeviceType::Unknown,
        }
    }

    pub fn raw(&self) -> u8 {
        match *self {
            DeviceType::LatchingRelay => 0x03,
            DeviceType::MomentaryHBridge => 0x04,
            DeviceType::TankSensor => 0x0a,
            DeviceType::RgbLight => 0x0d,
            DeviceType::HvacControl => 0x10,
            DeviceType::DimmableLight => 0x14,
            DeviceType::LatchingRelayType2 => 0x1e,
            DeviceType::MomentaryHBridgeType2 => 0x1f,
            DeviceType::Unknown => 0xff,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, DeviceType::Unknown)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            DeviceType::LatchingRelay => "Latching Relay",
            DeviceType::MomentaryHBridge => "Momentary H-Bridge",
            DeviceType::TankSensor => "Tank Sensor",
            DeviceType::RgbLight => "RGB Light",
            DeviceType::HvacControl => "HVAC Control",
            DeviceType::DimmableLight => "Dimmable Light",
            DeviceType::LatchingRelayType2 => "Latching Relay",
            DeviceType::MomentaryHBridgeType2 => "Momentary H-Bridge",
            DeviceType::Unknown => "Unknown Device",
        }
    }
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Status payload held {got} bytes where {needed} were required.")]
    Truncated { needed: usize, got: usize },
}

/// Output modes shared by the dimmable and RGB lights.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LightMode {
    Off,
    Dimmer,
    Blink,
    Swell,
}

impl LightMode {
    pub fn from_raw(raw: u8) -> Option<LightMode> {
        match raw {
            0 => Some(LightMode::Off),
            1 => Some(LightMode::Dimmer),
            2 => Some(LightMode::Blink),
            3 => Some(LightMode::Swell),
            _ => None,
        }
    }

    pub fn raw(&self) -> u8 {
        match *self {
            LightMode::Off => 0,
            LightMode::Dimmer => 1,
            LightMode::Blink => 2,
            LightMode::Swell => 3,
        }
    }
}

/// Scales a percentage into the 0..=255 range the devices speak.
/// Out-of-range input is clamped.
pub fn percent_to_raw(percent: i32) -> u8 {
    let pct = percent.max(0).min(100) as u32;
    ((pct * 255) / 100) as u8
}

/// Inverse of [`percent_to_raw`], rounding down.
pub fn raw_to_percent(raw: u8) -> u8 {
    ((raw as u32 * 100) / 255) as u8
}

/// Decoded dimmable light status. Short payloads decode the leading fields
/// only, at the same byte positions as the full 8 byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightStatus {
    pub mode: Option<LightMode>,
    pub max_brightness: Option<u8>,
    pub duration: Option<u8>,
    pub current_brightness: Option<u8>,
    pub cycle_t1: Option<u16>,
    pub cycle_t2: Option<u16>,
}

impl LightStatus {
    pub fn decode(payload: &[u8]) -> Result<LightStatus, StatusError> {
        if payload.is_empty() {
            return Err(StatusError::Truncated { needed: 1, got: 0 });
        }
        let mut status = LightStatus {
            mode: LightMode::from_raw(payload[0]),
            max_brightness: None,
            duration: None,
            current_brightness: None,
            cycle_t1: None,
            cycle_t2: None,
        };
        if payload.len() >= 4 {
            status.max_brightness = Some(payload[1]);
            status.duration = Some(payload[2]);
            status.current_brightness = Some(payload[3]);
        }
        if payload.len() >= 8 {
            status.cycle_t1 = Some(BigEndian::read_u16(&payload[4..6]));
            status.cycle_t2 = Some(BigEndian::read_u16(&payload[6..8]));
        }
        Ok(status)
    }
}

/// Type 1 latching relay status, a single byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub on: bool,
    pub fault: bool,
}

impl RelayStatus {
    pub fn decode(payload: &[u8]) -> Result<RelayStatus, StatusError> {
        if payload.is_empty() {
            return Err(StatusError::Truncated { needed: 1, got: 0 });
        }
        Ok(RelayStatus {
            on: payload[0] & 0x01 != 0,
            fault: payload[0] & 0x40 != 0,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RelayState {
    Off,
    On,
    Unknown,
}

/// Type 2 relay / H-bridge status, six bytes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RelayStatusType2 {
    pub state: RelayState,
    pub output_disabled: bool,
    /// Position 0..=100; 255 on the wire means not reported.
    pub position: Option<u8>,
    /// Current draw in amps, 8.8 fixed point on the wire; 0xffff means
    /// unsupported.
    pub current: Option<f32>,
    /// Diagnostic trouble code; 0 on the wire means unknown.
    pub dtc: Option<u16>,
}

impl RelayStatusType2 {
    pub fn decode(payload: &[u8]) -> Result<RelayStatusType2, StatusError> {
        if payload.len() < 6 {
            return Err(StatusError::Truncated {
                needed: 6,
                got: payload.len(),
            });
        }
        let state = match payload[0] & 0x0f {
            0 => RelayState::Off,
            1 => RelayState::On,
            _ => RelayState::Unknown,
        };
        let raw_current = BigEndian::read_u16(&payload[2..4]);
        let raw_dtc = BigEndian::read_u16(&payload[4..6]);
        Ok(RelayStatusType2 {
            state,
            output_disabled: payload[0] & 0x20 != 0,
            position: match payload[1] {
                0xff => None,
                p => Some(p.min(100)),
            },
            current: match raw_current {
                0xffff => None,
                c => Some(c as f32 / 256.0),
            },
            dtc: match raw_dtc {
                0 => None,
                d => Some(d),
            },
        })
    }

    /// A device is faulted when its output is disabled for a recorded
    /// diagnostic reason.
    pub fn faulted(&self) -> bool {
        self.output_disabled && self.dtc.is_some()
    }
}

/// Whether a type 2 relay advertises position reporting in its capability
/// byte.
pub fn position_supported(capabilities: u8) -> bool {
    capabilities & 0x06 != 0
}

/// Tank sensor status: byte 0 is the fill level percentage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TankStatus {
    pub level_percent: u8,
}

impl TankStatus {
    pub fn decode(payload: &[u8]) -> Result<TankStatus, StatusError> {
        if payload.is_empty() {
            return Err(StatusError::Truncated { needed: 1, got: 0 });
        }
        Ok(TankStatus {
            level_percent: payload[0].min(100),
        })
    }
}

//! Protocol level error codes and configuration validation failures.

use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Error codes carried in RESPONSE messages. The set is not exhaustive on
/// the bus; unlisted values are preserved raw.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolCode {
    ConditionsNotCorrect,
    Busy,
    SeedNotRequested,
    KeyNotCorrect,
    SessionNotOpen,
    Timeout,
    Other(u8),
}

impl ProtocolCode {
    pub fn from_raw(raw: u8) -> ProtocolCode {
        match raw {
            0x09 => ProtocolCode::ConditionsNotCorrect,
            0x0b => ProtocolCode::Busy,
            0x0c => ProtocolCode::SeedNotRequested,
            0x0d => ProtocolCode::KeyNotCorrect,
            0x0e => ProtocolCode::SessionNotOpen,
            0x0f => ProtocolCode::Timeout,
            other => ProtocolCode::Other(other),
        }
    }

    pub fn raw(&self) -> u8 {
        match *self {
            ProtocolCode::ConditionsNotCorrect => 0x09,
            ProtocolCode::Busy => 0x0b,
            ProtocolCode::SeedNotRequested => 0x0c,
            ProtocolCode::KeyNotCorrect => 0x0d,
            ProtocolCode::SessionNotOpen => 0x0e,
            ProtocolCode::Timeout => 0x0f,
            ProtocolCode::Other(raw) => raw,
        }
    }
}

impl Display for ProtocolCode {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match *self {
            ProtocolCode::ConditionsNotCorrect => write!(f, "conditions not correct"),
            ProtocolCode::Busy => write!(f, "device busy"),
            ProtocolCode::SeedNotRequested => write!(f, "seed not requested"),
            ProtocolCode::KeyNotCorrect => write!(f, "key not correct"),
            ProtocolCode::SessionNotOpen => write!(f, "session not open"),
            ProtocolCode::Timeout => write!(f, "device side timeout"),
            ProtocolCode::Other(raw) => write!(f, "error code {:#04x}", raw),
        }
    }
}

/// Configuration problems reported at bridge construction. The bridge
/// stays offline until the host corrects them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Source address {0} is outside the usable range 1..=254.")]
    SourceAddressOutOfRange(u8),
    #[error("A TCP connection requires a gateway host name or address.")]
    EmptyHost,
    #[error("A SocketCAN connection requires an interface name.")]
    EmptyInterface,
    #[error("No gateway beacon was received to resolve the default port.")]
    GatewayNotDiscovered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_codes_round_trip() {
        for raw in 0..=0x20u8 {
            assert_eq!(ProtocolCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn known_codes_have_names() {
        assert_eq!(ProtocolCode::from_raw(0x0d), ProtocolCode::KeyNotCorrect);
        assert_eq!(format!("{}", ProtocolCode::KeyNotCorrect), "key not correct");
        assert_eq!(format!("{}", ProtocolCode::Other(0x33)), "error code 0x33");
    }
}

//! The IDS-CAN message layer.
//!
//! Logical `(type, source, target, msg_data, payload)` tuples are packed
//! into the CAN identifier space. Broadcast message types travel on 11 bit
//! standard identifiers, point-to-point types on 29 bit extended ones.
//!
//! Broadcast layout (11 bits): `id = type << 8 | source`.
//!
//! Point-to-point layout (29 bits, high to low): type bits 4..2, source,
//! type bits 1..0, target, msg data.

use thiserror::Error;

use crate::frame::{CanFrame, CanId, FrameError, BROADCAST_ADDR};

/// IDS-CAN message types. The numeric split matters: values below 0x80 are
/// bus-wide broadcasts, values from 0x80 up are point-to-point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    Network,
    CircuitId,
    DeviceId,
    DeviceStatus,
    ProductStatus,
    Time,
    Request,
    Response,
    Command,
    ExtStatus,
    TextConsole,
    /// Sentinel for numeric values this driver does not know.
    Unknown,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> MessageType {
        match raw {
            0 => MessageType::Network,
            1 => MessageType::CircuitId,
            2 => MessageType::DeviceId,
            3 => MessageType::DeviceStatus,
            6 => MessageType::ProductStatus,
            7 => MessageType::Time,
            0x80 => MessageType::Request,
            0x81 => MessageType::Response,
            0x82 => MessageType::Command,
            0x83 => MessageType::ExtStatus,
            0x84 => MessageType::TextConsole,
            _ => MessageType::Unknown,
        }
    }

    pub fn raw(&self) -> u8 {
        match *self {
            MessageType::Network => 0,
            MessageType::CircuitId => 1,
            MessageType::DeviceId => 2,
            MessageType::DeviceStatus => 3,
            MessageType::ProductStatus => 6,
            MessageType::Time => 7,
            MessageType::Request => 0x80,
            MessageType::Response => 0x81,
            MessageType::Command => 0x82,
            MessageType::ExtStatus => 0x83,
            MessageType::TextConsole => 0x84,
            MessageType::Unknown => 0xff,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        !matches!(self, MessageType::Unknown) && self.raw() < 0x80
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message type {0:#04x} is not part of the protocol.")]
    UnknownType(u8),
    #[error("Payload was longer than 8 bytes.")]
    PayloadTooLong,
    #[error("Broadcast message types cannot carry a unicast target.")]
    BroadcastWithTarget,
    #[error("Point-to-point message types require a unicast target.")]
    PointToPointWithoutTarget,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A decoded IDS-CAN message.
///
/// Construction enforces the broadcast invariant: a message is broadcast
/// exactly when its target is the broadcast address, in which case
/// `msg_data` is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdsMessage {
    message_type: MessageType,
    src: u8,
    tgt: u8,
    msg_data: u8,
    payload: [u8; 8],
    payload_len: u8,
}

impl IdsMessage {
    pub fn broadcast(
        message_type: MessageType,
        src: u8,
        payload: &[u8],
    ) -> Result<IdsMessage, MessageError> {
        if !message_type.is_broadcast() {
            return Err(MessageError::PointToPointWithoutTarget);
        }
        Self::build(message_type, src, BROADCAST_ADDR, 0, payload)
    }

    pub fn point_to_point(
        message_type: MessageType,
        src: u8,
        tgt: u8,
        msg_data: u8,
        payload: &[u8],
    ) -> Result<IdsMessage, MessageError> {
        if message_type.is_broadcast() || message_type == MessageType::Unknown {
            return Err(MessageError::BroadcastWithTarget);
        }
        if tgt == BROADCAST_ADDR {
            return Err(MessageError::PointToPointWithoutTarget);
        }
        Self::build(message_type, src, tgt, msg_data, payload)
    }

    fn build(
        message_type: MessageType,
        src: u8,
        tgt: u8,
        msg_data: u8,
        payload: &[u8],
    ) -> Result<IdsMessage, MessageError> {
        if message_type == MessageType::Unknown {
            return Err(MessageError::UnknownType(0xff));
        }
        if payload.len() > 8 {
            return Err(MessageError::PayloadTooLong);
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(IdsMessage {
            message_type,
            src,
            tgt,
            msg_data,
            payload: data,
            payload_len: payload.len() as u8,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn src(&self) -> u8 {
        self.src
    }

    pub fn tgt(&self) -> u8 {
        self.tgt
    }

    pub fn msg_data(&self) -> u8 {
        self.msg_data
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// Packs the message into a CAN frame.
    pub fn to_frame(&self) -> CanFrame {
        let raw = self.message_type.raw() as u32;
        let id = if self.message_type.is_broadcast() {
            CanId::Standard(((raw << 8) | self.src as u32) as u16)
        } else {
            CanId::Extended(
                ((raw & 0x1c) << 24)
                    | ((self.src as u32) << 18)
                    | ((raw & 0x03) << 16)
                    | ((self.tgt as u32) << 8)
                    | self.msg_data as u32,
            )
        };
        // payload length was checked at construction
        CanFrame::new(id, self.payload()).expect("validated payload")
    }

    /// Unpacks a CAN frame into a message. The payload travels unchanged.
    pub fn from_frame(frame: &CanFrame) -> Result<IdsMessage, MessageError> {
        match frame.id() {
            CanId::Standard(id) => {
                let raw = ((id >> 8) & 0x07) as u8;
                let message_type = MessageType::from_raw(raw);
                if message_type == MessageType::Unknown {
                    return Err(MessageError::UnknownType(raw));
                }
                Self::build(message_type, (id & 0xff) as u8, BROADCAST_ADDR, 0, frame.data())
            }
            CanId::Extended(id) => {
                let raw = 0x80 | (((id >> 24) & 0x1c) | ((id >> 16) & 0x03)) as u8;
                let message_type = MessageType::from_raw(raw);
                if message_type == MessageType::Unknown {
                    return Err(MessageError::UnknownType(raw));
                }
                let src = ((id >> 18) & 0xff) as u8;
                let tgt = ((id >> 8) & 0xff) as u8;
                if tgt == BROADCAST_ADDR {
                    return Err(MessageError::PointToPointWithoutTarget);
                }
                Self::build(message_type, src, tgt, (id & 0xff) as u8, frame.data())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_status_packs_to_standard_id() {
        let msg = IdsMessage::broadcast(MessageType::DeviceStatus, 92, &[0x01]).unwrap();
        let frame = msg.to_frame();
        assert_eq!(frame.id(), CanId::Standard(0x35c));
        assert_eq!(frame.data(), &[0x01]);
    }

    #[test]
    fn command_packs_to_extended_id() {
        let payload = [0x01, 0x64, 0, 0, 0, 0, 0, 0];
        let msg = IdsMessage::point_to_point(MessageType::Command, 1, 92, 0, &payload).unwrap();
        let frame = msg.to_frame();
        assert_eq!(
            frame.id(),
            CanId::Extended((1 << 18) | (2 << 16) | (92 << 8))
        );
    }

    #[test]
    fn round_trip_broadcast() {
        let msg = IdsMessage::broadcast(MessageType::Network, 7, &[0, 8, 1, 2, 3, 4, 5, 6]).unwrap();
        let decoded = IdsMessage::from_frame(&msg.to_frame()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.tgt(), BROADCAST_ADDR);
        assert_eq!(decoded.msg_data(), 0);
    }

    #[test]
    fn round_trip_point_to_point() {
        for &message_type in &[
            MessageType::Request,
            MessageType::Response,
            MessageType::Command,
            MessageType::ExtStatus,
            MessageType::TextConsole,
        ] {
            let msg =
                IdsMessage::point_to_point(message_type, 9, 254, 0x42, &[0xaa, 0xbb]).unwrap();
            let decoded = IdsMessage::from_frame(&msg.to_frame()).unwrap();
            assert_eq!(decoded, msg, "{:?}", message_type);
        }
    }

    #[test]
    fn unknown_broadcast_type_is_rejected() {
        // type 5 is unassigned
        let frame = CanFrame::new(CanId::Standard((5 << 8) | 12), &[]).unwrap();
        assert!(matches!(
            IdsMessage::from_frame(&frame),
            Err(MessageError::UnknownType(5))
        ));
    }

    #[test]
    fn broadcast_constructor_rejects_point_to_point_types() {
        assert!(IdsMessage::broadcast(MessageType::Command, 1, &[]).is_err());
        assert!(IdsMessage::point_to_point(MessageType::Network, 1, 2, 0, &[]).is_err());
    }

    #[test]
    fn payload_length_is_enforced() {
        assert!(matches!(
            IdsMessage::broadcast(MessageType::Network, 1, &[0u8; 9]),
            Err(MessageError::PayloadTooLong)
        ));
    }
}

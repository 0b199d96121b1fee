//! Pure encoders for device commands and requests.
//!
//! Builders return raw COMMAND payloads; the message level wrappers attach
//! addressing. Brightness percentages are clamped into 0..=100 before
//! scaling onto the wire range.

use byteorder::{BigEndian, ByteOrder};

use crate::device::{percent_to_raw, LightMode};
use crate::message::{IdsMessage, MessageType};

/// REQUEST code asking a device to broadcast its DEVICE_ID.
pub const MSG_REQUEST_DEVICE_ID: u8 = 0x00;

/// REQUEST code asking a device to broadcast its DEVICE_STATUS.
pub const MSG_REQUEST_DEVICE_STATUS: u8 = 0x01;

/// Momentary H-bridge drive directions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HBridgeAction {
    Stop,
    Forward,
    Reverse,
}

impl HBridgeAction {
    pub fn raw(&self) -> u8 {
        match *self {
            HBridgeAction::Stop => 0,
            HBridgeAction::Forward => 1,
            HBridgeAction::Reverse => 2,
        }
    }
}

/// Full dimmable light command.
///
/// Layout: `[mode][max brightness][duration][current brightness]
/// [cycle1 hi][cycle1 lo][cycle2 hi][cycle2 lo]`.
pub fn light_command(
    mode: LightMode,
    brightness_percent: i32,
    duration: u8,
    cycle_t1: u16,
    cycle_t2: u16,
) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0] = mode.raw();
    payload[1] = percent_to_raw(brightness_percent);
    payload[2] = duration;
    BigEndian::write_u16(&mut payload[4..6], cycle_t1);
    BigEndian::write_u16(&mut payload[6..8], cycle_t2);
    payload
}

pub fn light_on(brightness_percent: i32) -> [u8; 8] {
    light_command(LightMode::Dimmer, brightness_percent, 0, 0, 0)
}

pub fn light_off() -> [u8; 8] {
    light_command(LightMode::Off, 0, 0, 0, 0)
}

pub fn light_blink(brightness_percent: i32, on_time: u16, off_time: u16) -> [u8; 8] {
    light_command(LightMode::Blink, brightness_percent, 0, on_time, off_time)
}

pub fn light_swell(brightness_percent: i32, ramp_up: u16, ramp_down: u16) -> [u8; 8] {
    light_command(LightMode::Swell, brightness_percent, 0, ramp_up, ramp_down)
}

/// RGB light command: the shared light mode set plus a color triple.
pub fn rgb_command(mode: LightMode, r: u8, g: u8, b: u8, brightness_percent: i32) -> [u8; 8] {
    [
        mode.raw(),
        r,
        g,
        b,
        percent_to_raw(brightness_percent),
        0,
        0,
        0,
    ]
}

pub fn relay_command(on: bool) -> [u8; 1] {
    [if on { 1 } else { 0 }]
}

pub fn hbridge_command(action: HBridgeAction) -> [u8; 1] {
    [action.raw()]
}

/// HVAC command. Byte 0 packs heat mode (bits 0..2), heat source
/// (bits 4..5) and fan mode (bits 6..7); bytes 1 and 2 are the low and high
/// trip temperatures.
pub fn hvac_command(heat_mode: u8, heat_source: u8, fan_mode: u8, low: u8, high: u8) -> [u8; 3] {
    [
        (heat_mode.min(7)) | (heat_source.min(3) << 4) | (fan_mode.min(3) << 6),
        low,
        high,
    ]
}

/// Wraps a command payload into a point-to-point COMMAND message.
pub fn device_command(src: u8, tgt: u8, payload: &[u8]) -> IdsMessage {
    IdsMessage::point_to_point(MessageType::Command, src, tgt, 0, payload)
        .expect("command payloads are at most 8 bytes")
}

/// Builds a payloadless REQUEST with the given request code.
pub fn request(src: u8, tgt: u8, code: u8) -> IdsMessage {
    IdsMessage::point_to_point(MessageType::Request, src, tgt, code, &[])
        .expect("empty payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_on_at_half_brightness() {
        assert_eq!(light_on(50), [0x01, 127, 0x00, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn light_off_clears_everything() {
        assert_eq!(light_off(), [0u8; 8]);
    }

    #[test]
    fn light_brightness_is_clamped() {
        assert_eq!(light_on(200)[1], 255);
        assert_eq!(light_on(-1)[1], 0);
    }

    #[test]
    fn blink_cycle_times_are_big_endian() {
        let payload = light_blink(100, 0x1234, 0x5678);
        assert_eq!(payload[0], 0x02);
        assert_eq!(&payload[4..8], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn hvac_packs_all_fields() {
        assert_eq!(hvac_command(1, 1, 1, 68, 72), [0x51, 68, 72]);
    }

    #[test]
    fn hvac_clamps_each_field() {
        let payload = hvac_command(9, 9, 9, 0, 255);
        assert_eq!(payload[0], 7 | (3 << 4) | (3 << 6));
    }

    #[test]
    fn rgb_carries_color_and_brightness() {
        let payload = rgb_command(LightMode::Dimmer, 10, 20, 30, 100);
        assert_eq!(payload, [0x01, 10, 20, 30, 255, 0, 0, 0]);
    }

    #[test]
    fn relay_and_hbridge_single_byte() {
        assert_eq!(relay_command(true), [1]);
        assert_eq!(relay_command(false), [0]);
        assert_eq!(hbridge_command(HBridgeAction::Reverse), [2]);
    }

    #[test]
    fn requests_carry_no_payload() {
        let msg = request(1, 44, MSG_REQUEST_DEVICE_ID);
        assert_eq!(msg.msg_data(), 0x00);
        assert!(msg.payload().is_empty());

        let msg = request(1, 44, MSG_REQUEST_DEVICE_STATUS);
        assert_eq!(msg.msg_data(), 0x01);
    }
}

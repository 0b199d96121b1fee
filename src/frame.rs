use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Address 0 is the bus-wide broadcast address.
pub const BROADCAST_ADDR: u8 = 0;

/// valid bits in a standard frame id
pub const SFF_MASK: u32 = 0x0000_07ff;

/// valid bits in an extended frame id
pub const EFF_MASK: u32 = 0x1fff_ffff;

/// if set in the serialized 32 bit id, indicates 29 bit extended format
pub const EFF_FLAG: u32 = 0x8000_0000;

/// Returns true for addresses a single device can own (1..=254).
pub fn is_unicast(addr: u8) -> bool {
    addr != BROADCAST_ADDR && addr != 0xff
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Provided slice of data was longer than 8 bytes.")]
    TooMuchData,
    #[error("Provided ID was greater than the valid identifier mask.")]
    IdTooLarge,
    #[error("Frame bytes ended before the declared payload length.")]
    Truncated,
    #[error("Frame bytes were empty.")]
    Empty,
}

/// CAN identifier, either 11 bit standard or 29 bit extended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CanId {
    Standard(u16),
    Extended(u32),
}

impl CanId {
    /// Identifier value without the extended flag.
    pub fn raw(&self) -> u32 {
        match *self {
            CanId::Standard(id) => id as u32,
            CanId::Extended(id) => id,
        }
    }

    pub fn is_extended(&self) -> bool {
        match *self {
            CanId::Standard(_) => false,
            CanId::Extended(_) => true,
        }
    }

    /// Serialized 32 bit form with bit 31 signalling extended format.
    pub fn to_wire(&self) -> u32 {
        match *self {
            CanId::Standard(id) => id as u32,
            CanId::Extended(id) => id | EFF_FLAG,
        }
    }

    pub fn from_wire(value: u32) -> CanId {
        if value & EFF_FLAG != 0 {
            CanId::Extended(value & EFF_MASK)
        } else {
            CanId::Standard((value & SFF_MASK) as u16)
        }
    }
}

/// A single CAN 2.0 frame: an identifier plus up to 8 payload bytes.
///
/// Immutable once constructed; construction with more than 8 bytes of
/// payload fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: CanId,
    data: [u8; 8],
    len: u8,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Result<CanFrame, FrameError> {
        if data.len() > 8 {
            return Err(FrameError::TooMuchData);
        }
        match id {
            CanId::Standard(raw) if raw as u32 > SFF_MASK => return Err(FrameError::IdTooLarge),
            CanId::Extended(raw) if raw > EFF_MASK => return Err(FrameError::IdTooLarge),
            _ => {}
        }

        let mut full_data = [0u8; 8];
        full_data[..data.len()].copy_from_slice(data);

        Ok(CanFrame {
            id,
            data: full_data,
            len: data.len() as u8,
        })
    }

    pub fn id(&self) -> CanId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serializes the frame as `[len][id: 2 or 4 bytes BE][data]`.
    ///
    /// Standard identifiers use a 2 byte id field; extended identifiers use
    /// 4 bytes with the high bit set.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.len as usize);
        out.push(self.len);
        match self.id {
            CanId::Standard(id) => {
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, id);
                out.extend_from_slice(&buf);
            }
            CanId::Extended(id) => {
                let mut buf = [0u8; 4];
                BigEndian::write_u32(&mut buf, id | EFF_FLAG);
                out.extend_from_slice(&buf);
            }
        }
        out.extend_from_slice(self.data());
        out
    }

    /// Inverse of [`marshal`](CanFrame::marshal).
    ///
    /// The width of the id field is chosen by the high bit of its first
    /// byte. Declared payload lengths above 8 are rejected.
    pub fn unmarshal(bytes: &[u8]) -> Result<CanFrame, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let len = bytes[0] as usize;
        if len > 8 {
            return Err(FrameError::TooMuchData);
        }
        if bytes.len() < 2 {
            return Err(FrameError::Truncated);
        }

        let (id, data_start) = if bytes[1] & 0x80 != 0 {
            if bytes.len() < 5 {
                return Err(FrameError::Truncated);
            }
            (CanId::Extended(BigEndian::read_u32(&bytes[1..5]) & EFF_MASK), 5)
        } else {
            if bytes.len() < 3 {
                return Err(FrameError::Truncated);
            }
            (CanId::Standard(BigEndian::read_u16(&bytes[1..3]) & SFF_MASK as u16), 3)
        };

        if bytes.len() < data_start + len {
            return Err(FrameError::Truncated);
        }

        CanFrame::new(id, &bytes[data_start..data_start + len])
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ID: {:#x} EXT: {} DATA: {}",
            self.id.raw(),
            self.id.is_extended(),
            hex::encode(self.data())
        )
    }
}

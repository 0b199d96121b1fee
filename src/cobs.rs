//! Byte-stuffed stream framing for the CAN-over-Ethernet gateway.
//!
//! A frame on the wire is `[0x00][stuffed body][0x00]` where the body is the
//! payload plus a trailing CRC-8, re-coded so that no zero byte appears
//! between the delimiters. The stuffing code byte packs two fields: the low
//! 6 bits carry the length of a run of non-zero bytes (at most 63), the high
//! 2 bits carry the number of zero bytes that followed the run (at most 3,
//! one zero per 64 in the code value).

use log::{debug, trace};
use thiserror::Error;

use crate::crc;

/// Frame delimiter; never appears inside a stuffed body.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Longest run of non-zero bytes a single code byte can describe.
pub const MAX_SEGMENT_LENGTH: usize = 63;

/// Longest zero run a single code byte can describe, in code units of 64.
pub const MAX_ZERO_RUN_LENGTH: u8 = 192;

/// Decoder buffer cap. On overflow the oldest bytes are dropped and the
/// decoder resynchronizes on the next delimiter.
const MAX_BUFFERED: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CobsError {
    #[error("Stuffing code ran past the end of the frame body.")]
    BadCode,
    #[error("Frame checksum mismatch (expected {expected:#04x}, found {found:#04x}).")]
    CrcMismatch { expected: u8, found: u8 },
}

/// Encodes `data` into a self-delimited frame, CRC included.
///
/// Empty input encodes to a single delimiter byte.
pub fn encode(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return vec![FRAME_DELIMITER];
    }

    let mut stream = Vec::with_capacity(data.len() + 1);
    stream.extend_from_slice(data);
    stream.push(crc::checksum(data));

    let mut out = Vec::with_capacity(stream.len() + stream.len() / MAX_SEGMENT_LENGTH + 3);
    out.push(FRAME_DELIMITER);

    let mut i = 0;
    while i < stream.len() {
        let start = i;
        while i < stream.len() && stream[i] != 0 && i - start < MAX_SEGMENT_LENGTH {
            i += 1;
        }
        let segment_len = i - start;

        let mut zeros = 0u8;
        while i < stream.len() && stream[i] == 0 && zeros < MAX_ZERO_RUN_LENGTH / 64 {
            zeros += 1;
            i += 1;
        }

        out.push(segment_len as u8 | (zeros << 6));
        out.extend_from_slice(&stream[start..start + segment_len]);
    }

    out.push(FRAME_DELIMITER);
    out
}

/// Reverses the stuffing of one frame body and verifies the trailing CRC.
///
/// An empty body decodes to an empty payload with no checksum to verify.
fn decode_body(body: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut stream = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let code = body[i];
        i += 1;
        let segment_len = (code & 0x3f) as usize;
        let zeros = (code >> 6) as usize;

        if i + segment_len > body.len() {
            return Err(CobsError::BadCode);
        }
        stream.extend_from_slice(&body[i..i + segment_len]);
        i += segment_len;
        stream.extend(std::iter::repeat(0u8).take(zeros));
    }

    if stream.is_empty() {
        return Ok(stream);
    }

    let found = stream.pop().unwrap();
    let expected = crc::checksum(&stream);
    if expected != found {
        return Err(CobsError::CrcMismatch { expected, found });
    }
    Ok(stream)
}

/// Stateful decoder fed arbitrary byte chunks from the stream.
///
/// Complete frames are returned as soon as their closing delimiter arrives;
/// partial frames stay buffered across calls. Bytes received before the
/// first delimiter are discarded.
pub struct CobsDecoder {
    buf: Vec<u8>,
    synced: bool,
}

impl CobsDecoder {
    pub fn new() -> CobsDecoder {
        CobsDecoder {
            buf: Vec::new(),
            synced: false,
        }
    }

    /// Feeds `bytes` into the decoder and returns every payload whose frame
    /// completed. Frames that fail the CRC or carry a bad stuffing code are
    /// dropped. Empty frames (two adjacent delimiters) yield an empty
    /// payload; callers are expected to skip those.
    pub fn decode_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            debug!("framing buffer overflow, dropping {} stale bytes", excess);
            self.buf.drain(..excess);
            self.synced = false;
        }

        let mut payloads = Vec::new();
        loop {
            if !self.synced {
                match self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                    Some(pos) => {
                        if pos > 0 {
                            trace!("discarding {} bytes ahead of frame start", pos);
                        }
                        self.buf.drain(..=pos);
                        self.synced = true;
                    }
                    None => {
                        self.buf.clear();
                        return payloads;
                    }
                }
            }

            let end = match self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(pos) => pos,
                None => return payloads,
            };

            let body: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            match decode_body(&body) {
                Ok(payload) => payloads.push(payload),
                Err(e) => debug!("dropping malformed frame: {}", e),
            }
        }
    }

    /// Drops all buffered bytes and the synchronization state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.synced = false;
    }

    /// Number of bytes currently held for an incomplete frame.
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }
}

impl Default for CobsDecoder {
    fn default() -> CobsDecoder {
        CobsDecoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_a_single_delimiter() {
        assert_eq!(encode(&[]), vec![0x00]);
    }

    #[test]
    fn empty_frame_decodes_to_empty_payload() {
        let mut decoder = CobsDecoder::new();
        let payloads = decoder.decode_bytes(&[0x00, 0x00]);
        assert_eq!(payloads, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn encoded_frames_contain_no_interior_zeros() {
        let data = [0x00u8, 0x01, 0x00, 0x00, 0x02, 0x00];
        let encoded = encode(&data);
        assert_eq!(*encoded.first().unwrap(), 0x00);
        assert_eq!(*encoded.last().unwrap(), 0x00);
        assert!(encoded[1..encoded.len() - 1].iter().all(|&b| b != 0x00));
    }

    #[test]
    fn round_trip_various_lengths() {
        for len in 1..300usize {
            let data: Vec<u8> = (0..len).map(|i| (i % 7) as u8).collect();
            let mut decoder = CobsDecoder::new();
            let payloads = decoder.decode_bytes(&encode(&data));
            assert_eq!(payloads, vec![data], "length {}", len);
        }
    }

    #[test]
    fn round_trip_long_zero_runs() {
        for zeros in 1..10usize {
            let mut data = vec![0x42u8];
            data.extend(std::iter::repeat(0u8).take(zeros));
            data.push(0x43);
            let mut decoder = CobsDecoder::new();
            let payloads = decoder.decode_bytes(&encode(&data));
            assert_eq!(payloads, vec![data], "{} zeros", zeros);
        }
    }

    #[test]
    fn decode_survives_arbitrary_chunking() {
        let a = [0x01u8, 0x00, 0x02, 0x03];
        let b = [0xffu8; 70];
        let mut stream = encode(&a);
        stream.extend_from_slice(&encode(&b));

        for split in 0..stream.len() {
            let mut decoder = CobsDecoder::new();
            let mut payloads = decoder.decode_bytes(&stream[..split]);
            payloads.extend(decoder.decode_bytes(&stream[split..]));
            let non_empty: Vec<_> = payloads.into_iter().filter(|p| !p.is_empty()).collect();
            assert_eq!(non_empty, vec![a.to_vec(), b.to_vec()], "split {}", split);
        }
    }

    #[test]
    fn corrupted_frame_is_dropped() {
        let mut encoded = encode(&[0x10, 0x20, 0x30]);
        encoded[2] ^= 0x01;
        let mut decoder = CobsDecoder::new();
        assert!(decoder.decode_bytes(&encoded).is_empty());

        // the decoder recovers on the next well-formed frame
        let payloads = decoder.decode_bytes(&encode(&[0x44]));
        let non_empty: Vec<_> = payloads.into_iter().filter(|p| !p.is_empty()).collect();
        assert_eq!(non_empty, vec![vec![0x44]]);
    }

    #[test]
    fn garbage_before_first_delimiter_is_skipped() {
        let mut stream = vec![0xde, 0xad, 0xbe];
        stream.extend_from_slice(&encode(&[0x05, 0x06]));
        let mut decoder = CobsDecoder::new();
        let payloads = decoder.decode_bytes(&stream);
        assert_eq!(payloads, vec![vec![0x05, 0x06]]);
    }

    #[test]
    fn reset_drops_buffered_bytes() {
        let mut decoder = CobsDecoder::new();
        decoder.decode_bytes(&[0x00, 0x01]);
        assert!(decoder.buffer_size() > 0);
        decoder.reset();
        assert_eq!(decoder.buffer_size(), 0);
    }
}

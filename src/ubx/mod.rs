//! u-blox UBX binary protocol support.
//!
//! Framing: `0xB5 0x62 | class | id | length (u16 LE) | payload | ck_a ck_b`
//! where the checksum is the 8 bit Fletcher variant computed over everything
//! from the class byte to the end of the payload.

pub mod commands;
pub mod nav;

use byteorder::{ByteOrder, LittleEndian};

use crate::framing::{FrameBuffer, FrameError};

/// First sync byte (the UTF-8 µ glyph).
pub const SYNC_BYTE1: u8 = 0xB5;
/// Second sync byte (ASCII 'b').
pub const SYNC_BYTE2: u8 = 0x62;

/// Decode buffer size for serial connections.
pub const UBX_BUFFER_SIZE: usize = 1024;

// Message class bytes
pub const CLASS_NAV: u8 = 0x01;
pub const CLASS_ACK: u8 = 0x05;
pub const CLASS_CFG: u8 = 0x06;
pub const CLASS_MON: u8 = 0x0A;

// NAV message IDs handled explicitly
pub const NAV_PVT: u8 = 0x07;
pub const NAV_SAT: u8 = 0x35;
pub const NAV_TIMEUTC: u8 = 0x21;

/// A complete UBX message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UbxFrame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl UbxFrame {
    pub fn new(class: u8, id: u8, payload: Vec<u8>) -> Self {
        UbxFrame { class, id, payload }
    }

    /// 8 bit Fletcher checksum over class, id, length and payload.
    pub fn checksum(&self) -> (u8, u8) {
        let mut a: u8 = 0;
        let mut b: u8 = 0;
        let len = self.payload.len() as u16;
        let head = [self.class, self.id, (len & 0xFF) as u8, (len >> 8) as u8];
        for &byte in head.iter().chain(self.payload.iter()) {
            a = a.wrapping_add(byte);
            b = b.wrapping_add(a);
        }
        (a, b)
    }

    /// Serialise in transmission order. The checksum trailer is written for
    /// every message, including those with empty payloads.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.push(SYNC_BYTE1);
        out.push(SYNC_BYTE2);
        out.push(self.class);
        out.push(self.id);
        let len = self.payload.len() as u16;
        out.push((len & 0xFF) as u8);
        out.push((len >> 8) as u8);
        out.extend_from_slice(&self.payload);
        let (ck_a, ck_b) = self.checksum();
        out.push(ck_a);
        out.push(ck_b);
        out
    }
}

/// Streaming UBX decoder holding the rolling buffer state.
pub struct UbxReader {
    fb: FrameBuffer,
}

impl Default for UbxReader {
    fn default() -> Self {
        Self::new()
    }
}

impl UbxReader {
    pub fn new() -> Self {
        UbxReader { fb: FrameBuffer::new(UBX_BUFFER_SIZE) }
    }

    /// Pull bytes from `source` and try to decode the next message.
    pub fn read_frame(&mut self, source: &mut impl std::io::Read) -> Result<UbxFrame, FrameError> {
        let got = self.fb.fill(source)?;
        let result = self.scan(got);
        self.fb.compact();
        result
    }

    fn scan(&mut self, got: usize) -> Result<UbxFrame, FrameError> {
        let starved = |got: usize| {
            if got == 0 {
                FrameError::ZeroRead
            } else {
                FrameError::NeedMore
            }
        };

        if !self.fb.seek_sync(|b| b == SYNC_BYTE1) {
            return Err(starved(got));
        }
        if self.fb.available() < 8 {
            return Err(starved(got));
        }

        let data = self.fb.data();
        if data[1] != SYNC_BYTE2 {
            // First sync byte without the second: resynchronise
            self.fb.skip_byte();
            return Err(FrameError::NeedMore);
        }
        let class = data[2];
        let id = data[3];
        let length = LittleEndian::read_u16(&data[4..6]) as usize;

        if length + 8 > self.fb.capacity() {
            // Cannot ever buffer a message this long; claimed length is junk
            self.fb.skip_byte();
            return Err(FrameError::Invalid);
        }
        if self.fb.available() < length + 8 {
            // Leave the cursor so we resume from the same sync position
            return Err(starved(got));
        }

        let data = self.fb.data();
        let frame = UbxFrame::new(class, id, data[6..6 + length].to_vec());
        let (ck_a, ck_b) = frame.checksum();
        if ck_a == data[6 + length] && ck_b == data[7 + length] {
            self.fb.consume(8 + length);
            Ok(frame)
        } else {
            self.fb.skip_byte();
            Err(FrameError::Invalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // ACK-ACK for a CFG-PRT write: class 05, id 01, payload 06 01
    const ACK: [u8; 10] = [0xB5, 0x62, 0x05, 0x01, 0x02, 0x00, 0x06, 0x01, 0x0F, 0x38];

    #[test]
    fn decode_single_message() {
        let mut reader = UbxReader::new();
        let mut src = Cursor::new(ACK.to_vec());
        let frame = reader.read_frame(&mut src).unwrap();
        assert_eq!(frame.class, 0x05);
        assert_eq!(frame.id, 0x01);
        assert_eq!(frame.payload, vec![0x06, 0x01]);
        assert_eq!(frame.checksum(), (0x0F, 0x38));
    }

    #[test]
    fn leading_garbage_is_consumed_silently() {
        let mut stream = vec![0x00];
        stream.extend_from_slice(&ACK);
        let mut reader = UbxReader::new();
        let mut src = Cursor::new(stream);
        let frame = reader.read_frame(&mut src).unwrap();
        assert_eq!((frame.class, frame.id), (0x05, 0x01));
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        for flip in 2..ACK.len() {
            let mut bytes = ACK.to_vec();
            bytes[flip] ^= 0x01;
            let mut reader = UbxReader::new();
            let mut src = Cursor::new(bytes);
            match reader.read_frame(&mut src) {
                Err(FrameError::Invalid) | Err(FrameError::NeedMore) | Err(FrameError::ZeroRead) => {}
                other => panic!("corrupted frame decoded: {other:?}"),
            }
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = UbxFrame::new(0x06, 0x08, vec![0xF4, 0x01, 0x01, 0x00, 0x00, 0x00]);
        let bytes = frame.to_bytes();
        let mut reader = UbxReader::new();
        let mut src = Cursor::new(bytes);
        assert_eq!(reader.read_frame(&mut src).unwrap(), frame);
    }

    #[test]
    fn zero_length_payload_keeps_trailer() {
        let poll = UbxFrame::new(0x0A, 0x04, Vec::new());
        let bytes = poll.to_bytes();
        assert_eq!(bytes.len(), 8);
        let (ck_a, ck_b) = poll.checksum();
        assert_eq!(&bytes[6..], &[ck_a, ck_b]);
        // And it must decode again
        let mut reader = UbxReader::new();
        let mut src = Cursor::new(bytes);
        assert_eq!(reader.read_frame(&mut src).unwrap(), poll);
    }

    #[test]
    fn split_reads_resume() {
        let (first, second) = ACK.split_at(5);
        let mut reader = UbxReader::new();
        let mut src = Cursor::new(first.to_vec());
        assert!(matches!(
            reader.read_frame(&mut src),
            Err(FrameError::NeedMore) | Err(FrameError::ZeroRead)
        ));
        let mut src = Cursor::new(second.to_vec());
        let frame = reader.read_frame(&mut src).unwrap();
        assert_eq!((frame.class, frame.id), (0x05, 0x01));
    }
}

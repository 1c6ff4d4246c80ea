//! NMEA 2000 support via the Actisense serial gateway framing.
//!
//! Gateway frames are byte stuffed: a message starts with `ESC SOT N2K`
//! (`0x10 0x02 0x93`) and ends with `ESC EOT` (`0x10 0x03`). Any literal
//! `0x10` inside the data is doubled. The checksum byte is chosen so that
//! the sum of every message byte from the `N2K` marker through the checksum
//! itself is zero modulo 256.

pub mod pgn;

use byteorder::{ByteOrder, LittleEndian};

use crate::framing::{FrameBuffer, FrameError};

pub const ACT_ESC: u8 = 0x10;
pub const ACT_SOT: u8 = 0x02;
pub const ACT_EOT: u8 = 0x03;
pub const ACT_N2K: u8 = 0x93;

/// Smallest possible frame: header, fixed fields, checksum and trailer.
pub const MIN_FRAME: usize = 18;

/// Decode buffer size for serial connections.
pub const N2K_BUFFER_SIZE: usize = 1024;

/// One NMEA 2000 message as delivered by the gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct N2kMessage {
    pub priority: u8,
    /// 24 bit parameter group number.
    pub pgn: u32,
    pub dst: u8,
    pub src: u8,
    /// Gateway timestamp, milliseconds.
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl N2kMessage {
    /// Serialise to gateway framing, escaping data bytes and appending the
    /// checksum and trailer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + MIN_FRAME + 4);
        out.push(ACT_ESC);
        out.push(ACT_SOT);
        out.push(ACT_N2K);
        // length counts the fixed fields plus unescaped data
        out.push(11 + self.data.len() as u8);
        out.push(self.priority);
        out.push((self.pgn & 0xFF) as u8);
        out.push(((self.pgn >> 8) & 0xFF) as u8);
        out.push(((self.pgn >> 16) & 0xFF) as u8);
        out.push(self.dst);
        out.push(self.src);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push(self.data.len() as u8);
        for &b in &self.data {
            out.push(b);
            if b == ACT_ESC {
                out.push(ACT_ESC);
            }
        }
        // Checksum over everything from the N2K marker, excluding stuffing
        let mut cs: u8 = ACT_N2K;
        cs = cs.wrapping_add(11 + self.data.len() as u8);
        cs = cs.wrapping_add(self.priority);
        cs = cs.wrapping_add((self.pgn & 0xFF) as u8);
        cs = cs.wrapping_add(((self.pgn >> 8) & 0xFF) as u8);
        cs = cs.wrapping_add(((self.pgn >> 16) & 0xFF) as u8);
        cs = cs.wrapping_add(self.dst);
        cs = cs.wrapping_add(self.src);
        for b in self.timestamp.to_le_bytes() {
            cs = cs.wrapping_add(b);
        }
        cs = cs.wrapping_add(self.data.len() as u8);
        for &b in &self.data {
            cs = cs.wrapping_add(b);
        }
        out.push(cs.wrapping_neg());
        out.push(ACT_ESC);
        out.push(ACT_EOT);
        out
    }
}

/// Result of attempting to parse one frame from a buffer.
enum Parse {
    /// Complete frame; `consumed` bytes can be discarded.
    Message { msg: N2kMessage, consumed: usize },
    /// Nothing decodable yet; `discard` bytes are known garbage.
    NeedMore { discard: usize },
    /// A frame was found but is unusable; skip `discard` bytes and rescan.
    Invalid { discard: usize },
}

fn parse(buf: &[u8]) -> Parse {
    // Find the frame start
    let mut start = 0;
    loop {
        if start + MIN_FRAME > buf.len() {
            return Parse::NeedMore { discard: start };
        }
        if buf[start] == ACT_ESC && buf[start + 1] == ACT_SOT && buf[start + 2] == ACT_N2K {
            break;
        }
        start += 1;
    }

    let frame = &buf[start..];
    let mut msg = N2kMessage {
        priority: frame[4],
        pgn: frame[5] as u32 | ((frame[6] as u32) << 8) | ((frame[7] as u32) << 16),
        dst: frame[8],
        src: frame[9],
        timestamp: LittleEndian::read_u32(&frame[10..14]),
        data: Vec::new(),
    };
    let datalen = frame[14] as usize;
    msg.data.reserve(datalen);

    let mut cs: u8 = 0;
    for &b in &frame[2..15] {
        cs = cs.wrapping_add(b);
    }

    // Unescape the data region
    let mut off = 15;
    while msg.data.len() < datalen {
        if off + 1 > frame.len() {
            return Parse::NeedMore { discard: start };
        }
        let c = frame[off];
        off += 1;
        if c == ACT_ESC {
            if off >= frame.len() {
                return Parse::NeedMore { discard: start };
            }
            let next = frame[off];
            off += 1;
            match next {
                ACT_ESC => {
                    msg.data.push(ACT_ESC);
                    cs = cs.wrapping_add(ACT_ESC);
                }
                ACT_EOT => {
                    // Frame terminated inside the data region: drop the
                    // message and resume scanning after the terminator
                    log::debug!("N2K frame truncated by ESC EOT inside data");
                    return Parse::Invalid { discard: start + off };
                }
                ACT_SOT => {
                    // A new frame appears to have started; rescan from its
                    // escape byte
                    log::debug!("N2K frame interrupted by ESC SOT inside data");
                    return Parse::Invalid { discard: start + off - 2 };
                }
                _ => {
                    log::debug!("Invalid N2K escape sequence 0x10 0x{next:02x}");
                    return Parse::Invalid { discard: start + 1 };
                }
            }
        } else {
            msg.data.push(c);
            cs = cs.wrapping_add(c);
        }
    }

    // Checksum byte plus ESC EOT trailer
    if off + 3 > frame.len() {
        return Parse::NeedMore { discard: start };
    }
    let csum = frame[off];
    off += 1;
    let ee = frame[off];
    let et = frame[off + 1];
    off += 2;
    if !(ee == ACT_ESC && et == ACT_EOT) {
        if et == ACT_ESC && off < frame.len() && frame[off] == ACT_EOT {
            // ESC ESC EOT: overzealous escaping of the trailer
            off += 1;
        } else {
            log::debug!("Unexpected sequence at end of N2K message: 0x{ee:02x} 0x{et:02x}");
        }
    }

    if cs.wrapping_add(csum) != 0 {
        log::debug!(
            "Bad N2K checksum ({} => {}, PGN {})",
            msg.src,
            msg.dst,
            msg.pgn
        );
        return Parse::Invalid { discard: start + off };
    }

    Parse::Message { msg, consumed: start + off }
}

/// Streaming Actisense decoder holding the rolling buffer state.
pub struct N2kReader {
    fb: FrameBuffer,
}

impl Default for N2kReader {
    fn default() -> Self {
        Self::new()
    }
}

impl N2kReader {
    pub fn new() -> Self {
        N2kReader { fb: FrameBuffer::new(N2K_BUFFER_SIZE) }
    }

    /// Pull bytes from `source` and try to decode the next message.
    pub fn read_message(
        &mut self,
        source: &mut impl std::io::Read,
    ) -> Result<N2kMessage, FrameError> {
        let got = self.fb.fill(source)?;
        let result = match parse(self.fb.data()) {
            Parse::Message { msg, consumed } => {
                self.fb.consume(consumed);
                Ok(msg)
            }
            Parse::NeedMore { discard } => {
                self.fb.consume(discard);
                if self.fb.available() >= self.fb.capacity() - 1 {
                    // A full buffer always holds a complete valid frame, so
                    // whatever is pinning the cursor is junk
                    self.fb.skip_byte();
                    Err(FrameError::Invalid)
                } else if got == 0 {
                    Err(FrameError::ZeroRead)
                } else {
                    Err(FrameError::NeedMore)
                }
            }
            Parse::Invalid { discard } => {
                self.fb.consume(discard);
                Err(FrameError::Invalid)
            }
        };
        self.fb.compact();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> N2kMessage {
        N2kMessage {
            priority: 2,
            pgn: 129025,
            dst: 255,
            src: 3,
            timestamp: 0x01020304,
            data: vec![0x64, 0x00, 0x00, 0x20, 0xC8, 0x01, 0x00, 0x40],
        }
    }

    fn read_one(bytes: &[u8]) -> Result<N2kMessage, FrameError> {
        let mut reader = N2kReader::new();
        let mut src = Cursor::new(bytes.to_vec());
        loop {
            match reader.read_message(&mut src) {
                Err(FrameError::NeedMore) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = sample();
        assert_eq!(read_one(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn escaped_data_bytes_round_trip() {
        let mut msg = sample();
        msg.data = vec![ACT_ESC, 0x00, ACT_ESC, ACT_ESC];
        let bytes = msg.to_bytes();
        // Stuffing doubled every ESC in the data region
        assert_eq!(read_one(&bytes).unwrap(), msg);
    }

    #[test]
    fn checksum_corruption_is_detected() {
        let msg = sample();
        let mut bytes = msg.to_bytes();
        // Flip a payload byte without touching framing
        bytes[16] ^= 0x01;
        assert!(matches!(read_one(&bytes), Err(FrameError::Invalid)));
    }

    #[test]
    fn esc_eot_inside_data_drops_message_and_resumes() {
        let msg = sample();
        let mut stream = msg.to_bytes();
        // Truncate mid-data and splice in a premature terminator, followed
        // by a complete good message
        stream.truncate(17);
        stream.push(ACT_ESC);
        stream.push(ACT_EOT);
        stream.extend(msg.to_bytes());

        let mut reader = N2kReader::new();
        let mut src = Cursor::new(stream);
        let mut results = Vec::new();
        loop {
            match reader.read_message(&mut src) {
                Ok(m) => results.push(m),
                Err(FrameError::ZeroRead) => break,
                Err(_) => continue,
            }
        }
        assert_eq!(results, vec![msg]);
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let msg = sample();
        let mut stream = vec![0xAA, 0x10, 0x00, 0x55];
        stream.extend(msg.to_bytes());
        assert_eq!(read_one(&stream).unwrap(), msg);
    }

    #[test]
    fn split_reads_resume() {
        let msg = sample();
        let bytes = msg.to_bytes();
        let (first, second) = bytes.split_at(10);
        let mut reader = N2kReader::new();
        let mut src = Cursor::new(first.to_vec());
        assert!(reader.read_message(&mut src).is_err());
        let mut src = Cursor::new(second.to_vec());
        let mut out = None;
        for _ in 0..4 {
            if let Ok(m) = reader.read_message(&mut src) {
                out = Some(m);
                break;
            }
        }
        assert_eq!(out, Some(msg));
    }
}

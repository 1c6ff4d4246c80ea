//! The native MessagePack message envelope.
//!
//! Every record, both on the wire from native sources and in the output
//! files, is a MessagePack array of four elements:
//!
//! 1. the positive fixint `0x55`, which together with the four element
//!    array marker `0x94` forms a two byte frame signature,
//! 2. the source ID (0-127),
//! 3. the channel ID (0-127),
//! 4. a type dependent payload: float, positive integer (timestamp),
//!    string, binary, array of strings or array of floats.
//!
//! There is no checksum; the frame signature is the only resynchronisation
//! aid.

use std::io::{Cursor, Write};

use crate::framing::{FrameBuffer, FrameError};
use crate::message::{DataValue, Message, ID_MAX};
use crate::strarray::{LogString, StringArray};

/// MessagePack marker for a four element array.
pub const SYNC_BYTE1: u8 = 0x94;
/// Fixed integer 85, the first array element.
pub const SYNC_BYTE2: u8 = 0x55;

/// Default decode buffer size for serial connected native sources.
pub const MP_BUFFER_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message type cannot be serialized")]
    Unrepresentable,
    #[error("source or channel ID out of range")]
    IdRange,
    #[error("truncated envelope")]
    Truncated,
    #[error("malformed envelope")]
    Malformed,
    #[error("write failed: {0}")]
    Write(#[from] rmp::encode::ValueWriteError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialise one message into `out`.
///
/// `Undefined` and `ErrorStatus` payloads are not representable on the wire
/// and are rejected.
pub fn encode(msg: &Message, out: &mut impl Write) -> Result<(), EnvelopeError> {
    if msg.source > ID_MAX || msg.channel > ID_MAX {
        return Err(EnvelopeError::IdRange);
    }
    rmp::encode::write_array_len(out, 4)?;
    rmp::encode::write_pfix(out, SYNC_BYTE2)?;
    rmp::encode::write_pfix(out, msg.source)?;
    rmp::encode::write_pfix(out, msg.channel)?;
    match &msg.value {
        DataValue::Float(v) => {
            rmp::encode::write_f32(out, *v)?;
        }
        DataValue::Timestamp(t) => {
            rmp::encode::write_uint(out, *t as u64)?;
        }
        DataValue::Bytes(b) => {
            rmp::encode::write_bin_len(out, b.len() as u32)?;
            out.write_all(b)?;
        }
        DataValue::Str(s) => {
            write_log_string(out, s)?;
        }
        DataValue::StrArray(sa) => {
            rmp::encode::write_array_len(out, sa.entries() as u32)?;
            for s in sa.iter() {
                write_log_string(out, s)?;
            }
        }
        DataValue::FloatArray(fa) => {
            rmp::encode::write_array_len(out, fa.len() as u32)?;
            for v in fa {
                rmp::encode::write_f32(out, *v)?;
            }
        }
        DataValue::Undefined | DataValue::ErrorStatus(_) => {
            return Err(EnvelopeError::Unrepresentable);
        }
    }
    Ok(())
}

fn write_log_string(out: &mut impl Write, s: &LogString) -> Result<(), EnvelopeError> {
    rmp::encode::write_str_len(out, s.len() as u32)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

/// Serialise one message to a fresh buffer.
pub fn encode_vec(msg: &Message) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::with_capacity(16 + msg.len());
    encode(msg, &mut out)?;
    Ok(out)
}

/// Decode a single envelope from the front of `data`.
///
/// Returns the message and the number of bytes consumed. `Truncated` means
/// the buffer may hold a valid prefix of a message and the caller should
/// retry with more data; `Malformed` means the bytes at the front cannot be
/// a valid envelope.
pub fn decode(data: &[u8]) -> Result<(Message, usize), EnvelopeError> {
    let mut cursor = Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| {
        let truncated = match &e {
            rmpv::decode::Error::InvalidMarkerRead(io)
            | rmpv::decode::Error::InvalidDataRead(io) => {
                io.kind() == std::io::ErrorKind::UnexpectedEof
            }
            #[allow(unreachable_patterns)]
            _ => false,
        };
        if truncated {
            EnvelopeError::Truncated
        } else {
            EnvelopeError::Malformed
        }
    })?;
    let consumed = cursor.position() as usize;

    let items = match value {
        rmpv::Value::Array(items) if items.len() == 4 => items,
        _ => return Err(EnvelopeError::Malformed),
    };
    if items[0].as_u64() != Some(SYNC_BYTE2 as u64) {
        return Err(EnvelopeError::Malformed);
    }
    let source = match items[1].as_u64() {
        Some(v) if v <= ID_MAX as u64 => v as u8,
        _ => return Err(EnvelopeError::Malformed),
    };
    let channel = match items[2].as_u64() {
        Some(v) if v <= ID_MAX as u64 => v as u8,
        _ => return Err(EnvelopeError::Malformed),
    };

    let value = match &items[3] {
        rmpv::Value::F32(v) => DataValue::Float(*v),
        // Tolerated for compatibility with wide encoders
        rmpv::Value::F64(v) => DataValue::Float(*v as f32),
        rmpv::Value::Integer(i) => match i.as_u64() {
            Some(v) if v <= u32::MAX as u64 => DataValue::Timestamp(v as u32),
            _ => return Err(EnvelopeError::Malformed),
        },
        rmpv::Value::String(s) => DataValue::Str(LogString::from_bytes(s.as_bytes())),
        rmpv::Value::Binary(b) => DataValue::Bytes(b.clone()),
        rmpv::Value::Array(entries) => decode_payload_array(entries)?,
        _ => return Err(EnvelopeError::Malformed),
    };

    Ok((Message { source, channel, value }, consumed))
}

fn decode_payload_array(entries: &[rmpv::Value]) -> Result<DataValue, EnvelopeError> {
    // Discriminate on the first element: arrays are homogeneous
    match entries.first() {
        None => Ok(DataValue::FloatArray(Vec::new())),
        Some(rmpv::Value::String(_)) => {
            let mut sa = StringArray::new(entries.len());
            for (ix, entry) in entries.iter().enumerate() {
                match entry {
                    rmpv::Value::String(s) => {
                        sa.set_entry(ix, &LogString::from_bytes(s.as_bytes()));
                    }
                    _ => return Err(EnvelopeError::Malformed),
                }
            }
            Ok(DataValue::StrArray(sa))
        }
        Some(rmpv::Value::F32(_)) | Some(rmpv::Value::F64(_)) => {
            let mut fa = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    rmpv::Value::F32(v) => fa.push(*v),
                    rmpv::Value::F64(v) => fa.push(*v as f32),
                    _ => return Err(EnvelopeError::Malformed),
                }
            }
            Ok(DataValue::FloatArray(fa))
        }
        _ => Err(EnvelopeError::Malformed),
    }
}

/// Streaming envelope reader with the shared rolling buffer discipline.
pub struct MpReader {
    fb: FrameBuffer,
}

impl Default for MpReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MpReader {
    pub fn new() -> Self {
        MpReader { fb: FrameBuffer::new(MP_BUFFER_SIZE) }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MpReader { fb: FrameBuffer::new(capacity) }
    }

    /// Pull bytes from `source` and try to decode the next envelope.
    pub fn read_message(&mut self, source: &mut impl std::io::Read) -> Result<Message, FrameError> {
        let got = self.fb.fill(source)?;
        let result = self.scan(got);
        self.fb.compact();
        result
    }

    fn scan(&mut self, got: usize) -> Result<Message, FrameError> {
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
        if self.fb.data()[1] != SYNC_BYTE2 {
            self.fb.skip_byte();
            return Err(FrameError::NeedMore);
        }
        match decode(self.fb.data()) {
            Ok((msg, consumed)) => {
                self.fb.consume(consumed);
                Ok(msg)
            }
            Err(EnvelopeError::Truncated) => {
                if self.fb.available() >= self.fb.capacity() - 1 {
                    // Claimed payload larger than the buffer can ever hold
                    self.fb.skip_byte();
                    Err(FrameError::Invalid)
                } else {
                    Err(starved(got))
                }
            }
            Err(_) => {
                self.fb.skip_byte();
                Err(FrameError::Invalid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_signature() {
        let msg = Message::new_timestamp(0x02, 0x02, 1234);
        let buf = encode_vec(&msg).unwrap();
        assert_eq!(&buf[..2], &[SYNC_BYTE1, SYNC_BYTE2]);
    }

    #[test]
    fn float_round_trip_is_bit_identical() {
        let msg = Message::new_float(0x41, 0x04, 1.5);
        let buf = encode_vec(&msg).unwrap();
        let (back, consumed) = decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(back, msg);
        // Re-encoding must reproduce the original bytes exactly
        assert_eq!(encode_vec(&back).unwrap(), buf);
    }

    #[test]
    fn all_dtypes_round_trip() {
        let mut sa = StringArray::new(3);
        sa.create_entry(0, "Name");
        sa.create_entry(1, "Channels");
        let msgs = vec![
            Message::new_timestamp(0x02, 0x02, u32::MAX),
            Message::new_bytes(0x10, 0x03, &[0xB5, 0x62, 0x00]),
            Message::new_string(0x30, 0x00, "Observer"),
            Message::new_string_array(0x30, 0x01, &sa),
            Message::new_float_array(0x10, 0x04, &[1.0, -2.5, 3.25]),
        ];
        for msg in msgs {
            let buf = encode_vec(&msg).unwrap();
            let (back, consumed) = decode(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn error_status_is_unrepresentable() {
        let msg = Message::error_status(0xEE);
        assert!(matches!(
            encode_vec(&msg),
            Err(EnvelopeError::Unrepresentable)
        ));
        let undef = Message { source: 0, channel: 0, value: DataValue::Undefined };
        assert!(matches!(
            encode_vec(&undef),
            Err(EnvelopeError::Unrepresentable)
        ));
    }

    #[test]
    fn truncated_input_asks_for_more() {
        let msg = Message::new_string(0x60, 0x00, "A somewhat longer source name");
        let buf = encode_vec(&msg).unwrap();
        assert!(matches!(
            decode(&buf[..buf.len() - 3]),
            Err(EnvelopeError::Truncated)
        ));
    }

    #[test]
    fn reader_skips_leading_garbage() {
        let msg = Message::new_float(0x41, 0x04, 3.25);
        let mut stream = vec![0x00, 0x11, 0x94, 0x00];
        stream.extend(encode_vec(&msg).unwrap());
        let mut reader = MpReader::new();
        let mut src = Cursor::new(stream);
        // First calls consume garbage, eventually the message appears
        let mut found = None;
        for _ in 0..8 {
            match reader.read_message(&mut src) {
                Ok(m) => {
                    found = Some(m);
                    break;
                }
                Err(e) if e.is_recoverable() => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(found, Some(msg));
    }

    #[test]
    fn reader_sequence_of_messages() {
        let a = Message::new_timestamp(0x02, 0x02, 1);
        let b = Message::new_timestamp(0x02, 0x02, 2);
        let mut stream = encode_vec(&a).unwrap();
        stream.extend(encode_vec(&b).unwrap());
        let mut reader = MpReader::new();
        let mut src = Cursor::new(stream);
        assert_eq!(reader.read_message(&mut src).unwrap(), a);
        assert_eq!(reader.read_message(&mut src).unwrap(), b);
        assert!(matches!(
            reader.read_message(&mut src),
            Err(FrameError::ZeroRead)
        ));
    }
}

//! The unified in-process message type.
//!
//! Every source normalises its decoded output into [`Message`] values before
//! pushing them onto the shared queue. A message carries a 7 bit source ID, a
//! 7 bit channel ID and a tagged payload value.
//!
//! Channel IDs 0-3 and 0x7D-0x7F are reserved in every source's channel map;
//! see the constants below.

use std::fmt;

use crate::strarray::{LogString, StringArray};

// Reserved channel IDs, common to all sources
pub const CHAN_NAME: u8 = 0x00; // Source name
pub const CHAN_MAP: u8 = 0x01; // Channel name map
pub const CHAN_TSTAMP: u8 = 0x02; // Monotonic timestamp, milliseconds
pub const CHAN_RAW: u8 = 0x03; // Raw source bytes
pub const CHAN_LOG_INFO: u8 = 0x7D;
pub const CHAN_LOG_WARN: u8 = 0x7E;
pub const CHAN_LOG_ERR: u8 = 0x7F;

// Conventional source ID range bases. Offsets 0-15 within each family are
// assigned from the `sourcenum` configuration key.
pub const SOURCE_LOGGER: u8 = 0x00;
pub const SOURCE_LOCAL: u8 = 0x01;
pub const SOURCE_TIMER: u8 = 0x02;
pub const SOURCE_GPS: u8 = 0x10;
pub const SOURCE_ADC: u8 = 0x20;
pub const SOURCE_NMEA: u8 = 0x30;
pub const SOURCE_I2C: u8 = 0x40;
pub const SOURCE_N2K: u8 = 0x50;
pub const SOURCE_EXT: u8 = 0x60;

/// Highest valid source or channel ID.
pub const ID_MAX: u8 = 0x7F;

/// Tagged payload carried by a [`Message`].
///
/// `ErrorStatus` is used by decoders to report status codes in band while a
/// partial message is being assembled. It must never be enqueued for output;
/// the writer will refuse to serialise it.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Undefined,
    ErrorStatus(u8),
    Float(f32),
    Timestamp(u32),
    Bytes(Vec<u8>),
    Str(LogString),
    StrArray(StringArray),
    FloatArray(Vec<f32>),
}

impl DataValue {
    /// Element count for arrays, byte count for bytes/strings, 1 otherwise.
    pub fn len(&self) -> usize {
        match self {
            DataValue::Bytes(b) => b.len(),
            DataValue::Str(s) => s.len(),
            DataValue::StrArray(sa) => sa.entries(),
            DataValue::FloatArray(fa) => fa.len(),
            _ => 1,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single logged sample or metadata record.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub source: u8,
    pub channel: u8,
    pub value: DataValue,
}

impl Message {
    #[inline]
    pub fn new_float(source: u8, channel: u8, value: f32) -> Self {
        Message { source, channel, value: DataValue::Float(value) }
    }

    #[inline]
    pub fn new_timestamp(source: u8, channel: u8, ts: u32) -> Self {
        Message { source, channel, value: DataValue::Timestamp(ts) }
    }

    #[inline]
    pub fn new_bytes(source: u8, channel: u8, bytes: &[u8]) -> Self {
        Message { source, channel, value: DataValue::Bytes(bytes.to_vec()) }
    }

    #[inline]
    pub fn new_string(source: u8, channel: u8, s: &str) -> Self {
        Message { source, channel, value: DataValue::Str(LogString::from(s)) }
    }

    #[inline]
    pub fn new_string_array(source: u8, channel: u8, sa: &StringArray) -> Self {
        Message { source, channel, value: DataValue::StrArray(sa.clone()) }
    }

    #[inline]
    pub fn new_float_array(source: u8, channel: u8, fa: &[f32]) -> Self {
        Message { source, channel, value: DataValue::FloatArray(fa.to_vec()) }
    }

    #[inline]
    pub fn error_status(code: u8) -> Self {
        Message { source: SOURCE_LOGGER, channel: 0, value: DataValue::ErrorStatus(code) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// True if `source` falls within one of the conventional ID ranges listed in
/// the module documentation. IDs outside the convention are permitted but
/// sources should warn when assigned one.
pub fn source_in_convention(source: u8) -> bool {
    source <= SOURCE_EXT + 0x0F
}

impl fmt::Display for Message {
    /// Single line debug rendering, used by the dump utility. Not a wire
    /// format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}:0x{:02x}\t", self.source, self.channel)?;
        match &self.value {
            DataValue::Undefined => write!(f, "undefined"),
            DataValue::ErrorStatus(c) => write!(f, "error status 0x{c:02x}"),
            DataValue::Float(v) => write!(f, "{v}"),
            DataValue::Timestamp(t) => write!(f, "@{t}"),
            DataValue::Bytes(b) => {
                write!(f, "{} bytes:", b.len())?;
                for byte in b.iter().take(16) {
                    write!(f, " {byte:02x}")?;
                }
                if b.len() > 16 {
                    write!(f, " ...")?;
                }
                Ok(())
            }
            DataValue::Str(s) => write!(f, "{s}"),
            DataValue::StrArray(sa) => {
                let names: Vec<_> = sa.iter().map(|s| s.to_string_lossy()).collect();
                write!(f, "[{}]", names.join("/"))
            }
            DataValue::FloatArray(fa) => {
                let vals: Vec<_> = fa.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", vals.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_follow_dtype() {
        assert_eq!(Message::new_float(1, 4, 1.5).len(), 1);
        assert_eq!(Message::new_bytes(1, 3, &[1, 2, 3]).len(), 3);
        assert_eq!(Message::new_string(1, 0, "name").len(), 4);
        let fa = Message::new_float_array(1, 5, &[0.0, 1.0]);
        assert_eq!(fa.len(), 2);
        let sa = StringArray::new(5);
        assert_eq!(Message::new_string_array(1, 1, &sa).len(), 5);
    }

    #[test]
    fn convention_ranges() {
        assert!(source_in_convention(SOURCE_TIMER));
        assert!(source_in_convention(SOURCE_GPS + 5));
        assert!(source_in_convention(SOURCE_EXT + 0x0F));
        assert!(!source_in_convention(0x70));
        assert!(!source_in_convention(0x7F));
    }

    #[test]
    fn display_is_single_line() {
        let m = Message::new_float_array(0x41, 0x04, &[1.0, 2.0]);
        let rendered = format!("{m}");
        assert!(!rendered.contains('\n'));
        assert!(rendered.starts_with("0x41:0x04"));
    }
}

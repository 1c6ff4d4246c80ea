//! LPMS inertial measurement unit protocol support.
//!
//! Framing: `0x3A | id (u16 LE) | command (u16 LE) | length (u16 LE) |
//! data | checksum (u16 LE) | 0x0D 0x0A`. The checksum is the 16 bit sum of
//! every byte from the id field through the last data byte.
//!
//! The contents of an IMU data packet depend entirely on which outputs the
//! unit has been configured to transmit, so the enabled-outputs bitmask must
//! be known before any data packet can be interpreted.

use byteorder::{ByteOrder, LittleEndian};

use crate::framing::{FrameBuffer, FrameError};

pub const LPMS_START: u8 = 0x3A;
pub const LPMS_END1: u8 = 0x0D;
pub const LPMS_END2: u8 = 0x0A;

/// Decode buffer size for serial connections.
pub const LPMS_BUFFER_SIZE: usize = 1024;

// Command words used by the logger
pub const CMD_REPLY_ACK: u16 = 0x00;
pub const CMD_REPLY_NAK: u16 = 0x01;
pub const CMD_MODE_COMMAND: u16 = 0x06;
pub const CMD_MODE_STREAM: u16 = 0x07;
pub const CMD_GET_IMUDATA: u16 = 0x09;
pub const CMD_GET_SENSORMODEL: u16 = 0x14;
pub const CMD_GET_FIRMWAREVER: u16 = 0x15;
pub const CMD_GET_SERIALNUM: u16 = 0x16;
pub const CMD_SET_OUTPUTS: u16 = 0x1E;
pub const CMD_GET_OUTPUTS: u16 = 0x1F;
pub const CMD_SET_FREQ: u16 = 0x22;
pub const CMD_GET_FREQ: u16 = 0x23;

bitflags::bitflags! {
    /// Enabled-outputs bitmask, as reported by a GET_OUTPUTS reply.
    ///
    /// The bit positions are fixed by the sensor firmware; note the gaps.
    pub struct ImuOutputs: u32 {
        const ACCEL_RAW    = 1 << 0;
        const ACCEL_CAL    = 1 << 1;
        const GYRO_RAW     = 1 << 3;
        const GYRO_CAL     = 1 << 5;
        const GYRO_ALIGNED = 1 << 7;
        const MAG_RAW      = 1 << 8;
        const MAG_CAL      = 1 << 9;
        const OMEGA        = 1 << 10;
        const QUATERNION   = 1 << 11;
        const EULER        = 1 << 12;
        const ACCEL_LINEAR = 1 << 13;
        const PRESSURE     = 1 << 14;
        const ALTITUDE     = 1 << 15;
        const TEMPERATURE  = 1 << 16;
    }
}

/// One LPMS message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LpmsFrame {
    /// Source/destination sensor ID.
    pub id: u16,
    pub command: u16,
    pub data: Vec<u8>,
    /// Checksum as transmitted. Compare against [`computed_checksum`].
    ///
    /// [`computed_checksum`]: LpmsFrame::computed_checksum
    pub checksum: u16,
}

impl LpmsFrame {
    pub fn new(id: u16, command: u16, data: Vec<u8>) -> Self {
        let mut frame = LpmsFrame { id, command, data, checksum: 0 };
        frame.checksum = frame.computed_checksum();
        frame
    }

    /// 16 bit sum of id, command, length and data bytes.
    pub fn computed_checksum(&self) -> u16 {
        let mut cs: u16 = 0;
        let len = self.data.len() as u16;
        for b in self
            .id
            .to_le_bytes()
            .iter()
            .chain(self.command.to_le_bytes().iter())
            .chain(len.to_le_bytes().iter())
            .chain(self.data.iter())
        {
            cs = cs.wrapping_add(*b as u16);
        }
        cs
    }

    #[inline(always)]
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.computed_checksum()
    }

    /// Serialise in transmission order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 11);
        out.push(LPMS_START);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(LPMS_END1);
        out.push(LPMS_END2);
        out
    }
}

/// Streaming LPMS decoder holding the rolling buffer state.
pub struct LpmsReader {
    fb: FrameBuffer,
}

impl Default for LpmsReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LpmsReader {
    pub fn new() -> Self {
        LpmsReader { fb: FrameBuffer::new(LPMS_BUFFER_SIZE) }
    }

    /// Pull bytes from `source` and try to decode the next frame. Checksums
    /// are not validated here; callers check [`LpmsFrame::checksum_ok`] so
    /// that mismatches can be counted rather than silently resynced.
    pub fn read_frame(&mut self, source: &mut impl std::io::Read) -> Result<LpmsFrame, FrameError> {
        let got = self.fb.fill(source)?;
        let result = self.scan(got);
        self.fb.compact();
        result
    }

    fn scan(&mut self, got: usize) -> Result<LpmsFrame, FrameError> {
        let starved = |got: usize| {
            if got == 0 {
                FrameError::ZeroRead
            } else {
                FrameError::NeedMore
            }
        };

        if !self.fb.seek_sync(|b| b == LPMS_START) {
            return Err(starved(got));
        }
        if self.fb.available() < 11 {
            return Err(starved(got));
        }

        let data = self.fb.data();
        let id = LittleEndian::read_u16(&data[1..3]);
        let command = LittleEndian::read_u16(&data[3..5]);
        let length = LittleEndian::read_u16(&data[5..7]) as usize;

        if length + 11 > self.fb.capacity() {
            self.fb.skip_byte();
            return Err(FrameError::Invalid);
        }
        if self.fb.available() < length + 11 {
            return Err(starved(got));
        }

        let data = self.fb.data();
        let checksum = LittleEndian::read_u16(&data[7 + length..9 + length]);
        if data[9 + length] != LPMS_END1 || data[10 + length] != LPMS_END2 {
            self.fb.skip_byte();
            return Err(FrameError::Invalid);
        }
        let frame = LpmsFrame {
            id,
            command,
            data: data[7..7 + length].to_vec(),
            checksum,
        };
        self.fb.consume(11 + length);
        Ok(frame)
    }
}

/// Decoded IMU data packet. Sections are present only when the
/// corresponding output bit was set at parse time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImuData {
    /// Sensor timestamp, counted in 2.5 ms increments on most firmware.
    pub timestamp: u32,
    pub accel_raw: Option<[f32; 3]>,
    pub accel_cal: Option<[f32; 3]>,
    pub gyro_raw: Option<[f32; 3]>,
    pub gyro_cal: Option<[f32; 3]>,
    pub gyro_aligned: Option<[f32; 3]>,
    pub mag_raw: Option<[f32; 3]>,
    pub mag_cal: Option<[f32; 3]>,
    pub omega: Option<[f32; 3]>,
    pub quaternion: Option<[f32; 4]>,
    pub euler: Option<[f32; 3]>,
    pub accel_linear: Option<[f32; 3]>,
    pub pressure: Option<f32>,
    pub altitude: Option<f32>,
    pub temperature: Option<f32>,
}

struct SectionWalker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionWalker<'a> {
    fn vec3(&mut self) -> Option<[f32; 3]> {
        if self.data.len() < self.pos + 12 {
            return None;
        }
        let mut out = [0f32; 3];
        for (ix, v) in out.iter_mut().enumerate() {
            *v = LittleEndian::read_f32(&self.data[self.pos + 4 * ix..]);
        }
        self.pos += 12;
        Some(out)
    }

    fn vec4(&mut self) -> Option<[f32; 4]> {
        if self.data.len() < self.pos + 16 {
            return None;
        }
        let mut out = [0f32; 4];
        for (ix, v) in out.iter_mut().enumerate() {
            *v = LittleEndian::read_f32(&self.data[self.pos + 4 * ix..]);
        }
        self.pos += 16;
        Some(out)
    }

    fn scalar(&mut self) -> Option<f32> {
        if self.data.len() < self.pos + 4 {
            return None;
        }
        let v = LittleEndian::read_f32(&self.data[self.pos..]);
        self.pos += 4;
        Some(v)
    }
}

/// Interpret a GET_IMUDATA frame according to the cached outputs bitmask.
///
/// Sections appear on the wire in a fixed order with fixed widths; each one
/// is present iff its bit is set in `outputs`. Returns `None` for other
/// commands or when the payload is shorter than the mask requires.
pub fn parse_imu_data(frame: &LpmsFrame, outputs: ImuOutputs) -> Option<ImuData> {
    if frame.command != CMD_GET_IMUDATA || frame.data.len() < 4 {
        return None;
    }
    let mut out = ImuData {
        timestamp: LittleEndian::read_u32(&frame.data[0..4]),
        ..ImuData::default()
    };
    let mut walk = SectionWalker { data: &frame.data, pos: 4 };

    if outputs.contains(ImuOutputs::ACCEL_RAW) {
        out.accel_raw = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::ACCEL_CAL) {
        out.accel_cal = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::GYRO_RAW) {
        out.gyro_raw = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::GYRO_CAL) {
        out.gyro_cal = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::GYRO_ALIGNED) {
        out.gyro_aligned = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::MAG_RAW) {
        out.mag_raw = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::MAG_CAL) {
        out.mag_cal = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::OMEGA) {
        out.omega = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::QUATERNION) {
        out.quaternion = Some(walk.vec4()?);
    }
    if outputs.contains(ImuOutputs::EULER) {
        out.euler = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::ACCEL_LINEAR) {
        out.accel_linear = Some(walk.vec3()?);
    }
    if outputs.contains(ImuOutputs::PRESSURE) {
        out.pressure = Some(walk.scalar()?);
    }
    if outputs.contains(ImuOutputs::ALTITUDE) {
        out.altitude = Some(walk.scalar()?);
    }
    if outputs.contains(ImuOutputs::TEMPERATURE) {
        out.temperature = Some(walk.scalar()?);
    }
    Some(out)
}

// Command frame constructors

pub fn command_mode(id: u16) -> LpmsFrame {
    LpmsFrame::new(id, CMD_MODE_COMMAND, Vec::new())
}

pub fn stream_mode(id: u16) -> LpmsFrame {
    LpmsFrame::new(id, CMD_MODE_STREAM, Vec::new())
}

pub fn get_outputs(id: u16) -> LpmsFrame {
    LpmsFrame::new(id, CMD_GET_OUTPUTS, Vec::new())
}

pub fn set_outputs(id: u16, outputs: ImuOutputs) -> LpmsFrame {
    LpmsFrame::new(id, CMD_SET_OUTPUTS, outputs.bits().to_le_bytes().to_vec())
}

pub fn set_rate(id: u16, hz: u32) -> LpmsFrame {
    LpmsFrame::new(id, CMD_SET_FREQ, hz.to_le_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let frame = LpmsFrame::new(1, CMD_SET_FREQ, vec![10, 0, 0, 0]);
        assert!(frame.checksum_ok());
        let bytes = frame.to_bytes();
        let mut reader = LpmsReader::new();
        let mut src = Cursor::new(bytes);
        let back = reader.read_frame(&mut src).unwrap();
        assert_eq!(back, frame);
        assert!(back.checksum_ok());
    }

    #[test]
    fn corrupted_data_fails_checksum() {
        let frame = LpmsFrame::new(1, CMD_GET_IMUDATA, vec![1, 2, 3, 4]);
        let mut bytes = frame.to_bytes();
        bytes[8] ^= 0x01;
        let mut reader = LpmsReader::new();
        let mut src = Cursor::new(bytes);
        let back = reader.read_frame(&mut src).unwrap();
        assert!(!back.checksum_ok());
    }

    #[test]
    fn bad_trailer_resyncs() {
        let frame = LpmsFrame::new(1, CMD_MODE_STREAM, Vec::new());
        let mut bytes = frame.to_bytes();
        let n = bytes.len();
        bytes[n - 1] = 0x00;
        let mut reader = LpmsReader::new();
        let mut src = Cursor::new(bytes);
        assert!(matches!(
            reader.read_frame(&mut src),
            Err(FrameError::Invalid)
        ));
    }

    #[test]
    fn imu_data_section_walk() {
        let outputs = ImuOutputs::ACCEL_CAL | ImuOutputs::EULER | ImuOutputs::ALTITUDE;
        let mut data = Vec::new();
        data.extend(1000u32.to_le_bytes());
        for v in [1.0f32, 2.0, 3.0] {
            data.extend(v.to_le_bytes());
        }
        for v in [10.0f32, 20.0, 30.0] {
            data.extend(v.to_le_bytes());
        }
        data.extend(99.5f32.to_le_bytes());
        let frame = LpmsFrame::new(1, CMD_GET_IMUDATA, data);
        let imu = parse_imu_data(&frame, outputs).unwrap();
        assert_eq!(imu.timestamp, 1000);
        assert_eq!(imu.accel_cal, Some([1.0, 2.0, 3.0]));
        assert_eq!(imu.euler, Some([10.0, 20.0, 30.0]));
        assert_eq!(imu.altitude, Some(99.5));
        // Sections not in the mask stay absent
        assert!(imu.accel_raw.is_none());
        assert!(imu.quaternion.is_none());
        assert!(imu.pressure.is_none());
    }

    #[test]
    fn imu_data_too_short_for_mask() {
        let outputs = ImuOutputs::ACCEL_RAW | ImuOutputs::QUATERNION;
        let mut data = Vec::new();
        data.extend(0u32.to_le_bytes());
        for v in [0f32; 3] {
            data.extend(v.to_le_bytes());
        }
        // Quaternion section missing entirely
        let frame = LpmsFrame::new(1, CMD_GET_IMUDATA, data);
        assert!(parse_imu_data(&frame, outputs).is_none());
    }

    #[test]
    fn command_constructors_are_valid() {
        for frame in [
            command_mode(1),
            stream_mode(1),
            get_outputs(1),
            set_outputs(1, ImuOutputs::ACCEL_CAL | ImuOutputs::EULER),
            set_rate(1, 100),
        ] {
            let mut reader = LpmsReader::new();
            let mut src = Cursor::new(frame.to_bytes());
            let back = reader.read_frame(&mut src).unwrap();
            assert_eq!(back, frame);
            assert!(back.checksum_ok());
        }
    }
}

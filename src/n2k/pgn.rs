//! Field extraction for the parameter groups handled as first class values.
//!
//! All multi-byte fields are little endian. The sentinel values `i16::MAX`
//! and `i32::MAX` (and all-ones for unsigned fields) mean "not available"
//! and are mapped to NaN in the returned floats.

use byteorder::{ByteOrder, LittleEndian};

use super::N2kMessage;

/// Scale factor for angular fields stored as 1e-4 radian integers.
pub const N2K_TO_DEGREES: f64 = 0.005_729_577_951_308_233_2;

#[inline]
fn get_u8(n: &N2kMessage, offset: usize) -> u8 {
    n.data[offset]
}

#[inline]
fn get_i16(n: &N2kMessage, offset: usize) -> i16 {
    LittleEndian::read_i16(&n.data[offset..offset + 2])
}

#[inline]
fn get_u16(n: &N2kMessage, offset: usize) -> u16 {
    LittleEndian::read_u16(&n.data[offset..offset + 2])
}

#[inline]
fn get_i32(n: &N2kMessage, offset: usize) -> i32 {
    LittleEndian::read_i32(&n.data[offset..offset + 4])
}

#[inline]
fn get_u32(n: &N2kMessage, offset: usize) -> u32 {
    LittleEndian::read_u32(&n.data[offset..offset + 4])
}

#[inline]
fn get_i64(n: &N2kMessage, offset: usize) -> i64 {
    LittleEndian::read_i64(&n.data[offset..offset + 8])
}

fn angle_deg(raw: i16) -> f64 {
    if raw == i16::MAX {
        f64::NAN
    } else {
        raw as f64 * N2K_TO_DEGREES
    }
}

fn check(n: &N2kMessage, pgn: u32, min_len: usize) -> bool {
    n.pgn == pgn && n.data.len() >= min_len
}

/// PGN 60928: ISO address claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressClaim {
    pub unique_number: u32,
    pub manufacturer: u16,
    pub device_function: u8,
    pub device_class: u8,
    pub industry_group: u8,
}

pub fn address_claim(n: &N2kMessage) -> Option<AddressClaim> {
    if !check(n, 60928, 8) {
        return None;
    }
    let head = get_u32(n, 0);
    Some(AddressClaim {
        unique_number: head & 0x001F_FFFF,
        manufacturer: ((head >> 21) & 0x07FF) as u16,
        device_function: get_u8(n, 5),
        device_class: (get_u8(n, 6) >> 1) & 0x7F,
        industry_group: (get_u8(n, 7) >> 4) & 0x07,
    })
}

/// PGN 127250: vessel heading. Angles in degrees.
pub fn heading(n: &N2kMessage) -> Option<(u8, f64, f64, f64, u8)> {
    if !check(n, 127250, 8) {
        return None;
    }
    let seq = get_u8(n, 0);
    let heading = {
        let raw = get_u16(n, 1);
        if raw == u16::MAX {
            f64::NAN
        } else {
            raw as f64 * N2K_TO_DEGREES
        }
    };
    let deviation = angle_deg(get_i16(n, 3));
    let variation = angle_deg(get_i16(n, 5));
    let reference = get_u8(n, 7) & 0x03;
    Some((seq, heading, deviation, variation, reference))
}

/// PGN 127251: rate of turn, degrees/second.
pub fn rate_of_turn(n: &N2kMessage) -> Option<(u8, f64)> {
    if !check(n, 127251, 5) {
        return None;
    }
    let seq = get_u8(n, 0);
    let raw = get_i32(n, 1);
    let rate = if raw == i32::MAX {
        f64::NAN
    } else {
        // 1/32 * 1e-6 radians per second resolution
        raw as f64 * 3.125e-8 * 180.0 / std::f64::consts::PI
    };
    Some((seq, rate))
}

/// PGN 127257: attitude. Yaw, pitch and roll in degrees.
pub fn attitude(n: &N2kMessage) -> Option<(u8, f64, f64, f64)> {
    if !check(n, 127257, 7) {
        return None;
    }
    Some((
        get_u8(n, 0),
        angle_deg(get_i16(n, 1)),
        angle_deg(get_i16(n, 3)),
        angle_deg(get_i16(n, 5)),
    ))
}

/// PGN 128267: water depth. Depth in metres, transducer offset in metres.
pub fn water_depth(n: &N2kMessage) -> Option<(u8, f64, f64)> {
    if !check(n, 128267, 7) {
        return None;
    }
    let seq = get_u8(n, 0);
    let raw = get_u32(n, 1);
    let depth = if raw == u32::MAX { f64::NAN } else { raw as f64 * 0.01 };
    let offraw = get_i16(n, 5);
    let offset = if offraw == i16::MAX { f64::NAN } else { offraw as f64 * 0.001 };
    Some((seq, depth, offset))
}

/// PGN 129025: position rapid update. Latitude and longitude in degrees.
pub fn position(n: &N2kMessage) -> Option<(f64, f64)> {
    if !check(n, 129025, 8) {
        return None;
    }
    let lat = get_i32(n, 0);
    let lon = get_i32(n, 4);
    let lat = if lat == i32::MAX { f64::NAN } else { lat as f64 * 1e-7 };
    let lon = if lon == i32::MAX { f64::NAN } else { lon as f64 * 1e-7 };
    Some((lat, lon))
}

/// PGN 129026: COG and SOG rapid update. Course in degrees, speed in m/s.
pub fn cog_sog(n: &N2kMessage) -> Option<(u8, u8, f64, f64)> {
    if !check(n, 129026, 8) {
        return None;
    }
    let seq = get_u8(n, 0);
    let reference = get_u8(n, 1) & 0x03;
    let course = angle_deg(get_i16(n, 2));
    let sraw = get_i16(n, 4);
    let speed = if sraw == i16::MAX { f64::NAN } else { sraw as f64 * 0.01 };
    Some((seq, reference, course, speed))
}

/// PGN 129029: GNSS position data. Degrees and metres.
pub fn gnss_position(n: &N2kMessage) -> Option<(u8, f64, f64, f64)> {
    if !check(n, 129029, 31) {
        return None;
    }
    let seq = get_u8(n, 0);
    let conv = |raw: i64, scale: f64| {
        if raw == i64::MAX {
            f64::NAN
        } else {
            raw as f64 * scale
        }
    };
    let lat = conv(get_i64(n, 7), 1e-16);
    let lon = conv(get_i64(n, 15), 1e-16);
    let alt = conv(get_i64(n, 23), 1e-6);
    Some((seq, lat, lon, alt))
}

/// PGN 129033: date and time. Returns Unix epoch seconds and the local
/// offset in minutes.
pub fn date_time(n: &N2kMessage) -> Option<(f64, i16)> {
    if !check(n, 129033, 8) {
        return None;
    }
    let days = get_u16(n, 0);
    let seconds = get_u32(n, 2);
    if days == u16::MAX || seconds == u32::MAX {
        return None;
    }
    let epoch = days as f64 * 86400.0 + seconds as f64 * 1e-4;
    Some((epoch, get_i16(n, 6)))
}

/// PGN 130306: wind data. Speed in m/s, angle in degrees.
pub fn wind(n: &N2kMessage) -> Option<(u8, u8, f64, f64)> {
    if !check(n, 130306, 6) {
        return None;
    }
    let seq = get_u8(n, 0);
    let sraw = get_i16(n, 1);
    let speed = if sraw == i16::MAX { f64::NAN } else { sraw as f64 * 0.01 };
    let angle = angle_deg(get_i16(n, 3));
    let reference = get_u8(n, 5) & 0x07;
    Some((seq, reference, speed, angle))
}

/// PGN 130311: environmental parameters. Temperature in Celsius, humidity
/// in percent, pressure in Pascal.
pub fn environmental(n: &N2kMessage) -> Option<(u8, f64, f64, f64)> {
    if !check(n, 130311, 8) {
        return None;
    }
    let seq = get_u8(n, 0);
    let traw = get_u16(n, 2);
    let temperature = if traw == u16::MAX {
        f64::NAN
    } else {
        traw as f64 * 0.01 - 273.15
    };
    let hraw = get_i16(n, 4);
    let humidity = if hraw == i16::MAX { f64::NAN } else { hraw as f64 * 0.004 };
    let praw = get_u16(n, 6);
    let pressure = if praw == u16::MAX { f64::NAN } else { praw as f64 * 100.0 };
    Some((seq, temperature, humidity, pressure))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(pgn: u32, data: Vec<u8>) -> N2kMessage {
        N2kMessage { pgn, data, ..N2kMessage::default() }
    }

    #[test]
    fn position_scaling_and_sentinels() {
        let mut data = Vec::new();
        data.extend(516070000i32.to_le_bytes()); // 51.607 degrees
        data.extend((-38975000i32).to_le_bytes()); // -3.8975 degrees
        let (lat, lon) = position(&msg(129025, data)).unwrap();
        assert!((lat - 51.607).abs() < 1e-6);
        assert!((lon + 3.8975).abs() < 1e-6);

        let mut data = Vec::new();
        data.extend(i32::MAX.to_le_bytes());
        data.extend(0i32.to_le_bytes());
        let (lat, lon) = position(&msg(129025, data)).unwrap();
        assert!(lat.is_nan());
        assert_eq!(lon, 0.0);
    }

    #[test]
    fn attitude_uses_degree_factor() {
        let mut data = vec![7u8];
        data.extend(5236i16.to_le_bytes()); // ~30 degrees in 1e-4 rad
        data.extend(0i16.to_le_bytes());
        data.extend(i16::MAX.to_le_bytes());
        let (seq, yaw, pitch, roll) = attitude(&msg(127257, data)).unwrap();
        assert_eq!(seq, 7);
        assert!((yaw - 30.0).abs() < 0.01);
        assert_eq!(pitch, 0.0);
        assert!(roll.is_nan());
    }

    #[test]
    fn wind_fields() {
        let mut data = vec![1u8];
        data.extend(250i16.to_le_bytes()); // 2.5 m/s
        data.extend(15708i16.to_le_bytes()); // ~90 degrees
        data.push(0x02); // apparent
        let (seq, reference, speed, angle) = wind(&msg(130306, data)).unwrap();
        assert_eq!((seq, reference), (1, 2));
        assert!((speed - 2.5).abs() < 1e-9);
        assert!((angle - 90.0).abs() < 0.01);
    }

    #[test]
    fn wrong_pgn_returns_none() {
        assert!(position(&msg(127257, vec![0; 8])).is_none());
        assert!(attitude(&msg(129025, vec![0; 8])).is_none());
        assert!(wind(&msg(130306, vec![0; 3])).is_none());
    }

    #[test]
    fn environmental_temperature_is_kelvin_scaled() {
        let mut data = vec![0u8, 0u8];
        data.extend(29515u16.to_le_bytes()); // 295.15 K = 22 C
        data.extend(12500i16.to_le_bytes()); // 50 %
        data.extend(1013u16.to_le_bytes()); // 101300 Pa
        let (_, temp, humidity, pressure) = environmental(&msg(130311, data)).unwrap();
        assert!((temp - 22.0).abs() < 1e-6);
        assert!((humidity - 50.0).abs() < 1e-9);
        assert!((pressure - 101300.0).abs() < 1e-9);
    }

    #[test]
    fn address_claim_bit_unpacking() {
        let head: u32 = (0x123u32 << 21) | 0x1ABCD;
        let mut data = Vec::new();
        data.extend(head.to_le_bytes());
        data.extend_from_slice(&[0x00, 150, 70 << 1, 4 << 4]);
        let claim = address_claim(&msg(60928, data)).unwrap();
        assert_eq!(claim.unique_number, 0x1ABCD);
        assert_eq!(claim.manufacturer, 0x123);
        assert_eq!(claim.device_function, 150);
        assert_eq!(claim.device_class, 70);
        assert_eq!(claim.industry_group, 4);
    }
}

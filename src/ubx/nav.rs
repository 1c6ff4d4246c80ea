//! Decoded UBX navigation messages.

use byteorder::{ByteOrder, LittleEndian};

use super::{UbxFrame, CLASS_NAV, NAV_PVT, NAV_TIMEUTC};

/// Decoded NAV-PVT (position/velocity/time) message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NavPvt {
    pub tow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub valid_date: bool,
    pub valid_time: bool,
    pub accuracy: u32,
    pub nanosecond: i32,
    pub fix_type: u8,
    pub fix_flags: u8,
    pub num_sv: u8,
    pub longitude: f32,
    pub latitude: f32,
    /// WGS84 ellipsoid height, mm
    pub height: i32,
    /// Height above mean sea level, mm
    pub asl: i32,
    /// Horizontal accuracy estimate, mm
    pub horiz_acc: u32,
    /// Vertical accuracy estimate, mm
    pub vert_acc: u32,
    /// NED velocities, mm/s
    pub north_v: i32,
    pub east_v: i32,
    pub down_v: i32,
    pub ground_speed: i32,
    /// Motion heading, degrees
    pub heading: f32,
    pub speed_acc: i32,
    pub heading_acc: f32,
}

impl NavPvt {
    /// Decode from a NAV-PVT frame. Returns `None` for other messages or a
    /// short payload.
    pub fn decode(frame: &UbxFrame) -> Option<NavPvt> {
        if frame.class != CLASS_NAV || frame.id != NAV_PVT || frame.payload.len() < 92 {
            return None;
        }
        let p = &frame.payload;
        let valid = p[11];
        Some(NavPvt {
            tow: LittleEndian::read_u32(&p[0..4]),
            year: LittleEndian::read_u16(&p[4..6]),
            month: p[6],
            day: p[7],
            hour: p[8],
            minute: p[9],
            second: p[10],
            valid_date: (valid & 0x01) != 0,
            valid_time: (valid & 0x02) != 0,
            accuracy: LittleEndian::read_u32(&p[12..16]),
            nanosecond: LittleEndian::read_i32(&p[16..20]),
            fix_type: p[20],
            fix_flags: p[21],
            num_sv: p[23],
            longitude: LittleEndian::read_i32(&p[24..28]) as f32 * 1e-7,
            latitude: LittleEndian::read_i32(&p[28..32]) as f32 * 1e-7,
            height: LittleEndian::read_i32(&p[32..36]),
            asl: LittleEndian::read_i32(&p[36..40]),
            horiz_acc: LittleEndian::read_u32(&p[40..44]),
            vert_acc: LittleEndian::read_u32(&p[44..48]),
            north_v: LittleEndian::read_i32(&p[48..52]),
            east_v: LittleEndian::read_i32(&p[52..56]),
            down_v: LittleEndian::read_i32(&p[56..60]),
            ground_speed: LittleEndian::read_i32(&p[60..64]),
            heading: LittleEndian::read_i32(&p[64..68]) as f32 * 1e-5,
            speed_acc: LittleEndian::read_i32(&p[68..72]),
            heading_acc: LittleEndian::read_u32(&p[72..76]) as f32 * 1e-5,
        })
    }
}

/// GPS time of week from a NAV-TIMEUTC payload (first four bytes, LE).
pub fn timeutc_tow(frame: &UbxFrame) -> Option<u32> {
    if frame.class != CLASS_NAV || frame.id != NAV_TIMEUTC || frame.payload.len() < 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&frame.payload[0..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pvt() -> UbxFrame {
        let mut p = vec![0u8; 92];
        p[0..4].copy_from_slice(&123456789u32.to_le_bytes()); // tow
        p[4..6].copy_from_slice(&2023u16.to_le_bytes());
        p[6] = 6; // month
        p[7] = 15; // day
        p[8] = 12;
        p[9] = 30;
        p[10] = 45;
        p[11] = 0x03; // date and time valid
        p[20] = 3; // 3D fix
        p[23] = 12; // satellites
        p[24..28].copy_from_slice(&(-38975000i32).to_le_bytes()); // lon -3.8975
        p[28..32].copy_from_slice(&516070000i32.to_le_bytes()); // lat 51.607
        p[32..36].copy_from_slice(&120000i32.to_le_bytes()); // height 120 m
        p[60..64].copy_from_slice(&1500i32.to_le_bytes()); // 1.5 m/s
        p[64..68].copy_from_slice(&(18000000i32).to_le_bytes()); // heading 180
        UbxFrame::new(CLASS_NAV, NAV_PVT, p)
    }

    #[test]
    fn nav_pvt_field_extraction() {
        let nav = NavPvt::decode(&sample_pvt()).unwrap();
        assert_eq!(nav.tow, 123456789);
        assert_eq!((nav.year, nav.month, nav.day), (2023, 6, 15));
        assert!(nav.valid_date && nav.valid_time);
        assert_eq!(nav.fix_type, 3);
        assert_eq!(nav.num_sv, 12);
        assert!((nav.longitude + 3.8975).abs() < 1e-4);
        assert!((nav.latitude - 51.607).abs() < 1e-4);
        assert_eq!(nav.height, 120000);
        assert_eq!(nav.ground_speed, 1500);
        assert!((nav.heading - 180.0).abs() < 1e-3);
    }

    #[test]
    fn wrong_class_is_rejected() {
        let mut frame = sample_pvt();
        frame.class = 0x02;
        assert!(NavPvt::decode(&frame).is_none());
    }

    #[test]
    fn timeutc_tow_extraction() {
        let mut p = vec![0u8; 20];
        p[0..4].copy_from_slice(&987654u32.to_le_bytes());
        let frame = UbxFrame::new(CLASS_NAV, NAV_TIMEUTC, p);
        assert_eq!(timeutc_tow(&frame), Some(987654));
        assert_eq!(timeutc_tow(&UbxFrame::new(CLASS_NAV, 0x35, vec![0; 8])), None);
    }
}

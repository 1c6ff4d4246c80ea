//! ZDA (time and date) sentence conversion.

use time::{Date, Month, PrimitiveDateTime, Time};

use super::NmeaMessage;

/// Convert an `II`/`ZDA` sentence to Unix epoch seconds.
///
/// Expected fields: `HHMMSS[.sss]`, day, month, four digit year and the two
/// local timezone fields. Fractional seconds are discarded and the timestamp
/// is interpreted as UTC. Returns `None` for other sentences or if any field
/// fails to parse.
pub fn parse_zda(msg: &NmeaMessage) -> Option<i64> {
    if msg.talker != "II" || msg.message != "ZDA" {
        return None;
    }
    let fields = msg.fields();
    if fields.entries() != 6 {
        return None;
    }

    let hms = fields.get(0)?.as_bytes();
    if hms.len() < 6 {
        return None;
    }
    let hms = std::str::from_utf8(&hms[..6]).ok()?;
    let hour: u8 = hms[0..2].parse().ok()?;
    let minute: u8 = hms[2..4].parse().ok()?;
    let second: u8 = hms[4..6].parse().ok()?;

    let day: u8 = field_int(&fields, 1)?;
    let month: u8 = field_int(&fields, 2)?;
    let year_bytes = fields.get(3)?.as_bytes();
    if year_bytes.len() != 4 {
        return None;
    }
    let year: i32 = std::str::from_utf8(year_bytes).ok()?.parse().ok()?;
    // Bounds are arbitrary but exclude obviously bogus receivers
    if !(1970..=2100).contains(&year) {
        return None;
    }

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let tod = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, tod).assume_utc().unix_timestamp())
}

fn field_int(fields: &crate::strarray::StringArray, ix: usize) -> Option<u8> {
    let bytes = fields.get(ix)?.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zda(raw: &str) -> NmeaMessage {
        NmeaMessage {
            encapsulated: false,
            talker: "II".into(),
            message: "ZDA".into(),
            raw: raw.as_bytes().to_vec(),
            checksum: None,
        }
    }

    #[test]
    fn epoch_conversion() {
        // 2023-06-15 16:50:45 UTC
        let epoch = parse_zda(&zda("165045.00,15,06,2023,00,00")).unwrap();
        assert_eq!(epoch, 1686847845);
    }

    #[test]
    fn fractional_seconds_discarded() {
        let a = parse_zda(&zda("120000.00,01,01,2020,00,00")).unwrap();
        let b = parse_zda(&zda("120000.99,01,01,2020,00,00")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_other_sentences() {
        let mut m = zda("165045.00,15,06,2023,00,00");
        m.message = "GLL".into();
        assert!(parse_zda(&m).is_none());
    }

    #[test]
    fn rejects_bad_fields() {
        assert!(parse_zda(&zda("1650,15,06,2023,00,00")).is_none());
        assert!(parse_zda(&zda("165045,32,06,2023,00,00")).is_none());
        assert!(parse_zda(&zda("165045,15,13,2023,00,00")).is_none());
        assert!(parse_zda(&zda("165045,15,06,1969,00,00")).is_none());
        assert!(parse_zda(&zda("165045,15,06,2023,00")).is_none());
    }
}

//! DVB time codecs: MJD + BCD UTC timestamps (ETSI EN 300 468 Annex C),
//! BCD durations, and the European summer-time boundaries used by TOT
//! local-time-offset generation.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};

/// Packs a two-digit decimal value into BCD.
pub fn dec2bcd(dec: u8) -> u8 {
    ((dec / 10) << 4) + dec % 10
}

/// Unpacks a BCD octet into its decimal value.
pub fn bcd2dec(bcd: u8) -> u8 {
    (bcd >> 4).wrapping_mul(10) + (bcd & 0x0f)
}

/// Encodes a duration in seconds as the 24-bit BCD hh:mm:ss form used by
/// EIT durations and local time offsets.
pub fn encode_bcd_duration(duration_sec: u32) -> u32 {
    let sec = duration_sec % 60;
    let min = (duration_sec / 60) % 60;
    let hour = duration_sec / 3600;

    ((dec2bcd((hour % 100) as u8) as u32) << 16)
        | ((dec2bcd(min as u8) as u32) << 8)
        | dec2bcd(sec as u8) as u32
}

/// Decodes a 24-bit BCD duration into `(total_seconds, hours, minutes,
/// seconds)`.
pub fn decode_bcd_duration(duration_bcd: u32) -> (u32, u8, u8, u8) {
    let hour = bcd2dec(((duration_bcd >> 16) & 0xff) as u8);
    let min = bcd2dec(((duration_bcd >> 8) & 0xff) as u8);
    let sec = bcd2dec((duration_bcd & 0xff) as u8);
    (
        hour as u32 * 3600 + min as u32 * 60 + sec as u32,
        hour,
        min,
        sec,
    )
}

/// Encodes a unix timestamp as `(MJD, BCD hh:mm:ss)` per EN 300 468
/// Annex C: `MJD = 14956 + D + int((Y - L) * 365.25) +
/// int((M + 1 + L * 12) * 30.6001)` with `Y = year - 1900` and `L = 1` for
/// January and February.
pub fn encode_mjd(ts: i64) -> (u16, u32) {
    let dt = DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let y = dt.year() - 1900;
    let m = dt.month() as i32;
    let d = dt.day() as i32;
    let l = if m == 1 || m == 2 { 1 } else { 0 };
    let mjd = 14956 + d + ((y - l) as f64 * 365.25) as i32 + ((m + 1 + l * 12) as f64 * 30.6001) as i32;

    let bcd = ((dec2bcd(dt.hour() as u8) as u32) << 16)
        | ((dec2bcd(dt.minute() as u8) as u32) << 8)
        | dec2bcd(dt.second() as u8) as u32;

    (mjd as u16, bcd)
}

/// Decodes `(MJD, BCD)` into broken-down UTC using the inverse Annex C
/// formula. Returns `None` for field combinations that do not name a valid
/// civil time.
pub fn decode_mjd_datetime(mjd: u16, bcd: u32) -> Option<NaiveDateTime> {
    let mut year = 0_i32;
    let mut month = 0_i32;
    let mut day = 0_i32;
    if mjd > 0 {
        let m = mjd as f64;
        year = ((m - 15078.2) / 365.25) as i32;
        month = ((m - 14956.1 - (year as f64 * 365.25) as i32 as f64) / 30.6001) as i32;
        day = mjd as i32 - 14956 - (year as f64 * 365.25) as i32 - (month as f64 * 30.6001) as i32;
        let k = if month == 14 || month == 15 { 1 } else { 0 };
        year += k;
        month = month - 1 - k * 12;
        year += 1900;
    }
    let hour = bcd2dec(((bcd >> 16) & 0xff) as u8);
    let min = bcd2dec(((bcd >> 8) & 0xff) as u8);
    let sec = bcd2dec((bcd & 0xff) as u8);

    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, min as u32, sec as u32))
}

/// Decodes `(MJD, BCD)` to a unix timestamp; malformed input degrades to 0.
pub fn decode_mjd(mjd: u16, bcd: u32) -> i64 {
    decode_mjd_datetime(mjd, bcd)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// Unix timestamp of the European summer time start (last Sunday of March,
/// 01:00 UTC) for `year`.
pub fn euro_dst_start(year: i32) -> i64 {
    let day = 31 - (5 * year / 4 + 4) % 7;
    NaiveDate::from_ymd_opt(year, 3, day as u32)
        .and_then(|date| date.and_hms_opt(1, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// Unix timestamp of the European summer time end (last Sunday of October,
/// 01:00 UTC) for `year`.
pub fn euro_dst_end(year: i32) -> i64 {
    let day = 31 - (5 * year / 4 + 1) % 7;
    NaiveDate::from_ymd_opt(year, 10, day as u32)
        .and_then(|date| date.and_hms_opt(1, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_octets() {
        assert_eq!(dec2bcd(59), 0x59);
        assert_eq!(bcd2dec(0x59), 59);
    }

    #[test]
    fn bcd_duration_round_trip() {
        for &secs in &[0_u32, 1, 59, 60, 3599, 3600, 3661, 86399] {
            let bcd = encode_bcd_duration(secs);
            let (total, _, _, _) = decode_bcd_duration(bcd);
            assert_eq!(total, secs);
        }
        assert_eq!(encode_bcd_duration(3600), 0x010000);
        assert_eq!(encode_bcd_duration(12 * 3600 + 45 * 60), 0x124500);
    }

    #[test]
    fn annex_c_reference_vector() {
        // EN 300 468 Annex C example: 1993-10-13 12:45:00 is MJD 0xC079.
        let ts = NaiveDate::from_ymd_opt(1993, 10, 13)
            .unwrap()
            .and_hms_opt(12, 45, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let (mjd, bcd) = encode_mjd(ts);
        assert_eq!(mjd, 0xC079);
        assert_eq!(bcd, 0x124500);
        assert_eq!(decode_mjd(mjd, bcd), ts);
    }

    #[test]
    fn mjd_identity_1901_to_2100() {
        let mut date = NaiveDate::from_ymd_opt(1901, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2100, 12, 31).unwrap();
        while date <= end {
            let ts = date.and_hms_opt(12, 34, 56).unwrap().and_utc().timestamp();
            let (mjd, bcd) = encode_mjd(ts);
            assert_eq!(decode_mjd(mjd, bcd), ts, "date {}", date);
            date = date.succ_opt().unwrap();
        }
    }

    #[test]
    fn euro_dst_boundaries() {
        // 2009: March 29 / October 25. 2026: March 29 / October 25.
        for &(year, start_day, end_day) in &[(2009, 29, 25), (2024, 31, 27), (2026, 29, 25)] {
            let start = DateTime::<Utc>::from_timestamp(euro_dst_start(year), 0).unwrap();
            assert_eq!((start.month(), start.day(), start.hour()), (3, start_day, 1));
            let end = DateTime::<Utc>::from_timestamp(euro_dst_end(year), 0).unwrap();
            assert_eq!((end.month(), end.day(), end.hour()), (10, end_day, 1));
        }
    }
}

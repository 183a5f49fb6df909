use std::fmt;

use chrono::{Datelike, NaiveDate, Timelike};

/// Absolute instant with millisecond precision and a UTC offset kept in
/// 15-minute steps.
///
/// The offset does not shift the instant; it is carried so that the original
/// local time can be reconstructed. Equality compares both fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateTime {
    /// Milliseconds since the Unix epoch.
    epoch_msec: i64,
    /// UTC offset in seconds, a multiple of 900.
    utc_offset: i32,
}

/// Milliseconds between the Unix epoch and 2018-02-02T00:00:00Z, the epoch
/// the ChainPack wire form is anchored at.
pub(crate) const SHV_EPOCH_MSEC: i64 = 1_517_529_600_000;

impl DateTime {
    /// Create from Unix epoch milliseconds and a UTC offset in seconds.
    ///
    /// Returns `None` when the offset is not a multiple of 15 minutes or is
    /// outside the representable ±15:45 range.
    pub fn from_epoch_msec_tz(epoch_msec: i64, utc_offset: i32) -> Option<Self> {
        if utc_offset % 900 != 0 || !(-63..=63).contains(&(utc_offset / 900)) {
            return None;
        }
        Some(Self {
            epoch_msec,
            utc_offset,
        })
    }

    pub fn from_epoch_msec(epoch_msec: i64) -> Self {
        Self {
            epoch_msec,
            utc_offset: 0,
        }
    }

    /// The current instant in UTC.
    pub fn now() -> Self {
        Self::from_epoch_msec(chrono::Utc::now().timestamp_millis())
    }

    pub fn epoch_msec(&self) -> i64 {
        self.epoch_msec
    }

    /// UTC offset in seconds.
    pub fn utc_offset(&self) -> i32 {
        self.utc_offset
    }

    /// Build from calendar fields expressed in the given offset.
    pub fn from_calendar(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
        msec: u32,
        utc_offset: i32,
    ) -> Option<Self> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let local = date.and_hms_milli_opt(hour, min, sec, msec)?;
        let epoch_msec = local.and_utc().timestamp_millis() - i64::from(utc_offset) * 1000;
        Self::from_epoch_msec_tz(epoch_msec, utc_offset)
    }

    /// Calendar fields in the carried offset:
    /// `(year, month, day, hour, minute, second, millisecond)`.
    pub fn to_calendar(&self) -> (i32, u32, u32, u32, u32, u32, u32) {
        let local_msec = self.epoch_msec.saturating_add(i64::from(self.utc_offset) * 1000);
        // Instants beyond the calendar range collapse to the epoch rather
        // than failing; they cannot come from a well-formed wire value.
        let dt = chrono::DateTime::from_timestamp_millis(local_msec).unwrap_or_default();
        let d = dt.date_naive();
        let t = dt.time();
        (
            d.year(),
            d.month(),
            d.day(),
            t.hour(),
            t.minute(),
            t.second(),
            t.nanosecond() / 1_000_000,
        )
    }
}

impl PartialOrd for DateTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DateTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.epoch_msec.cmp(&other.epoch_msec)
    }
}

impl fmt::Display for DateTime {
    /// ISO-8601 with the offset shortened the way the Cpon writer does it:
    /// `Z` for UTC, `±HH` for whole hours, `±HHMM` otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (y, mo, d, h, mi, s, ms) = self.to_calendar();
        write!(f, "{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}")?;
        if ms != 0 {
            write!(f, ".{ms:03}")?;
        }
        if self.utc_offset == 0 {
            write!(f, "Z")
        } else {
            let sign = if self.utc_offset < 0 { '-' } else { '+' };
            let off = self.utc_offset.abs();
            write!(f, "{}{:02}", sign, off / 3600)?;
            if off % 3600 != 0 {
                write!(f, "{:02}", (off % 3600) / 60)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_round_trip() {
        let dt = DateTime::from_calendar(2027, 5, 3, 11, 30, 12, 345, 3600).unwrap();
        assert_eq!(dt.to_calendar(), (2027, 5, 3, 11, 30, 12, 345));
        assert_eq!(dt.utc_offset(), 3600);
    }

    #[test]
    fn shv_epoch() {
        let dt = DateTime::from_calendar(2018, 2, 2, 0, 0, 0, 0, 0).unwrap();
        assert_eq!(dt.epoch_msec(), SHV_EPOCH_MSEC);
    }

    #[test]
    fn display_offsets() {
        let utc = DateTime::from_calendar(2018, 2, 2, 0, 0, 0, 0, 0).unwrap();
        assert_eq!(utc.to_string(), "2018-02-02T00:00:00Z");
        let plus = DateTime::from_calendar(2019, 5, 3, 11, 30, 0, 0, -7 * 3600).unwrap();
        assert_eq!(plus.to_string(), "2019-05-03T11:30:00-07");
        let half = DateTime::from_calendar(2017, 5, 3, 15, 0, 0, 0, -12600).unwrap();
        assert_eq!(half.to_string(), "2017-05-03T15:00:00-0330");
        let msec = DateTime::from_calendar(2027, 5, 3, 11, 30, 12, 345, 3600).unwrap();
        assert_eq!(msec.to_string(), "2027-05-03T11:30:12.345+01");
    }

    #[test]
    fn rejects_bad_offset() {
        assert!(DateTime::from_epoch_msec_tz(0, 100).is_none());
        assert!(DateTime::from_epoch_msec_tz(0, 64 * 900).is_none());
        assert!(DateTime::from_epoch_msec_tz(0, -63 * 900).is_some());
    }

    #[test]
    fn ordering_ignores_offset() {
        let a = DateTime::from_epoch_msec_tz(1000, 3600).unwrap();
        let b = DateTime::from_epoch_msec_tz(1000, 0).unwrap();
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
        assert_ne!(a, b);
    }
}

//! Civil calendar conversion for UTC-offset timestamps

use core::fmt;

/// A broken-down calendar time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTime {
    pub year: i32,
    /// 1-12
    pub month: u8,
    /// 1-31
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0-365, January 1st is 0
    pub day_of_year: u16,
}

impl CivilTime {
    /// Converts seconds since 1970-01-01T00:00:00 into a calendar time.
    pub fn from_timestamp(timestamp: i64) -> Self {
        let days = timestamp.div_euclid(86_400);
        let seconds_of_day = timestamp.rem_euclid(86_400);

        // Days-to-civil, shifted so the era starts on March 1st
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy_from_march = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy_from_march + 2) / 153;
        let day = (doy_from_march - (153 * mp + 2) / 5 + 1) as u8;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
        let year = (yoe + era * 400 + if month <= 2 { 1 } else { 0 }) as i32;

        Self {
            year,
            month,
            day,
            hour: (seconds_of_day / 3600) as u8,
            minute: (seconds_of_day / 60 % 60) as u8,
            second: (seconds_of_day % 60) as u8,
            day_of_year: day_of_year(year, month, day),
        }
    }
}

impl fmt::Display for CivilTime {
    /// `HH:MM:SS DD/MM/YYYY`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02} {:02}/{:02}/{:04}",
            self.hour, self.minute, self.second, self.day, self.month, self.year
        )
    }
}

const fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn day_of_year(year: i32, month: u8, day: u8) -> u16 {
    const CUMULATIVE_DAYS: [u16; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

    let mut doy = CUMULATIVE_DAYS[(month - 1) as usize] + day as u16 - 1;
    if month > 2 && is_leap_year(year) {
        doy += 1;
    }
    doy
}

/// Seconds elapsed since UTC midnight
pub const fn seconds_of_day(timestamp: u32) -> u32 {
    timestamp % 86_400
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_epoch() {
        let time = CivilTime::from_timestamp(0);
        assert_eq!((time.year, time.month, time.day), (1970, 1, 1));
        assert_eq!((time.hour, time.minute, time.second), (0, 0, 0));
        assert_eq!(time.day_of_year, 0);
    }

    #[test]
    fn test_leap_day() {
        let time = CivilTime::from_timestamp(951_782_400);
        assert_eq!((time.year, time.month, time.day), (2000, 2, 29));
        assert_eq!(time.day_of_year, 59);
    }

    #[test]
    fn test_end_of_leap_year() {
        // 2024-12-31T23:59:59Z
        let time = CivilTime::from_timestamp(1_735_689_599);
        assert_eq!((time.year, time.month, time.day), (2024, 12, 31));
        assert_eq!((time.hour, time.minute, time.second), (23, 59, 59));
        assert_eq!(time.day_of_year, 365);
    }

    #[test]
    fn test_before_epoch() {
        let time = CivilTime::from_timestamp(-1);
        assert_eq!((time.year, time.month, time.day), (1969, 12, 31));
        assert_eq!(time.hour, 23);
    }

    #[test]
    fn test_display() {
        let time = CivilTime::from_timestamp(1_700_000_000);
        assert_eq!(format!("{}", time), "22:13:20 14/11/2023");
    }
}

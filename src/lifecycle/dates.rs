//! Calendar arithmetic for settlement and expiry dates. All UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

fn at_settlement_time(date: NaiveDate) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// Last day of the month containing `at`, 23:59 UTC.
pub fn end_of_month(at: DateTime<Utc>) -> DateTime<Utc> {
    at_settlement_time(last_day_of_month(at.year(), at.month()))
}

/// Last day of the month after the one containing `reference`, 23:59 UTC.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use settlement_engine::lifecycle::dates::next_settlement_after;
///
/// let jan = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap();
/// let feb = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
/// assert_eq!(next_settlement_after(jan), feb);
/// ```
pub fn next_settlement_after(reference: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if reference.month() == 12 {
        (reference.year() + 1, 1)
    } else {
        (reference.year(), reference.month() + 1)
    };
    at_settlement_time(last_day_of_month(year, month))
}

/// First settlement date for a newly recurring group: the end of the
/// current month, or of the next one when today already is the last day.
pub fn first_settlement_date(now: DateTime<Utc>) -> DateTime<Utc> {
    let this_month = last_day_of_month(now.year(), now.month());
    if now.date_naive() >= this_month {
        next_settlement_after(now)
    } else {
        at_settlement_time(this_month)
    }
}

/// Last representable second of `date`, used for expiry dates.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// Midnight UTC at the start of the day containing `at`.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_next_settlement_rolls_year() {
        assert_eq!(next_settlement_after(utc(2024, 12, 31, 23, 59)), utc(2025, 1, 31, 23, 59));
        assert_eq!(next_settlement_after(utc(2023, 1, 15, 8, 0)), utc(2023, 2, 28, 23, 59));
        assert_eq!(next_settlement_after(utc(2024, 3, 31, 23, 59)), utc(2024, 4, 30, 23, 59));
    }

    #[test]
    fn test_first_settlement_date() {
        assert_eq!(first_settlement_date(utc(2024, 9, 10, 12, 0)), utc(2024, 9, 30, 23, 59));
        assert_eq!(first_settlement_date(utc(2024, 9, 30, 10, 0)), utc(2024, 10, 31, 23, 59));
    }

    #[test]
    fn test_end_of_month_and_day() {
        assert_eq!(end_of_month(utc(2024, 2, 3, 0, 0)), utc(2024, 2, 29, 23, 59));
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(end_of_day(d), Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap());
        assert_eq!(start_of_day(utc(2024, 5, 1, 17, 45)), utc(2024, 5, 1, 0, 0));
    }
}

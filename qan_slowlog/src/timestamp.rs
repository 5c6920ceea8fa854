//! Slow log timestamps.
//!
//! Two formats appear in the wild. Older servers write a local, zone-less
//! `yymmdd H:MM:SS` (the hour is space padded, not zero padded), newer ones
//! an RFC 3339 timestamp with microseconds. Zone-less values are interpreted
//! in the parser's default offset.

use time::{
    Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
    format_description::well_known::Rfc3339, macros::format_description,
};

fn digits(s: &str) -> Option<u8> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse `071015 21:43:52` style timestamps.
pub(crate) fn parse_legacy(value: &str, offset: UtcOffset) -> Option<OffsetDateTime> {
    let mut parts = value.split_whitespace();
    let date = parts.next()?;
    let clock = parts.next()?;
    if date.len() != 6 || !date.is_ascii() || parts.next().is_some() {
        return None;
    }

    let year = 2000 + i32::from(digits(&date[0..2])?);
    let month = Month::try_from(digits(&date[2..4])?).ok()?;
    let day = digits(&date[4..6])?;

    let mut hms = clock.split(':');
    let hour = digits(hms.next()?)?;
    let minute = digits(hms.next()?)?;
    let second = digits(hms.next()?)?;
    if hms.next().is_some() {
        return None;
    }

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_offset(offset))
}

/// Parse `2018-04-06T08:11:33.123456Z` style timestamps. A value without a
/// zone designator is taken to be in `offset`.
pub(crate) fn parse_rfc3339(value: &str, offset: UtcOffset) -> Option<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(ts);
    }
    let fractional = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let whole = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(value, fractional)
        .or_else(|_| PrimitiveDateTime::parse(value, whole))
        .ok()
        .map(|ts| ts.assume_offset(offset))
}

#[cfg(test)]
mod tests {
    use time::{UtcOffset, macros::datetime};

    use super::{parse_legacy, parse_rfc3339};

    #[test]
    fn legacy_in_default_offset() {
        assert_eq!(
            parse_legacy("071015 21:43:52", UtcOffset::UTC),
            Some(datetime!(2007-10-15 21:43:52 UTC))
        );
        let est = UtcOffset::from_hms(-5, 0, 0).expect("offset");
        assert_eq!(
            parse_legacy("071015  9:03:01", est),
            Some(datetime!(2007-10-15 9:03:01 -5))
        );
    }

    #[test]
    fn legacy_rejects_garbage() {
        assert_eq!(parse_legacy("0710 21:43:52", UtcOffset::UTC), None);
        assert_eq!(parse_legacy("071315 21:43:52", UtcOffset::UTC), None);
        assert_eq!(parse_legacy("071015 25:43:52", UtcOffset::UTC), None);
        assert_eq!(parse_legacy("071015", UtcOffset::UTC), None);
    }

    #[test]
    fn rfc3339_with_and_without_zone() {
        assert_eq!(
            parse_rfc3339("2018-04-06T08:11:33.123456Z", UtcOffset::UTC),
            Some(datetime!(2018-04-06 08:11:33.123456 UTC))
        );
        let cet = UtcOffset::from_hms(1, 0, 0).expect("offset");
        assert_eq!(
            parse_rfc3339("2018-04-06T08:11:33", cet),
            Some(datetime!(2018-04-06 08:11:33 +1))
        );
        assert_eq!(parse_rfc3339("yesterday", UtcOffset::UTC), None);
    }
}

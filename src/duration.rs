//! Parsing and formatting for the `<int><unit>...` keep-within duration grammar.

use chrono::{DateTime, Months, Utc};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DurationParseError {
    #[error("{0}: not a valid duration (expected e.g. \"2y5m7d3h\", units are y/m/w/d/h, each at most once)")]
    Malformed(String),
    #[error("{0}: unit '{1}' appears more than once")]
    RepeatedUnit(String, char),
}

/// A calendar-aware duration offset: years and months are applied via calendar
/// arithmetic (so "1 month ago" lands on the same day of the previous month),
/// weeks/days/hours are applied as fixed 3600s-multiples. Zero value disables
/// the corresponding "within" bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
}

const UNIT_ORDER: [char; 5] = ['y', 'm', 'w', 'd', 'h'];

impl KeepDuration {
    pub fn is_zero(&self) -> bool {
        *self == KeepDuration::default()
    }

    /// `now - self`, with years/months applied calendar-wise before the fixed part.
    pub fn before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let months_total = self.years * 12 + self.months;
        let after_calendar = if months_total > 0 {
            now.checked_sub_months(Months::new(months_total)).unwrap_or(now)
        } else {
            now
        };
        let fixed_hours = i64::from(self.weeks) * 24 * 7 + i64::from(self.days) * 24 + i64::from(self.hours);
        after_calendar - chrono::Duration::hours(fixed_hours)
    }
}

impl fmt::Display for KeepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: [(char, u32); 5] = [
            ('y', self.years),
            ('m', self.months),
            ('w', self.weeks),
            ('d', self.days),
            ('h', self.hours),
        ];
        let mut wrote = false;
        for (unit, amount) in parts {
            if amount > 0 {
                write!(f, "{amount}{unit}")?;
                wrote = true;
            }
        }
        if !wrote {
            write!(f, "0h")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for KeepDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DurationParseError::Malformed(s.to_owned()));
        }
        let mut out = KeepDuration::default();
        let mut seen = [false; 5];
        let mut chars = s.char_indices().peekable();
        let mut number_start = 0usize;

        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() {
                chars.next();
                continue;
            }
            if !UNIT_ORDER.contains(&c) {
                return Err(DurationParseError::Malformed(s.to_owned()));
            }
            let unit_pos = UNIT_ORDER.iter().position(|&u| u == c).unwrap();
            if seen[unit_pos] {
                return Err(DurationParseError::RepeatedUnit(s.to_owned(), c));
            }
            if idx == number_start {
                // unit with no digits in front of it
                return Err(DurationParseError::Malformed(s.to_owned()));
            }
            let amount: u32 = s[number_start..idx]
                .parse()
                .map_err(|_| DurationParseError::Malformed(s.to_owned()))?;
            match c {
                'y' => out.years = amount,
                'm' => out.months = amount,
                'w' => out.weeks = amount,
                'd' => out.days = amount,
                'h' => out.hours = amount,
                _ => unreachable!(),
            }
            seen[unit_pos] = true;
            chars.next();
            number_start = idx + c.len_utf8();
        }

        if number_start != s.len() {
            // trailing digits with no unit
            return Err(DurationParseError::Malformed(s.to_owned()));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_multi_unit() {
        let d = KeepDuration::from_str("2y5m7d3h").unwrap();
        assert_eq!(
            d,
            KeepDuration { years: 2, months: 5, weeks: 0, days: 7, hours: 3 }
        );
    }

    #[test]
    fn parses_single_unit() {
        let d = KeepDuration::from_str("90d").unwrap();
        assert_eq!(d, KeepDuration { days: 90, ..Default::default() });
    }

    #[test]
    fn rejects_repeated_unit() {
        let err = KeepDuration::from_str("1d2d").unwrap_err();
        assert!(matches!(err, DurationParseError::RepeatedUnit(_, 'd')));
    }

    #[test]
    fn rejects_garbage() {
        assert!(KeepDuration::from_str("not-a-duration").is_err());
        assert!(KeepDuration::from_str("").is_err());
        assert!(KeepDuration::from_str("5").is_err());
    }

    #[test]
    fn round_trips_through_display() {
        let d = KeepDuration { years: 0, months: 3, weeks: 1, days: 0, hours: 6 };
        let s = d.to_string();
        let parsed = KeepDuration::from_str(&s).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn round_trips_zero() {
        let d = KeepDuration::default();
        let parsed = KeepDuration::from_str(&d.to_string()).unwrap();
        assert_eq!(parsed, d);
        assert!(parsed.is_zero());
    }

    #[test]
    fn before_applies_calendar_months_then_fixed_part() {
        let now: DateTime<Utc> = "2024-03-15T10:00:00Z".parse().unwrap();
        let d = KeepDuration { months: 1, days: 1, ..Default::default() };
        let before = d.before(now);
        assert_eq!(before.to_rfc3339(), "2024-02-14T10:00:00+00:00");
    }
}

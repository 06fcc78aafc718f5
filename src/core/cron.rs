//! Six-field cron expressions with a leading seconds field.
//!
//! ```text
//! ┌───────────── second (0-59)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31, or ?)
//! │ │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday, or ?)
//! │ │ │ │ │ │
//! 0 0 2 * * ?
//! ```
//!
//! When both day fields are restricted a day matches if either one does.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use thiserror::Error;

use crate::error::{Error, Result};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Give up looking for a fire time this many years ahead (e.g. `0 0 0 30 2 ?`).
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 6 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("invalid step '{0}'")]
    InvalidStep(String),
    #[error("'?' is only allowed in the day-of-month and day-of-week fields")]
    MisplacedQuestionMark,
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day-of-month",
            Self::Month => "month",
            Self::DayOfWeek => "day-of-week",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
        }
    }

    fn allows_question_mark(self) -> bool {
        matches!(self, Self::DayOfMonth | Self::DayOfWeek)
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            Self::Month => &MONTH_NAMES,
            Self::DayOfWeek => &DAY_NAMES,
            _ => &[],
        }
    }

    /// Offset between a name's index and its numeric value.
    fn name_base(self) -> u32 {
        match self {
            Self::Month => 1,
            _ => 0,
        }
    }
}

/// One field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    pub values: BTreeSet<u32>,
    /// False for `*` and `?`.
    pub restricted: bool,
}

impl CronField {
    fn parse(expr: &str, kind: FieldKind) -> std::result::Result<Self, CronParseError> {
        let (min, max) = kind.bounds();

        if expr == "?" || expr == "*" {
            if expr == "?" && !kind.allows_question_mark() {
                return Err(CronParseError::MisplacedQuestionMark);
            }
            return Ok(Self {
                values: (min..=max).collect(),
                restricted: false,
            });
        }

        let mut values = BTreeSet::new();
        for part in expr.split(',') {
            parse_part(part, kind, &mut values)?;
        }

        if matches!(kind, FieldKind::DayOfWeek) && values.remove(&7) {
            values.insert(0);
        }

        Ok(Self {
            values,
            restricted: true,
        })
    }

    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest matching value >= `value`.
    pub fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    pub fn first(&self) -> Option<u32> {
        self.values.iter().next().copied()
    }
}

fn parse_part(
    part: &str,
    kind: FieldKind,
    values: &mut BTreeSet<u32>,
) -> std::result::Result<(), CronParseError> {
    let (min, max) = kind.bounds();

    let (range_part, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step = step
                .parse::<u32>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| CronParseError::InvalidStep(step.to_string()))?;
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if range_part == "*" {
        (min, max)
    } else if let Some((start, end)) = range_part.split_once('-') {
        let start = parse_value(start, kind)?;
        let end = parse_value(end, kind)?;
        if start > end {
            return Err(CronParseError::InvalidRange(start, end));
        }
        (start, end)
    } else {
        let value = parse_value(range_part, kind)?;
        // "5/15" runs from 5 to the end of the field
        (value, if step.is_some() { max } else { value })
    };

    for value in [start, end] {
        if value < min || value > max {
            return Err(CronParseError::OutOfRange {
                field: kind.name(),
                value,
                min,
                max,
            });
        }
    }

    values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    Ok(())
}

fn parse_value(token: &str, kind: FieldKind) -> std::result::Result<u32, CronParseError> {
    if let Ok(value) = token.parse::<u32>() {
        return Ok(value);
    }

    kind.names()
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|idx| idx as u32 + kind.name_base())
        .ok_or_else(|| CronParseError::InvalidValue {
            field: kind.name(),
            value: token.to_string(),
        })
}

/// A parsed six-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    pub expr: String,
    pub second: CronField,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> std::result::Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        }

        Ok(Self {
            expr: expr.to_string(),
            second: CronField::parse(parts[0], FieldKind::Second)?,
            minute: CronField::parse(parts[1], FieldKind::Minute)?,
            hour: CronField::parse(parts[2], FieldKind::Hour)?,
            day_of_month: CronField::parse(parts[3], FieldKind::DayOfMonth)?,
            month: CronField::parse(parts[4], FieldKind::Month)?,
            day_of_week: CronField::parse(parts[5], FieldKind::DayOfWeek)?,
        })
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());

        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `after`, in `after`'s time zone.
    ///
    /// Local times that do not exist (DST gaps) are skipped.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let mut current = after
            .naive_local()
            .with_nanosecond(0)?
            .checked_add_signed(Duration::seconds(1))?;
        let last_year = current.year() + SEARCH_YEARS;

        while current.year() <= last_year {
            if !self.month.matches(current.month()) {
                current = match self.month.next(current.month() + 1) {
                    Some(month) => start_of_day(NaiveDate::from_ymd_opt(current.year(), month, 1)?),
                    None => start_of_day(NaiveDate::from_ymd_opt(
                        current.year() + 1,
                        self.month.first()?,
                        1,
                    )?),
                };
                continue;
            }

            if !self.matches_day(current.date()) {
                current = start_of_day(current.date().succ_opt()?);
                continue;
            }

            if !self.hour.matches(current.hour()) {
                current = match self.hour.next(current.hour() + 1) {
                    Some(hour) => current.date().and_hms_opt(hour, 0, 0)?,
                    None => start_of_day(current.date().succ_opt()?),
                };
                continue;
            }

            if !self.minute.matches(current.minute()) {
                current = match self.minute.next(current.minute() + 1) {
                    Some(minute) => current.date().and_hms_opt(current.hour(), minute, 0)?,
                    None => next_hour(current)?,
                };
                continue;
            }

            if !self.second.matches(current.second()) {
                current = match self.second.next(current.second() + 1) {
                    Some(second) => current.with_second(second)?,
                    None => next_minute(current)?,
                };
                continue;
            }

            match tz.from_local_datetime(&current).earliest() {
                Some(fire) => return Some(fire),
                None => current = current.checked_add_signed(Duration::seconds(1))?,
            }
        }

        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming<Tz: TimeZone>(&self, after: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after.clone();
        while times.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    cursor = next.clone();
                    times.push(next);
                }
                None => break,
            }
        }
        times
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn next_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.date()
        .and_hms_opt(t.hour(), 0, 0)?
        .checked_add_signed(Duration::hours(1))
}

fn next_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.date()
        .and_hms_opt(t.hour(), t.minute(), 0)?
        .checked_add_signed(Duration::minutes(1))
}

/// Canonical form of a user-supplied cron expression.
///
/// Five-field expressions get a `0` seconds field. When both day fields are
/// `*`, day-of-week becomes `?`. The result must parse.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_schedule(expr, "expression is blank"));
    }

    let mut fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => fields.insert(0, "0"),
        6 => {}
        n => {
            return Err(Error::invalid_schedule(
                expr,
                format!("expected 5 or 6 fields, got {}", n),
            ));
        }
    }

    if fields[3] == "*" && fields[5] == "*" {
        fields[5] = "?";
    }

    let normalized = fields.join(" ");
    CronExpr::parse(&normalized).map_err(|e| Error::invalid_schedule(expr, e.to_string()))?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_normalize_replaces_double_wildcard_day() {
        assert_eq!(normalize_cron("0 0 0 * * *").unwrap(), "0 0 0 * * ?");
    }

    #[test]
    fn test_normalize_keeps_weekday_expression() {
        assert_eq!(normalize_cron("0 30 14 * * MON").unwrap(), "0 30 14 * * MON");
    }

    #[test]
    fn test_normalize_five_fields_and_whitespace() {
        assert_eq!(normalize_cron("  30 2 * * *  ").unwrap(), "0 30 2 * * ?");
        assert_eq!(normalize_cron("0  0\t1 * *").unwrap(), "0 0 0 1 * *");
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        for expr in ["", "   ", "* * *", "0 0 0 * * * * *", "0 61 * * * ?", "0 0 ? * * *"] {
            let err = normalize_cron(expr).unwrap_err();
            assert!(
                matches!(err, Error::InvalidSchedule { .. }),
                "{:?} gave {:?}",
                expr,
                err
            );
        }
    }

    #[test]
    fn test_parse_names_steps_and_lists() {
        let cron = CronExpr::parse("*/15 0 8-18/2 ? JAN,jul MON-FRI").unwrap();
        assert_eq!(cron.second.values.len(), 4);
        assert_eq!(cron.hour.values, BTreeSet::from([8, 10, 12, 14, 16, 18]));
        assert_eq!(cron.month.values, BTreeSet::from([1, 7]));
        assert_eq!(cron.day_of_week.values, BTreeSet::from([1, 2, 3, 4, 5]));
        assert!(!cron.day_of_month.restricted);
    }

    #[test]
    fn test_sunday_as_seven() {
        let cron = CronExpr::parse("0 0 0 ? * 7").unwrap();
        assert_eq!(cron.day_of_week.values, BTreeSet::from([0]));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronExpr::parse("0 0 0 * *"),
            Err(CronParseError::InvalidFieldCount(5))
        );
        assert!(matches!(
            CronExpr::parse("0 0 5-2 * * ?"),
            Err(CronParseError::InvalidRange(5, 2))
        ));
        assert!(matches!(
            CronExpr::parse("0 */0 * * * ?"),
            Err(CronParseError::InvalidStep(_))
        ));
        assert!(matches!(
            CronExpr::parse("0 0 0 * FOO ?"),
            Err(CronParseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_next_daily() {
        let cron = CronExpr::parse("0 0 2 * * ?").unwrap();
        assert_eq!(
            cron.next_after(&at(2026, 3, 10, 1, 59, 59)),
            Some(at(2026, 3, 10, 2, 0, 0))
        );
        // Strictly after: a fire time is never returned for itself
        assert_eq!(
            cron.next_after(&at(2026, 3, 10, 2, 0, 0)),
            Some(at(2026, 3, 11, 2, 0, 0))
        );
    }

    #[test]
    fn test_next_crosses_year() {
        let cron = CronExpr::parse("0 0 0 1 JAN ?").unwrap();
        assert_eq!(
            cron.next_after(&at(2026, 6, 15, 12, 0, 0)),
            Some(at(2027, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_next_weekday() {
        // 2026-10-18 is a Sunday
        let cron = CronExpr::parse("0 30 14 * * MON").unwrap();
        assert_eq!(
            cron.next_after(&at(2026, 10, 18, 9, 0, 0)),
            Some(at(2026, 10, 19, 14, 30, 0))
        );
    }

    #[test]
    fn test_restricted_day_fields_either_match() {
        // 1st of the month or any Friday; 2026-10-02 is a Friday
        let cron = CronExpr::parse("0 0 0 1 * FRI").unwrap();
        assert_eq!(
            cron.next_after(&at(2026, 10, 1, 0, 0, 0)),
            Some(at(2026, 10, 2, 0, 0, 0))
        );
    }

    #[test]
    fn test_impossible_date_gives_up() {
        let cron = CronExpr::parse("0 0 0 30 2 ?").unwrap();
        assert_eq!(cron.next_after(&at(2026, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_upcoming_seconds() {
        let cron = CronExpr::parse("*/20 * * * * ?").unwrap();
        let times = cron.upcoming(&at(2026, 1, 1, 0, 0, 5), 3);
        assert_eq!(
            times,
            vec![
                at(2026, 1, 1, 0, 0, 20),
                at(2026, 1, 1, 0, 0, 40),
                at(2026, 1, 1, 0, 1, 0)
            ]
        );
    }
}

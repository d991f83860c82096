//! Five-field cron expressions evaluated in UTC
//!
//! Supports `*`, `*/n`, single values, ranges (`a-b`), stepped ranges
//! (`a-b/n`, `a/n`), comma lists, month and weekday names, and the common
//! `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly` macros. Day-of-month and
//! day-of-week combine with OR when both are restricted, as in vixie cron.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Search window for the next occurrence; covers every leap day
const MAX_SEARCH_DAYS: i64 = 5 * 366;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

/// Errors produced while parsing a cron expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("cron expression is empty")]
    Empty,

    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown cron macro: {0}")]
    UnknownMacro(String),

    #[error("invalid value '{value}' in {field} field")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid step '{value}' in {field} field")]
    InvalidStep { field: &'static str, value: String },

    #[error("expression '{0}' never fires")]
    NeverFires(String),
}

/// Set of allowed values for one cron field, stored as a bitmask
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    /// False when the field text started with `*`
    restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [(&'static str, u32)],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
};
// 7 is accepted as an alias for Sunday and folded onto 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
};

impl CronField {
    fn parse(text: &str, spec: &FieldSpec) -> Result<Self, CronParseError> {
        let mut bits = 0u64;
        for item in text.split(',') {
            bits |= Self::parse_item(item, spec)?;
        }
        if spec.name == DAY_OF_WEEK.name && bits & (1 << 7) != 0 {
            bits = (bits & !(1 << 7)) | 1;
        }
        Ok(Self {
            bits,
            restricted: !text.starts_with('*'),
        })
    }

    fn parse_item(item: &str, spec: &FieldSpec) -> Result<u64, CronParseError> {
        let invalid = || CronParseError::InvalidValue {
            field: spec.name,
            value: item.to_string(),
        };
        if item.is_empty() {
            return Err(invalid());
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| CronParseError::InvalidStep {
                    field: spec.name,
                    value: item.to_string(),
                })?;
                if step == 0 {
                    return Err(CronParseError::InvalidStep {
                        field: spec.name,
                        value: item.to_string(),
                    });
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (Self::value(a, spec)?, Self::value(b, spec)?)
        } else {
            let v = Self::value(range, spec)?;
            // `a/n` runs from a to the end of the field
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };

        if start > end {
            return Err(invalid());
        }

        let step = step.unwrap_or(1);
        let mut bits = 0u64;
        let mut v = start;
        while v <= end {
            bits |= 1 << v;
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
        Ok(bits)
    }

    fn value(text: &str, spec: &FieldSpec) -> Result<u32, CronParseError> {
        let lower = text.to_ascii_lowercase();
        if let Some((_, v)) = spec.names.iter().find(|(name, _)| *name == lower) {
            return Ok(*v);
        }
        let v: u32 = text.parse().map_err(|_| CronParseError::InvalidValue {
            field: spec.name,
            value: text.to_string(),
        })?;
        if v < spec.min || v > spec.max {
            return Err(CronParseError::OutOfRange {
                field: spec.name,
                value: v,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(v)
    }

    /// Whether `value` is allowed by this field
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }
}

/// A parsed cron expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(CronParseError::Empty);
        }

        let expanded = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * 0",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                _ => return Err(CronParseError::UnknownMacro(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CronParseError::FieldCount(fields.len()));
        };

        let parsed = Self {
            source: trimmed.to_string(),
            minutes: CronField::parse(minute, &MINUTE)?,
            hours: CronField::parse(hour, &HOUR)?,
            days_of_month: CronField::parse(dom, &DAY_OF_MONTH)?,
            months: CronField::parse(month, &MONTH)?,
            days_of_week: CronField::parse(dow, &DAY_OF_WEEK)?,
        };

        // Reject expressions such as "0 0 30 2 *"
        let reference = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if reference.and_then(|r| parsed.next_after(r)).is_none() {
            return Err(CronParseError::NeverFires(parsed.source));
        }

        Ok(parsed)
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the expression fires at `t` (seconds are ignored)
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date_naive())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.is_restricted(),
            self.days_of_week.is_restricted(),
        ) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The first boundary strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(after)? + Duration::minutes(1);
        let limit = start + Duration::days(MAX_SEARCH_DAYS);
        let mut t = start;

        while t <= limit {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = truncate_to_hour(t)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// The latest boundary at or before `at`, searching forward from `from`
    ///
    /// Returns `None` when no boundary lies in `(from, at]`.
    pub fn latest_at_or_before(
        &self,
        from: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut latest = None;
        let mut cursor = from;
        while let Some(next) = self.next_after(cursor) {
            if next > at {
                break;
            }
            latest = Some(next);
            cursor = next;
        }
        latest
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

fn truncate_to_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    truncate_to_minute(t)?.with_minute(0)
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}

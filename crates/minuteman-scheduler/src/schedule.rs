use std::{fmt, sync::Arc};

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use crate::error::ScheduleError;

/// Boolean schedule evaluated in-process on every scan.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Defines when a job is due.
#[derive(Clone)]
pub enum Schedule {
    /// Five-field cron expression, `@` macro, or absolute `YYYY-MM-DD HH:MM[:SS]`.
    Expression(String),
    /// Arbitrary predicate; the reference time is ignored.
    Predicate(Predicate),
}

impl Schedule {
    pub fn expression(expression: impl Into<String>) -> Self {
        Schedule::Expression(expression.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Schedule::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Expression(expr) => f.debug_tuple("Expression").field(expr).finish(),
            Schedule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Expression(expr) => f.write_str(expr),
            Schedule::Predicate(_) => f.write_str("<predicate>"),
        }
    }
}

/// Evaluates schedules against one reference instant fixed at construction.
///
/// A scan builds a single checker up front so every job is judged against
/// the same minute, however long the scan itself takes.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleChecker {
    reference: NaiveDateTime,
}

impl ScheduleChecker {
    pub fn new(reference: NaiveDateTime) -> Self {
        Self { reference }
    }

    /// Checker pinned to the current local wall-clock time.
    pub fn now() -> Self {
        Self::new(Local::now().naive_local())
    }

    pub fn reference(&self) -> NaiveDateTime {
        self.reference
    }

    pub fn is_due(&self, schedule: &Schedule) -> Result<bool, ScheduleError> {
        match schedule {
            Schedule::Predicate(predicate) => Ok(predicate()),
            Schedule::Expression(expression) => {
                if let Some(at) = parse_datetime(expression) {
                    return Ok(same_minute(&at, &self.reference));
                }
                Ok(CronExpr::parse(expression)?.matches(&self.reference))
            }
        }
    }
}

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse an absolute date-time schedule. Returns `None` for anything else.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

fn same_minute(a: &NaiveDateTime, b: &NaiveDateTime) -> bool {
    a.date() == b.date() && a.hour() == b.hour() && a.minute() == b.minute()
}

// ---------------------------------------------------------------------------
// Cron expressions
// ---------------------------------------------------------------------------

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Numeric value of `names[0]`.
    name_base: u32,
}

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

const MINUTE: Field = Field { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: Field = Field { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: Field = Field { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: Field = Field { name: "month", min: 1, max: 12, names: MONTH_NAMES, name_base: 1 };
// 7 is accepted as an alias for Sunday and folded into 0 after parsing.
const DAY_OF_WEEK: Field = Field { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES, name_base: 0 };

impl Field {
    fn value(&self, token: &str) -> Result<u32, String> {
        let lower = token.to_ascii_lowercase();
        let value = match self.names.iter().position(|n| *n == lower) {
            Some(idx) => idx as u32 + self.name_base,
            None => token
                .parse::<u32>()
                .map_err(|_| format!("invalid value '{token}' in {} field", self.name))?,
        };
        if value < self.min || value > self.max {
            return Err(format!(
                "value {value} out of range {}-{} in {} field",
                self.min, self.max, self.name
            ));
        }
        Ok(value)
    }

    /// Parse one field into a bitset of allowed values.
    fn parse(&self, raw: &str) -> Result<u64, String> {
        let mut set = 0u64;
        for entry in raw.split(',') {
            if entry.is_empty() {
                return Err(format!("empty entry in {} field", self.name));
            }

            let (range, step) = match entry.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step '{step}' in {} field", self.name))?;
                    if step == 0 || step > self.max {
                        return Err(format!(
                            "step {step} outside 1-{} in {} field",
                            self.max, self.name
                        ));
                    }
                    (range, Some(step))
                }
                None => (entry, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((from, to)) = range.split_once('-') {
                (self.value(from)?, self.value(to)?)
            } else {
                let value = self.value(range)?;
                // `a/N` means "from a to the end of the field, every N".
                (value, if step.is_some() { self.max } else { value })
            };

            if start > end {
                return Err(format!("reversed range {start}-{end} in {} field", self.name));
            }

            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                set |= 1u64 << value;
            }
        }
        Ok(set)
    }
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// A parsed five-field cron expression (minute hour day-of-month month day-of-week).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Day fields starting with `*` do not take part in the day-of-month /
    /// day-of-week OR rule (Vixie cron semantics).
    dom_star: bool,
    dow_star: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fail = |reason: String| ScheduleError::Parse {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(&trimmed.to_ascii_lowercase())
                .ok_or_else(|| fail(format!("unsupported macro '{trimmed}'")))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(fail(format!("expected 5 fields, found {}", fields.len())));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4]).map_err(fail)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: MINUTE.parse(fields[0]).map_err(fail)?,
            hours: HOUR.parse(fields[1]).map_err(fail)?,
            days_of_month: DAY_OF_MONTH.parse(fields[2]).map_err(fail)?,
            months: MONTH.parse(fields[3]).map_err(fail)?,
            days_of_week,
            dom_star: fields[2].starts_with('*'),
            dow_star: fields[4].starts_with('*'),
        })
    }

    /// Whether `at` (minute resolution) satisfies every field.
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        let has = |set: u64, value: u32| set & (1u64 << value) != 0;

        if !has(self.minutes, at.minute())
            || !has(self.hours, at.hour())
            || !has(self.months, at.month())
        {
            return false;
        }

        let dom = has(self.days_of_month, at.day());
        let dow = has(self.days_of_week, at.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

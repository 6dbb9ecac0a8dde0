//! Parsing of human interval strings such as `"1 year"`, `"6months"` or
//! `"2 weeks 3 days"`.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{Result, TriageError};

static WHOLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+\s*[A-Za-z]+\s*)+$").expect("static regex")
});
static PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*([A-Za-z]+)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl IntervalUnit {
    fn parse(unit: &str) -> Option<Self> {
        Some(match unit.to_ascii_lowercase().as_str() {
            "y" | "yr" | "yrs" | "year" | "years" => IntervalUnit::Year,
            "m" | "mon" | "mons" | "month" | "months" => IntervalUnit::Month,
            "w" | "wk" | "wks" | "week" | "weeks" => IntervalUnit::Week,
            "d" | "day" | "days" => IntervalUnit::Day,
            "h" | "hr" | "hrs" | "hour" | "hours" => IntervalUnit::Hour,
            "min" | "mins" | "minute" | "minutes" => IntervalUnit::Minute,
            "s" | "sec" | "secs" | "second" | "seconds" => IntervalUnit::Second,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            IntervalUnit::Year => "year",
            IntervalUnit::Month => "month",
            IntervalUnit::Week => "week",
            IntervalUnit::Day => "day",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Minute => "minute",
            IntervalUnit::Second => "second",
        }
    }
}

/// A validated interval: one or more `(amount, unit)` pairs in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub parts: Vec<(u64, IntervalUnit)>,
}

impl Interval {
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || TriageError::InvalidInterval(value.to_string());
        if !WHOLE.is_match(value) {
            return Err(invalid());
        }
        let parts = PAIR
            .captures_iter(value)
            .map(|cap| {
                let amount: u64 = cap[1].parse().map_err(|_| invalid())?;
                let unit = IntervalUnit::parse(&cap[2]).ok_or_else(invalid)?;
                Ok((amount, unit))
            })
            .collect::<Result<Vec<_>>>()?;
        let interval = Interval { parts };
        interval.months()?;
        interval.seconds()?;
        Ok(interval)
    }

    /// Total months of the year/month part.
    pub fn months(&self) -> Result<u64> {
        self.total(|unit| match unit {
            IntervalUnit::Year => 12,
            IntervalUnit::Month => 1,
            _ => 0,
        })
    }

    /// Total seconds of the week/day/time part.
    pub fn seconds(&self) -> Result<u64> {
        self.total(|unit| match unit {
            IntervalUnit::Week => 7 * 86_400,
            IntervalUnit::Day => 86_400,
            IntervalUnit::Hour => 3_600,
            IntervalUnit::Minute => 60,
            IntervalUnit::Second => 1,
            _ => 0,
        })
    }

    fn total(&self, scale: impl Fn(IntervalUnit) -> u64) -> Result<u64> {
        self.parts
            .iter()
            .try_fold(0u64, |acc, &(n, unit)| {
                n.checked_mul(scale(unit))
                    .and_then(|v| acc.checked_add(v))
            })
            .ok_or_else(|| TriageError::InvalidInterval(self.to_string()))
    }
}

/// Canonical `"<n> <unit>"` rendering with full unit names.
impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|(n, unit)| {
                let plural = if *n == 1 { "" } else { "s" };
                format!("{} {}{}", n, unit.name(), plural)
            })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}

// Copyright 2025 FlowerPower Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use config::utils::{json, time::micros_to_datetime};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const CRON_FIELDS: &[&str] = &[
    "crontab",
    "minute",
    "hour",
    "day",
    "month",
    "day_of_week",
    "start",
    "end",
    "timezone",
];
const INTERVAL_FIELDS: &[&str] = &[
    "weeks",
    "days",
    "hours",
    "minutes",
    "seconds",
    "microseconds",
    "start",
    "end",
];
const CALENDAR_FIELDS: &[&str] = &[
    "years",
    "months",
    "weeks",
    "days",
    "hour",
    "minute",
    "second",
    "start_date",
    "end_date",
    "timezone",
];
const DATE_FIELDS: &[&str] = &["run_at"];

/// When a schedule fires. Pure value, serialized into the schedule record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trigger {
    Cron(CronTrigger),
    Interval(IntervalTrigger),
    #[serde(rename = "calendarinterval")]
    CalendarInterval(CalendarIntervalTrigger),
    Date(DateTrigger),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
    // normalized five field expression: minute hour day month day-of-week
    pub expr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntervalTrigger {
    #[serde(default)]
    pub weeks: i64,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub microseconds: i64,
    // anchor of the series, stamped at construction when not supplied
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalendarIntervalTrigger {
    #[serde(default)]
    pub years: i32,
    #[serde(default)]
    pub months: i32,
    #[serde(default)]
    pub weeks: i32,
    #[serde(default)]
    pub days: i32,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
    // ISO dates, e.g. 2024-01-31
    pub start_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTrigger {
    pub run_at: i64,
}

impl Trigger {
    pub fn kind(&self) -> i32 {
        match self {
            Trigger::Cron(_) => 0,
            Trigger::Interval(_) => 1,
            Trigger::CalendarInterval(_) => 2,
            Trigger::Date(_) => 3,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Trigger::Cron(_) => "cron",
            Trigger::Interval(_) => "interval",
            Trigger::CalendarInterval(_) => "calendarinterval",
            Trigger::Date(_) => "date",
        }
    }

    /// Build a cron trigger from a crontab string.
    pub fn cron(
        expr: &str,
        timezone: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Self> {
        let normalized = normalize_cron(expr)?;
        if let Some(tz) = timezone {
            Tz::from_str(tz)
                .map_err(|_| Error::InvalidTriggerField(format!("unknown timezone: {tz}")))?;
        }
        Ok(Trigger::Cron(CronTrigger {
            expr: normalized,
            timezone: timezone.map(|s| s.to_string()),
            start,
            end,
        }))
    }

    /// Build an interval trigger; `start` anchors the series.
    pub fn interval(ivl: IntervalTrigger) -> Result<Self> {
        if interval_micros(&ivl) <= 0 {
            return Err(Error::InvalidTriggerField(
                "interval must be positive".to_string(),
            ));
        }
        Ok(Trigger::Interval(ivl))
    }

    pub fn date(run_at: i64) -> Self {
        Trigger::Date(DateTrigger { run_at })
    }

    /// Build a trigger from a kind tag and a field map, rejecting unknown
    /// keywords. `crontab` and the separate cron fields are mutually
    /// exclusive.
    pub fn from_spec(kind: &str, fields: &json::Map<String, json::Value>) -> Result<Self> {
        let allowed: &[&str] = match kind {
            "cron" => CRON_FIELDS,
            "interval" => INTERVAL_FIELDS,
            "calendarinterval" | "calendar_interval" => CALENDAR_FIELDS,
            "date" => DATE_FIELDS,
            _ => {
                return Err(Error::InvalidTriggerField(format!(
                    "unknown trigger kind: {kind}"
                )));
            }
        };
        for key in fields.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(Error::InvalidTriggerField(format!(
                    "invalid field '{key}' for trigger kind '{kind}', allowed: {}",
                    allowed.join(", ")
                )));
            }
        }

        match kind {
            "cron" => {
                let crontab = str_field(fields, "crontab");
                let parts = [
                    str_field(fields, "minute"),
                    str_field(fields, "hour"),
                    str_field(fields, "day"),
                    str_field(fields, "month"),
                    str_field(fields, "day_of_week"),
                ];
                let has_parts = parts.iter().any(|p| p.is_some());
                if crontab.is_some() && has_parts {
                    return Err(Error::InvalidTriggerField(
                        "crontab and separate cron fields are mutually exclusive".to_string(),
                    ));
                }
                let expr = match crontab {
                    Some(expr) => expr,
                    None => parts
                        .iter()
                        .map(|p| p.clone().unwrap_or_else(|| "*".to_string()))
                        .collect::<Vec<_>>()
                        .join(" "),
                };
                Trigger::cron(
                    &expr,
                    str_field(fields, "timezone").as_deref(),
                    int_field(fields, "start"),
                    int_field(fields, "end"),
                )
            }
            "interval" => {
                let ivl = IntervalTrigger {
                    weeks: int_field(fields, "weeks").unwrap_or_default(),
                    days: int_field(fields, "days").unwrap_or_default(),
                    hours: int_field(fields, "hours").unwrap_or_default(),
                    minutes: int_field(fields, "minutes").unwrap_or_default(),
                    seconds: int_field(fields, "seconds").unwrap_or_default(),
                    microseconds: int_field(fields, "microseconds").unwrap_or_default(),
                    start: int_field(fields, "start")
                        .unwrap_or_else(config::utils::time::now_micros),
                    end: int_field(fields, "end"),
                };
                Trigger::interval(ivl)
            }
            "calendarinterval" | "calendar_interval" => {
                let start_date = str_field(fields, "start_date").ok_or_else(|| {
                    Error::InvalidTriggerField("start_date is required".to_string())
                })?;
                parse_date(&start_date)?;
                if let Some(end) = str_field(fields, "end_date") {
                    parse_date(&end)?;
                }
                if let Some(tz) = str_field(fields, "timezone") {
                    Tz::from_str(&tz).map_err(|_| {
                        Error::InvalidTriggerField(format!("unknown timezone: {tz}"))
                    })?;
                }
                let trigger = CalendarIntervalTrigger {
                    years: int_field(fields, "years").unwrap_or_default() as i32,
                    months: int_field(fields, "months").unwrap_or_default() as i32,
                    weeks: int_field(fields, "weeks").unwrap_or_default() as i32,
                    days: int_field(fields, "days").unwrap_or_default() as i32,
                    hour: int_field(fields, "hour").unwrap_or_default() as u32,
                    minute: int_field(fields, "minute").unwrap_or_default() as u32,
                    second: int_field(fields, "second").unwrap_or_default() as u32,
                    start_date,
                    end_date: str_field(fields, "end_date"),
                    timezone: str_field(fields, "timezone"),
                };
                if trigger.years == 0
                    && trigger.months == 0
                    && trigger.weeks == 0
                    && trigger.days == 0
                {
                    return Err(Error::InvalidTriggerField(
                        "calendar interval must be positive".to_string(),
                    ));
                }
                Ok(Trigger::CalendarInterval(trigger))
            }
            "date" => {
                let run_at = int_field(fields, "run_at").ok_or_else(|| {
                    Error::InvalidTriggerField("run_at is required".to_string())
                })?;
                Ok(Trigger::date(run_at))
            }
            _ => unreachable!(),
        }
    }

    /// Next fire instant strictly after `after`, None once exhausted.
    pub fn compute_next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(c) => cron_next(c, after),
            Trigger::Interval(i) => interval_next(i, after),
            Trigger::CalendarInterval(c) => calendar_next(c, after),
            Trigger::Date(d) => {
                let run_at = micros_to_datetime(d.run_at);
                (after < run_at).then_some(run_at)
            }
        }
    }
}

fn str_field(fields: &json::Map<String, json::Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(|v| match v {
        json::Value::String(s) => Some(s.clone()),
        json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn int_field(fields: &json::Map<String, json::Value>, key: &str) -> Option<i64> {
    fields.get(key).and_then(|v| v.as_i64())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::InvalidTriggerField(format!("invalid date: {s}")))
}

/// Validate a five field crontab expression and remap numeric day-of-week
/// values (0=Sunday..6=Saturday, 7=Sunday) to names, which every cron
/// dialect agrees on.
fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::InvalidTriggerField(format!(
            "cron expression must have 5 fields, got {}: '{expr}'",
            fields.len()
        )));
    }
    let dow = map_dow_field(fields[4])?;
    let normalized = format!(
        "{} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );
    // the cron crate wants a seconds column; prove the expression parses
    cron::Schedule::from_str(&format!("0 {normalized}"))
        .map_err(|e| Error::InvalidTriggerField(format!("invalid cron '{expr}': {e}")))?;
    Ok(normalized)
}

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn map_dow_field(field: &str) -> Result<String> {
    let mapped: Result<Vec<String>> = field
        .split(',')
        .map(|token| {
            let (range, step) = match token.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (token, None),
            };
            let mapped_range = if range == "*" {
                "*".to_string()
            } else if let Some((a, b)) = range.split_once('-') {
                format!("{}-{}", map_dow_value(a)?, map_dow_value(b)?)
            } else {
                map_dow_value(range)?
            };
            Ok(match step {
                Some(s) => format!("{mapped_range}/{s}"),
                None => mapped_range,
            })
        })
        .collect();
    Ok(mapped?.join(","))
}

fn map_dow_value(v: &str) -> Result<String> {
    if let Ok(n) = v.parse::<usize>() {
        if n <= 7 {
            return Ok(DOW_NAMES[n % 7].to_string());
        }
        return Err(Error::InvalidTriggerField(format!(
            "day-of-week out of range: {v}"
        )));
    }
    Ok(v.to_uppercase())
}

fn cron_next(c: &CronTrigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(&format!("0 {}", c.expr)).ok()?;
    let tz: Tz = match &c.timezone {
        Some(name) => Tz::from_str(name).ok()?,
        None => chrono_tz::UTC,
    };
    let mut after = after;
    if let Some(start) = c.start {
        let start = micros_to_datetime(start);
        if after < start {
            after = start - Duration::microseconds(1);
        }
    }
    let next = schedule.after(&after.with_timezone(&tz)).next()?;
    let next = next.with_timezone(&Utc);
    if let Some(end) = c.end {
        if next > micros_to_datetime(end) {
            return None;
        }
    }
    Some(next)
}

fn interval_micros(i: &IntervalTrigger) -> i64 {
    i.microseconds
        + 1_000_000
            * (i.seconds + 60 * i.minutes + 3600 * i.hours + 86400 * (i.days + 7 * i.weeks))
}

fn interval_next(i: &IntervalTrigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let step = interval_micros(i);
    let after_us = after.timestamp_micros();
    let next_us = if after_us < i.start {
        i.start
    } else {
        let elapsed = after_us - i.start;
        i.start + (elapsed / step + 1) * step
    };
    if let Some(end) = i.end {
        if next_us > end {
            return None;
        }
    }
    Some(micros_to_datetime(next_us))
}

fn calendar_next(c: &CalendarIntervalTrigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = match &c.timezone {
        Some(name) => Tz::from_str(name).ok()?,
        None => chrono_tz::UTC,
    };
    let start = parse_date(&c.start_date).ok()?;
    let end = c.end_date.as_deref().and_then(|d| parse_date(d).ok());

    let mut date = start;
    // bounded search: each step advances at least one day
    for _ in 0..100_000 {
        if let Some(end) = end {
            if date > end {
                return None;
            }
        }
        let local = date.and_hms_opt(c.hour, c.minute, c.second)?;
        // skip instants that do not exist in the target timezone
        if let Some(at) = tz.from_local_datetime(&local).earliest() {
            let at = at.with_timezone(&Utc);
            if at > after {
                return Some(at);
            }
        }
        date = advance_calendar(date, c.years, c.months, c.weeks * 7 + c.days)?;
    }
    None
}

fn advance_calendar(date: NaiveDate, years: i32, months: i32, days: i32) -> Option<NaiveDate> {
    let with_months = add_months_clamped(date, years * 12 + months)?;
    with_months.checked_add_signed(Duration::days(days as i64))
}

/// Month arithmetic with end-of-month clamping: 2024-01-31 + 1 month is
/// 2024-02-29.
fn add_months_clamped(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    if months == 0 {
        return Some(date);
    }
    let total = date.year() * 12 + date.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let mut day = date.day();
    while day > 0 {
        if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(d);
        }
        day -= 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_cron_every_minute() {
        let t = Trigger::cron("*/1 * * * *", None, None, None).unwrap();
        let after = utc(2024, 3, 1, 12, 0, 30);
        let next = t.compute_next(after).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 12, 1, 0));
    }

    #[test]
    fn test_cron_deterministic_and_monotonic() {
        let t = Trigger::cron("*/5 8-17 * * 1-5", None, None, None).unwrap();
        let t1 = utc(2024, 3, 1, 7, 0, 0);
        let t2 = utc(2024, 3, 1, 9, 3, 0);
        assert_eq!(t.compute_next(t1), t.compute_next(t1));
        assert!(t.compute_next(t1).unwrap() <= t.compute_next(t2).unwrap());
    }

    #[test]
    fn test_cron_numeric_day_of_week() {
        // 0 means Sunday
        let t = Trigger::cron("0 9 * * 0", None, None, None).unwrap();
        let next = t.compute_next(utc(2024, 3, 1, 0, 0, 0)).unwrap();
        // 2024-03-03 is a Sunday
        assert_eq!(next, utc(2024, 3, 3, 9, 0, 0));
        // 7 is Sunday as well
        let t7 = Trigger::cron("0 9 * * 7", None, None, None).unwrap();
        assert_eq!(t7.compute_next(utc(2024, 3, 1, 0, 0, 0)).unwrap(), next);
    }

    #[test]
    fn test_cron_timezone() {
        let t = Trigger::cron("30 9 * * *", Some("Europe/Berlin"), None, None).unwrap();
        let next = t.compute_next(utc(2024, 7, 1, 0, 0, 0)).unwrap();
        // 09:30 CEST is 07:30 UTC
        assert_eq!(next, utc(2024, 7, 1, 7, 30, 0));
    }

    #[test]
    fn test_cron_end_bound() {
        let end = utc(2024, 3, 1, 12, 0, 0).timestamp_micros();
        let t = Trigger::cron("*/1 * * * *", None, None, Some(end)).unwrap();
        assert!(t.compute_next(utc(2024, 3, 1, 11, 59, 30)).is_some());
        assert!(t.compute_next(utc(2024, 3, 1, 12, 0, 30)).is_none());
    }

    #[test]
    fn test_cron_rejects_bad_expressions() {
        assert!(Trigger::cron("* * * *", None, None, None).is_err());
        assert!(Trigger::cron("99 * * * *", None, None, None).is_err());
        assert!(Trigger::cron("* * * * 9", None, None, None).is_err());
    }

    #[test]
    fn test_interval_series() {
        let start = utc(2024, 1, 1, 0, 0, 0).timestamp_micros();
        let t = Trigger::interval(IntervalTrigger {
            seconds: 30,
            start,
            ..Default::default()
        })
        .unwrap();
        let next = t.compute_next(utc(2024, 1, 1, 0, 0, 45)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 1, 0));
        // before the anchor the first occurrence is the anchor itself
        let next = t.compute_next(utc(2023, 12, 31, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_interval_end() {
        let start = utc(2024, 1, 1, 0, 0, 0).timestamp_micros();
        let end = utc(2024, 1, 1, 0, 1, 0).timestamp_micros();
        let t = Trigger::interval(IntervalTrigger {
            seconds: 30,
            start,
            end: Some(end),
            ..Default::default()
        })
        .unwrap();
        assert!(t.compute_next(utc(2024, 1, 1, 0, 0, 40)).is_some());
        assert!(t.compute_next(utc(2024, 1, 1, 0, 1, 0)).is_none());
    }

    #[test]
    fn test_interval_rejects_zero() {
        assert!(Trigger::interval(IntervalTrigger::default()).is_err());
    }

    #[test]
    fn test_calendar_end_of_month_clamp() {
        let t = Trigger::CalendarInterval(CalendarIntervalTrigger {
            months: 1,
            start_date: "2024-01-31".to_string(),
            ..Default::default()
        });
        let next = t.compute_next(utc(2024, 2, 1, 0, 0, 0)).unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_calendar_pins_time_of_day() {
        let t = Trigger::CalendarInterval(CalendarIntervalTrigger {
            days: 1,
            hour: 6,
            minute: 30,
            start_date: "2024-03-01".to_string(),
            ..Default::default()
        });
        let next = t.compute_next(utc(2024, 3, 1, 7, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 2, 6, 30, 0));
        assert_eq!(next.hour(), 6);
    }

    #[test]
    fn test_date_fires_once() {
        let run_at = utc(2024, 6, 1, 12, 0, 0);
        let t = Trigger::date(run_at.timestamp_micros());
        assert_eq!(t.compute_next(utc(2024, 5, 1, 0, 0, 0)), Some(run_at));
        assert_eq!(t.compute_next(run_at), None);
    }

    #[test]
    fn test_from_spec_rejects_unknown_fields() {
        let mut fields = json::Map::new();
        fields.insert("crontab".to_string(), json::Value::from("* * * * *"));
        fields.insert("bogus".to_string(), json::Value::from(1));
        let err = Trigger::from_spec("cron", &fields).unwrap_err();
        assert!(matches!(err, Error::InvalidTriggerField(_)));
    }

    #[test]
    fn test_from_spec_crontab_exclusive_with_fields() {
        let mut fields = json::Map::new();
        fields.insert("crontab".to_string(), json::Value::from("* * * * *"));
        fields.insert("minute".to_string(), json::Value::from("5"));
        assert!(Trigger::from_spec("cron", &fields).is_err());
    }

    #[test]
    fn test_from_spec_separate_cron_fields() {
        let mut fields = json::Map::new();
        fields.insert("minute".to_string(), json::Value::from("15"));
        fields.insert("hour".to_string(), json::Value::from("3"));
        let t = Trigger::from_spec("cron", &fields).unwrap();
        let next = t.compute_next(utc(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 3, 15, 0));
    }

    #[test]
    fn test_trigger_serde_roundtrip() {
        let t = Trigger::cron("*/10 * * * *", Some("UTC"), None, None).unwrap();
        let s = json::to_string(&t).unwrap();
        let back: Trigger = json::from_str(&s).unwrap();
        assert_eq!(t, back);
    }
}

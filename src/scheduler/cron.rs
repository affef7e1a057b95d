//! Five-field cron expressions evaluated in a configured time zone.
//!
//! The `cron` crate wants a leading seconds field and numbers day-of-week
//! 1..=7 from Sunday, while classic cron uses 0..=7 with both 0 and 7 meaning
//! Sunday. Expressions are translated before parsing: seconds pinned to 0,
//! numeric weekdays rewritten as names.
//!
//! When both day-of-month and day-of-week are restricted (neither starts
//! with `*`), classic cron fires on a day matching either one. The `cron`
//! crate requires both, so such expressions become two schedules and the
//! earlier slot wins.

use crate::error::{KeeperError, KeeperResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<Schedule>,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, tz: Tz) -> KeeperResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(KeeperError::config(format!(
                "cron expression {expression:?} must have 5 fields (minute hour day-of-month month day-of-week), found {}",
                fields.len()
            )));
        }
        let dow = translate_weekdays(fields[4])
            .ok_or_else(|| KeeperError::config(format!("invalid day-of-week field {:?}", fields[4])))?;
        let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
        let variants = if is_restricted(dom) && is_restricted(fields[4]) {
            vec![(dom, "*".to_string()), ("*", dow)]
        } else {
            vec![(dom, dow)]
        };
        let schedules = variants
            .into_iter()
            .map(|(dom, dow)| {
                Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}")).map_err(|e| {
                    KeeperError::config(format!("invalid cron expression {expression:?}: {e}"))
                })
            })
            .collect::<KeeperResult<Vec<_>>>()?;
        Ok(Self {
            expression: fields.join(" "),
            schedules,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .min()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn weekday_name(token: &str) -> Option<String> {
    if token.chars().all(|c| c.is_ascii_digit()) {
        let n: usize = token.parse().ok()?;
        WEEKDAYS.get(n).map(|s| s.to_string())
    } else {
        Some(token.to_ascii_uppercase())
    }
}

fn translate_weekdays(field: &str) -> Option<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        let translated = if range == "*" || range == "?" {
            range.to_string()
        } else if let Some((start, end)) = range.split_once('-') {
            let start_name = weekday_name(start)?;
            // `N-7` / `N-0` run through Sunday, which the cron crate numbers first
            if start != "0" && (end == "7" || end == "0") {
                match step {
                    None => format!("{start_name}-SAT,SUN"),
                    Some(_) => return None,
                }
            } else {
                format!("{start_name}-{}", weekday_name(end)?)
            }
        } else {
            weekday_name(range)?
        };
        match step {
            Some(s) => items.push(format!("{translated}/{s}")),
            None => items.push(translated),
        }
    }
    Some(items.join(","))
}

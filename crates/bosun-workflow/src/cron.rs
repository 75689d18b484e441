// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! 5-field cron expressions and the per-workflow scheduling loops.
//!
//! Expression parsing and next-match iteration ride on the `cron` crate.
//! The wire format is classic 5-field cron (minute, hour, day-of-month,
//! month, day-of-week with 0 = Sunday); the crate wants a seconds field
//! and 1-indexed Sundays, so [`CronExpr::parse`] normalizes between the
//! two. Next-fire looks at most 366 days ahead; matches beyond that
//! horizon are reported as no fire at all. Schedules evaluate in local
//! wall-clock time, so a minute inside a DST spring-forward gap never
//! materializes and a fall-back overlap fires at its first occurrence
//! only.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use cron::{Schedule, TimeUnitSpec};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("day-of-week value {0} out of range 0..=6")]
    DayOfWeek(u32),
    #[error("step must be positive")]
    ZeroStep,
    #[error("invalid cron expression: {0}")]
    Invalid(String),
}

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// Matches beyond this horizon count as "never fires".
const SCAN_DAYS: i64 = 366;

#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
    fields: [BTreeSet<u32>; 5],
}

impl CronExpr {
    /// Parse a 5-field expression. Supported atoms per field: `*`, `N`,
    /// `N-M`, `*/S`, `N-M/S`, joined by commas.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }
        // The cron crate treats `*/0` as `*`; a zero step is a user error
        // and must be rejected, not silently widened.
        for part in &parts {
            for atom in part.split(',') {
                if let Some((_, step)) = atom.split_once('/') {
                    if step.parse::<u32>().ok() == Some(0) {
                        return Err(CronError::ZeroStep);
                    }
                }
            }
        }

        // Prepend a seconds field and shift day-of-week from the classic
        // 0..6 (0 = Sunday) to the crate's 1..7 (1 = Sunday).
        let dow = shift_day_of_week(parts[4])?;
        let normalized = format!(
            "0 {} {} {} {} {}",
            parts[0], parts[1], parts[2], parts[3], dow
        );
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CronError::Invalid(e.to_string()))?;

        let fields = [
            ordinals(schedule.minutes()),
            ordinals(schedule.hours()),
            ordinals(schedule.days_of_month()),
            ordinals(schedule.months()),
            // Back to the 0 = Sunday convention for callers.
            schedule.days_of_week().iter().map(|d| d - 1).collect(),
        ];

        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
            fields,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Allowed integers for one field (0 = minute .. 4 = day-of-week,
    /// day-of-week in 0..=6 with 0 = Sunday).
    pub fn field(&self, index: usize) -> &BTreeSet<u32> {
        &self.fields[index]
    }

    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.fields[0].contains(&t.minute())
            && self.fields[1].contains(&t.hour())
            && self.fields[2].contains(&t.day())
            && self.fields[3].contains(&t.month())
            && self.fields[4].contains(&t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`, or `None` when
    /// nothing matches within 366 days.
    pub fn next_fire<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let fire = self.schedule.after(&after).next()?;
        if fire.clone() - after > Duration::days(SCAN_DAYS) {
            return None;
        }
        Some(fire)
    }

    /// Human-readable field breakdown, e.g. for schedule validation
    /// replies.
    pub fn describe(&self) -> String {
        self.source
            .split_whitespace()
            .zip(FIELD_NAMES)
            .map(|(atom, name)| format!("{name}: {atom}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn ordinals<T: TimeUnitSpec>(unit: &T) -> BTreeSet<u32> {
    unit.iter().collect()
}

/// Rewrite a day-of-week field from 0..6 (0 = Sunday) to the crate's
/// 1..7. Only range endpoints shift; step values pass through.
fn shift_day_of_week(field: &str) -> Result<String, CronError> {
    let mut atoms = Vec::new();
    for atom in field.split(',') {
        let (range, step) = match atom.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (atom, None),
        };
        let shifted = if range == "*" {
            "*".to_string()
        } else if let Some((lo, hi)) = range.split_once('-') {
            format!("{}-{}", shift_value(lo)?, shift_value(hi)?)
        } else {
            shift_value(range)?.to_string()
        };
        atoms.push(match step {
            Some(step) => format!("{shifted}/{step}"),
            None => shifted,
        });
    }
    Ok(atoms.join(","))
}

fn shift_value(text: &str) -> Result<u32, CronError> {
    let value: u32 = text
        .parse()
        .map_err(|_| CronError::Invalid(format!("bad day-of-week value '{text}'")))?;
    if value > 6 {
        return Err(CronError::DayOfWeek(value));
    }
    Ok(value + 1)
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// Invoked with the workflow id each time its schedule fires.
pub type FireCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// One sleep-until loop per workflow id.
///
/// Re-scheduling an id cancels and replaces its loop; `schedule_all`
/// replaces the full set. At most one loop per id exists at any instant.
pub struct CronScheduler {
    jobs: Mutex<HashMap<String, CancellationToken>>,
    callback: FireCallback,
}

impl CronScheduler {
    pub fn new(callback: FireCallback) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            callback,
        }
    }

    pub async fn schedule(&self, id: &str, expr: CronExpr) {
        let token = CancellationToken::new();
        if let Some(old) = self
            .jobs
            .lock()
            .await
            .insert(id.to_string(), token.clone())
        {
            old.cancel();
        }
        info!(workflow = %id, cron = %expr.source(), "scheduled");

        let id = id.to_string();
        let callback = Arc::clone(&self.callback);
        tokio::spawn(async move {
            loop {
                let Some(next) = expr.next_fire(chrono::Local::now()) else {
                    warn!(workflow = %id, "no matching minute within a year, stopping loop");
                    break;
                };
                let wait = (next.clone() - chrono::Local::now())
                    .to_std()
                    .unwrap_or_default();
                debug!(workflow = %id, fire = %next, "sleeping until next fire");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        callback(id.clone()).await;
                    }
                }
            }
        });
    }

    pub async fn unschedule(&self, id: &str) {
        if let Some(token) = self.jobs.lock().await.remove(id) {
            token.cancel();
        }
    }

    /// Replace the full set of scheduling loops.
    pub async fn schedule_all(&self, jobs: Vec<(String, CronExpr)>) {
        {
            let mut current = self.jobs.lock().await;
            for (_, token) in current.drain() {
                token.cancel();
            }
        }
        for (id, expr) in jobs {
            self.schedule(&id, expr).await;
        }
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stop_all(&self) {
        self.schedule_all(Vec::new()).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

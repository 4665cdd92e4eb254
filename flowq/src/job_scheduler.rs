//! Repeatable jobs.
//!
//! A job scheduler owns at most one pending iteration at a time. Iteration
//! ids are derived from `(scheduler id, run time)`, so concurrent or
//! duplicate scheduling attempts converge on the same job instead of
//! creating copies. The next iteration is created atomically when a worker
//! claims the current one.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::opts::JobOptions;
use crate::queue::Queue;
use crate::store::Store;

/// When a scheduler fires.
///
/// Exactly one of `every` and `pattern` must be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepeatOptions {
    /// Fixed interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every: Option<i64>,
    /// Cron expression with 5 (minute first) or 6 (second first) fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    /// Maximum number of iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Run the first iteration of a pattern right away.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub immediately: bool,
    /// Scheduler id used when repeating through `JobOptions::repeat`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl RepeatOptions {
    pub fn every(every_ms: i64) -> Self {
        Self {
            every: Some(every_ms),
            ..Default::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn with_start_date(mut self, start_ms: i64) -> Self {
        self.start_date = Some(start_ms);
        self
    }

    pub fn with_end_date(mut self, end_ms: i64) -> Self {
        self.end_date = Some(end_ms);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_immediately(mut self, immediately: bool) -> Self {
        self.immediately = immediately;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        match (&self.every, &self.pattern) {
            (Some(_), Some(_)) => Err(QueueError::InvalidOptions(
                "both pattern and every are set for this scheduler".into(),
            )),
            (None, None) => Err(QueueError::InvalidOptions(
                "either pattern or every must be set".into(),
            )),
            (Some(every), None) if *every <= 0 => Err(
                QueueError::InvalidOptions("every must be positive".into()),
            ),
            (None, Some(pattern)) => parse_pattern(pattern).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Scheduler id for a job added with these repeat options.
    pub fn scheduler_id(&self, job_name: &str) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }
        match (&self.every, &self.pattern) {
            (Some(every), _) => format!("{job_name}:every:{every}"),
            (_, Some(pattern)) => format!("{job_name}:pattern:{pattern}"),
            _ => job_name.to_string(),
        }
    }
}

fn parse_pattern(pattern: &str) -> QueueResult<cron::Schedule> {
    let normalized = if pattern.split_whitespace().count() == 5 {
        format!("0 {pattern}")
    } else {
        pattern.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|err| {
        QueueError::InvalidOptions(format!("invalid pattern {pattern}: {err}"))
    })
}

/// Compute the next run time in epoch milliseconds.
///
/// `prev` is the scheduled time of the iteration that just ran, if any.
/// Returns `None` once `end_date` is passed.
pub fn next_run(
    repeat: &RepeatOptions,
    now: i64,
    prev: Option<i64>,
) -> QueueResult<Option<i64>> {
    repeat.validate()?;
    let start = repeat.start_date.unwrap_or(i64::MIN);

    let next = match (repeat.every, &repeat.pattern) {
        (Some(every), _) => match prev {
            None => Some(now.max(start)),
            Some(prev) => Some(prev.saturating_add(every).max(now).max(start)),
        },
        (None, Some(pattern)) => {
            let reference = now.max(prev.unwrap_or(i64::MIN)).max(start);
            if prev.is_none() && repeat.immediately {
                Some(reference)
            } else {
                let schedule = parse_pattern(pattern)?;
                let after = DateTime::<Utc>::from_timestamp_millis(reference)
                    .ok_or_else(|| {
                        QueueError::InvalidOptions(format!(
                            "timestamp {reference} out of range"
                        ))
                    })?;
                schedule
                    .after(&after)
                    .next()
                    .map(|at| at.timestamp_millis())
            }
        }
        (None, None) => None,
    };

    Ok(next.filter(|at| repeat.end_date.is_none_or(|end| *at <= end)))
}

/// Id of the iteration a scheduler creates for `millis`.
pub fn iteration_job_id(scheduler_id: &str, millis: i64) -> String {
    format!("repeat:{scheduler_id}:{millis}")
}

/// Name, payload and options every iteration is created with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub opts: JobOptions,
}

impl JobTemplate {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    fn validate(&self) -> QueueResult<()> {
        if self.opts.job_id.is_some() {
            return Err(QueueError::InvalidOptions(
                "scheduler templates cannot set a job id".into(),
            ));
        }
        if self.opts.repeat.is_some() || self.opts.parent.is_some() {
            return Err(QueueError::InvalidOptions(
                "scheduler templates cannot repeat or have a parent".into(),
            ));
        }
        self.opts.validate()
    }
}

/// Stored state of a job scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct JobScheduler {
    pub id: String,
    pub repeat: RepeatOptions,
    pub template: JobTemplate,
    pub iteration_count: u32,
    /// Scheduled time of the pending iteration.
    pub next: Option<i64>,
}

pub(crate) mod field {
    pub const NAME: &str = "name";
    pub const DATA: &str = "data";
    pub const OPTS: &str = "opts";
    pub const REPEAT: &str = "repeat";
    pub const ITERATIONS: &str = "ic";
    pub const NEXT: &str = "next";
}

impl JobScheduler {
    pub(crate) fn from_hash(
        id: &str,
        hash: &HashMap<String, String>,
    ) -> QueueResult<Option<Self>> {
        let Some(name) = hash.get(field::NAME) else {
            return Ok(None);
        };
        let data = match hash.get(field::DATA) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        let opts = match hash.get(field::OPTS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let repeat = match hash.get(field::REPEAT) {
            Some(raw) => serde_json::from_str(raw)?,
            None => RepeatOptions::default(),
        };
        Ok(Some(Self {
            id: id.to_string(),
            repeat,
            template: JobTemplate {
                name: name.clone(),
                data,
                opts,
            },
            iteration_count: hash
                .get(field::ITERATIONS)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_default(),
            next: hash.get(field::NEXT).and_then(|raw| raw.parse().ok()),
        }))
    }

    /// Whether the iteration limit allows another run.
    pub fn can_run_again(&self) -> bool {
        self.repeat
            .limit
            .is_none_or(|limit| self.iteration_count < limit)
    }
}

impl<S: Store> Queue<S> {
    /// Create or replace a job scheduler and its first iteration.
    ///
    /// Replacing a scheduler drops its pending iteration if that iteration
    /// has not been claimed yet.
    pub async fn upsert_job_scheduler(
        &self,
        scheduler_id: &str,
        repeat: RepeatOptions,
        template: JobTemplate,
    ) -> QueueResult<Option<Job>> {
        repeat.validate()?;
        template.validate()?;
        let template = JobTemplate {
            opts: template.opts.merged_over(&self.config().default_job_options)?,
            ..template
        };
        let created = self
            .scripts()
            .upsert_job_scheduler(scheduler_id, repeat, template)
            .await?;
        tracing::info!(
            queue = %self.name(),
            scheduler_id,
            iteration = created.as_deref().unwrap_or("none"),
            "job scheduler upserted"
        );
        match created {
            Some(id) => self.get_job(&id).await,
            None => Ok(None),
        }
    }

    pub async fn remove_job_scheduler(&self, scheduler_id: &str) -> QueueResult<bool> {
        self.scripts().remove_job_scheduler(scheduler_id).await
    }

    pub async fn get_job_scheduler(
        &self,
        scheduler_id: &str,
    ) -> QueueResult<Option<JobScheduler>> {
        self.scripts().get_job_scheduler(scheduler_id).await
    }

    /// All schedulers ordered by their next run.
    pub async fn get_job_schedulers(&self) -> QueueResult<Vec<JobScheduler>> {
        self.scripts().get_job_schedulers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_and_pattern_are_exclusive() {
        let both = RepeatOptions {
            every: Some(1_000),
            pattern: Some("* * * * *".into()),
            ..Default::default()
        };
        assert!(both.validate().is_err());
        assert!(RepeatOptions::default().validate().is_err());
        assert!(RepeatOptions::every(0).validate().is_err());
        assert!(RepeatOptions::pattern("not a cron").validate().is_err());
    }

    #[test]
    fn test_every_next_run() {
        let repeat = RepeatOptions::every(1_000);
        assert_eq!(next_run(&repeat, 5_000, None).unwrap(), Some(5_000));
        assert_eq!(next_run(&repeat, 5_100, Some(5_000)).unwrap(), Some(6_000));
        // A late claim does not schedule in the past.
        assert_eq!(next_run(&repeat, 9_000, Some(5_000)).unwrap(), Some(9_000));

        let delayed_start = RepeatOptions::every(1_000).with_start_date(20_000);
        assert_eq!(
            next_run(&delayed_start, 5_000, None).unwrap(),
            Some(20_000)
        );
    }

    #[test]
    fn test_pattern_next_run() {
        let every_five_seconds = RepeatOptions::pattern("*/5 * * * * *");
        assert_eq!(
            next_run(&every_five_seconds, 1_000, None).unwrap(),
            Some(5_000)
        );
        assert_eq!(
            next_run(&every_five_seconds, 5_200, Some(5_000)).unwrap(),
            Some(10_000)
        );

        let hourly = RepeatOptions::pattern("0 * * * *");
        assert_eq!(next_run(&hourly, 1_000, None).unwrap(), Some(3_600_000));

        let immediate = RepeatOptions::pattern("0 * * * *").with_immediately(true);
        assert_eq!(next_run(&immediate, 1_000, None).unwrap(), Some(1_000));
    }

    #[test]
    fn test_end_date_stops_schedule() {
        let repeat = RepeatOptions::every(1_000).with_end_date(5_500);
        assert_eq!(next_run(&repeat, 5_000, Some(4_000)).unwrap(), Some(5_000));
        assert_eq!(next_run(&repeat, 5_100, Some(5_000)).unwrap(), None);
    }

    #[test]
    fn test_iteration_ids_are_deterministic() {
        assert_eq!(iteration_job_id("nightly", 1_000), "repeat:nightly:1000");
        assert_eq!(
            RepeatOptions::every(500).scheduler_id("tick"),
            "tick:every:500"
        );
    }

    #[test]
    fn test_limit() {
        let scheduler = JobScheduler {
            id: "s".into(),
            repeat: RepeatOptions::every(10).with_limit(2),
            template: JobTemplate::new("t", Value::Null),
            iteration_count: 2,
            next: None,
        };
        assert!(!scheduler.can_run_again());
    }
}

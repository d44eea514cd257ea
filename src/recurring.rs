//! Recurring task definitions evaluated by the scheduler.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::{
    config::RecurringTaskConfig,
    error::ConfigError,
    store::{NewJob, Occurrence},
};

/// Upper bound on occurrences produced by one evaluation window.
const MAX_OCCURRENCES_PER_WINDOW: usize = 100;

/// A cron schedule plus the job it enqueues.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    pub key: String,
    pub schedule: Schedule,
    pub command: String,
    pub queue: String,
    pub priority: i32,
    pub timezone: Tz,
}

impl RecurringTask {
    pub fn new(
        key: impl Into<String>,
        expression: &str,
        command: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        let schedule = Schedule::from_str(expression).map_err(|e| {
            ConfigError::Invalid(format!(
                "Invalid cron expression '{expression}' for recurring task '{key}': {e}"
            ))
        })?;
        Ok(Self {
            key,
            schedule,
            command: command.into(),
            queue: "default".to_string(),
            priority: 0,
            timezone: Tz::UTC,
        })
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn from_config(key: &str, config: &RecurringTaskConfig) -> Result<Self, ConfigError> {
        let mut task = Self::new(key, &config.schedule, config.command.clone())?
            .queue(config.queue.clone())
            .priority(config.priority);
        if let Some(name) = &config.timezone {
            let timezone = name.parse::<Tz>().map_err(|e| {
                ConfigError::Invalid(format!(
                    "Unknown timezone '{name}' for recurring task '{key}': {e}"
                ))
            })?;
            task = task.timezone(timezone);
        }
        Ok(task)
    }

    /// Run times in `(after, until]`, in UTC.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .map(|at| at.with_timezone(&Utc))
            .take_while(|at| *at <= until)
            .take(MAX_OCCURRENCES_PER_WINDOW)
            .collect()
    }

    pub fn occurrence(&self, run_at: DateTime<Utc>) -> Occurrence {
        Occurrence {
            task: self.key.clone(),
            run_at,
            job: NewJob::new(self.queue.clone(), self.command.clone()).priority(self.priority),
        }
    }
}

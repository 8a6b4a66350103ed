//! Cron scheduler feeding the inbound pipeline.
//!
//! Jobs carry a cron expression and a message body. Once per minute the
//! scheduler evaluates every enabled job; a match synthesises an
//! [`InboundMessage`] with `channel_id = "cron:<name>"` and dispatches it
//! through the same pipeline real channels use, so scheduled work gets the
//! full routing/loop/verification treatment. A job fires at most once per
//! minute tick regardless of how often the tick is evaluated.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::pipeline::InboundPipeline;
use crate::channels::types::{InboundMessage, Sender};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },
    #[error("job '{0}' already exists")]
    DuplicateJob(String),
}

#[derive(Debug, Clone)]
pub struct CronJob {
    pub name: String,
    pub schedule: String,
    pub message: String,
    pub enabled: bool,
    pub user_id: Option<String>,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            message: message.into(),
            enabled: true,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

struct ScheduledJob {
    job: CronJob,
    compiled: Schedule,
}

pub struct Scheduler {
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
    pipeline: Arc<InboundPipeline>,
    /// Dedup keys (`name@minute`) already fired this minute.
    fired: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<InboundPipeline>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            pipeline,
            fired: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub async fn add_job(&self, job: CronJob) -> Result<(), SchedulerError> {
        let compiled = compile_expression(&job.schedule)?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.name) {
            return Err(SchedulerError::DuplicateJob(job.name));
        }
        info!(job = %job.name, schedule = %job.schedule, "Cron job added");
        jobs.insert(job.name.clone(), ScheduledJob { job, compiled });
        Ok(())
    }

    pub async fn remove_job(&self, name: &str) -> bool {
        let removed = self.jobs.write().await.remove(name).is_some();
        if removed {
            info!(job = %name, "Cron job removed");
        }
        removed
    }

    pub async fn size(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Spawns the minute tick task.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            info!("Scheduler started");
            loop {
                let wait = millis_to_next_minute();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait)) => {}
                }
                scheduler.tick(Utc::now()).await;
            }
            info!("Scheduler stopped");
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Evaluates every enabled job against the minute containing `now` and
    /// dispatches the matches. Idempotent within one minute.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let minute = minute_floor(now);
        let minute_key = minute.timestamp() / 60;

        let due: Vec<CronJob> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|s| s.job.enabled && fires_in_minute(&s.compiled, minute))
                .map(|s| s.job.clone())
                .collect()
        };

        let mut fired = self.fired.lock().await;
        // Only the current minute's keys matter; older ones can never
        // recur.
        fired.retain(|k| k.ends_with(&format!("@{minute_key}")));

        for job in due {
            let key = format!("{}@{minute_key}", job.name);
            if !fired.insert(key) {
                debug!(job = %job.name, "Job already fired this minute, skipping");
                continue;
            }
            info!(job = %job.name, "Cron job firing");
            let channel_id = format!("cron:{}", job.name);
            let from = Sender {
                channel_id: channel_id.clone(),
                user_id: job.user_id.clone(),
                group_id: None,
                thread_id: None,
                name: None,
            };
            let msg = InboundMessage::new(channel_id, from, job.message.clone());
            self.pipeline.dispatch(msg);
        }
    }
}

/// The `cron` crate wants a seconds field; plain 5-field expressions are
/// accepted by pinning seconds to zero.
fn compile_expression(expression: &str) -> Result<Schedule, SchedulerError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        warn!(expression = %expression, error = %e, "Rejecting cron expression");
        SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            message: e.to_string(),
        }
    })
}

fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn fires_in_minute(schedule: &Schedule, minute: DateTime<Utc>) -> bool {
    let just_before = minute - ChronoDuration::seconds(1);
    schedule
        .after(&just_before)
        .next()
        .is_some_and(|next| next < minute + ChronoDuration::seconds(60))
}

fn millis_to_next_minute() -> u64 {
    let now = Utc::now();
    let next = minute_floor(now) + ChronoDuration::seconds(60);
    (next - now).num_milliseconds().max(50) as u64
}

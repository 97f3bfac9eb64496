use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Bytes = Vec<u8>;

/// Priority assigned to jobs that don't ask for one. Lower is higher priority.
pub const DEFAULT_PRIORITY: i16 = 100;

/// A snapshot of a `jobs` row, read inside the claiming transaction after the
/// advisory lock on its id was acquired.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Job {
    /// A unique id identifying a job. Doubles as the advisory lock key.
    pub id: i64,
    /// The queue this job belongs to. The empty string is the default queue.
    pub queue: String,
    /// Sort priority. Lower numeric values are claimed first.
    pub priority: i16,
    /// The earliest time this job is eligible to run.
    pub run_at: DateTime<Utc>,
    /// The job type, routing the job to a handler.
    #[sqlx(rename = "type")]
    pub job_type: String,
    /// Opaque payload bytes. Handlers interpret; the queue does not.
    pub args: Bytes,
    /// How many attempts have failed so far.
    pub error_count: i32,
    /// The message recorded by the most recent failed attempt.
    pub last_error: Option<String>,
}

/// The chunk of data needed to enqueue a job.
/// Anything not set explicitly takes the queue's defaults: the default queue,
/// [`DEFAULT_PRIORITY`], a `run_at` of now, and an empty JSON array payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub priority: i16,
    /// When `None`, the database fills in `now()`.
    pub run_at: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub job_type: String,
    pub args: Bytes,
}

impl NewJob {
    pub fn new(job_type: &str) -> Self {
        Self {
            queue: String::new(),
            priority: DEFAULT_PRIORITY,
            run_at: None,
            job_type: job_type.to_owned(),
            args: b"[]".to_vec(),
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn args(mut self, args: Bytes) -> Self {
        self.args = args;
        self
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ratchet_core::{LockedJob, RetryPolicy};

/// A handler for one job type.
///
/// Handlers receive the claimed job and succeed or fail; the worker turns
/// the outcome into the matching terminal operation. A handler may also
/// settle the job itself (delete, error, or release) and simply return: all
/// terminal operations on a settled handle are no-ops.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &mut LockedJob) -> Result<(), anyhow::Error>;
}

pub(crate) struct WorkItem {
    pub handler: Arc<dyn JobHandler>,
    pub retry_policy: RetryPolicy,
}

/// Mapping from a job's `type` to the handler that runs it.
/// Built before the pool starts and read-only afterwards.
#[derive(Default)]
pub struct JobRegistry {
    items: HashMap<String, WorkItem>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type` with the default retry backoff.
    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.register_with_policy(job_type, handler, RetryPolicy::default());
    }

    /// Register `handler` for `job_type` with a per-type retry backoff.
    pub fn register_with_policy(
        &mut self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        retry_policy: RetryPolicy,
    ) {
        self.items.insert(
            job_type.to_owned(),
            WorkItem {
                handler,
                retry_policy,
            },
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&WorkItem> {
        self.items.get(job_type)
    }
}

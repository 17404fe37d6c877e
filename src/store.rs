//! Durable job record store.
//!
//! The record store is the single source of truth for job state; the broker
//! is a best-effort acceleration path on top of it. Backends live behind the
//! [`JobStore`] trait; `MemoryJobStore` ships for the dev server and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{Job, JobMetadata, JobStatus};

/// Partial update of a job record. `None` fields are left untouched, so a
/// caller can patch a subset safely.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub generated_code: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<JobMetadata>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new job in `generating` state.
    async fn create(&self, outline: &str) -> Result<Job>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Apply a partial patch. A terminal status never reverts to
    /// `generating`; such a patch keeps the stored status.
    async fn update(&self, id: &str, patch: JobPatch) -> Result<Job>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory store backed by a `HashMap`. The mutex is never held across an
/// await point.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, outline: &str) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Generating,
            outline: outline.to_string(),
            generated_code: None,
            error_message: None,
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
        };
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| anyhow::anyhow!("Job store lock poisoned: {}", e))?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| anyhow::anyhow!("Job store lock poisoned: {}", e))?;
        Ok(jobs.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| anyhow::anyhow!("Job store lock poisoned: {}", e))?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Job {} not found", id))?;

        if let Some(status) = patch.status {
            if job.status.is_terminal() && status == JobStatus::Generating {
                tracing::warn!(
                    job_id = %id,
                    current = job.status.as_str(),
                    "Ignoring status downgrade on terminal job"
                );
            } else {
                job.status = status;
            }
        }
        if let Some(code) = patch.generated_code {
            job.generated_code = Some(code);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(metadata) = patch.metadata {
            job.metadata = metadata;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| anyhow::anyhow!("Job store lock poisoned: {}", e))?;
        jobs.remove(id);
        Ok(())
    }
}

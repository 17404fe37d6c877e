//! Generation pipeline.
//!
//! Drives one job through generation → validation → optional auto-fix →
//! persistence. Progress is emitted to the broker as it happens; the durable
//! job record is written exactly once at the terminal transition (plus a
//! best-effort write if an error escapes a branch). Terminal writes are
//! idempotent: a record that already reached `generated` or `failed` is
//! never overwritten.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::EventBroker;
use crate::errors::PipelineError;
use crate::models::{GenerationOptions, Job, JobMetadata, JobStatus, StreamEvent};
use crate::providers::{
    CorrectiveGenerator, GenerationContext, Generator, ImageProvider, TokenUsage, Validator,
};
use crate::retry::Backoff;
use crate::store::{JobPatch, JobStore};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Total generation attempts (first try included). Only the generation
    /// step is retried; validation and persistence failures are not.
    pub max_generation_attempts: u32,
    pub backoff: Backoff,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(8)),
        }
    }
}

/// Terminal result of a handled run. Escaped errors (persistence failures,
/// collaborator bugs) surface as `Err` from [`GenerationPipeline::run`]
/// instead, after a best-effort `failed` write.
#[derive(Debug)]
pub enum RunOutcome {
    Generated(Job),
    Failed(Job),
}

pub struct GenerationPipeline {
    store: Arc<dyn JobStore>,
    broker: Arc<EventBroker>,
    generator: Arc<dyn Generator>,
    fixer: Arc<dyn CorrectiveGenerator>,
    validator: Arc<dyn Validator>,
    images: Option<Arc<dyn ImageProvider>>,
    config: PipelineConfig,
}

impl GenerationPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<EventBroker>,
        generator: Arc<dyn Generator>,
        fixer: Arc<dyn CorrectiveGenerator>,
        validator: Arc<dyn Validator>,
        images: Option<Arc<dyn ImageProvider>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            broker,
            generator,
            fixer,
            validator,
            images,
            config,
        }
    }

    /// Run the pipeline to a terminal state for one job.
    ///
    /// Any error that escapes the handled branches is caught here once,
    /// forces a best-effort terminal `failed` write, and is re-raised so an
    /// outer orchestration layer can apply its own retry policy to the whole
    /// run.
    pub async fn run(
        &self,
        job_id: &str,
        outline: &str,
        options: &GenerationOptions,
    ) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();
        match self.run_inner(job_id, outline, options, started).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = err.to_string();
                if let Err(write_err) = self.fail_job(job_id, &message, None).await {
                    tracing::warn!(job_id, "Best-effort failure write did not land: {}", write_err);
                }
                Err(err)
            }
        }
    }

    /// Spawn a detached run. Callers observe the outcome through the stream
    /// endpoint or by re-reading the job record.
    pub fn spawn_run(self: &Arc<Self>, job: Job, options: GenerationOptions) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            match pipeline.run(&job.id, &job.outline, &options).await {
                Ok(RunOutcome::Generated(_)) => {
                    tracing::info!(job_id = %job.id, "Generation complete");
                }
                Ok(RunOutcome::Failed(job)) => {
                    tracing::warn!(
                        job_id = %job.id,
                        error = job.error_message.as_deref().unwrap_or(""),
                        "Generation failed"
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, "Pipeline run aborted: {}", e);
                }
            }
        });
    }

    async fn run_inner(
        &self,
        job_id: &str,
        outline: &str,
        options: &GenerationOptions,
        started: Instant,
    ) -> Result<RunOutcome, PipelineError> {
        let mut meta = JobMetadata {
            trace_id: Some(Uuid::new_v4().to_string()),
            ..JobMetadata::default()
        };

        let ctx = self.fetch_images(job_id, outline, options).await;

        // ── Generation (the only step retried with backoff) ─────────────
        self.broker
            .emit(&StreamEvent::status(job_id, JobStatus::Generating, "generating code"));

        let max_attempts = self.config.max_generation_attempts.max(1);
        let mut last_error: Option<anyhow::Error> = None;
        let mut output = None;
        for attempt in 1..=max_attempts {
            let broker = &self.broker;
            let sink = move |chunk: &str| broker.emit(&StreamEvent::chunk(job_id, chunk));
            match self.generator.generate(outline, &ctx, &sink).await {
                Ok(out) => {
                    meta.retry_count = attempt - 1;
                    output = Some(out);
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id, attempt, "Generation attempt failed: {:#}", e);
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        let output = match output {
            Some(output) => output,
            None => {
                meta.retry_count = max_attempts - 1;
                meta.duration_ms = started.elapsed().as_millis() as u64;
                let message = PipelineError::Generation {
                    attempts: max_attempts,
                    message: last_error
                        .map(|e| format!("{:#}", e))
                        .unwrap_or_else(|| "unknown error".to_string()),
                }
                .to_string();
                let job = self.fail_job(job_id, &message, Some(meta)).await?;
                return Ok(RunOutcome::Failed(job));
            }
        };

        let mut code = output.code;
        let mut usage = output.usage;

        // ── Validation / auto-fix ───────────────────────────────────────
        let validation = self.validator.validate(&code);
        if !validation.is_valid {
            if validation.errors.is_empty() {
                // Invalid with nothing to report is a validator bug.
                meta.duration_ms = started.elapsed().as_millis() as u64;
                let job = self
                    .fail_job(job_id, "Validation failed without reported errors", Some(meta))
                    .await?;
                return Ok(RunOutcome::Failed(job));
            }

            meta.auto_fix_attempted = true;
            let original = validation.errors.join("; ");
            tracing::info!(job_id, errors = %original, "Validation failed, attempting auto-fix");

            match self.fixer.fix(&code, &validation.errors, &ctx).await {
                Ok(fixed) => {
                    let revalidation = self.validator.validate(&fixed.code);
                    if revalidation.is_valid {
                        usage = usage.add(fixed.usage);
                        code = fixed.code;
                        meta.auto_fix_applied = true;
                        // Replace, not append: subscribers hold the broken buffer.
                        self.broker.emit(&StreamEvent::update(job_id, code.clone()));
                    } else {
                        let message = PipelineError::CorrectiveFailed {
                            original,
                            fix: revalidation.errors.join("; "),
                        }
                        .to_string();
                        meta.duration_ms = started.elapsed().as_millis() as u64;
                        let job = self.fail_job(job_id, &message, Some(meta)).await?;
                        return Ok(RunOutcome::Failed(job));
                    }
                }
                Err(e) => {
                    let message = PipelineError::CorrectiveFailed {
                        original,
                        fix: format!("fix step failed: {:#}", e),
                    }
                    .to_string();
                    meta.duration_ms = started.elapsed().as_millis() as u64;
                    let job = self.fail_job(job_id, &message, Some(meta)).await?;
                    return Ok(RunOutcome::Failed(job));
                }
            }
        }

        // ── Saving: the single authoritative success write ──────────────
        meta.prompt_tokens = usage.prompt_tokens;
        meta.completion_tokens = usage.completion_tokens;
        meta.duration_ms = started.elapsed().as_millis() as u64;
        let job = self
            .store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Generated),
                    generated_code: Some(code.clone()),
                    metadata: Some(meta),
                    ..JobPatch::default()
                },
            )
            .await
            .map_err(PipelineError::Persistence)?;

        // Emitted after the durable write so live subscribers converge on
        // exactly what the record holds.
        self.broker.emit(&StreamEvent::complete(job_id, code));
        Ok(RunOutcome::Generated(job))
    }

    /// Imaging is best-effort; a failure is logged and the pipeline proceeds
    /// with an empty image set.
    async fn fetch_images(
        &self,
        job_id: &str,
        outline: &str,
        options: &GenerationOptions,
    ) -> GenerationContext {
        let provider = match (&self.images, options.with_images) {
            (Some(provider), true) => provider,
            _ => return GenerationContext::default(),
        };
        self.broker
            .emit(&StreamEvent::status(job_id, JobStatus::Generating, "fetching images"));
        match provider.fetch(outline).await {
            Ok(images) => GenerationContext { images },
            Err(e) => {
                tracing::warn!(job_id, "Image fetch failed, continuing without: {:#}", e);
                GenerationContext::default()
            }
        }
    }

    /// Terminal failure write plus `error` event. Idempotent: a record that
    /// is already terminal is returned untouched.
    async fn fail_job(
        &self,
        job_id: &str,
        message: &str,
        metadata: Option<JobMetadata>,
    ) -> Result<Job, PipelineError> {
        let existing = self
            .store
            .get(job_id)
            .await
            .map_err(PipelineError::Persistence)?;
        let job = match existing {
            Some(job) if job.status.is_terminal() => {
                tracing::debug!(job_id, "Skipping duplicate terminal write");
                job
            }
            Some(_) => self
                .store
                .update(
                    job_id,
                    JobPatch {
                        status: Some(JobStatus::Failed),
                        error_message: Some(message.to_string()),
                        metadata,
                        ..JobPatch::default()
                    },
                )
                .await
                .map_err(PipelineError::Persistence)?,
            None => {
                return Err(PipelineError::JobNotFound {
                    id: job_id.to_string(),
                })
            }
        };
        self.broker.emit(&StreamEvent::error(job_id, message));
        Ok(job)
    }
}

//! Structured lifecycle events for job runs.
//!
//! Every event carries an `event` field (`job.started`, `interview.finished`,
//! ...) so JSON logs can be filtered without parsing messages.

use tracing::{info, warn, Span};

/// Span that tags everything logged during a job with its id.
///
/// Attach it with `tracing::Instrument` so it follows the job across awaits.
pub fn job_span(job_id: &str) -> Span {
    tracing::info_span!("survey.job", job_id = %job_id)
}

pub fn emit_job_started(job_id: &str, interviews: usize, concurrency: usize) {
    info!(
        event = "job.started",
        job_id = %job_id,
        interviews = interviews,
        concurrency = concurrency,
    );
}

pub fn emit_interview_finished(index: usize, answered: usize, failed: usize, skipped: usize) {
    info!(
        event = "interview.finished",
        interview = index,
        answered = answered,
        failed = failed,
        skipped = skipped,
    );
}

/// Per-question failure (warning level).
pub fn emit_question_failed(interview: usize, question: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "question.failed",
        interview = interview,
        question = %question,
        error = %error,
    );
}

pub fn emit_job_finished(
    job_id: &str,
    duration_ms: u64,
    interviews: usize,
    new_tokens: u64,
    cached_tokens: u64,
    cancelled: bool,
) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        duration_ms = duration_ms,
        interviews = interviews,
        new_tokens = new_tokens,
        cached_tokens = cached_tokens,
        cancelled = cancelled,
    );
}

/// The limiter slowed down after a provider rate-limit signal.
pub fn emit_limiter_backoff(model: &str, requests_per_minute: Option<f64>) {
    warn!(
        event = "limiter.backoff",
        model = %model,
        requests_per_minute = requests_per_minute.unwrap_or(f64::INFINITY),
    );
}

/// Requested concurrency was clamped to what the model limits can serve.
pub fn emit_concurrency_clamped(requested: usize, effective: usize) {
    warn!(
        event = "job.concurrency_clamped",
        requested = requested,
        effective = effective,
    );
}

use crate::ingest::RunSummary;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use uuid::Uuid;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunOutput {
    pub spreadsheet_url: Option<String>,
    pub spreadsheet_filename: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Best-effort percentage, driven by the orchestrator's row loop.
    pub progress: u8,
    pub result: Option<RunOutput>,
    pub error: Option<String>,
    pub summary: Option<RunSummary>,
}

/// Process-wide registry of ingestion runs. Explicitly constructed and
/// injected into the submission handlers and the orchestrator tasks; the
/// polling side only ever reads.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, IngestionJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, IngestionJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        let job = IngestionJob {
            id,
            status: JobStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            progress: 0,
            result: None,
            error: None,
            summary: None,
        };
        self.lock().insert(id, job);
        log::info!("Created ingestion job {id}");
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<IngestionJob> {
        self.lock().get(id).cloned()
    }

    pub fn mark_processing(&self, id: &Uuid) {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) => {
                job.status = JobStatus::Processing;
                job.started_at.get_or_insert(OffsetDateTime::now_utc());
            }
            None => log::warn!("Attempt to start unknown job {id}"),
        }
    }

    pub fn set_progress(&self, id: &Uuid, done: usize, total: usize) {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(id) {
            job.progress = if total == 0 {
                0
            } else {
                ((done * 100 / total).min(100)) as u8
            };
        }
    }

    pub fn complete(&self, id: &Uuid, summary: RunSummary, result: RunOutput) {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(OffsetDateTime::now_utc());
                job.progress = 100;
                job.summary = Some(summary);
                job.result = Some(result);
            }
            None => log::warn!("Attempt to complete unknown job {id}"),
        }
    }

    pub fn fail(&self, id: &Uuid, error: String) {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(OffsetDateTime::now_utc());
                job.error = Some(error);
            }
            None => log::warn!("Attempt to fail unknown job {id}"),
        }
    }

    /// Drops terminal jobs older than `max_age`; running jobs are never
    /// touched.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let max_age = time::Duration::try_from(max_age).unwrap_or(time::Duration::MAX);
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal()
                && job.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        before - jobs.len()
    }
}

pub fn spawn_sweeper(store: Arc<JobStore>, every: Duration, max_age: Duration) {
    tokio::spawn(async move {
        loop {
            sleep(every).await;
            let removed = store.sweep(max_age);
            if removed > 0 {
                log::info!("Purged {removed} stale ingestion job(s)");
            }
        }
    });
}

//! Async job tracking (spec.md §3 Job entity, §6 "Job tracking surface",
//! Testable Properties 9 and 10). Jobs live in the `jobs` KV namespace
//! with a configurable TTL (default 7 days); listing never issues a
//! blocking `KEYS`-equivalent call — it streams `all_keys` the same way
//! the Redis backend streams via `SCAN`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::models::{Job, JobStatus};
use graphrag_core::store::KvStore;
use uuid::Uuid;

const NAMESPACE: &str = "jobs";

pub struct JobStore {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl JobStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub async fn create(&self, now: DateTime<Utc>) -> Result<Job> {
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            phase: "queued".to_string(),
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        self.save(&job).await?;
        Ok(job)
    }

    pub async fn mark_running(&self, job_id: &str, phase: &str, now: DateTime<Utc>) -> Result<()> {
        let mut job = self.get(job_id).await?.ok_or_else(|| GraphRagError::data_integrity(format!("job {job_id} not found")))?;
        job.status = JobStatus::Running;
        job.phase = phase.to_string();
        job.updated_at = now;
        self.save(&job).await
    }

    pub async fn mark_completed(&self, job_id: &str, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let mut job = self.get(job_id).await?.ok_or_else(|| GraphRagError::data_integrity(format!("job {job_id} not found")))?;
        job.status = JobStatus::Completed;
        job.phase = "done".to_string();
        job.result = Some(result);
        job.updated_at = now;
        self.save(&job).await
    }

    pub async fn mark_failed(&self, job_id: &str, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let mut job = self.get(job_id).await?.ok_or_else(|| GraphRagError::data_integrity(format!("job {job_id} not found")))?;
        job.status = JobStatus::Failed;
        job.phase = "failed".to_string();
        job.error = Some(error.into());
        job.updated_at = now;
        self.save(&job).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let raw = self.kv.get(NAMESPACE, job_id).await?;
        Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Lists all non-expired jobs, streaming keys via `all_keys` (the
    /// file backend reads one namespace file; the Redis backend `SCAN`s)
    /// rather than a blocking full scan (Testable Property 10).
    pub async fn list(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let ids = self.kv.all_keys(NAMESPACE).await?;
        let mut jobs = Vec::new();
        for id in ids {
            if let Some(job) = self.get(&id).await? {
                if !self.is_expired(&job, now) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Deletes every job older than the configured TTL (Testable
    /// Property 9: an expired job is unreachable via `list` AND absent
    /// from storage, so this actually deletes rather than just filtering).
    pub async fn gc_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids = self.kv.all_keys(NAMESPACE).await?;
        let mut removed = 0;
        for id in ids {
            if let Some(job) = self.get(&id).await? {
                if self.is_expired(&job, now) {
                    self.kv.delete(NAMESPACE, &id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn is_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(job.created_at);
        age.num_seconds().max(0) as u64 > self.ttl_secs
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_value(job).map_err(|e| GraphRagError::Internal(format!("job serialization failed: {e}")))?;
        self.kv.upsert(NAMESPACE, std::collections::HashMap::from([(job.job_id.clone(), value)])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use graphrag_core::store::InMemoryKvStore;

    fn store() -> JobStore {
        JobStore::new(Arc::new(InMemoryKvStore::new()), 7 * 24 * 3600)
    }

    #[tokio::test]
    async fn create_then_mark_completed_round_trips() {
        let jobs = store();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let job = jobs.create(now).await.unwrap();
        jobs.mark_running(&job.job_id, "chunking", now).await.unwrap();
        jobs.mark_completed(&job.job_id, serde_json::json!({"documents": 1}), now).await.unwrap();
        let fetched = jobs.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.result, Some(serde_json::json!({"documents": 1})));
    }

    #[tokio::test]
    async fn gc_expired_removes_old_jobs_and_they_vanish_from_list() {
        let jobs = JobStore::new(Arc::new(InMemoryKvStore::new()), 60);
        let created_at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let job = jobs.create(created_at).await.unwrap();
        let later = created_at + Duration::seconds(120);
        assert_eq!(jobs.list(later).await.unwrap().len(), 0);
        let removed = jobs.gc_expired(later).await.unwrap();
        assert_eq!(removed, 1);
        assert!(jobs.get(&job.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_by_creation_time() {
        let jobs = store();
        let t0 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = t0 + Duration::seconds(10);
        let second = jobs.create(t1).await.unwrap();
        let first = jobs.create(t0).await.unwrap();
        let listed = jobs.list(t1 + Duration::seconds(1)).await.unwrap();
        assert_eq!(listed[0].job_id, first.job_id);
        assert_eq!(listed[1].job_id, second.job_id);
    }
}

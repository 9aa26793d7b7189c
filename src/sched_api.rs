//! Client for the scheduler daemon's HTTP API. The daemon is a dumb durable
//! timer in a separate process; this is the portal's only way to talk to it.

use crate::errors::OnDemandError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize)]
struct ScheduleRequest<'a> {
    time: i64,
    course_id: &'a str,
    assignment_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    scheduled_run_id: String,
}

#[derive(Debug, Serialize)]
struct RescheduleRequest {
    time: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    scheduled_runs: HashMap<String, i64>,
}

/// Outbound interface to the durable job-scheduling service. Implemented by
/// [`SchedulerClient`] in production and by test doubles in tests.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Schedule a trigger at `time` carrying the course/assignment payload.
    /// Returns the daemon's job id. Transport or daemon failure maps to
    /// `SchedulerUnavailable`; no raw transport error escapes.
    async fn schedule_run(
        &self,
        time: i64,
        course_id: &str,
        assignment_id: &str,
    ) -> Result<String, OnDemandError>;

    /// Move an existing job to a new fire time. Returns false if the job does
    /// not exist or the daemon call fails.
    async fn update_scheduled_run(&self, job_id: &str, time: i64) -> bool;

    /// Cancel a job. Returns false if the job does not exist or the daemon
    /// call fails.
    async fn delete_scheduled_run(&self, job_id: &str) -> bool;

    /// Pending jobs and their fire times, for operational dashboards.
    async fn list_scheduled_runs(&self) -> Result<HashMap<String, i64>, OnDemandError>;
}

#[derive(Clone)]
pub struct SchedulerClient {
    http: reqwest::Client,
    base_url: String,
}

impl SchedulerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SchedulerApi for SchedulerClient {
    async fn schedule_run(
        &self,
        time: i64,
        course_id: &str,
        assignment_id: &str,
    ) -> Result<String, OnDemandError> {
        let url = format!("{}/api/schedule_run", self.base_url);
        let body = ScheduleRequest {
            time,
            course_id,
            assignment_id,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OnDemandError::SchedulerUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OnDemandError::SchedulerUnavailable(format!(
                "schedule_run returned {status}: {text}"
            )));
        }
        let parsed: ScheduleResponse = resp
            .json()
            .await
            .map_err(|e| OnDemandError::SchedulerUnavailable(e.to_string()))?;
        Ok(parsed.scheduled_run_id)
    }

    async fn update_scheduled_run(&self, job_id: &str, time: i64) -> bool {
        let url = format!("{}/api/{}", self.base_url, job_id);
        match self
            .http
            .post(&url)
            .json(&RescheduleRequest { time })
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(job_id, status = %resp.status(), "Failed to update scheduled run");
                false
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to reach scheduler for update");
                false
            }
        }
    }

    async fn delete_scheduled_run(&self, job_id: &str) -> bool {
        let url = format!("{}/api/{}", self.base_url, job_id);
        match self.http.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(job_id, status = %resp.status(), "Failed to delete scheduled run");
                false
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to reach scheduler for delete");
                false
            }
        }
    }

    async fn list_scheduled_runs(&self) -> Result<HashMap<String, i64>, OnDemandError> {
        let url = format!("{}/api/scheduled_runs", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OnDemandError::SchedulerUnavailable(e.to_string()))?;
        let parsed: ListResponse = resp
            .json()
            .await
            .map_err(|e| OnDemandError::SchedulerUnavailable(e.to_string()))?;
        Ok(parsed.scheduled_runs)
    }
}

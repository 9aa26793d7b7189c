//! Client for the external Jenkins-style grading backend. Every transport or
//! decode failure is caught here and mapped to `None`; callers never see a
//! raw HTTP error from this boundary.

use crate::storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use uuid::Uuid;

/// Outbound interface to the grading backend. Implemented by
/// [`JenkinsClient`] in production and by test doubles in tests.
#[async_trait]
pub trait GradingBackendApi: Send + Sync {
    /// Start a grading run for the given students with the given due date.
    /// Returns the new backend run id, or `None` on any failure.
    async fn start_run(
        &self,
        course_id: &str,
        assignment_id: &str,
        netids: &[String],
        due_timestamp: i64,
    ) -> Option<String>;

    /// Fetch the backend's status string for a run, or `None` on any failure.
    async fn get_run_status(&self, course_id: &str, run_id: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct RunStatusResponse {
    status: String,
}

pub struct JenkinsClient {
    http: reqwest::Client,
    base_url: String,
    db: DatabaseConnection,
    tz: Tz,
}

impl JenkinsClient {
    pub fn new(base_url: &str, db: DatabaseConnection, tz: Tz) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            db,
            tz,
        }
    }

    /// Per-course Basic credential stored alongside the course record.
    async fn course_auth(&self, course_id: &str) -> Option<String> {
        match storage::get_course(&self.db, course_id).await {
            Ok(Some(course)) => Some(format!("Basic {}", course.backend_token)),
            Ok(None) => {
                tracing::warn!(course_id, "No such course when building backend auth");
                None
            }
            Err(e) => {
                tracing::warn!(course_id, error = %e, "Failed to load course for backend auth");
                None
            }
        }
    }

    /// Backend-visible due date format: local wall-clock minutes in the
    /// configured course timezone.
    fn format_due_date(&self, timestamp: i64) -> String {
        DateTime::<Utc>::from_timestamp(timestamp, 0)
            .unwrap_or_default()
            .with_timezone(&self.tz)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

#[async_trait]
impl GradingBackendApi for JenkinsClient {
    async fn start_run(
        &self,
        course_id: &str,
        assignment_id: &str,
        netids: &[String],
        due_timestamp: i64,
    ) -> Option<String> {
        let auth = self.course_auth(course_id).await?;

        // The run id is generated portal-side and handed to the backend so
        // status callbacks can reference it.
        let grading_run_id = Uuid::new_v4().to_string();
        let url = format!(
            "{}/job/{}/buildWithParameters",
            self.base_url, assignment_id
        );
        let params = [
            ("STUDENT_IDS", netids.join(",")),
            ("DUE_DATE", self.format_due_date(due_timestamp)),
            ("PUBLISH_TO_STUDENT", "true".to_string()),
            ("GRADING_RUN_ID", grading_run_id.clone()),
        ];

        let result = self
            .http
            .post(&url)
            .header("Authorization", auth)
            .header("Content-Type", "application/json")
            .query(&params)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => Some(grading_run_id),
            Ok(resp) => {
                tracing::warn!(
                    course_id,
                    assignment_id,
                    status = %resp.status(),
                    "Backend refused to start grading run"
                );
                None
            }
            Err(e) => {
                tracing::warn!(course_id, assignment_id, error = %e, "Backend start_run failed");
                None
            }
        }
    }

    async fn get_run_status(&self, course_id: &str, run_id: &str) -> Option<String> {
        let auth = self.course_auth(course_id).await?;
        let url = format!("{}/runs/{}/status", self.base_url, run_id);

        let resp = match self.http.get(&url).header("Authorization", auth).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::warn!(course_id, run_id, status = %resp.status(), "Backend status query refused");
                return None;
            }
            Err(e) => {
                tracing::warn!(course_id, run_id, error = %e, "Backend status query failed");
                return None;
            }
        };

        match resp.json::<RunStatusResponse>().await {
            Ok(parsed) => Some(parsed.status),
            Err(e) => {
                tracing::warn!(course_id, run_id, error = %e, "Malformed backend status body");
                None
            }
        }
    }
}

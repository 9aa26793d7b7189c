use async_trait::async_trait;
use ondemand::errors::OnDemandError;
use ondemand::grading_api::GradingBackendApi;
use ondemand::sched_api::SchedulerApi;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory scheduler double. Records every call so tests can assert on the
/// exact external-job traffic an operation produced.
#[derive(Default)]
pub struct MockScheduler {
    pub fail_schedule: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    pub schedule_calls: Mutex<Vec<(i64, String, String)>>,
    pub update_calls: Mutex<Vec<(String, i64)>>,
    pub delete_calls: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_schedule() -> Self {
        let mock = Self::default();
        mock.fail_schedule.store(true, Ordering::SeqCst);
        mock
    }
}

#[async_trait]
impl SchedulerApi for MockScheduler {
    async fn schedule_run(
        &self,
        time: i64,
        course_id: &str,
        assignment_id: &str,
    ) -> Result<String, OnDemandError> {
        if self.fail_schedule.load(Ordering::SeqCst) {
            return Err(OnDemandError::SchedulerUnavailable(
                "mock scheduler down".to_string(),
            ));
        }
        self.schedule_calls.lock().unwrap().push((
            time,
            course_id.to_string(),
            assignment_id.to_string(),
        ));
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("job-{n}"))
    }

    async fn update_scheduled_run(&self, job_id: &str, time: i64) -> bool {
        if self.fail_update.load(Ordering::SeqCst) {
            return false;
        }
        self.update_calls
            .lock()
            .unwrap()
            .push((job_id.to_string(), time));
        true
    }

    async fn delete_scheduled_run(&self, job_id: &str) -> bool {
        if self.fail_delete.load(Ordering::SeqCst) {
            return false;
        }
        self.delete_calls.lock().unwrap().push(job_id.to_string());
        true
    }

    async fn list_scheduled_runs(&self) -> Result<HashMap<String, i64>, OnDemandError> {
        Ok(HashMap::new())
    }
}

/// Grading backend double. Each accepted start gets a fresh run id.
#[derive(Default)]
pub struct MockBackend {
    pub fail_start: AtomicBool,
    /// Refuse any start whose roster contains one of these netids.
    pub fail_netids: Mutex<Vec<String>>,
    pub start_calls: Mutex<Vec<(String, String, Vec<String>, i64)>>,
    counter: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let mock = Self::default();
        mock.fail_start.store(true, Ordering::SeqCst);
        mock
    }

    pub fn fail_for(&self, netid: &str) {
        self.fail_netids.lock().unwrap().push(netid.to_string());
    }

    pub fn start_count(&self) -> usize {
        self.start_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl GradingBackendApi for MockBackend {
    async fn start_run(
        &self,
        course_id: &str,
        assignment_id: &str,
        netids: &[String],
        due_time: i64,
    ) -> Option<String> {
        self.start_calls.lock().unwrap().push((
            course_id.to_string(),
            assignment_id.to_string(),
            netids.to_vec(),
            due_time,
        ));
        if self.fail_start.load(Ordering::SeqCst) {
            return None;
        }
        {
            let refused = self.fail_netids.lock().unwrap();
            if netids.iter().any(|n| refused.contains(n)) {
                return None;
            }
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Some(format!("backend-run-{n}"))
    }

    async fn get_run_status(&self, _course_id: &str, _run_id: &str) -> Option<String> {
        Some("finished".to_string())
    }
}

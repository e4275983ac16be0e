//! Ray job submission.
//!
//! Jobs are submitted to and polled from the dashboard of the head node.
//! [`DashboardClient`] speaks the dashboard REST API; [`InMemorySubmissionClient`]
//! is a scripted stand-in for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::JobStatus;
use crate::resources::common::head_service_fqdn;

/// Body of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRequest {
    pub entrypoint: String,
    pub submission_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Coarse job outcome used by the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Job state reported by the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

impl JobInfo {
    pub fn outcome(&self) -> JobOutcome {
        match self.status {
            Some(JobStatus::Pending | JobStatus::Running) => JobOutcome::Running,
            Some(JobStatus::Succeeded) => JobOutcome::Succeeded,
            Some(JobStatus::Failed | JobStatus::Stopped) => JobOutcome::Failed,
            None => JobOutcome::Unknown,
        }
    }
}

/// Dashboard base URL of a cluster.
pub fn dashboard_endpoint(cluster: &str, namespace: &str, port: u16) -> String {
    format!("http://{}:{}", head_service_fqdn(cluster, namespace), port)
}

/// Client of the job submission API.
pub trait JobSubmissionClient: Send + Sync + 'static {
    /// Submit a job and return its submission id.
    ///
    /// Submitting an id that already exists succeeds.
    fn submit(
        &self,
        endpoint: &str,
        request: &SubmissionRequest,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Fetch the state of a submitted job; `None` when the dashboard does
    /// not know the id, e.g. after the head restarted.
    fn poll(
        &self,
        endpoint: &str,
        submission_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<JobInfo>>> + Send;
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    submission_id: Option<String>,
}

/// Client of the Ray dashboard REST API.
#[derive(Debug, Clone)]
pub struct DashboardClient {
    client: reqwest::Client,
}

impl DashboardClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl JobSubmissionClient for DashboardClient {
    async fn submit(&self, endpoint: &str, request: &SubmissionRequest) -> Result<String> {
        let url = format!("{endpoint}/api/jobs/");
        debug!(%url, submission_id = %request.submission_id, "Submitting job");

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("already exists") {
                info!(submission_id = %request.submission_id, "Job already submitted");
                return Ok(request.submission_id.clone());
            }
            return Err(Error::Submission(format!("HTTP {status}: {body}")));
        }

        let parsed: SubmitResponse = response.json().await?;
        Ok(parsed
            .submission_id
            .unwrap_or_else(|| request.submission_id.clone()))
    }

    async fn poll(&self, endpoint: &str, submission_id: &str) -> Result<Option<JobInfo>> {
        let url = format!("{endpoint}/api/jobs/{submission_id}");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(%url, "Dashboard does not know the submission");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Submission(format!("HTTP {status} polling {submission_id}")));
        }
        Ok(Some(response.json().await?))
    }
}

#[derive(Debug, Default)]
struct Script {
    submitted: Vec<(String, SubmissionRequest)>,
    statuses: BTreeMap<String, JobInfo>,
    failing_submits: usize,
}

/// Scripted submission client.
///
/// Submitted jobs start `PENDING`; tests move them along with [`Self::set_status`].
#[derive(Debug, Default)]
pub struct InMemorySubmissionClient {
    script: Mutex<Script>,
}

impl InMemorySubmissionClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every accepted submission, with the endpoint it was sent to.
    pub fn submissions(&self) -> Vec<(String, SubmissionRequest)> {
        self.lock().submitted.clone()
    }

    pub fn set_status(&self, submission_id: &str, status: JobStatus, message: Option<&str>) {
        self.lock().statuses.insert(
            submission_id.to_string(),
            JobInfo {
                status: Some(status),
                message: message.map(str::to_string),
            },
        );
    }

    /// Drop a job, as a restarted head node would.
    pub fn forget(&self, submission_id: &str) {
        self.lock().statuses.remove(submission_id);
    }

    /// Reject the next `times` submissions.
    pub fn fail_submits(&self, times: usize) {
        self.lock().failing_submits = times;
    }
}

impl JobSubmissionClient for InMemorySubmissionClient {
    async fn submit(&self, endpoint: &str, request: &SubmissionRequest) -> Result<String> {
        let mut script = self.lock();
        if script.failing_submits > 0 {
            script.failing_submits -= 1;
            return Err(Error::Submission("dashboard unavailable".into()));
        }
        let id = request.submission_id.clone();
        if !script.statuses.contains_key(&id) {
            script.statuses.insert(
                id.clone(),
                JobInfo {
                    status: Some(JobStatus::Pending),
                    message: None,
                },
            );
            script.submitted.push((endpoint.to_string(), request.clone()));
        }
        Ok(id)
    }

    async fn poll(&self, _endpoint: &str, submission_id: &str) -> Result<Option<JobInfo>> {
        Ok(self.lock().statuses.get(submission_id).cloned())
    }
}

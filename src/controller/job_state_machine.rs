//! RayJob deployment state machine.
//!
//! ```text
//! PendingClusterCreation -> ClusterReady -> Submitted -> Running
//!                                              |            |
//!                                              v            v
//!                                        Succeeded / Failed -> CleaningUp -> Complete
//! ```
//!
//! [`next_step`] looks at the recorded deployment status and what the current
//! pass observed, and names one side effect plus the status to record once it
//! succeeded. It never performs I/O.

use std::time::Duration;

use jiff::{SignedDuration, Timestamp};

use crate::controller::common::parse_timestamp;
use crate::crd::{ClusterPhase, JobDeploymentStatus, RayJob};
use crate::submission::{JobInfo, JobOutcome};

/// Side effect of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    None,
    CreateCluster,
    Submit,
    DeleteCluster,
}

/// One step of a RayJob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
    pub action: JobAction,
    /// Deployment status once the action succeeded.
    pub next: JobDeploymentStatus,
    /// When to look again; `None` once nothing is left to do.
    pub requeue: Option<Duration>,
    pub message: Option<String>,
}

impl JobStep {
    fn stay(current: JobDeploymentStatus, requeue: Duration) -> Self {
        Self {
            action: JobAction::None,
            next: current,
            requeue: Some(requeue),
            message: None,
        }
    }

    fn advance(next: JobDeploymentStatus) -> Self {
        Self {
            action: JobAction::None,
            next,
            requeue: Some(Duration::ZERO),
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What a job pass saw before deciding.
#[derive(Debug, Clone)]
pub struct JobObservation<'a> {
    /// Phase of the job's cluster, `None` when the cluster does not exist.
    pub cluster_phase: Option<ClusterPhase>,
    /// The cluster is created and controlled by the job.
    pub owns_cluster: bool,
    /// Latest dashboard answer, polled only while the job is in flight.
    pub job_info: Option<&'a JobInfo>,
    /// The dashboard was polled and does not know the submission.
    pub submission_lost: bool,
    pub poll_interval: Duration,
    pub pending_requeue: Duration,
    pub now: Timestamp,
}

/// Time left before a finished job's cluster may be torn down.
pub fn ttl_remaining(job: &RayJob, now: Timestamp) -> Duration {
    let Some(end) = job
        .status
        .as_ref()
        .and_then(|s| s.end_time.as_deref())
        .and_then(parse_timestamp)
    else {
        return Duration::ZERO;
    };
    let ttl = SignedDuration::from_secs(i64::from(job.spec.ttl_seconds_after_finished.max(0)));
    let deadline = end.checked_add(ttl).unwrap_or(Timestamp::MAX);
    Duration::try_from(deadline.duration_since(now)).unwrap_or(Duration::ZERO)
}

/// Decide the next step of `job`.
pub fn next_step(job: &RayJob, observed: &JobObservation<'_>) -> JobStep {
    use JobDeploymentStatus as S;

    let current = job
        .status
        .as_ref()
        .map(|s| s.job_deployment_status)
        .unwrap_or_default();

    match current {
        S::PendingClusterCreation => match observed.cluster_phase {
            None if observed.owns_cluster => JobStep {
                action: JobAction::CreateCluster,
                next: S::PendingClusterCreation,
                requeue: Some(observed.pending_requeue),
                message: Some("Creating RayCluster".into()),
            },
            None => JobStep::stay(current, observed.pending_requeue)
                .with_message("Selected RayCluster not found"),
            Some(ClusterPhase::Running) => JobStep::advance(S::ClusterReady),
            Some(phase) => JobStep::stay(current, observed.pending_requeue)
                .with_message(format!("Waiting for RayCluster, currently {phase}")),
        },
        S::ClusterReady => match observed.cluster_phase {
            None => JobStep::advance(S::PendingClusterCreation),
            Some(_) => JobStep {
                action: JobAction::Submit,
                next: S::Submitted,
                requeue: Some(observed.poll_interval),
                message: Some("Job submitted".into()),
            },
        },
        S::Submitted | S::Running => {
            if observed.cluster_phase.is_none() {
                return JobStep::advance(S::Failed).with_message("RayCluster disappeared while the job was running");
            }
            if observed.submission_lost {
                // Same submission id, so a duplicate is refused by the dashboard.
                return JobStep {
                    action: JobAction::Submit,
                    next: S::Submitted,
                    requeue: Some(observed.poll_interval),
                    message: Some("Dashboard lost the submission, resubmitted".into()),
                };
            }
            let outcome = observed.job_info.map(JobInfo::outcome).unwrap_or(JobOutcome::Unknown);
            let message = observed.job_info.and_then(|i| i.message.clone());
            let step = match outcome {
                JobOutcome::Succeeded => JobStep::advance(S::Succeeded),
                JobOutcome::Failed => JobStep::advance(S::Failed),
                JobOutcome::Running => JobStep::stay(S::Running, observed.poll_interval),
                JobOutcome::Unknown => JobStep::stay(current, observed.poll_interval),
            };
            match message {
                Some(message) => step.with_message(message),
                None => step,
            }
        }
        S::Succeeded | S::Failed => {
            let tear_down = job.spec.shutdown_after_job_finishes && observed.owns_cluster;
            if !tear_down || observed.cluster_phase.is_none() {
                return JobStep::advance(S::Complete);
            }
            let remaining = ttl_remaining(job, observed.now);
            if remaining.is_zero() {
                JobStep {
                    action: JobAction::DeleteCluster,
                    next: S::CleaningUp,
                    requeue: Some(observed.pending_requeue),
                    message: Some("Deleting RayCluster".into()),
                }
            } else {
                JobStep::stay(current, remaining)
            }
        }
        S::CleaningUp => match observed.cluster_phase {
            None => JobStep::advance(S::Complete),
            Some(_) => JobStep {
                action: JobAction::DeleteCluster,
                next: S::CleaningUp,
                requeue: Some(observed.pending_requeue),
                message: None,
            },
        },
        S::Complete => JobStep {
            action: JobAction::None,
            next: S::Complete,
            requeue: None,
            message: None,
        },
    }
}

//! RayJob reconciler.
//!
//! Observes the job's cluster and, while the job is in flight, its dashboard
//! state; asks the job state machine for the next step; performs it and
//! records the resulting deployment status.

use std::time::Instant;

use jiff::Timestamp;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::cluster_validation::validate_cluster_spec;
use crate::controller::context::Context;
use crate::controller::error::{Error, ErrorKind, Result};
use crate::controller::job_state_machine::{JobAction, JobObservation, JobStep, next_step};
use crate::crd::{ClusterPhase, JobDeploymentStatus, RayCluster, RayJob, RayJobStatus};
use crate::gateway::ApiGateway;
use crate::resources::OwnerIdentity;
use crate::resources::common::{LABEL_CLUSTER, owned_cluster};
use crate::scheduler::{ObjectKey, ReconcileOutcome};
use crate::submission::{JobSubmissionClient, SubmissionRequest, dashboard_endpoint};

const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Cluster a job runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCluster {
    pub name: String,
    /// Created for the job and torn down with it.
    pub owned: bool,
}

/// Resolve the cluster of a job from its spec.
pub fn job_cluster(job: &RayJob) -> Result<JobCluster> {
    let name = job.name_any();
    if !job.spec.cluster_selector.is_empty() {
        let cluster = job.spec.cluster_selector.get(LABEL_CLUSTER).ok_or_else(|| {
            Error::Validation(format!("RayJob {name}: clusterSelector must set {LABEL_CLUSTER}"))
        })?;
        return Ok(JobCluster {
            name: cluster.clone(),
            owned: false,
        });
    }
    match &job.spec.ray_cluster_spec {
        Some(spec) => {
            let cluster = format!("{name}-raycluster");
            validate_cluster_spec(&cluster, spec)?;
            Ok(JobCluster {
                name: cluster,
                owned: true,
            })
        }
        None => Err(Error::Validation(format!(
            "RayJob {name}: one of rayClusterSpec or clusterSelector is required"
        ))),
    }
}

/// Deterministic submission id: `spec.jobId`, else the name plus a uid prefix.
pub fn submission_id(job: &RayJob) -> String {
    if let Some(id) = &job.spec.job_id {
        return id.clone();
    }
    let uid = job.metadata.uid.as_deref().unwrap_or_default();
    format!("{}-{}", job.name_any(), uid.get(..8).unwrap_or(uid))
}

fn runtime_env(job: &RayJob) -> Result<Option<serde_json::Value>> {
    match &job.spec.runtime_env {
        Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
            Error::Validation(format!("RayJob {}: runtimeEnv is not valid JSON: {e}", job.name_any()))
        }),
        None => Ok(None),
    }
}

/// Check everything a job needs before any side effect and resolve its cluster.
pub fn preflight(job: &RayJob) -> Result<JobCluster> {
    let target = job_cluster(job)?;
    runtime_env(job)?;
    Ok(target)
}

/// Build the submission request of a job.
pub fn submission_request(job: &RayJob, submission_id: &str) -> Result<SubmissionRequest> {
    Ok(SubmissionRequest {
        entrypoint: job.spec.entrypoint.clone(),
        submission_id: submission_id.to_string(),
        runtime_env: runtime_env(job)?,
        metadata: job.spec.metadata.clone(),
    })
}

/// Reconcile the RayJob behind `key`.
pub async fn reconcile<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> ReconcileOutcome {
    let start_time = Instant::now();
    debug!(name = %key.name, namespace = %key.namespace, "Reconciling RayJob");

    let outcome = match reconcile_job(key, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(name = %key.name, namespace = %key.namespace, error = %e, "RayJob reconcile failed");
            ctx.record_error(key);
            ReconcileOutcome::from(&e)
        }
    };

    ctx.record_reconcile(key, start_time.elapsed().as_secs_f64());
    outcome
}

fn observed_phase(cluster: &RayCluster) -> ClusterPhase {
    if cluster.metadata.deletion_timestamp.is_some() {
        return ClusterPhase::Deleting;
    }
    cluster.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

async fn reconcile_job<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> Result<ReconcileOutcome> {
    let gateway = ctx.gateway.as_ref();
    let Some(job) = gateway.get_job(&key.namespace, &key.name).await? else {
        debug!(name = %key.name, "RayJob not found, nothing to do");
        return Ok(ReconcileOutcome::Done);
    };
    if job.metadata.deletion_timestamp.is_some() {
        return Ok(ReconcileOutcome::Done);
    }
    let owner = OwnerIdentity::of_job(&job)?;
    let previous = job.status.clone().unwrap_or_default();

    let target = match preflight(&job) {
        Ok(target) => target,
        Err(e) if e.is_configuration() => {
            warn!(name = %key.name, error = %e, "RayJob spec rejected");
            let message = e.to_string();
            if previous.message.as_deref() != Some(message.as_str()) {
                ctx.publish_warning_event(&owner, e.reason(), "Validating", Some(message.clone()))
                    .await;
                let status = RayJobStatus {
                    message: Some(message),
                    observed_generation: job.metadata.generation,
                    ..previous
                };
                write_status(gateway, &job, &status).await?;
            }
            return Ok(ReconcileOutcome::Error(ErrorKind::Configuration));
        }
        Err(e) => return Err(e),
    };

    let cluster = gateway.get_cluster(&owner.namespace, &target.name).await?;
    let cluster_phase = cluster.as_ref().map(observed_phase);
    let endpoint = dashboard_endpoint(&target.name, &owner.namespace, ctx.config.dashboard_port);
    let job_id = previous.job_id.clone().unwrap_or_else(|| submission_id(&job));

    let in_flight = matches!(
        previous.job_deployment_status,
        JobDeploymentStatus::Submitted | JobDeploymentStatus::Running
    );
    let polled = match (in_flight, cluster_phase) {
        (true, Some(_)) => Some(ctx.submission.poll(&endpoint, &job_id).await?),
        _ => None,
    };
    let submission_lost = matches!(polled, Some(None));
    if submission_lost {
        warn!(name = %key.name, submission_id = %job_id, "Dashboard does not know the submission");
    }
    let job_info = polled.flatten();

    let step = next_step(
        &job,
        &JobObservation {
            cluster_phase,
            owns_cluster: target.owned,
            job_info: job_info.as_ref(),
            submission_lost,
            poll_interval: ctx.config.job_poll_interval,
            pending_requeue: ctx.config.pending_requeue,
            now: Timestamp::now(),
        },
    );
    debug!(name = %key.name, current = %previous.job_deployment_status, next = %step.next, action = ?step.action, "RayJob step");

    perform(ctx, &job, &owner, &target, &endpoint, &job_id, &step).await?;

    let now = Timestamp::now().to_string();
    let finished_now = matches!(step.next, JobDeploymentStatus::Succeeded | JobDeploymentStatus::Failed)
        && !previous.job_deployment_status.is_finished();
    let status = RayJobStatus {
        job_id: Some(job_id),
        ray_cluster_name: Some(target.name.clone()),
        dashboard_url: Some(endpoint),
        job_deployment_status: step.next,
        job_status: job_info.as_ref().and_then(|i| i.status).or(previous.job_status),
        message: step.message.clone().or_else(|| previous.message.clone()),
        start_time: match step.action {
            JobAction::Submit => previous.start_time.clone().or_else(|| Some(now.clone())),
            _ => previous.start_time.clone(),
        },
        end_time: if finished_now {
            Some(now)
        } else {
            previous.end_time.clone()
        },
        conditions: previous.conditions.clone(),
        observed_generation: job.metadata.generation,
    };

    if status != previous {
        write_status(gateway, &job, &status).await?;
    }
    if status.job_deployment_status != previous.job_deployment_status {
        info!(
            name = %key.name,
            namespace = %key.namespace,
            from = %previous.job_deployment_status,
            to = %status.job_deployment_status,
            "RayJob deployment status changed"
        );
        let note = status.message.clone();
        match status.job_deployment_status {
            JobDeploymentStatus::Failed => {
                ctx.publish_warning_event(&owner, "JobFailed", "Polling", note).await;
            }
            next => {
                ctx.publish_normal_event(&owner, &next.to_string(), "Reconciling", note)
                    .await;
            }
        }
    }

    Ok(match step.requeue {
        None => ReconcileOutcome::Done,
        Some(delay) => ReconcileOutcome::RetryAfter(delay),
    })
}

async fn perform<G: ApiGateway, S: JobSubmissionClient>(
    ctx: &Context<G, S>,
    job: &RayJob,
    owner: &OwnerIdentity,
    target: &JobCluster,
    endpoint: &str,
    job_id: &str,
    step: &JobStep,
) -> Result<()> {
    let gateway = ctx.gateway.as_ref();
    match step.action {
        JobAction::None => Ok(()),
        JobAction::CreateCluster => {
            let Some(spec) = &job.spec.ray_cluster_spec else {
                return Err(Error::MissingField(format!("RayJob {} rayClusterSpec", owner.name)));
            };
            match gateway.create_cluster(&owned_cluster(owner, &target.name, spec)).await {
                Ok(()) => {
                    info!(job = %owner.name, cluster = %target.name, "Created RayCluster for RayJob");
                    Ok(())
                }
                Err(e) if e.is_already_exists() => Ok(()),
                Err(e) => Err(e),
            }
        }
        JobAction::Submit => {
            let request = submission_request(job, job_id)?;
            let id = ctx.submission.submit(endpoint, &request).await?;
            info!(job = %owner.name, submission_id = %id, "Submitted job");
            Ok(())
        }
        JobAction::DeleteCluster => match gateway.delete_cluster(&owner.namespace, &target.name).await {
            Ok(()) => {
                info!(job = %owner.name, cluster = %target.name, "Deleting RayCluster of finished job");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        },
    }
}

async fn write_status<G: ApiGateway>(gateway: &G, job: &RayJob, status: &RayJobStatus) -> Result<()> {
    let namespace = job.namespace().unwrap_or_default();
    let name = job.name_any();
    let mut resource_version = job.resource_version();

    for attempt in 1..=STATUS_WRITE_ATTEMPTS {
        match gateway
            .patch_job_status(&namespace, &name, resource_version.as_deref(), status)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(name = %name, attempt, "Status write conflicted, refreshing resourceVersion");
                resource_version = gateway
                    .get_job(&namespace, &name)
                    .await?
                    .and_then(|j| j.resource_version());
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("status of RayJob/{name}")))
}

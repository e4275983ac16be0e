//! RayJob lifecycle scenarios.

use std::collections::BTreeMap;

use ray_operator::controller::error::ErrorKind;
use ray_operator::crd::{ClusterPhase, JobDeploymentStatus, JobStatus, RayJob, RayJobSpec, RayJobStatus};
use ray_operator::gateway::memory::GatewayCall;
use ray_operator::resources::OwnerKind;
use ray_operator::scheduler::ReconcileOutcome;

use crate::{Harness, NS, cluster_spec, worker_group};

const JOB_CLUSTER: &str = "train-raycluster";

fn ephemeral_job(shutdown: bool) -> RayJob {
    RayJob::new(
        "train",
        RayJobSpec {
            entrypoint: "python train.py --epochs 3".into(),
            runtime_env: Some(r#"{"pip": ["torch"]}"#.into()),
            metadata: BTreeMap::from([("team".to_string(), "research".to_string())]),
            ray_cluster_spec: Some(cluster_spec(vec![worker_group("gpu", 1, 0, 2)])),
            shutdown_after_job_finishes: shutdown,
            ttl_seconds_after_finished: 0,
            ..Default::default()
        },
    )
}

fn selector_job(cluster: &str) -> RayJob {
    RayJob::new(
        "train",
        RayJobSpec {
            entrypoint: "python train.py".into(),
            cluster_selector: BTreeMap::from([("ray.io/cluster".to_string(), cluster.to_string())]),
            shutdown_after_job_finishes: true,
            ..Default::default()
        },
    )
}

impl Harness {
    async fn reconcile_job(&self) -> ReconcileOutcome {
        self.reconcile(OwnerKind::RayJob, "train").await
    }

    fn job_status(&self) -> RayJobStatus {
        self.gateway()
            .job(NS, "train")
            .and_then(|j| j.status)
            .unwrap_or_default()
    }

    fn deployment_status(&self) -> JobDeploymentStatus {
        self.job_status().job_deployment_status
    }

    /// Drive an ephemeral job until its submission is accepted.
    async fn submitted_job(&self, shutdown: bool) -> String {
        self.gateway().insert_job(ephemeral_job(shutdown));
        self.reconcile_job().await;
        self.settle_cluster(JOB_CLUSTER).await;
        self.reconcile_job().await;
        assert_eq!(self.deployment_status(), JobDeploymentStatus::ClusterReady);
        self.reconcile_job().await;
        assert_eq!(self.deployment_status(), JobDeploymentStatus::Submitted);
        self.job_status().job_id.unwrap()
    }
}

#[tokio::test]
async fn test_ephemeral_job_full_lifecycle() {
    let h = Harness::new();
    h.gateway().insert_job(ephemeral_job(true));

    let outcome = h.reconcile_job().await;
    assert!(matches!(outcome, ReconcileOutcome::RetryAfter(_)));
    assert_eq!(h.deployment_status(), JobDeploymentStatus::PendingClusterCreation);
    assert!(h.gateway().calls().contains(&GatewayCall::CreateCluster(JOB_CLUSTER.into())));

    // Nothing is submitted until the cluster runs.
    h.reconcile_cluster(JOB_CLUSTER).await;
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::PendingClusterCreation);
    assert!(h.submission().submissions().is_empty());

    assert_eq!(h.settle_cluster(JOB_CLUSTER).await.phase, ClusterPhase::Running);
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::ClusterReady);

    h.reconcile_job().await;
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Submitted);
    assert!(status.start_time.is_some());
    assert_eq!(status.ray_cluster_name.as_deref(), Some(JOB_CLUSTER));
    let job_id = status.job_id.unwrap();
    assert!(job_id.starts_with("train-"));

    let submissions = h.submission().submissions();
    assert_eq!(submissions.len(), 1);
    let (endpoint, request) = &submissions[0];
    assert!(endpoint.contains("train-raycluster-head-svc"));
    assert!(endpoint.ends_with(":8265"));
    assert_eq!(request.submission_id, job_id);
    assert_eq!(request.entrypoint, "python train.py --epochs 3");
    assert_eq!(request.runtime_env.as_ref().unwrap()["pip"][0], "torch");
    assert_eq!(request.metadata["team"], "research");

    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Running);
    assert_eq!(h.job_status().job_status, Some(JobStatus::Pending));

    h.submission().set_status(&job_id, JobStatus::Succeeded, Some("done"));
    h.reconcile_job().await;
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Succeeded);
    assert_eq!(status.job_status, Some(JobStatus::Succeeded));
    assert!(status.end_time.is_some());

    // TTL is zero: the cluster goes right away.
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::CleaningUp);
    assert!(h.gateway().calls().contains(&GatewayCall::DeleteCluster(JOB_CLUSTER.into())));

    h.reconcile_cluster(JOB_CLUSTER).await;
    assert!(h.gateway().cluster(NS, JOB_CLUSTER).is_none());
    assert!(h.gateway().units(NS).is_empty());

    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Complete);
    assert_eq!(h.reconcile_job().await, ReconcileOutcome::Done);

    // The job was submitted exactly once.
    assert_eq!(h.submission().submissions().len(), 1);
}

#[tokio::test]
async fn test_failed_job_emits_warning_and_keeps_cluster() {
    let h = Harness::new();
    let job_id = h.submitted_job(false).await;

    h.submission()
        .set_status(&job_id, JobStatus::Failed, Some("exit code 1"));
    h.reconcile_job().await;

    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Failed);
    assert_eq!(status.message.as_deref(), Some("exit code 1"));
    assert!(h.warnings("train").contains(&"JobFailed".to_string()));

    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Complete);
    assert_eq!(h.reconcile_job().await, ReconcileOutcome::Done);
    assert!(h.gateway().cluster(NS, JOB_CLUSTER).is_some());
}

#[tokio::test]
async fn test_submission_retried_after_dashboard_error() {
    let h = Harness::new();
    h.gateway().insert_job(ephemeral_job(false));
    h.reconcile_job().await;
    h.settle_cluster(JOB_CLUSTER).await;
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::ClusterReady);

    h.submission().fail_submits(1);
    assert!(matches!(h.reconcile_job().await, ReconcileOutcome::Error(_)));
    assert_eq!(h.deployment_status(), JobDeploymentStatus::ClusterReady);
    assert!(h.submission().submissions().is_empty());

    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Submitted);
    assert_eq!(h.submission().submissions().len(), 1);
}

#[tokio::test]
async fn test_lost_submission_is_resubmitted() {
    let h = Harness::new();
    let job_id = h.submitted_job(false).await;
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Running);

    // The head restarted and the dashboard forgot the job.
    h.submission().forget(&job_id);
    h.reconcile_job().await;
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Submitted);
    assert_eq!(status.job_id.as_deref(), Some(job_id.as_str()));
    let submissions = h.submission().submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[1].1.submission_id, job_id);

    h.submission().set_status(&job_id, JobStatus::Succeeded, None);
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Succeeded);
}

#[tokio::test]
async fn test_cluster_lost_mid_run_fails_job() {
    let h = Harness::new();
    h.submitted_job(false).await;

    h.gateway().remove_cluster(NS, JOB_CLUSTER);
    h.reconcile_cluster(JOB_CLUSTER).await;
    assert!(h.gateway().cluster(NS, JOB_CLUSTER).is_none());

    h.reconcile_job().await;
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Failed);
    assert!(status.message.unwrap().contains("disappeared"));
    assert!(h.warnings("train").contains(&"JobFailed".to_string()));
}

#[tokio::test]
async fn test_selector_job_uses_existing_cluster() {
    let h = Harness::new();
    h.running_cluster("shared", cluster_spec(vec![worker_group("small", 1, 0, 2)]))
        .await;
    h.gateway().insert_job(selector_job("shared"));

    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::ClusterReady);
    h.reconcile_job().await;
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::Submitted);
    assert_eq!(status.ray_cluster_name.as_deref(), Some("shared"));
    assert!(h.submission().submissions()[0].0.contains("shared-head-svc"));

    let job_id = status.job_id.unwrap();
    h.submission().set_status(&job_id, JobStatus::Succeeded, None);
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Succeeded);

    // Teardown is requested, but the cluster is not the job's to delete.
    h.reconcile_job().await;
    assert_eq!(h.deployment_status(), JobDeploymentStatus::Complete);
    assert!(
        !h.gateway()
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::CreateCluster(_) | GatewayCall::DeleteCluster(_)))
    );
    assert!(h.gateway().cluster(NS, "shared").is_some());
}

#[tokio::test]
async fn test_selector_job_waits_for_missing_cluster() {
    let h = Harness::new();
    h.gateway().insert_job(selector_job("absent"));

    for _ in 0..2 {
        assert!(matches!(h.reconcile_job().await, ReconcileOutcome::RetryAfter(_)));
    }
    let status = h.job_status();
    assert_eq!(status.job_deployment_status, JobDeploymentStatus::PendingClusterCreation);
    assert_eq!(status.message.as_deref(), Some("Selected RayCluster not found"));
    assert!(h.gateway().clusters(NS).is_empty());
}

#[tokio::test]
async fn test_invalid_job_spec_reported_once() {
    let h = Harness::new();
    h.gateway().insert_job(RayJob::new(
        "train",
        RayJobSpec {
            entrypoint: "python train.py".into(),
            ..Default::default()
        },
    ));

    for _ in 0..2 {
        assert!(matches!(h.reconcile_job().await, ReconcileOutcome::Error(_)));
    }
    assert_eq!(h.warnings("train"), vec!["InvalidSpec".to_string()]);
    assert!(h.gateway().clusters(NS).is_empty());
}

#[tokio::test]
async fn test_malformed_runtime_env_is_reported_before_any_cluster() {
    let h = Harness::new();
    let mut job = ephemeral_job(true);
    job.spec.runtime_env = Some("pip: [torch]".into());
    h.gateway().insert_job(job);

    for _ in 0..2 {
        assert_eq!(
            h.reconcile_job().await,
            ReconcileOutcome::Error(ErrorKind::Configuration)
        );
    }
    let status = h.job_status();
    assert!(status.message.unwrap().contains("runtimeEnv"));
    assert_eq!(h.warnings("train"), vec!["InvalidSpec".to_string()]);
    assert!(h.gateway().clusters(NS).is_empty());
    assert!(h.submission().submissions().is_empty());
}

#[tokio::test]
async fn test_job_name_too_long_for_its_cluster_is_reported() {
    let h = Harness::new();
    let name = "nightly-recommendation-retrain";
    let mut job = ephemeral_job(true);
    job.metadata.name = Some(name.into());
    h.gateway().insert_job(job);

    for _ in 0..2 {
        assert_eq!(
            h.reconcile(OwnerKind::RayJob, name).await,
            ReconcileOutcome::Error(ErrorKind::Configuration)
        );
    }
    let status = h.gateway().job(NS, name).unwrap().status.unwrap();
    assert!(status.message.unwrap().contains("exceeds maximum length"));
    assert_eq!(h.warnings(name), vec!["InvalidSpec".to_string()]);
    assert!(h.gateway().clusters(NS).is_empty());
}

#[tokio::test]
async fn test_removing_job_collects_its_cluster() {
    let h = Harness::new();
    h.submitted_job(false).await;

    h.gateway().remove_job(NS, "train");
    let cluster = h.gateway().cluster(NS, JOB_CLUSTER).unwrap();
    assert!(cluster.metadata.deletion_timestamp.is_some());

    assert_eq!(h.reconcile_cluster(JOB_CLUSTER).await, ReconcileOutcome::Done);
    assert!(h.gateway().cluster(NS, JOB_CLUSTER).is_none());
    assert!(h.gateway().units(NS).is_empty());
}

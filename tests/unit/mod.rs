// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for ray-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use kube::CustomResourceExt;
    use ray_operator::crd::{
        ClusterPhase, Condition, JobDeploymentStatus, RayCluster, RayJob, RayService, ServicePhase,
    };

    #[test]
    fn test_phase_display() {
        assert_eq!(ClusterPhase::Initializing.to_string(), "Initializing");
        assert_eq!(ClusterPhase::Pending.to_string(), "Pending");
        assert_eq!(ClusterPhase::Running.to_string(), "Running");
        assert_eq!(ClusterPhase::Upgrading.to_string(), "Upgrading");
        assert_eq!(ClusterPhase::Degraded.to_string(), "Degraded");
        assert_eq!(ClusterPhase::Failed.to_string(), "Failed");
        assert_eq!(ClusterPhase::Deleting.to_string(), "Deleting");
    }

    #[test]
    fn test_phase_defaults() {
        assert_eq!(ClusterPhase::default(), ClusterPhase::Initializing);
        assert_eq!(ServicePhase::default(), ServicePhase::Pending);
        assert_eq!(
            JobDeploymentStatus::default(),
            JobDeploymentStatus::PendingClusterCreation
        );
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "AllUnitsReady", "Head and workers ready", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "AllUnitsReady");
        assert_eq!(condition.observed_generation, Some(1));
        assert!(condition.is_true());
    }

    #[test]
    fn test_condition_spec_valid_false() {
        let condition = Condition::spec_valid(false, "ValidationError", "bad group", Some(2));
        assert_eq!(condition.r#type, "SpecValid");
        assert!(!condition.is_true());
    }

    #[test]
    fn test_condition_upgrade_blocked() {
        let condition = Condition::upgrade_blocked(true, "DisruptiveChangeBlocked", "head serving", None);
        assert_eq!(condition.r#type, "UpgradeBlocked");
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn test_crd_names() {
        assert_eq!(RayCluster::crd().metadata.name.as_deref(), Some("rayclusters.ray.io"));
        assert_eq!(RayService::crd().metadata.name.as_deref(), Some("rayservices.ray.io"));
        assert_eq!(RayJob::crd().metadata.name.as_deref(), Some("rayjobs.ray.io"));
    }

    #[test]
    fn test_cluster_status_wire_names() {
        let cluster: RayCluster = serde_json::from_value(serde_json::json!({
            "apiVersion": "ray.io/v1alpha1",
            "kind": "RayCluster",
            "metadata": {"name": "demo"},
            "spec": {
                "headGroupSpec": {"template": {"image": "rayproject/ray:2.9.0"}},
                "workerGroupSpecs": [{
                    "groupName": "small",
                    "replicas": 2,
                    "minReplicas": 1,
                    "maxReplicas": 3,
                    "template": {"image": "rayproject/ray:2.9.0"}
                }]
            },
            "status": {"phase": "Running", "desiredWorkerReplicas": 2, "readyWorkerReplicas": 2}
        }))
        .unwrap();

        assert_eq!(cluster.spec.worker_group_specs[0].max_replicas, 3);
        let status = cluster.status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.ready_worker_replicas, 2);
    }
}

mod validation_tests {
    use ray_operator::controller::cluster_validation::{MAX_NAME_LENGTH, validate_cluster_spec, validate_spec};
    use ray_operator::crd::{
        ContainerTemplate, EndpointSpec, HeadGroupSpec, RayCluster, RayClusterSpec, WorkerGroupSpec,
    };

    fn template() -> ContainerTemplate {
        ContainerTemplate {
            image: "rayproject/ray:2.9.0".into(),
            ..Default::default()
        }
    }

    fn group(name: &str, replicas: i32, min: i32, max: i32) -> WorkerGroupSpec {
        WorkerGroupSpec {
            group_name: name.into(),
            replicas,
            min_replicas: min,
            max_replicas: max,
            template: template(),
            ..Default::default()
        }
    }

    fn spec(groups: Vec<WorkerGroupSpec>) -> RayClusterSpec {
        RayClusterSpec {
            head_group_spec: HeadGroupSpec {
                template: template(),
                ..Default::default()
            },
            worker_group_specs: groups,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_cluster_spec("demo", &spec(vec![group("small", 2, 1, 3)])).is_ok());
    }

    #[test]
    fn test_head_image_required() {
        let mut invalid = spec(vec![]);
        invalid.head_group_spec.template.image = " ".into();
        let err = validate_cluster_spec("demo", &invalid).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_replicas_outside_bounds() {
        let err = validate_cluster_spec("demo", &spec(vec![group("small", 4, 1, 3)])).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_min_above_max() {
        assert!(validate_cluster_spec("demo", &spec(vec![group("small", 2, 3, 2)])).is_err());
    }

    #[test]
    fn test_duplicate_group_names() {
        let groups = vec![group("small", 1, 0, 2), group("small", 1, 0, 2)];
        let err = validate_cluster_spec("demo", &spec(groups)).unwrap_err();
        assert!(err.to_string().contains("not unique"));
    }

    #[test]
    fn test_group_name_must_be_dns_label() {
        assert!(validate_cluster_spec("demo", &spec(vec![group("Small_Group", 1, 0, 2)])).is_err());
    }

    #[test]
    fn test_endpoint_colliding_with_head_service() {
        let mut invalid = spec(vec![]);
        invalid.head_group_spec.services = vec![EndpointSpec {
            name: "head-svc".into(),
            port: 8000,
            ..Default::default()
        }];
        let err = validate_cluster_spec("demo", &invalid).unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_long_name_rejected() {
        let cluster = RayCluster::new(&"a".repeat(MAX_NAME_LENGTH + 1), spec(vec![]));
        assert!(validate_spec(&cluster).is_err());
    }
}

mod resolver_tests {
    use ray_operator::batch::SchedulerRegistry;
    use ray_operator::config::EngineConfig;
    use ray_operator::crd::{
        ContainerTemplate, GangSchedulingSpec, HeadGroupSpec, RayCluster, RayClusterSpec, ScaleStrategy,
        WorkerGroupSpec,
    };
    use ray_operator::resources::resolver::worker_pod_names;
    use ray_operator::resources::{UnitKey, UnitRole, resolve};

    fn cluster(replicas: i32) -> RayCluster {
        let template = ContainerTemplate {
            image: "rayproject/ray:2.9.0".into(),
            ..Default::default()
        };
        let mut cluster = RayCluster::new(
            "demo",
            RayClusterSpec {
                head_group_spec: HeadGroupSpec {
                    template: template.clone(),
                    ..Default::default()
                },
                worker_group_specs: vec![WorkerGroupSpec {
                    group_name: "small".into(),
                    replicas,
                    min_replicas: 0,
                    max_replicas: 10,
                    template,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster.metadata.uid = Some("uid-demo".into());
        cluster
    }

    #[test]
    fn test_head_service_and_workers() {
        let desired = resolve(&cluster(2), &SchedulerRegistry::new(), &EngineConfig::default()).unwrap();
        assert_eq!(desired.units.len(), 4);
        assert!(desired.get(&UnitKey::pod("demo-head")).is_some());
        assert!(desired.get(&UnitKey::service("demo-head-svc")).is_some());
        assert_eq!(desired.worker_counts().get("small"), Some(&2));
        assert_eq!(desired.units[0].role, UnitRole::Head);
    }

    #[test]
    fn test_workers_to_delete_are_skipped() {
        let group = WorkerGroupSpec {
            group_name: "small".into(),
            replicas: 2,
            scale_strategy: ScaleStrategy {
                workers_to_delete: vec!["demo-small-worker-0".into()],
            },
            ..Default::default()
        };
        assert_eq!(
            worker_pod_names("demo", &group),
            vec!["demo-small-worker-1", "demo-small-worker-2"]
        );
    }

    #[test]
    fn test_unknown_gang_policy_fails_closed() {
        let mut cluster = cluster(1);
        cluster.spec.gang_scheduling = Some(GangSchedulingSpec {
            policy: Some("yunikorn".into()),
            ..Default::default()
        });
        let err = resolve(&cluster, &SchedulerRegistry::new(), &EngineConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_volcano_adds_placement_group() {
        let mut cluster = cluster(2);
        cluster.spec.gang_scheduling = Some(GangSchedulingSpec {
            policy: Some("volcano".into()),
            ..Default::default()
        });
        let desired = resolve(&cluster, &SchedulerRegistry::from_config(true), &EngineConfig::default()).unwrap();
        assert_eq!(desired.units[0].role, UnitRole::Placement);
        assert_eq!(desired.units.len(), 5);
    }
}

mod job_tests {
    use std::time::Duration;

    use jiff::Timestamp;
    use ray_operator::controller::job_reconciler::{job_cluster, submission_request};
    use ray_operator::controller::job_state_machine::{JobAction, JobObservation, next_step};
    use ray_operator::crd::{ClusterPhase, JobDeploymentStatus, RayJob, RayJobSpec, RayJobStatus};

    fn observe(cluster_phase: Option<ClusterPhase>) -> JobObservation<'static> {
        JobObservation {
            cluster_phase,
            owns_cluster: false,
            job_info: None,
            submission_lost: false,
            poll_interval: Duration::from_secs(3),
            pending_requeue: Duration::from_secs(5),
            now: Timestamp::now(),
        }
    }

    #[test]
    fn test_selector_job_waits_for_cluster() {
        let mut job = RayJob::new("train", RayJobSpec::default());
        job.spec.cluster_selector.insert("ray.io/cluster".into(), "shared".into());
        let target = job_cluster(&job).unwrap();
        assert_eq!(target.name, "shared");
        assert!(!target.owned);

        let step = next_step(&job, &observe(Some(ClusterPhase::Pending)));
        assert_eq!(step.action, JobAction::None);
        assert_eq!(step.next, JobDeploymentStatus::PendingClusterCreation);
        assert_eq!(step.requeue, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_selector_job_never_tears_down() {
        let mut job = RayJob::new(
            "train",
            RayJobSpec {
                shutdown_after_job_finishes: true,
                ..Default::default()
            },
        );
        job.status = Some(RayJobStatus {
            job_deployment_status: JobDeploymentStatus::Succeeded,
            ..Default::default()
        });
        let step = next_step(&job, &observe(Some(ClusterPhase::Running)));
        assert_eq!(step.action, JobAction::None);
        assert_eq!(step.next, JobDeploymentStatus::Complete);
    }

    #[test]
    fn test_submission_request_carries_metadata() {
        let mut job = RayJob::new(
            "train",
            RayJobSpec {
                entrypoint: "python train.py".into(),
                runtime_env: Some(r#"{"pip": ["torch"]}"#.into()),
                ..Default::default()
            },
        );
        job.spec.metadata.insert("owner".into(), "ml".into());
        let request = submission_request(&job, "train-1").unwrap();
        assert_eq!(request.submission_id, "train-1");
        assert_eq!(request.runtime_env.unwrap()["pip"][0], "torch");
        assert_eq!(request.metadata.get("owner").map(String::as_str), Some("ml"));
    }
}

mod config_tests {
    use std::time::Duration;

    use clap::Parser;
    use ray_operator::config::{OperatorConfig, parse_duration};

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::try_parse_from(["ray-operator"]).unwrap();
        assert_eq!(config.reconcile_concurrency, 1);
        assert!(config.enable_leader_election);
        assert!(!config.enable_batch_scheduler);
        assert_eq!(config.namespaces(), None);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_watch_namespaces_are_split_and_trimmed() {
        let config =
            OperatorConfig::try_parse_from(["ray-operator", "--watch-namespace", "ml, serving,"]).unwrap();
        assert_eq!(
            config.namespaces(),
            Some(vec!["ml".to_string(), "serving".to_string()])
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(OperatorConfig::try_parse_from(["ray-operator", "--reconcile-concurrency", "0"]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h 30m"), Ok(Duration::from_secs(5400)));
        assert!(parse_duration("soon").is_err());
    }
}

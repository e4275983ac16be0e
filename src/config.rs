//! Operator configuration.
//!
//! `OperatorConfig` is the command-line/environment surface parsed by clap.
//! `EngineConfig` is the plain subset consumed by the reconcilers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

/// Parse a duration in jiff's friendly (`90s`, `5m`, `1h 30m`) or ISO 8601 form.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let signed: jiff::SignedDuration = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
    Duration::try_from(signed).map_err(|e| format!("invalid duration {value:?}: {e}"))
}

/// Command-line configuration of the operator process.
#[derive(Parser, Debug, Clone)]
#[command(name = "ray-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Maximum number of resources reconciled in parallel.
    #[arg(
        long,
        env = "RAY_OPERATOR_RECONCILE_CONCURRENCY",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub reconcile_concurrency: u16,

    /// Interval of the periodic resync sweep.
    #[arg(long, env = "RAY_OPERATOR_RESYNC_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// Recreate units of a serving cluster when their identity changes.
    #[arg(long, env = "RAY_OPERATOR_FORCED_CLUSTER_UPGRADE", default_value_t = false)]
    pub forced_cluster_upgrade: bool,

    /// Worker units replaced per group and pass while serving (0 disables rolling).
    #[arg(long, env = "RAY_OPERATOR_WORKER_UPGRADE_BATCH_SIZE", default_value_t = 0)]
    pub worker_upgrade_batch_size: u32,

    /// Gang-scheduling policy applied to clusters that do not name one.
    #[arg(long, env = "RAY_OPERATOR_DEFAULT_GANG_POLICY")]
    pub default_gang_policy: Option<String>,

    /// Register the Volcano batch scheduler plugin.
    #[arg(long, env = "RAY_OPERATOR_ENABLE_BATCH_SCHEDULER", default_value_t = false)]
    pub enable_batch_scheduler: bool,

    /// Namespaces to watch, comma separated. Empty watches all namespaces.
    #[arg(long, env = "RAY_OPERATOR_WATCH_NAMESPACE", value_delimiter = ',')]
    pub watch_namespace: Vec<String>,

    /// Address of the metrics endpoint.
    #[arg(long, env = "RAY_OPERATOR_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Address of the liveness and readiness probes.
    #[arg(long, env = "RAY_OPERATOR_HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8082")]
    pub health_probe_bind_address: SocketAddr,

    /// Run leader election before starting the controllers.
    #[arg(
        long,
        env = "RAY_OPERATOR_ENABLE_LEADER_ELECTION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub enable_leader_election: bool,

    /// Name of the leader election Lease.
    #[arg(long, env = "RAY_OPERATOR_LEADER_ELECTION_ID", default_value = "ray-operator-leader")]
    pub leader_election_id: String,

    /// Also write JSON logs to daily-rotated files named after this path.
    #[arg(long, env = "RAY_OPERATOR_LOG_FILE_PATH")]
    pub log_file_path: Option<PathBuf>,

    /// Consecutive failed passes before a cluster is marked Failed.
    #[arg(long, env = "RAY_OPERATOR_FAILURE_BUDGET", default_value_t = 5)]
    pub failure_budget: u32,

    /// How long a unit may stay not ready before the cluster is Degraded.
    #[arg(long, env = "RAY_OPERATOR_UNHEALTHY_GRACE_PERIOD", default_value = "60s", value_parser = parse_duration)]
    pub unhealthy_grace_period: Duration,

    /// Treat Pod resources as updatable in place.
    #[arg(long, env = "RAY_OPERATOR_IN_PLACE_RESIZE", default_value_t = false)]
    pub in_place_resize: bool,

    /// First retry delay after a failed reconcile.
    #[arg(long, env = "RAY_OPERATOR_BACKOFF_BASE", default_value = "500ms", value_parser = parse_duration)]
    pub backoff_base: Duration,

    /// Upper bound of the retry delay.
    #[arg(long, env = "RAY_OPERATOR_BACKOFF_MAX", default_value = "5m", value_parser = parse_duration)]
    pub backoff_max: Duration,

    /// Default retention of a replaced RayService cluster.
    #[arg(long, env = "RAY_OPERATOR_SERVICE_CLUSTER_RETENTION", default_value = "60s", value_parser = parse_duration)]
    pub service_cluster_retention: Duration,

    /// Poll interval of running RayJobs.
    #[arg(long, env = "RAY_OPERATOR_JOB_POLL_INTERVAL", default_value = "3s", value_parser = parse_duration)]
    pub job_poll_interval: Duration,

    /// Dashboard port used for job submission.
    #[arg(long, env = "RAY_OPERATOR_DASHBOARD_PORT", default_value_t = 8265)]
    pub dashboard_port: u16,
}

impl OperatorConfig {
    /// Namespaces to watch; `None` means cluster-wide.
    pub fn namespaces(&self) -> Option<Vec<String>> {
        let namespaces: Vec<String> = self
            .watch_namespace
            .iter()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        (!namespaces.is_empty()).then_some(namespaces)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            forced_upgrade: self.forced_cluster_upgrade,
            worker_upgrade_batch_size: self.worker_upgrade_batch_size,
            default_gang_policy: self.default_gang_policy.clone(),
            failure_budget: self.failure_budget,
            unhealthy_grace_period: self.unhealthy_grace_period,
            in_place_resize: self.in_place_resize,
            service_cluster_retention: self.service_cluster_retention,
            job_poll_interval: self.job_poll_interval,
            dashboard_port: self.dashboard_port,
            pending_requeue: Duration::from_secs(5),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: usize::from(self.reconcile_concurrency),
            resync_interval: self.resync_interval,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }
}

/// Options consumed by the reconcilers.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Disable the disruption guard.
    pub forced_upgrade: bool,
    /// Rolling worker replacement batch while serving; 0 refuses worker recreates.
    pub worker_upgrade_batch_size: u32,
    pub default_gang_policy: Option<String>,
    pub failure_budget: u32,
    pub unhealthy_grace_period: Duration,
    pub in_place_resize: bool,
    pub service_cluster_retention: Duration,
    pub job_poll_interval: Duration,
    pub dashboard_port: u16,
    /// Requeue delay while units are converging.
    pub pending_requeue: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            forced_upgrade: false,
            worker_upgrade_batch_size: 0,
            default_gang_policy: None,
            failure_budget: 5,
            unhealthy_grace_period: Duration::from_secs(60),
            in_place_resize: false,
            service_cluster_retention: Duration::from_secs(60),
            job_poll_interval: Duration::from_secs(3),
            dashboard_port: 8265,
            pending_requeue: Duration::from_secs(5),
        }
    }
}

/// Options of the reconcile scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            resync_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

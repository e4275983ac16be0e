//! Custom Resource Definitions (CRDs) for ray-operator.
//!
//! - `RayCluster`: head and worker groups converged into Pods and Services
//! - `RayService`: blue/green swaps of a serving cluster
//! - `RayJob`: one-shot jobs on an ephemeral cluster

mod ray_cluster;
mod ray_job;
mod ray_service;

pub use ray_cluster::*;
pub use ray_job::*;
pub use ray_service::*;

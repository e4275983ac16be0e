//! Resource generation module.
//!
//! Contains the desired-state resolver and the generators for the native
//! units owned by a RayCluster.
//!
//! ## Units Generated
//!
//! | Unit | Purpose |
//! |------|---------|
//! | Head Pod | GCS, dashboard and driver entry point |
//! | Worker Pods | Indexed members of each worker group |
//! | Head Service | Stable address of the head Pod |
//! | Endpoint Services | Extra endpoints declared on the head group |
//! | PodGroup | Gang-scheduling placement group (Volcano) |

pub mod common;
pub mod fingerprint;
pub mod pods;
pub mod resolver;
pub mod services;
pub mod units;

pub use common::standard_labels;
pub use resolver::{DesiredState, resolve};
pub use units::{DesiredUnit, OwnerIdentity, OwnerKind, UnitKey, UnitKind, UnitObject, UnitRole};

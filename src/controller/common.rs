//! Shared controller helpers.
//!
//! Utilities used by the RayCluster, RayService and RayJob controllers.

use kube::{Api, Resource, ResourceExt, api::PatchParams};
use serde::de::DeserializeOwned;

use crate::controller::error::Error;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "ray-operator";

/// Add a finalizer to a resource.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();

    if !finalizers.contains(&finalizer.to_string()) {
        finalizers.push(finalizer.to_string());
        patch_finalizers(api, name, finalizers).await?;
    }
    Ok(())
}

/// Remove a specific finalizer from a resource.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            // Resource already deleted, nothing to do
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut finalizers = resource.finalizers().to_vec();
    if let Some(pos) = finalizers.iter().position(|f| f == finalizer) {
        finalizers.remove(pos);
        patch_finalizers(api, name, finalizers).await?;
    }
    Ok(())
}

async fn patch_finalizers<T>(api: &Api<T>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        name,
        &PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Parse an RFC 3339 status timestamp.
pub fn parse_timestamp(value: &str) -> Option<jiff::Timestamp> {
    value.parse().ok()
}

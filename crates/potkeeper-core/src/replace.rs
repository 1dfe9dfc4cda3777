//! Replacement manager: swap a dirty container for a clean clone.
//!
//! The clone is created under a temporary name with the dirty container's
//! image, labels, ports and network endpoints, started, and only then is the
//! dirty container removed. The clone finally takes over the original name.
//!
//! A clone that cannot start because the dirty container still holds its
//! published host ports or static addresses is started after the dirty
//! container is removed. The pot is briefly down during such a swap.

use tracing::{error, info, warn};

use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::error::Result;
use crate::pot::{ContainerInfo, Pot};

/// Outcome of one container swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub old_id: String,
    pub new_id: String,
    /// Name the clean container ended up with
    pub name: String,
    /// Dirty container was removed before the clone could start
    pub degraded: bool,
}

/// Creation spec for the clean clone of `container`.
#[must_use]
pub fn replacement_spec(container: &ContainerInfo, unix_secs: i64) -> ContainerSpec {
    ContainerSpec {
        name: format!("{}-clean-{unix_secs}", container.name),
        image: container.image.clone(),
        labels: container.labels.clone(),
        ports: container.ports.clone(),
        networks: container.networks.clone(),
    }
}

/// Replace one container.
///
/// On any failure before the dirty container is gone, the clone is removed
/// again and the dirty container keeps running.
pub async fn replace_container(
    runtime: &dyn ContainerRuntime,
    container: &ContainerInfo,
    unix_secs: i64,
) -> Result<Replacement> {
    let spec = replacement_spec(container, unix_secs);
    let new_id = runtime.create_container(&spec).await?;

    let degraded = match runtime.start_container(&new_id).await {
        Ok(()) => {
            if let Err(e) = runtime.remove_container(&container.id).await {
                discard_clone(runtime, &container.name, &new_id).await;
                return Err(e);
            }
            false
        }
        Err(e) if e.is_address_conflict() => {
            swap_stopped_first(runtime, container, &new_id, &e).await?;
            true
        }
        Err(e) => {
            discard_clone(runtime, &container.name, &new_id).await;
            return Err(e);
        }
    };

    let name = match runtime.rename_container(&new_id, &container.name).await {
        Ok(()) => container.name.clone(),
        Err(e) => {
            warn!(
                container = %container.name,
                temporary = %spec.name,
                error = %e,
                "Clean container keeps its temporary name"
            );
            spec.name
        }
    };

    info!(
        container = %name,
        old_id = %container.id,
        new_id = %new_id,
        degraded,
        "Container replaced"
    );
    Ok(Replacement {
        old_id: container.id.clone(),
        new_id,
        name,
        degraded,
    })
}

/// Remove the dirty container first, then start the clone.
///
/// Once the dirty container is gone the clone is the pot's only container,
/// so a second start failure leaves it in place for the operator.
async fn swap_stopped_first(
    runtime: &dyn ContainerRuntime,
    container: &ContainerInfo,
    clone_id: &str,
    conflict: &crate::Error,
) -> Result<()> {
    warn!(
        container = %container.name,
        clone = %clone_id,
        error = %conflict,
        "Dirty container holds the clone's ports or addresses, removing it first (degraded swap)"
    );
    if let Err(e) = runtime.remove_container(&container.id).await {
        discard_clone(runtime, &container.name, clone_id).await;
        return Err(e);
    }
    runtime.start_container(clone_id).await.inspect_err(|e| {
        error!(
            container = %container.name,
            clone = %clone_id,
            error = %e,
            "Clean clone failed to start after the dirty container was removed"
        );
    })
}

async fn discard_clone(runtime: &dyn ContainerRuntime, name: &str, clone_id: &str) {
    if let Err(e) = runtime.remove_container(clone_id).await {
        warn!(container = %name, clone = %clone_id, error = %e, "Failed to remove clean clone");
    }
}

/// Replace every container of `pot` concurrently; the first error wins.
pub async fn replace_pot(
    runtime: &dyn ContainerRuntime,
    pot: &Pot,
    unix_secs: i64,
) -> Result<Vec<Replacement>> {
    let swaps = pot
        .containers
        .iter()
        .map(|container| replace_container(runtime, container, unix_secs));
    futures::future::join_all(swaps).await.into_iter().collect()
}

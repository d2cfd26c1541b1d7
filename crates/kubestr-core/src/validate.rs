//! Checks that the objects a workflow refers to exist and agree with each
//! other.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use tracing::debug;

use crate::context::Context;
use crate::defaults::SNAPSHOT_GROUP;
use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::snapshot::{SnapshotApi, VolumeSnapshot};

/// Looks up and cross-checks user supplied object references.
#[derive(Clone)]
pub struct ArgumentValidator {
    gateway: Arc<dyn ClusterGateway>,
}

impl ArgumentValidator {
    /// Validates against the cluster behind `gateway`.
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        ArgumentValidator { gateway }
    }

    /// Fails unless the namespace exists.
    pub async fn validate_namespace(&self, ctx: &Context, name: &str) -> Result<()> {
        self.gateway.get_namespace(ctx, name).await.map(|_| ())
    }

    /// Returns the PVC, failing unless it exists and is bound to a volume.
    pub async fn validate_pvc(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim> {
        let pvc = self.gateway.get_pvc(ctx, namespace, name).await?;
        let bound = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !bound {
            return Err(Error::Precondition(format!("PVC ({}) not bound", name)));
        }
        Ok(pvc)
    }

    /// Returns the PersistentVolume.
    pub async fn fetch_pv(&self, ctx: &Context, name: &str) -> Result<PersistentVolume> {
        self.gateway.get_persistent_volume(ctx, name).await
    }

    /// Returns the StorageClass.
    pub async fn validate_storage_class(&self, ctx: &Context, name: &str) -> Result<StorageClass> {
        self.gateway.get_storage_class(ctx, name).await
    }

    /// Returns the VolumeSnapshotClass, failing unless it names a driver.
    pub async fn validate_volume_snapshot_class(
        &self,
        ctx: &Context,
        name: &str,
        api: SnapshotApi,
    ) -> Result<DynamicObject> {
        let class = self
            .gateway
            .get_dynamic(ctx, &api.volume_snapshot_classes(), None, name)
            .await?;
        if api.class_driver(&class).is_none() {
            return Err(Error::Precondition(format!(
                "VolumeSnapshotClass ({}) has no {} field",
                name,
                api.driver_key()
            )));
        }
        Ok(class)
    }

    /// Returns the VolumeSnapshot.
    pub async fn validate_volume_snapshot(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
        api: SnapshotApi,
    ) -> Result<VolumeSnapshot> {
        let object = self
            .gateway
            .get_dynamic(ctx, &api.volume_snapshots(), Some(namespace), name)
            .await?;
        Ok(VolumeSnapshot::from_dynamic(api, &object))
    }

    /// Discovers the snapshot API version to use.
    ///
    /// The server's preferred version wins when it is one the tool speaks;
    /// otherwise the newest served version is used.
    pub async fn csi_snapshot_group_version(&self, ctx: &Context) -> Result<SnapshotApi> {
        let groups = self.gateway.server_groups(ctx).await?;
        let group = groups
            .iter()
            .find(|g| g.name == SNAPSHOT_GROUP)
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "Snapshot API group {} is not served by the cluster",
                    SNAPSHOT_GROUP
                ))
            })?;
        let preferred = group
            .preferred_version
            .as_deref()
            .and_then(SnapshotApi::from_version);
        let newest = group
            .versions
            .iter()
            .filter_map(|v| SnapshotApi::from_version(v))
            .max();
        let api = preferred.or(newest).ok_or_else(|| {
            Error::Precondition(format!(
                "Snapshot API group {} serves no known version ({})",
                SNAPSHOT_GROUP,
                group.versions.join(", ")
            ))
        })?;
        debug!(%api, "Using snapshot API version");
        Ok(api)
    }
}

/// Fails unless the snapshot class's driver provisions the storage class.
pub fn provisioner_driver_match(
    storage_class: &StorageClass,
    snapshot_class: &DynamicObject,
    api: SnapshotApi,
) -> Result<()> {
    let driver = api.class_driver(snapshot_class).unwrap_or_default();
    if driver == storage_class.provisioner {
        return Ok(());
    }
    Err(Error::Precondition(format!(
        "StorageClass ({}) provisioner ({}) and VolumeSnapshotClass ({}) driver ({}) do not match",
        storage_class.metadata.name.as_deref().unwrap_or_default(),
        storage_class.provisioner,
        snapshot_class.metadata.name.as_deref().unwrap_or_default(),
        driver
    )))
}

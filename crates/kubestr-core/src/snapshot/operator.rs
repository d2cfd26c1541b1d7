use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{SnapshotApi, SnapshotSource, VolumeSnapshot};
use crate::context::Context;
use crate::defaults::POLL_INTERVAL;
use crate::error::{Error, Result, StageExt};
use crate::gateway::ClusterGateway;
use crate::names::{clone_name, created_by_labels, shorten};

/// Parameters for a snapshot of a PVC.
#[derive(Clone, Debug)]
pub struct CreateSnapshotArgs {
    /// Namespace of the PVC and the snapshot.
    pub namespace: String,
    /// Snapshot name.
    pub name: String,
    /// PVC to snapshot.
    pub pvc: String,
    /// VolumeSnapshotClass to use.
    pub class: String,
}

/// Parameters for a snapshot bound to an existing storage-side snapshot.
#[derive(Clone, Debug)]
pub struct CreateFromSourceArgs {
    /// Driver and handle of the storage-side snapshot.
    pub source: SnapshotSource,
    /// Namespace of the new snapshot.
    pub namespace: String,
    /// Snapshot name. The content name is derived from it.
    pub name: String,
    /// VolumeSnapshotClass to use.
    pub class: String,
    /// `Delete` or `Retain`.
    pub deletion_policy: String,
}

/// Reads and writes snapshot objects in the version the cluster prefers.
#[derive(Clone)]
pub struct SnapshotOperator {
    gateway: Arc<dyn ClusterGateway>,
    api: SnapshotApi,
}

impl SnapshotOperator {
    /// Operates on snapshot objects of version `api`.
    pub fn new(gateway: Arc<dyn ClusterGateway>, api: SnapshotApi) -> Self {
        SnapshotOperator { gateway, api }
    }

    /// The API version in use.
    pub fn api(&self) -> SnapshotApi {
        self.api
    }

    fn snapshot_object(&self, namespace: &str, name: &str, spec: Value) -> Result<DynamicObject> {
        Ok(serde_json::from_value(json!({
            "apiVersion": self.api.api_version(),
            "kind": "VolumeSnapshot",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": created_by_labels(),
            },
            "spec": spec,
        }))?)
    }

    /// Snapshots a PVC, optionally waiting until the snapshot is ready.
    pub async fn create(
        &self,
        ctx: &Context,
        args: &CreateSnapshotArgs,
        wait_for_ready: bool,
    ) -> Result<VolumeSnapshot> {
        let spec = match self.api {
            SnapshotApi::V1Alpha1 => json!({
                "snapshotClassName": args.class,
                "source": { "kind": "PersistentVolumeClaim", "name": args.pvc },
            }),
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => json!({
                "volumeSnapshotClassName": args.class,
                "source": { "persistentVolumeClaimName": args.pvc },
            }),
        };
        let object = self.snapshot_object(&args.namespace, &args.name, spec)?;
        let created = self
            .gateway
            .create_dynamic(ctx, &self.api.volume_snapshots(), Some(&args.namespace), &object)
            .await?;
        info!(
            snapshot = %args.name,
            pvc = %args.pvc,
            class = %args.class,
            api = %self.api,
            "Created VolumeSnapshot"
        );
        if wait_for_ready {
            return self.wait_for_ready(ctx, &args.namespace, &args.name).await;
        }
        Ok(VolumeSnapshot::from_dynamic(self.api, &created))
    }

    /// Fetches a snapshot.
    pub async fn get(&self, ctx: &Context, namespace: &str, name: &str) -> Result<VolumeSnapshot> {
        let object = self
            .gateway
            .get_dynamic(ctx, &self.api.volume_snapshots(), Some(namespace), name)
            .await?;
        Ok(VolumeSnapshot::from_dynamic(self.api, &object))
    }

    /// Deletes a snapshot.
    pub async fn delete(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        self.gateway
            .delete_dynamic(ctx, &self.api.volume_snapshots(), Some(namespace), name)
            .await
    }

    /// Polls a snapshot until it is ready to use.
    pub async fn wait_for_ready(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<VolumeSnapshot> {
        let polled = ctx
            .run(async {
                loop {
                    let snapshot = self.get(ctx, namespace, name).await?;
                    if snapshot.ready_to_use {
                        return Ok(snapshot);
                    }
                    debug!(snapshot = %name, "Waiting for VolumeSnapshot to become ready");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await;
        match polled {
            Err(Error::DeadlineExceeded) => Err(Error::ProvisionTimeout(format!(
                "VolumeSnapshot ({}) did not become ready to use",
                name
            ))),
            other => other,
        }
    }

    /// Resolves the driver and handle behind a snapshot through its bound
    /// content.
    pub async fn get_source(
        &self,
        ctx: &Context,
        snapshot: &VolumeSnapshot,
    ) -> Result<SnapshotSource> {
        let content_name = snapshot.bound_content.as_deref().ok_or_else(|| {
            Error::Precondition(format!(
                "VolumeSnapshot ({}) is not bound to a VolumeSnapshotContent",
                snapshot.name
            ))
        })?;
        let content = self
            .gateway
            .get_dynamic(ctx, &self.api.volume_snapshot_contents(), None, content_name)
            .await?;
        SnapshotSource::from_content(self.api, &content).ok_or_else(|| {
            Error::Precondition(format!(
                "VolumeSnapshotContent ({}) has no snapshot handle",
                content_name
            ))
        })
    }

    /// Copies the VolumeSnapshotClass `source` to `target`, optionally with a
    /// different deletion policy.
    pub async fn clone_volume_snapshot_class(
        &self,
        ctx: &Context,
        source: &str,
        target: &str,
        deletion_policy: Option<&str>,
    ) -> Result<DynamicObject> {
        let gvr = self.api.volume_snapshot_classes();
        let original = self.gateway.get_dynamic(ctx, &gvr, None, source).await?;
        let driver = self.api.class_driver(&original).ok_or_else(|| {
            Error::Precondition(format!(
                "VolumeSnapshotClass ({}) does not name a {}",
                source,
                self.api.driver_key()
            ))
        })?;
        let policy = deletion_policy
            .map(str::to_owned)
            .or_else(|| {
                original
                    .data
                    .get("deletionPolicy")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "Delete".to_owned());

        let mut class = json!({
            "apiVersion": self.api.api_version(),
            "kind": "VolumeSnapshotClass",
            "metadata": { "name": target, "labels": created_by_labels() },
            "deletionPolicy": policy,
        });
        class[self.api.driver_key()] = json!(driver);
        if let Some(parameters) = original.data.get("parameters") {
            class["parameters"] = parameters.clone();
        }
        let class: DynamicObject = serde_json::from_value(class)?;
        let created = self.gateway.create_dynamic(ctx, &gvr, None, &class).await?;
        debug!(source, target, policy = %policy, "Cloned VolumeSnapshotClass");
        Ok(created)
    }

    /// Deletes a VolumeSnapshotClass.
    pub async fn delete_volume_snapshot_class(&self, ctx: &Context, name: &str) -> Result<()> {
        self.gateway
            .delete_dynamic(ctx, &self.api.volume_snapshot_classes(), None, name)
            .await
    }

    /// Deletes a VolumeSnapshotContent.
    pub async fn delete_content(&self, ctx: &Context, name: &str) -> Result<()> {
        self.gateway
            .delete_dynamic(ctx, &self.api.volume_snapshot_contents(), None, name)
            .await
    }

    /// Name of the content object [`SnapshotOperator::create_from_source`]
    /// pre-provisions for a snapshot.
    pub fn content_name_for(snapshot: &str) -> String {
        shorten(&format!("{}-content", snapshot))
    }

    /// Creates a snapshot from an existing storage-side snapshot: a
    /// pre-provisioned VolumeSnapshotContent carrying the handle plus a
    /// VolumeSnapshot bound to it.
    pub async fn create_from_source(
        &self,
        ctx: &Context,
        args: &CreateFromSourceArgs,
        wait_for_ready: bool,
    ) -> Result<VolumeSnapshot> {
        let CreateFromSourceArgs {
            source,
            namespace,
            name,
            class,
            deletion_policy,
        } = args;
        let (namespace, name) = (namespace.as_str(), name.as_str());
        let content_name = Self::content_name_for(name);
        let content = match self.api {
            SnapshotApi::V1Alpha1 => json!({
                "apiVersion": self.api.api_version(),
                "kind": "VolumeSnapshotContent",
                "metadata": { "name": content_name, "labels": created_by_labels() },
                "spec": {
                    "csiVolumeSnapshotSource": {
                        "driver": source.driver,
                        "snapshotHandle": source.handle,
                    },
                    "volumeSnapshotRef": {
                        "kind": "VolumeSnapshot",
                        "name": name,
                        "namespace": namespace,
                    },
                    "snapshotClassName": class,
                    "deletionPolicy": deletion_policy,
                },
            }),
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => json!({
                "apiVersion": self.api.api_version(),
                "kind": "VolumeSnapshotContent",
                "metadata": { "name": content_name, "labels": created_by_labels() },
                "spec": {
                    "deletionPolicy": deletion_policy,
                    "driver": source.driver,
                    "source": { "snapshotHandle": source.handle },
                    "volumeSnapshotClassName": class,
                    "volumeSnapshotRef": {
                        "kind": "VolumeSnapshot",
                        "name": name,
                        "namespace": namespace,
                    },
                },
            }),
        };
        let content: DynamicObject = serde_json::from_value(content)?;
        self.gateway
            .create_dynamic(ctx, &self.api.volume_snapshot_contents(), None, &content)
            .await?;

        let spec = match self.api {
            SnapshotApi::V1Alpha1 => json!({
                "snapshotClassName": class,
                "snapshotContentName": content_name,
            }),
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => json!({
                "volumeSnapshotClassName": class,
                "source": { "volumeSnapshotContentName": content_name },
            }),
        };
        let snapshot = self.snapshot_object(namespace, name, spec)?;
        let created = self
            .gateway
            .create_dynamic(ctx, &self.api.volume_snapshots(), Some(namespace), &snapshot)
            .await?;
        info!(snapshot = %name, content = %content_name, "Created VolumeSnapshot from source");
        if wait_for_ready {
            return self.wait_for_ready(ctx, namespace, name).await;
        }
        Ok(VolumeSnapshot::from_dynamic(self.api, &created))
    }

    /// Checks that the CSI driver can create a snapshot from an existing
    /// handle.
    ///
    /// The snapshot class is cloned with a `Retain` policy so deleting the
    /// cloned objects leaves the storage-side snapshot alone. The cloned
    /// snapshot, its content and the temporary class are always removed.
    pub async fn check_create_from_source(
        &self,
        ctx: &Context,
        snapshot: &VolumeSnapshot,
        class: &str,
    ) -> Result<()> {
        let temp_class = clone_name(class);
        let clone = clone_name(&snapshot.name);

        let res = self
            .create_clone_from_source(ctx, snapshot, class, &temp_class, &clone)
            .await;

        // The clones get a fresh deadline so they are removed even when the
        // check itself ran out of time.
        let cleanup_ctx = Context::with_timeout(crate::defaults::PVC_CLEANUP_TIMEOUT);
        let content = Self::content_name_for(&clone);
        let removals = [
            (
                "VolumeSnapshot",
                &clone,
                self.delete(&cleanup_ctx, &snapshot.namespace, &clone).await,
            ),
            (
                "VolumeSnapshotContent",
                &content,
                self.delete_content(&cleanup_ctx, &content).await,
            ),
            (
                "VolumeSnapshotClass",
                &temp_class,
                self.delete_volume_snapshot_class(&cleanup_ctx, &temp_class).await,
            ),
        ];
        for (kind, name, removed) in removals {
            match removed {
                Err(e) if !e.is_not_found() => {
                    warn!(
                        kind,
                        name = %name,
                        error = %e,
                        "Failed to remove a create-from-source object"
                    )
                }
                _ => {}
            }
        }
        res
    }

    async fn create_clone_from_source(
        &self,
        ctx: &Context,
        snapshot: &VolumeSnapshot,
        class: &str,
        temp_class: &str,
        clone: &str,
    ) -> Result<()> {
        self.clone_volume_snapshot_class(ctx, class, temp_class, Some("Retain"))
            .await
            .stage("Failed to clone a VolumeSnapshotClass")?;
        let source = self
            .get_source(ctx, snapshot)
            .await
            .stage("Failed to get the source of the VolumeSnapshot")?;
        let args = CreateFromSourceArgs {
            source,
            namespace: snapshot.namespace.clone(),
            name: clone.to_owned(),
            class: temp_class.to_owned(),
            deletion_policy: "Retain".to_owned(),
        };
        self.create_from_source(ctx, &args, true)
            .await
            .stage("Failed to create a VolumeSnapshot from source")?;
        Ok(())
    }
}

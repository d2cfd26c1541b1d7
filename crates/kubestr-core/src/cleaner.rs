//! Idempotent removal of the objects the workflows create.
//!
//! Deleting something that is already gone counts as success. Objects left
//! behind by interrupted or `--no-cleanup` runs are found by their label
//! with [`Cleaner::find_leftovers`].

use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::context::Context;
use crate::defaults::{
    CREATED_BY_FIO_LABEL_KEY, CREATED_BY_FIO_LABEL_VALUE, CREATED_BY_LABEL_KEY,
    CREATED_BY_LABEL_VALUE, POD_CLEANUP_TIMEOUT, POLL_INTERVAL, PVC_CLEANUP_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::names::created_by_selector;
use crate::snapshot::SnapshotApi;

fn ignore_not_found(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Kinds of labelled object a run can leave behind, declared in the order
/// they are removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LeftoverKind {
    /// A Pod. Removed first so its claims are released.
    Pod,
    /// A VolumeSnapshot.
    VolumeSnapshot,
    /// A PersistentVolumeClaim.
    PersistentVolumeClaim,
    /// A VolumeSnapshotContent pre-provisioned from a snapshot handle.
    VolumeSnapshotContent,
    /// A cloned VolumeSnapshotClass.
    VolumeSnapshotClass,
    /// A ConfigMap generated by the FIO runner.
    ConfigMap,
}

/// A labelled object found in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leftover {
    /// What it is.
    pub kind: LeftoverKind,
    /// Namespace; empty for cluster scoped objects.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl Leftover {
    fn of(kind: LeftoverKind, metadata: &ObjectMeta) -> Self {
        Leftover {
            kind,
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Leftover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{:?} {}", self.kind, self.name)
        } else {
            write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

fn is_labelled(metadata: &ObjectMeta) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CREATED_BY_LABEL_KEY))
        .map(|v| v == CREATED_BY_LABEL_VALUE)
        .unwrap_or(false)
}

/// Deletes transient objects.
#[derive(Clone)]
pub struct Cleaner {
    gateway: Arc<dyn ClusterGateway>,
}

impl Cleaner {
    /// Deletes through `gateway`.
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Cleaner { gateway }
    }

    /// Deletes a pod and waits up to two minutes for it to disappear.
    pub async fn delete_pod(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(self.gateway.delete_pod(ctx, namespace, name).await)?;
        let ctx = ctx.child(POD_CLEANUP_TIMEOUT);
        let gone = ctx
            .run(async {
                loop {
                    match self.gateway.get_pod(&ctx, namespace, name).await {
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                        Ok(_) => debug!(pod = %name, "Waiting for Pod to terminate"),
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await;
        match gone {
            Err(Error::DeadlineExceeded) => Err(Error::ProvisionTimeout(format!(
                "Pod ({}) did not terminate",
                name
            ))),
            other => {
                info!(pod = %name, "Deleted Pod");
                other
            }
        }
    }

    /// Deletes a PVC and waits up to two minutes for it to disappear.
    pub async fn delete_pvc(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(self.gateway.delete_pvc(ctx, namespace, name).await)?;
        let ctx = ctx.child(PVC_CLEANUP_TIMEOUT);
        let gone = ctx
            .run(async {
                loop {
                    match self.gateway.get_pvc(&ctx, namespace, name).await {
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                        Ok(_) => debug!(pvc = %name, "Waiting for PVC to be removed"),
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await;
        match gone {
            Err(Error::DeadlineExceeded) => Err(Error::ProvisionTimeout(format!(
                "PVC ({}) was not removed",
                name
            ))),
            other => {
                info!(pvc = %name, "Deleted PVC");
                other
            }
        }
    }

    /// Deletes a VolumeSnapshot.
    pub async fn delete_snapshot(
        &self,
        ctx: &Context,
        api: SnapshotApi,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        ignore_not_found(
            self.gateway
                .delete_dynamic(ctx, &api.volume_snapshots(), Some(namespace), name)
                .await,
        )?;
        info!(snapshot = %name, "Deleted VolumeSnapshot");
        Ok(())
    }

    /// Deletes a VolumeSnapshotClass.
    pub async fn delete_snapshot_class(
        &self,
        ctx: &Context,
        api: SnapshotApi,
        name: &str,
    ) -> Result<()> {
        ignore_not_found(
            self.gateway
                .delete_dynamic(ctx, &api.volume_snapshot_classes(), None, name)
                .await,
        )
    }

    /// Deletes a VolumeSnapshotContent.
    pub async fn delete_snapshot_content(
        &self,
        ctx: &Context,
        api: SnapshotApi,
        name: &str,
    ) -> Result<()> {
        ignore_not_found(
            self.gateway
                .delete_dynamic(ctx, &api.volume_snapshot_contents(), None, name)
                .await,
        )
    }

    /// Deletes a ConfigMap generated by the FIO runner. ConfigMaps without
    /// the FIO label are left alone and reported as an error.
    pub async fn delete_fio_config_map(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let config_map = match self.gateway.get_config_map(ctx, namespace, name).await {
            Err(e) if e.is_not_found() => return Ok(()),
            other => other?,
        };
        let generated = config_map
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CREATED_BY_FIO_LABEL_KEY))
            .map(|v| v == CREATED_BY_FIO_LABEL_VALUE)
            .unwrap_or(false);
        if !generated {
            return Err(Error::Precondition(format!(
                "ConfigMap ({}) is missing the {}={} label; refusing to delete it",
                name, CREATED_BY_FIO_LABEL_KEY, CREATED_BY_FIO_LABEL_VALUE
            )));
        }
        ignore_not_found(self.gateway.delete_config_map(ctx, namespace, name).await)?;
        info!(config_map = %name, "Deleted ConfigMap");
        Ok(())
    }

    /// Finds every object carrying the created-by label in any namespace,
    /// sorted into removal order. Snapshot objects are only looked up when
    /// `snapshots` names the version the cluster serves.
    pub async fn find_leftovers(
        &self,
        ctx: &Context,
        snapshots: Option<SnapshotApi>,
    ) -> Result<Vec<Leftover>> {
        let selector = created_by_selector();
        let mut leftovers = Vec::new();
        for pod in self.gateway.list_pods(ctx, "", &selector).await? {
            leftovers.push(Leftover::of(LeftoverKind::Pod, &pod.metadata));
        }
        for pvc in self.gateway.list_pvcs(ctx, "", &selector).await? {
            leftovers.push(Leftover::of(LeftoverKind::PersistentVolumeClaim, &pvc.metadata));
        }
        let fio_selector = format!(
            "{},{}={}",
            selector, CREATED_BY_FIO_LABEL_KEY, CREATED_BY_FIO_LABEL_VALUE
        );
        for config_map in self.gateway.list_config_maps(ctx, "", &fio_selector).await? {
            leftovers.push(Leftover::of(LeftoverKind::ConfigMap, &config_map.metadata));
        }
        if let Some(api) = snapshots {
            let resources = [
                (LeftoverKind::VolumeSnapshot, api.volume_snapshots()),
                (LeftoverKind::VolumeSnapshotContent, api.volume_snapshot_contents()),
                (LeftoverKind::VolumeSnapshotClass, api.volume_snapshot_classes()),
            ];
            for (kind, gvr) in resources {
                let objects = self.gateway.list_dynamic(ctx, &gvr, None).await?;
                leftovers.extend(
                    objects
                        .iter()
                        .filter(|o| is_labelled(&o.metadata))
                        .map(|o| Leftover::of(kind, &o.metadata)),
                );
            }
        }
        leftovers.sort_by_key(|l| l.kind);
        debug!(count = leftovers.len(), "Found labelled objects");
        Ok(leftovers)
    }

    /// Removes a leftover with the delete matching its kind.
    pub async fn remove(
        &self,
        ctx: &Context,
        snapshots: Option<SnapshotApi>,
        leftover: &Leftover,
    ) -> Result<()> {
        let (namespace, name) = (leftover.namespace.as_str(), leftover.name.as_str());
        let api = || {
            snapshots.ok_or_else(|| {
                Error::Precondition(format!("{} needs the snapshot API to be removed", leftover))
            })
        };
        match leftover.kind {
            LeftoverKind::Pod => self.delete_pod(ctx, namespace, name).await,
            LeftoverKind::PersistentVolumeClaim => self.delete_pvc(ctx, namespace, name).await,
            LeftoverKind::ConfigMap => self.delete_fio_config_map(ctx, namespace, name).await,
            LeftoverKind::VolumeSnapshot => {
                self.delete_snapshot(ctx, api()?, namespace, name).await
            }
            LeftoverKind::VolumeSnapshotContent => {
                self.delete_snapshot_content(ctx, api()?, name).await
            }
            LeftoverKind::VolumeSnapshotClass => {
                self.delete_snapshot_class(ctx, api()?, name).await
            }
        }
    }
}

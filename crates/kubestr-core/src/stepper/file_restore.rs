//! Restores files from a snapshot back into the PVC it was taken from.
//!
//! The snapshot is restored into a new claim and mounted next to the source
//! claim. With a path an alpine pod copies the files over with `cp -rf`;
//! without one a filebrowser rooted at `/` is served so files can be picked
//! by hand.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::Serialize;
use tracing::info;

use super::browse::viewer_pod_args;
use super::{
    exec_checked, provision_pod, provision_pvc, snapshot_data_source, wait_until_ready, Ledger,
    PodOptions, PodRef, Workflow,
};
use crate::context::Context;
use crate::creator::{CreatePvcArgs, VolumePath};
use crate::defaults::FILEBROWSER_PORT;
use crate::error::{Error, Result, StageExt};
use crate::portforward::{self, PortForwardOptions};
use crate::snapshot::VolumeSnapshot;
use crate::toolkit::Toolkit;
use crate::validate::provisioner_driver_match;

const SNAPSHOT_DATA_DIR: &str = "/snapshot-data";
const SOURCE_DATA_DIR: &str = "/source-data";

/// Inputs of a file restore.
#[derive(Clone, Debug)]
pub struct FileRestoreArgs {
    /// Snapshot to restore from.
    pub snapshot: String,
    /// Claim to restore into; the snapshot's own source when unset.
    pub pvc: Option<String>,
    /// Absolute path to copy. Without it the browser is served instead.
    pub path: Option<String>,
    /// Port-forward settings for the interactive mode.
    pub forward: PortForwardOptions,
    /// Pod settings.
    pub pod: PodOptions,
}

/// What a file restore did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum FileRestoreOutput {
    /// `path` was copied from the snapshot into the source claim.
    Copied {
        /// The restored path.
        path: String,
        /// Claim the files were restored into.
        pvc: String,
    },
    /// The browser was served until stopped.
    Served {
        /// Where it was served.
        url: String,
    },
}

/// The validated snapshot and the claim it restores into.
pub struct FileRestorePrerequisites {
    snapshot: VolumeSnapshot,
    source: PersistentVolumeClaim,
    source_name: String,
    storage_class: StorageClass,
}

/// Copies files out of a snapshot.
pub struct FileRestore {
    toolkit: Toolkit,
    args: FileRestoreArgs,
}

impl FileRestore {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: FileRestoreArgs) -> Self {
        FileRestore { toolkit, args }
    }
}

/// The `cp` invocation restoring `path`.
pub fn copy_command(path: &str) -> Vec<String> {
    vec![
        "cp".to_owned(),
        "-rf".to_owned(),
        format!("{}{}", SNAPSHOT_DATA_DIR, path),
        format!("{}{}", SOURCE_DATA_DIR, path),
    ]
}

#[async_trait]
impl Workflow for FileRestore {
    type Prerequisites = FileRestorePrerequisites;
    type Provisioned = PodRef;
    type Output = FileRestoreOutput;

    fn name(&self) -> &'static str {
        "file-restore"
    }

    async fn validate(&self, ctx: &Context) -> Result<FileRestorePrerequisites> {
        if let Some(path) = &self.args.path {
            if !path.starts_with('/') {
                return Err(Error::InvalidArgument(format!(
                    "Path ({}) must be absolute",
                    path
                )));
            }
        }
        let validator = self.toolkit.validator();
        let namespace = &self.args.pod.namespace;
        validator
            .validate_namespace(ctx, namespace)
            .await
            .stage("Failed to find namespace")?;
        let api = validator
            .csi_snapshot_group_version(ctx)
            .await
            .stage("Failed to discover the snapshot API")?;
        let snapshot = validator
            .validate_volume_snapshot(ctx, namespace, &self.args.snapshot, api)
            .await
            .stage("Failed to find VolumeSnapshot")?;
        if !snapshot.ready_to_use {
            return Err(Error::Precondition(format!(
                "VolumeSnapshot ({}) is not ready to use",
                snapshot.name
            )));
        }
        let source_name = self
            .args
            .pvc
            .clone()
            .or_else(|| snapshot.source_pvc.clone())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "VolumeSnapshot ({}) has no source PVC; name one explicitly",
                    snapshot.name
                ))
            })?;
        let source = validator
            .validate_pvc(ctx, namespace, &source_name)
            .await
            .stage("Failed to validate source PVC")?;
        let class_name = source
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .ok_or_else(|| {
                Error::Precondition(format!("PVC ({}) has no StorageClass", source_name))
            })?;
        let storage_class = validator
            .validate_storage_class(ctx, &class_name)
            .await
            .stage("Failed to find the PVC's StorageClass")?;
        let snapshot_class_name = snapshot.class_name.clone().ok_or_else(|| {
            Error::Precondition(format!(
                "VolumeSnapshot ({}) does not name a VolumeSnapshotClass",
                snapshot.name
            ))
        })?;
        let snapshot_class = validator
            .validate_volume_snapshot_class(ctx, &snapshot_class_name, api)
            .await
            .stage("Failed to find the snapshot's VolumeSnapshotClass")?;
        provisioner_driver_match(&storage_class, &snapshot_class, api)?;
        Ok(FileRestorePrerequisites {
            snapshot,
            source,
            source_name,
            storage_class,
        })
    }

    async fn provision(
        &self,
        ctx: &Context,
        pre: &FileRestorePrerequisites,
        ledger: &mut Ledger,
    ) -> Result<PodRef> {
        let creator = self.toolkit.creator();
        let requested = pre
            .source
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| q.0.clone());
        let restored = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: "kubestr-restore-pvc-".to_owned(),
                storage_class: pre.storage_class.metadata.name.clone().unwrap_or_default(),
                namespace: self.args.pod.namespace.clone(),
                size: pre.snapshot.restore_size.clone().or(requested),
                data_source: Some(snapshot_data_source(&pre.snapshot.name)),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to restore PVC")?;

        let mut pod_args = viewer_pod_args(
            &self.args.pod,
            "kubestr-restore-pod-",
            "/",
            self.args.path.is_some(),
        );
        pod_args
            .pvc_paths
            .insert(restored.clone(), VolumePath::mount(SNAPSHOT_DATA_DIR));
        pod_args
            .pvc_paths
            .insert(pre.source_name.clone(), VolumePath::mount(SOURCE_DATA_DIR));
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create restore pod")?;
        wait_until_ready(&creator, ctx, &[&restored], &pod)
            .await
            .stage("Restore pod did not become ready")?;
        Ok(pod)
    }

    async fn act(
        &self,
        ctx: &Context,
        pre: &FileRestorePrerequisites,
        pod: &PodRef,
        _ledger: &mut Ledger,
    ) -> Result<FileRestoreOutput> {
        match &self.args.path {
            Some(path) => {
                exec_checked(self.toolkit.gateway().as_ref(), ctx, pod, &copy_command(path))
                    .await
                    .stage("Failed to restore files")?;
                info!(%path, pvc = %pre.source_name, "Restored files from snapshot");
                Ok(FileRestoreOutput::Copied {
                    path: path.clone(),
                    pvc: pre.source_name.clone(),
                })
            }
            None => {
                let url = portforward::serve(
                    self.toolkit.gateway(),
                    ctx,
                    pod,
                    FILEBROWSER_PORT,
                    self.args.forward.clone(),
                )
                .await
                .stage("Failed to port-forward the browser")?;
                Ok(FileRestoreOutput::Served { url })
            }
        }
    }
}

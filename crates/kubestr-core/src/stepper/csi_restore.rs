//! Snapshot and restore round trip through a CSI driver.
//!
//! A pod writes a random marker to a fresh volume, the volume is
//! snapshotted, a second volume is restored from the snapshot and the
//! marker is read back from it.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{
    command, exec_checked, provision_pod, provision_pvc, snapshot_data_source, wait_until_ready,
    CreatedObject, Ledger, PodOptions, PodRef, Workflow,
};
use crate::context::Context;
use crate::creator::{CreatePvcArgs, VolumePath};
use crate::error::{Error, Result, StageExt};
use crate::names::snapshot_name;
use crate::snapshot::{CreateSnapshotArgs, SnapshotApi, VolumeSnapshot};
use crate::toolkit::Toolkit;
use crate::validate::provisioner_driver_match;

const ORIGINAL_PVC_PREFIX: &str = "kubestr-csi-original-pvc-";
const ORIGINAL_POD_PREFIX: &str = "kubestr-csi-original-pod-";
const CLONED_PVC_PREFIX: &str = "kubestr-csi-cloned-pvc-";
const CLONED_POD_PREFIX: &str = "kubestr-csi-cloned-pod-";
const DATA_DIR: &str = "/data";
const DATA_FILE: &str = "/data/out.txt";

/// Inputs of the snapshot-restore check.
#[derive(Clone, Debug)]
pub struct CsiRestoreArgs {
    /// StorageClass to provision from.
    pub storage_class: String,
    /// VolumeSnapshotClass to snapshot with.
    pub volume_snapshot_class: String,
    /// Skip the create-from-source check.
    pub skip_cfs_check: bool,
    /// Marker to write; a random one is generated when unset.
    pub marker: Option<String>,
    /// Pod settings.
    pub pod: PodOptions,
}

/// The validated storage and snapshot classes.
pub struct CsiRestorePrerequisites {
    storage_class: StorageClass,
    api: SnapshotApi,
}

/// The original volume and the marker written to it.
pub struct OriginalApp {
    pvc: String,
    pod: PodRef,
    marker: String,
}

/// What the round trip created and verified.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiRestoreResult {
    /// Claim the marker was written to.
    pub original_pvc: String,
    /// Pod that wrote the marker.
    pub original_pod: String,
    /// Snapshot of the original claim.
    pub snapshot: VolumeSnapshot,
    /// Claim restored from the snapshot.
    pub cloned_pvc: String,
    /// Pod that read the marker back.
    pub cloned_pod: String,
    /// The marker that survived the round trip.
    pub marker: String,
}

/// The snapshot-restore workflow.
pub struct CsiRestore {
    toolkit: Toolkit,
    args: CsiRestoreArgs,
}

impl CsiRestore {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: CsiRestoreArgs) -> Self {
        CsiRestore { toolkit, args }
    }
}

/// Arguments for `/bin/sh` writing `marker` to the data file and then
/// idling. The marker travels as `$1` so the shell never parses it.
pub(crate) fn writer_args(marker: &str) -> Vec<String> {
    vec![
        "-c".to_owned(),
        format!(
            "printf '%s\\n' \"$1\" > {} && sync && tail -f /dev/null",
            DATA_FILE
        ),
        "sh".to_owned(),
        marker.to_owned(),
    ]
}

/// A random 16 byte marker, hex encoded.
pub fn random_marker() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl Workflow for CsiRestore {
    type Prerequisites = CsiRestorePrerequisites;
    type Provisioned = OriginalApp;
    type Output = CsiRestoreResult;

    fn name(&self) -> &'static str {
        "csi-restore"
    }

    async fn validate(&self, ctx: &Context) -> Result<CsiRestorePrerequisites> {
        let validator = self.toolkit.validator();
        validator
            .validate_namespace(ctx, &self.args.pod.namespace)
            .await
            .stage("Failed to find namespace")?;
        let storage_class = validator
            .validate_storage_class(ctx, &self.args.storage_class)
            .await
            .stage("Failed to find StorageClass")?;
        let api = validator
            .csi_snapshot_group_version(ctx)
            .await
            .stage("Failed to discover the snapshot API")?;
        let snapshot_class = validator
            .validate_volume_snapshot_class(ctx, &self.args.volume_snapshot_class, api)
            .await
            .stage("Failed to find VolumeSnapshotClass")?;
        provisioner_driver_match(&storage_class, &snapshot_class, api)?;
        Ok(CsiRestorePrerequisites { storage_class, api })
    }

    async fn provision(
        &self,
        ctx: &Context,
        pre: &CsiRestorePrerequisites,
        ledger: &mut Ledger,
    ) -> Result<OriginalApp> {
        let creator = self.toolkit.creator();
        let marker = self.args.marker.clone().unwrap_or_else(random_marker);
        let pvc = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: ORIGINAL_PVC_PREFIX.to_owned(),
                storage_class: pre.storage_class.metadata.name.clone().unwrap_or_default(),
                namespace: self.args.pod.namespace.clone(),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to create original PVC")?;

        let mut pod_args = self.args.pod.pod_args(ORIGINAL_POD_PREFIX);
        pod_args.command = command(&["/bin/sh"]);
        pod_args.args = writer_args(&marker);
        pod_args.pvc_paths.insert(pvc.clone(), VolumePath::mount(DATA_DIR));
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create original pod")?;
        wait_until_ready(&creator, ctx, &[&pvc], &pod)
            .await
            .stage("Original pod did not become ready")?;
        Ok(OriginalApp { pvc, pod, marker })
    }

    async fn act(
        &self,
        ctx: &Context,
        pre: &CsiRestorePrerequisites,
        original: &OriginalApp,
        ledger: &mut Ledger,
    ) -> Result<CsiRestoreResult> {
        let namespace = &self.args.pod.namespace;
        let operator = self.toolkit.snapshots(pre.api);
        let name = snapshot_name(Utc::now());
        let snapshot = operator
            .create(
                ctx,
                &CreateSnapshotArgs {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    pvc: original.pvc.clone(),
                    class: self.args.volume_snapshot_class.clone(),
                },
                false,
            )
            .await
            .stage("Failed to create snapshot")?;
        ledger.record(CreatedObject::Snapshot {
            api: pre.api,
            namespace: namespace.clone(),
            name: name.clone(),
        });
        let snapshot = operator
            .wait_for_ready(ctx, namespace, &snapshot.name)
            .await
            .stage("Snapshot did not become ready")?;

        if self.args.skip_cfs_check {
            info!("Skipping create-from-source check");
        } else {
            operator
                .check_create_from_source(ctx, &snapshot, &self.args.volume_snapshot_class)
                .await
                .stage("CSI driver cannot create a snapshot from source")?;
        }

        let creator = self.toolkit.creator();
        let cloned_pvc = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: CLONED_PVC_PREFIX.to_owned(),
                storage_class: pre.storage_class.metadata.name.clone().unwrap_or_default(),
                namespace: namespace.clone(),
                size: snapshot.restore_size.clone(),
                data_source: Some(snapshot_data_source(&snapshot.name)),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to restore PVC from snapshot")?;
        let mut pod_args = self.args.pod.pod_args(CLONED_POD_PREFIX);
        pod_args.command = command(crate::defaults::KEEP_ALIVE_COMMAND);
        pod_args
            .pvc_paths
            .insert(cloned_pvc.clone(), VolumePath::mount(DATA_DIR));
        let cloned_pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create cloned pod")?;
        wait_until_ready(&creator, ctx, &[&cloned_pvc], &cloned_pod)
            .await
            .stage("Cloned pod did not become ready")?;

        let read = exec_checked(
            self.toolkit.gateway().as_ref(),
            ctx,
            &cloned_pod,
            &command(&["cat", DATA_FILE]),
        )
        .await
        .stage("Failed to read restored data")?;
        let read = read.trim_end_matches('\n');
        if read != original.marker {
            return Err(Error::Action(format!(
                "Restored data ({}) does not match the written marker ({})",
                read, original.marker
            )));
        }
        info!(marker = %original.marker, "Restored data matches");

        Ok(CsiRestoreResult {
            original_pvc: original.pvc.clone(),
            original_pod: original.pod.name.clone(),
            snapshot,
            cloned_pvc,
            cloned_pod: cloned_pod.name,
            marker: original.marker.clone(),
        })
    }
}

//! Browsing the contents of a PVC or a snapshot.
//!
//! Both workflows restore a snapshot into a fresh volume and mount it in a
//! pod. By default the pod runs filebrowser and its port is forwarded to
//! the local machine; with `show_tree` an alpine pod lists every path
//! under the mount with `find` instead. `--image` replaces either image.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::Serialize;

use super::{
    command, exec_checked, provision_pod, provision_pvc, snapshot_data_source, wait_until_ready,
    CreatedObject, Ledger, PodOptions, PodRef, Workflow,
};
use crate::context::Context;
use crate::creator::{CreatePodArgs, CreatePvcArgs, VolumePath};
use crate::defaults::{ALPINE_IMAGE, FILEBROWSER_IMAGE, FILEBROWSER_PORT, KEEP_ALIVE_COMMAND};
use crate::error::{Error, Result, StageExt};
use crate::names::snapshot_name;
use crate::portforward::{self, PortForwardOptions};
use crate::snapshot::{CreateSnapshotArgs, SnapshotApi, VolumeSnapshot};
use crate::toolkit::Toolkit;
use crate::validate::provisioner_driver_match;

const PVC_DATA_DIR: &str = "/pvc-data";
const SNAPSHOT_DATA_DIR: &str = "/snapshot-data";

/// How the restored data is presented.
#[derive(Clone, Debug)]
pub struct BrowseOptions {
    /// Print the directory tree instead of serving a browser UI.
    pub show_tree: bool,
    /// Port-forward settings for the browser UI.
    pub forward: PortForwardOptions,
}

/// What a browse run produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum BrowseOutput {
    /// Output of `find` over the restored data.
    Tree {
        /// The listing.
        listing: String,
    },
    /// The browser UI was served until stopped.
    Served {
        /// Where it was served.
        url: String,
    },
}

/// A pod presenting `root`: filebrowser, or alpine when only a listing is
/// wanted. A caller supplied image takes the place of either default.
pub(crate) fn viewer_pod_args(
    options: &PodOptions,
    generate_name: &str,
    root: &str,
    show_tree: bool,
) -> CreatePodArgs {
    let mut args = options.pod_args(generate_name);
    if show_tree {
        args.container_image.get_or_insert_with(|| ALPINE_IMAGE.to_owned());
        args.command = command(KEEP_ALIVE_COMMAND);
    } else {
        args.container_image.get_or_insert_with(|| FILEBROWSER_IMAGE.to_owned());
        args.args = vec![
            "--noauth".to_owned(),
            "--root".to_owned(),
            root.to_owned(),
            "--address".to_owned(),
            "0.0.0.0".to_owned(),
            "--port".to_owned(),
            FILEBROWSER_PORT.to_string(),
        ];
    }
    args
}

/// Lists every path under `root`. busybox ships `find` but not `tree`.
pub(crate) fn listing_command(root: &str) -> Vec<String> {
    command(&["find", root])
}

pub(crate) async fn present(
    toolkit: &Toolkit,
    ctx: &Context,
    pod: &PodRef,
    root: &str,
    options: &BrowseOptions,
) -> Result<BrowseOutput> {
    if options.show_tree {
        let listing = exec_checked(toolkit.gateway().as_ref(), ctx, pod, &listing_command(root))
            .await
            .stage("Failed to list files")?;
        return Ok(BrowseOutput::Tree { listing });
    }
    let url = portforward::serve(
        toolkit.gateway(),
        ctx,
        pod,
        FILEBROWSER_PORT,
        options.forward.clone(),
    )
    .await
    .stage("Failed to port-forward the browser")?;
    Ok(BrowseOutput::Served { url })
}

fn requested_size(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

/// Inputs of PVC browsing.
#[derive(Clone, Debug)]
pub struct PvcBrowseArgs {
    /// Claim to browse.
    pub pvc: String,
    /// Snapshot class used to copy the claim.
    pub volume_snapshot_class: String,
    /// Presentation.
    pub browse: BrowseOptions,
    /// Pod settings.
    pub pod: PodOptions,
}

/// The validated claim and classes.
pub struct PvcBrowsePrerequisites {
    pvc: PersistentVolumeClaim,
    storage_class: StorageClass,
    api: SnapshotApi,
}

/// Browses a PVC through a snapshot of it.
pub struct PvcBrowse {
    toolkit: Toolkit,
    args: PvcBrowseArgs,
}

impl PvcBrowse {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: PvcBrowseArgs) -> Self {
        PvcBrowse { toolkit, args }
    }
}

#[async_trait]
impl Workflow for PvcBrowse {
    type Prerequisites = PvcBrowsePrerequisites;
    type Provisioned = PodRef;
    type Output = BrowseOutput;

    fn name(&self) -> &'static str {
        "browse-pvc"
    }

    async fn validate(&self, ctx: &Context) -> Result<PvcBrowsePrerequisites> {
        let validator = self.toolkit.validator();
        let namespace = &self.args.pod.namespace;
        validator
            .validate_namespace(ctx, namespace)
            .await
            .stage("Failed to find namespace")?;
        let pvc = validator
            .validate_pvc(ctx, namespace, &self.args.pvc)
            .await
            .stage("Failed to validate PVC")?;
        let spec = pvc.spec.clone().unwrap_or_default();
        let pv = validator
            .fetch_pv(ctx, spec.volume_name.as_deref().unwrap_or_default())
            .await
            .stage("Failed to fetch the PVC's volume")?;
        if pv.spec.and_then(|s| s.csi).is_none() {
            return Err(Error::Precondition(format!(
                "PVC ({}) is not backed by a CSI volume",
                self.args.pvc
            )));
        }
        let class_name = spec.storage_class_name.ok_or_else(|| {
            Error::Precondition(format!("PVC ({}) has no StorageClass", self.args.pvc))
        })?;
        let storage_class = validator
            .validate_storage_class(ctx, &class_name)
            .await
            .stage("Failed to find the PVC's StorageClass")?;
        let api = validator
            .csi_snapshot_group_version(ctx)
            .await
            .stage("Failed to discover the snapshot API")?;
        let snapshot_class = validator
            .validate_volume_snapshot_class(ctx, &self.args.volume_snapshot_class, api)
            .await
            .stage("Failed to find VolumeSnapshotClass")?;
        provisioner_driver_match(&storage_class, &snapshot_class, api)?;
        Ok(PvcBrowsePrerequisites {
            pvc,
            storage_class,
            api,
        })
    }

    async fn provision(
        &self,
        ctx: &Context,
        pre: &PvcBrowsePrerequisites,
        ledger: &mut Ledger,
    ) -> Result<PodRef> {
        let namespace = &self.args.pod.namespace;
        let name = snapshot_name(Utc::now());
        self.toolkit
            .snapshots(pre.api)
            .create(
                ctx,
                &CreateSnapshotArgs {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    pvc: self.args.pvc.clone(),
                    class: self.args.volume_snapshot_class.clone(),
                },
                false,
            )
            .await
            .stage("Failed to snapshot PVC")?;
        ledger.record(CreatedObject::Snapshot {
            api: pre.api,
            namespace: namespace.clone(),
            name: name.clone(),
        });
        let snapshot = self
            .toolkit
            .snapshots(pre.api)
            .wait_for_ready(ctx, namespace, &name)
            .await
            .stage("Snapshot did not become ready")?;

        let creator = self.toolkit.creator();
        let restored = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: "kubestr-browse-pvc-".to_owned(),
                storage_class: pre.storage_class.metadata.name.clone().unwrap_or_default(),
                namespace: namespace.clone(),
                size: snapshot.restore_size.or_else(|| requested_size(&pre.pvc)),
                data_source: Some(snapshot_data_source(&name)),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to restore PVC")?;
        let mut pod_args = viewer_pod_args(
            &self.args.pod,
            "kubestr-browse-pod-",
            PVC_DATA_DIR,
            self.args.browse.show_tree,
        );
        pod_args
            .pvc_paths
            .insert(restored.clone(), VolumePath::mount(PVC_DATA_DIR));
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create browse pod")?;
        wait_until_ready(&creator, ctx, &[&restored], &pod)
            .await
            .stage("Browse pod did not become ready")?;
        Ok(pod)
    }

    async fn act(
        &self,
        ctx: &Context,
        _pre: &PvcBrowsePrerequisites,
        pod: &PodRef,
        _ledger: &mut Ledger,
    ) -> Result<BrowseOutput> {
        present(&self.toolkit, ctx, pod, PVC_DATA_DIR, &self.args.browse).await
    }
}

/// Inputs of snapshot browsing.
#[derive(Clone, Debug)]
pub struct SnapshotBrowseArgs {
    /// Snapshot to browse.
    pub snapshot: String,
    /// StorageClass to restore into; the first class provisioned by the
    /// snapshot's driver when unset.
    pub storage_class: Option<String>,
    /// Presentation.
    pub browse: BrowseOptions,
    /// Pod settings.
    pub pod: PodOptions,
}

/// The validated snapshot and the class to restore it with.
pub struct SnapshotBrowsePrerequisites {
    snapshot: VolumeSnapshot,
    storage_class: StorageClass,
}

/// Browses an existing snapshot.
pub struct SnapshotBrowse {
    toolkit: Toolkit,
    args: SnapshotBrowseArgs,
}

impl SnapshotBrowse {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: SnapshotBrowseArgs) -> Self {
        SnapshotBrowse { toolkit, args }
    }
}

/// Validates a ready snapshot and finds a StorageClass of its driver.
pub(crate) async fn validate_snapshot_restore(
    toolkit: &Toolkit,
    ctx: &Context,
    namespace: &str,
    snapshot: &str,
    storage_class: Option<&str>,
) -> Result<(VolumeSnapshot, StorageClass)> {
    let validator = toolkit.validator();
    validator
        .validate_namespace(ctx, namespace)
        .await
        .stage("Failed to find namespace")?;
    let api = validator
        .csi_snapshot_group_version(ctx)
        .await
        .stage("Failed to discover the snapshot API")?;
    let snapshot = validator
        .validate_volume_snapshot(ctx, namespace, snapshot, api)
        .await
        .stage("Failed to find VolumeSnapshot")?;
    if !snapshot.ready_to_use {
        return Err(Error::Precondition(format!(
            "VolumeSnapshot ({}) is not ready to use",
            snapshot.name
        )));
    }
    let class_name = snapshot.class_name.clone().ok_or_else(|| {
        Error::Precondition(format!(
            "VolumeSnapshot ({}) does not name a VolumeSnapshotClass",
            snapshot.name
        ))
    })?;
    let snapshot_class = validator
        .validate_volume_snapshot_class(ctx, &class_name, api)
        .await
        .stage("Failed to find the snapshot's VolumeSnapshotClass")?;

    let storage_class = match storage_class {
        Some(name) => {
            let sc = validator
                .validate_storage_class(ctx, name)
                .await
                .stage("Failed to find StorageClass")?;
            provisioner_driver_match(&sc, &snapshot_class, api)?;
            sc
        }
        None => {
            let driver = api.class_driver(&snapshot_class).unwrap_or_default();
            toolkit
                .inspector()
                .storage_classes(ctx)
                .await?
                .iter()
                .find(|sc| sc.provisioner == driver)
                .cloned()
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "No StorageClass is provisioned by the snapshot's driver ({})",
                        driver
                    ))
                })?
        }
    };
    Ok((snapshot, storage_class))
}

#[async_trait]
impl Workflow for SnapshotBrowse {
    type Prerequisites = SnapshotBrowsePrerequisites;
    type Provisioned = PodRef;
    type Output = BrowseOutput;

    fn name(&self) -> &'static str {
        "browse-snapshot"
    }

    async fn validate(&self, ctx: &Context) -> Result<SnapshotBrowsePrerequisites> {
        let (snapshot, storage_class) = validate_snapshot_restore(
            &self.toolkit,
            ctx,
            &self.args.pod.namespace,
            &self.args.snapshot,
            self.args.storage_class.as_deref(),
        )
        .await?;
        Ok(SnapshotBrowsePrerequisites {
            snapshot,
            storage_class,
        })
    }

    async fn provision(
        &self,
        ctx: &Context,
        pre: &SnapshotBrowsePrerequisites,
        ledger: &mut Ledger,
    ) -> Result<PodRef> {
        let creator = self.toolkit.creator();
        let restored = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: "kubestr-browse-pvc-".to_owned(),
                storage_class: pre.storage_class.metadata.name.clone().unwrap_or_default(),
                namespace: self.args.pod.namespace.clone(),
                size: pre.snapshot.restore_size.clone(),
                data_source: Some(snapshot_data_source(&pre.snapshot.name)),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to restore PVC")?;
        let mut pod_args = viewer_pod_args(
            &self.args.pod,
            "kubestr-browse-pod-",
            SNAPSHOT_DATA_DIR,
            self.args.browse.show_tree,
        );
        pod_args
            .pvc_paths
            .insert(restored.clone(), VolumePath::mount(SNAPSHOT_DATA_DIR));
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create browse pod")?;
        wait_until_ready(&creator, ctx, &[&restored], &pod)
            .await
            .stage("Browse pod did not become ready")?;
        Ok(pod)
    }

    async fn act(
        &self,
        ctx: &Context,
        _pre: &SnapshotBrowsePrerequisites,
        pod: &PodRef,
        _ledger: &mut Ledger,
    ) -> Result<BrowseOutput> {
        present(&self.toolkit, ctx, pod, SNAPSHOT_DATA_DIR, &self.args.browse).await
    }
}

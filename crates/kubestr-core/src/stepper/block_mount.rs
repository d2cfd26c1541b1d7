//! Checks that a StorageClass can provision raw block volumes.

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::Serialize;

use super::{
    command, exec_checked, provision_pod, provision_pvc, wait_until_ready, Ledger, PodOptions,
    PodRef, Workflow,
};
use crate::context::Context;
use crate::creator::{CreatePvcArgs, VolumeMode, VolumePath};
use crate::defaults::KEEP_ALIVE_COMMAND;
use crate::error::{Result, StageExt};
use crate::toolkit::Toolkit;

const BLOCK_DEVICE_PATH: &str = "/mnt/block";

/// Inputs of the block mount check.
#[derive(Clone, Debug)]
pub struct BlockMountArgs {
    /// StorageClass under test.
    pub storage_class: String,
    /// Size of the block claim.
    pub pvc_size: Option<String>,
    /// Pod settings.
    pub pod: PodOptions,
}

/// Outcome of a block mount check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMountResult {
    /// StorageClass that was tested.
    pub storage_class: String,
    /// Where the device appeared in the pod.
    pub device_path: String,
    /// `ls -l` of the device node.
    pub listing: String,
}

/// Provisions a block mode claim and attaches it to a pod as a device.
pub struct BlockMount {
    toolkit: Toolkit,
    args: BlockMountArgs,
}

impl BlockMount {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: BlockMountArgs) -> Self {
        BlockMount { toolkit, args }
    }
}

#[async_trait]
impl Workflow for BlockMount {
    type Prerequisites = StorageClass;
    type Provisioned = PodRef;
    type Output = BlockMountResult;

    fn name(&self) -> &'static str {
        "block-mount"
    }

    async fn validate(&self, ctx: &Context) -> Result<StorageClass> {
        let validator = self.toolkit.validator();
        validator
            .validate_namespace(ctx, &self.args.pod.namespace)
            .await
            .stage("Failed to find namespace")?;
        validator
            .validate_storage_class(ctx, &self.args.storage_class)
            .await
            .stage("Failed to find StorageClass")
    }

    async fn provision(
        &self,
        ctx: &Context,
        _storage_class: &StorageClass,
        ledger: &mut Ledger,
    ) -> Result<PodRef> {
        let creator = self.toolkit.creator();
        let pvc = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: "kubestr-blockmount-pvc-".to_owned(),
                storage_class: self.args.storage_class.clone(),
                namespace: self.args.pod.namespace.clone(),
                size: self.args.pvc_size.clone(),
                volume_mode: Some(VolumeMode::Block),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to create block PVC")?;

        let mut pod_args = self.args.pod.pod_args("kubestr-blockmount-pod-");
        pod_args.command = command(KEEP_ALIVE_COMMAND);
        pod_args
            .pvc_paths
            .insert(pvc.clone(), VolumePath::device(BLOCK_DEVICE_PATH));
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create block mount pod")?;
        wait_until_ready(&creator, ctx, &[&pvc], &pod)
            .await
            .stage("Block mount pod did not become ready")?;
        Ok(pod)
    }

    async fn act(
        &self,
        ctx: &Context,
        _storage_class: &StorageClass,
        pod: &PodRef,
        _ledger: &mut Ledger,
    ) -> Result<BlockMountResult> {
        let listing = exec_checked(
            self.toolkit.gateway().as_ref(),
            ctx,
            pod,
            &command(&["ls", "-l", BLOCK_DEVICE_PATH]),
        )
        .await
        .stage("Block device is not visible in the pod")?;
        Ok(BlockMountResult {
            storage_class: self.args.storage_class.clone(),
            device_path: BLOCK_DEVICE_PATH.to_owned(),
            listing: listing.trim_end().to_owned(),
        })
    }
}

//! The validate / provision / act / cleanup protocol every workflow runs
//! through.
//!
//! A [`Workflow`] supplies the three feature specific steps. The
//! [`Stepper`] drives them in order, records every object the steps create
//! in a [`Ledger`] and removes the ledger in reverse creation order on every
//! exit path, including validation failures and expired deadlines.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use tracing::{debug, info, warn};

use crate::cleaner::Cleaner;
use crate::context::Context;
use crate::creator::{ApplicationCreator, CreatePodArgs, CreatePvcArgs};
use crate::defaults::{CLEANUP_TIMEOUT, SNAPSHOT_GROUP};
use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, ExecTarget};
use crate::snapshot::SnapshotApi;
use crate::toolkit::Toolkit;

pub mod baseline;
pub mod benchmark;
pub mod block_mount;
pub mod browse;
pub mod csi_restore;
pub mod file_restore;

/// Where a workflow run is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has happened yet.
    New,
    /// The referenced objects were found and agree.
    Validated,
    /// Transient objects are provisioned and ready.
    Running,
    /// The action completed.
    Done,
    /// Transient objects are being removed.
    Cleaning,
    /// The run is over.
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An object created during a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreatedObject {
    /// A pod.
    Pod {
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
    /// A PersistentVolumeClaim.
    Pvc {
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
    /// A VolumeSnapshot.
    Snapshot {
        /// API version it was created with.
        api: SnapshotApi,
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
    /// A ConfigMap holding an FIO job.
    FioConfigMap {
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
    },
}

impl CreatedObject {
    /// A `kubectl` command removing the object by hand.
    pub fn delete_command(&self) -> String {
        match self {
            CreatedObject::Pod { namespace, name } => {
                format!("kubectl delete pod -n {} {}", namespace, name)
            }
            CreatedObject::Pvc { namespace, name } => {
                format!("kubectl delete pvc -n {} {}", namespace, name)
            }
            CreatedObject::Snapshot {
                namespace, name, ..
            } => format!("kubectl delete volumesnapshot -n {} {}", namespace, name),
            CreatedObject::FioConfigMap { namespace, name } => {
                format!("kubectl delete configmap -n {} {}", namespace, name)
            }
        }
    }
}

impl fmt::Display for CreatedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatedObject::Pod { namespace, name } => write!(f, "Pod {}/{}", namespace, name),
            CreatedObject::Pvc { namespace, name } => {
                write!(f, "PersistentVolumeClaim {}/{}", namespace, name)
            }
            CreatedObject::Snapshot {
                namespace, name, ..
            } => write!(f, "VolumeSnapshot {}/{}", namespace, name),
            CreatedObject::FioConfigMap { namespace, name } => {
                write!(f, "ConfigMap {}/{}", namespace, name)
            }
        }
    }
}

/// Objects created by a run, in creation order.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    objects: Vec<CreatedObject>,
}

impl Ledger {
    /// Records a freshly created object.
    pub fn record(&mut self, object: CreatedObject) {
        debug!(%object, "Recorded created object");
        self.objects.push(object);
    }

    /// Objects in creation order.
    pub fn objects(&self) -> &[CreatedObject] {
        &self.objects
    }

    /// True when nothing was created.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// One feature built on the stepper protocol.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Objects looked up during validation.
    type Prerequisites: Send + Sync;
    /// Handles on the provisioned objects.
    type Provisioned: Send + Sync;
    /// What the action produces.
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Looks up and cross-checks the objects the workflow needs.
    async fn validate(&self, ctx: &Context) -> Result<Self::Prerequisites>;

    /// Creates the transient objects and waits for them, recording each in
    /// `ledger` as soon as it exists.
    async fn provision(
        &self,
        ctx: &Context,
        prerequisites: &Self::Prerequisites,
        ledger: &mut Ledger,
    ) -> Result<Self::Provisioned>;

    /// Runs the feature specific action.
    async fn act(
        &self,
        ctx: &Context,
        prerequisites: &Self::Prerequisites,
        provisioned: &Self::Provisioned,
        ledger: &mut Ledger,
    ) -> Result<Self::Output>;
}

/// Drives workflows through validate, provision, act and cleanup.
pub struct Stepper {
    cleaner: Cleaner,
    cleanup: bool,
}

impl Stepper {
    /// A stepper removing created objects when `cleanup` is set.
    pub fn new(toolkit: &Toolkit, cleanup: bool) -> Self {
        Stepper {
            cleaner: toolkit.cleaner(),
            cleanup,
        }
    }

    /// Runs `workflow` to completion. Cleanup always runs before this
    /// returns; its failures are logged and never replace the workflow's
    /// own result.
    pub async fn run<W: Workflow>(&self, ctx: &Context, workflow: &W) -> Result<W::Output> {
        let mut ledger = Ledger::default();
        let mut phase = Phase::New;
        let res = self.steps(ctx, workflow, &mut ledger, &mut phase).await;
        if let Err(e) = &res {
            warn!(workflow = workflow.name(), %phase, error = %e, "Workflow failed");
        }
        transition(workflow.name(), &mut phase, Phase::Cleaning);
        let leftovers = self.cleanup(&ledger).await;
        if !leftovers.is_empty() {
            warn!(
                workflow = workflow.name(),
                "Some objects could not be removed; delete them manually:\n  {}",
                leftovers.join("\n  ")
            );
        }
        transition(workflow.name(), &mut phase, Phase::Terminated);
        res
    }

    async fn steps<W: Workflow>(
        &self,
        ctx: &Context,
        workflow: &W,
        ledger: &mut Ledger,
        phase: &mut Phase,
    ) -> Result<W::Output> {
        let prerequisites = workflow.validate(ctx).await?;
        transition(workflow.name(), phase, Phase::Validated);
        let provisioned = workflow.provision(ctx, &prerequisites, ledger).await?;
        transition(workflow.name(), phase, Phase::Running);
        let output = workflow.act(ctx, &prerequisites, &provisioned, ledger).await?;
        transition(workflow.name(), phase, Phase::Done);
        Ok(output)
    }

    /// Removes the ledger in reverse creation order and returns the manual
    /// delete commands for anything that could not be removed. With cleanup
    /// disabled nothing is removed and every object is returned.
    pub async fn cleanup(&self, ledger: &Ledger) -> Vec<String> {
        if !self.cleanup {
            if !ledger.is_empty() {
                info!(
                    "Cleanup skipped; created objects:\n  {}",
                    ledger
                        .objects()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n  ")
                );
            }
            return Vec::new();
        }
        let mut leftovers = Vec::new();
        for object in ledger.objects().iter().rev() {
            // Each removal gets its own deadline so an expired request
            // context does not leak objects.
            let ctx = Context::with_timeout(CLEANUP_TIMEOUT);
            let res = match object {
                CreatedObject::Pod { namespace, name } => {
                    self.cleaner.delete_pod(&ctx, namespace, name).await
                }
                CreatedObject::Pvc { namespace, name } => {
                    self.cleaner.delete_pvc(&ctx, namespace, name).await
                }
                CreatedObject::Snapshot {
                    api,
                    namespace,
                    name,
                } => self.cleaner.delete_snapshot(&ctx, *api, namespace, name).await,
                CreatedObject::FioConfigMap { namespace, name } => {
                    self.cleaner.delete_fio_config_map(&ctx, namespace, name).await
                }
            };
            if let Err(e) = res {
                warn!(%object, error = %e, "Failed to clean up");
                leftovers.push(object.delete_command());
            }
        }
        leftovers
    }
}

fn transition(workflow: &str, phase: &mut Phase, next: Phase) {
    debug!(workflow, from = %phase, to = %next, "Workflow phase change");
    *phase = next;
}

/// Pod settings shared by every provisioning workflow.
#[derive(Clone, Debug, Default)]
pub struct PodOptions {
    /// Namespace for the transient objects.
    pub namespace: String,
    /// User (and fsGroup) the pods run as.
    pub run_as_user: Option<i64>,
    /// Image replacing the default tool image.
    pub container_image: Option<String>,
    /// Extra node selector terms for the pods.
    pub node_selector: BTreeMap<String, String>,
}

impl PodOptions {
    /// Options for the namespace `namespace` and nothing else.
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        PodOptions {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub(crate) fn pod_args(&self, generate_name: &str) -> CreatePodArgs {
        CreatePodArgs {
            generate_name: Some(generate_name.to_owned()),
            namespace: self.namespace.clone(),
            run_as_user: self.run_as_user,
            container_image: self.container_image.clone(),
            node_selector: self.node_selector.clone(),
            ..Default::default()
        }
    }
}

/// A provisioned pod and the container commands run in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    /// Namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// The pod's only container.
    pub container: String,
}

/// Data source restoring a volume from a snapshot.
pub(crate) fn snapshot_data_source(snapshot: &str) -> TypedLocalObjectReference {
    TypedLocalObjectReference {
        api_group: Some(SNAPSHOT_GROUP.to_owned()),
        kind: "VolumeSnapshot".to_owned(),
        name: snapshot.to_owned(),
    }
}

/// Creates a PVC and records it. Binding is not awaited here because
/// `WaitForFirstConsumer` classes only bind once a pod uses the claim; see
/// [`wait_until_ready`].
pub(crate) async fn provision_pvc(
    creator: &ApplicationCreator,
    ctx: &Context,
    args: &CreatePvcArgs,
    ledger: &mut Ledger,
) -> Result<String> {
    let pvc = creator.create_pvc(ctx, args).await?;
    let name = pvc.metadata.name.unwrap_or_default();
    ledger.record(CreatedObject::Pvc {
        namespace: args.namespace.clone(),
        name: name.clone(),
    });
    Ok(name)
}

/// Creates a pod and records it without waiting for it to run.
pub(crate) async fn provision_pod(
    creator: &ApplicationCreator,
    ctx: &Context,
    args: &CreatePodArgs,
    ledger: &mut Ledger,
) -> Result<PodRef> {
    let pod = creator.create_pod(ctx, args).await?;
    let name = pod.metadata.name.clone().unwrap_or_default();
    ledger.record(CreatedObject::Pod {
        namespace: args.namespace.clone(),
        name: name.clone(),
    });
    let container = pod
        .spec
        .and_then(|s| s.containers.into_iter().next())
        .map(|c| c.name)
        .unwrap_or_default();
    Ok(PodRef {
        namespace: args.namespace.clone(),
        name,
        container,
    })
}

/// Waits for a set of provisioned PVCs and then the pod using them.
pub(crate) async fn wait_until_ready(
    creator: &ApplicationCreator,
    ctx: &Context,
    pvcs: &[&str],
    pod: &PodRef,
) -> Result<()> {
    for pvc in pvcs {
        creator.wait_for_pvc_ready(ctx, &pod.namespace, pvc).await?;
    }
    creator.wait_for_pod_ready(ctx, &pod.namespace, &pod.name).await
}

/// Runs `command` in the pod. Output on stderr counts as failure even when
/// the command exits cleanly.
pub(crate) async fn exec_checked(
    gateway: &dyn ClusterGateway,
    ctx: &Context,
    pod: &PodRef,
    command: &[String],
) -> Result<String> {
    debug!(pod = %pod.name, ?command, "Executing command");
    let output = gateway
        .exec(
            ctx,
            ExecTarget {
                namespace: &pod.namespace,
                pod: &pod.name,
                container: &pod.container,
            },
            command,
        )
        .await?;
    if !output.stderr.trim().is_empty() {
        return Err(Error::Action(format!(
            "{} wrote to stderr: {}",
            command.first().map(String::as_str).unwrap_or("command"),
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Turns string literals into an owned command line.
pub(crate) fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

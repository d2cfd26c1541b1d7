//! Builds, creates and waits for the transient PVCs and Pods the workflows
//! run on.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, Pod, PodSecurityContext, Toleration, TypedLocalObjectReference,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::Context;
use crate::defaults::{DEFAULT_POD_IMAGE, DEFAULT_PVC_SIZE, POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::names::{created_by_labels, shorten};
use crate::toolkit::RuntimeEnv;

/// How a PVC is exposed to the pod's filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeMode {
    /// Mounted as a directory.
    Filesystem,
    /// Exposed as a raw block device.
    Block,
}

impl VolumeMode {
    fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

/// Parameters of a transient PVC.
#[derive(Clone, Debug, Default)]
pub struct CreatePvcArgs {
    /// Name prefix; the API server appends a random suffix.
    pub generate_name: String,
    /// StorageClass to provision from.
    pub storage_class: String,
    /// Namespace to create the claim in.
    pub namespace: String,
    /// Requested size. Defaults to 1Gi; restores pass the snapshot's
    /// restore size.
    pub size: Option<String>,
    /// Snapshot (or other object) to populate the volume from.
    pub data_source: Option<TypedLocalObjectReference>,
    /// Block or filesystem; the cluster default applies when unset.
    pub volume_mode: Option<VolumeMode>,
}

/// Where a PVC appears inside the pod. Exactly one path must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumePath {
    /// Directory to mount a filesystem volume at.
    pub mount_path: Option<String>,
    /// Device path of a block volume.
    pub device_path: Option<String>,
}

impl VolumePath {
    /// Mounts the volume at `path`.
    pub fn mount(path: impl Into<String>) -> Self {
        VolumePath {
            mount_path: Some(path.into()),
            device_path: None,
        }
    }

    /// Exposes the volume as a block device at `path`.
    pub fn device(path: impl Into<String>) -> Self {
        VolumePath {
            mount_path: None,
            device_path: Some(path.into()),
        }
    }
}

/// Parameters of a transient pod.
#[derive(Clone, Debug, Default)]
pub struct CreatePodArgs {
    /// Fixed pod name. Exclusive with `generate_name`.
    pub name: Option<String>,
    /// Name prefix. Exclusive with `name`.
    pub generate_name: Option<String>,
    /// Namespace to create the pod in.
    pub namespace: String,
    /// User the container runs as; also used as fsGroup.
    pub run_as_user: Option<i64>,
    /// Container image; inherited or the default tool image when unset.
    pub container_image: Option<String>,
    /// Container entrypoint.
    pub command: Vec<String>,
    /// Container arguments.
    pub args: Vec<String>,
    /// PVCs to attach, by claim name.
    pub pvc_paths: BTreeMap<String, VolumePath>,
    /// ConfigMaps to mount, by name, at the given directory.
    pub config_maps: BTreeMap<String, String>,
    /// Extra node selector terms.
    pub node_selector: BTreeMap<String, String>,
}

/// Scheduling fields copied from the pod the tool itself runs in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InheritedSpec {
    /// Node selector of the caller pod.
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations of the caller pod.
    pub tolerations: Vec<Toleration>,
    /// Pod security context of the caller pod.
    pub security_context: Option<PodSecurityContext>,
    /// Image of the caller pod's only container.
    pub image: Option<String>,
}

impl InheritedSpec {
    /// Projects the inherited fields out of the caller pod.
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let spec = pod.spec.clone().unwrap_or_default();
        if spec.containers.len() != 1 {
            return Err(Error::Precondition(format!(
                "Pod ({}) runs {} containers; inheriting needs exactly one",
                pod.metadata.name.as_deref().unwrap_or_default(),
                spec.containers.len()
            )));
        }
        Ok(InheritedSpec {
            node_selector: spec.node_selector.unwrap_or_default(),
            tolerations: spec.tolerations.unwrap_or_default(),
            security_context: spec.security_context,
            image: spec.containers[0].image.clone(),
        })
    }

    /// Applies the inherited fields to `pod`. The pod's own image stays when
    /// `keep_image` is set and its own node selector terms win.
    pub fn apply(&self, pod: &mut Pod, keep_image: bool) {
        let spec = match pod.spec.as_mut() {
            Some(spec) => spec,
            None => return,
        };
        if !self.node_selector.is_empty() {
            let mut selector = self.node_selector.clone();
            selector.extend(spec.node_selector.take().unwrap_or_default());
            spec.node_selector = Some(selector);
        }
        if !self.tolerations.is_empty() {
            spec.tolerations = Some(self.tolerations.clone());
        }
        if let Some(ctx) = &self.security_context {
            let mut merged = ctx.clone();
            if let Some(own) = spec.security_context.take() {
                merged.run_as_user = own.run_as_user.or(merged.run_as_user);
                merged.fs_group = own.fs_group.or(merged.fs_group);
            }
            spec.security_context = Some(merged);
        }
        if !keep_image {
            if let (Some(image), Some(container)) = (&self.image, spec.containers.first_mut()) {
                container.image = Some(image.clone());
            }
        }
    }
}

/// Creates transient PVCs and pods and waits for them.
#[derive(Clone)]
pub struct ApplicationCreator {
    gateway: Arc<dyn ClusterGateway>,
    env: RuntimeEnv,
}

impl ApplicationCreator {
    /// Creates objects through `gateway`; `env` locates the caller pod.
    pub fn new(gateway: Arc<dyn ClusterGateway>, env: RuntimeEnv) -> Self {
        ApplicationCreator { gateway, env }
    }

    /// Creates a labelled ReadWriteOnce claim.
    pub async fn create_pvc(
        &self,
        ctx: &Context,
        args: &CreatePvcArgs,
    ) -> Result<PersistentVolumeClaim> {
        let pvc = build_pvc(args)?;
        let created = self.gateway.create_pvc(ctx, &args.namespace, &pvc).await?;
        info!(
            pvc = %created.metadata.name.as_deref().unwrap_or_default(),
            namespace = %args.namespace,
            storage_class = %args.storage_class,
            "Created PVC"
        );
        Ok(created)
    }

    /// Creates a labelled single-container pod.
    pub async fn create_pod(&self, ctx: &Context, args: &CreatePodArgs) -> Result<Pod> {
        let mut pod = build_pod(args)?;
        if let Some(inherited) = self.inherited_spec(ctx).await? {
            debug!(?inherited, "Inheriting scheduling fields from caller pod");
            inherited.apply(&mut pod, args.container_image.is_some());
        }
        let created = self.gateway.create_pod(ctx, &args.namespace, &pod).await?;
        info!(
            pod = %created.metadata.name.as_deref().unwrap_or_default(),
            namespace = %args.namespace,
            "Created Pod"
        );
        Ok(created)
    }

    /// Looks up the pod the tool runs in, if any.
    pub async fn inherited_spec(&self, ctx: &Context) -> Result<Option<InheritedSpec>> {
        let name = match &self.env.pod_name {
            Some(name) => name,
            None => return Ok(None),
        };
        match self.gateway.get_pod(ctx, &self.env.namespace, name).await {
            Ok(pod) => InheritedSpec::from_pod(&pod).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Polls until the pod runs. A failed pod ends the wait early.
    pub async fn wait_for_pod_ready(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let polled = ctx
            .run(async {
                loop {
                    let pod = self.gateway.get_pod(ctx, namespace, name).await?;
                    let status = pod.status.unwrap_or_default();
                    match status.phase.as_deref() {
                        Some("Running") => return Ok(()),
                        Some("Failed") => {
                            return Err(Error::ProvisionTimeout(format!(
                                "Pod ({}) failed: {}",
                                name,
                                status.message.unwrap_or_default()
                            )))
                        }
                        phase => debug!(pod = %name, ?phase, "Waiting for Pod to run"),
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await;
        match polled {
            Err(Error::DeadlineExceeded) => Err(Error::ProvisionTimeout(
                self.with_warnings(format!("Pod ({}) did not become ready", name), namespace)
                    .await,
            )),
            other => other,
        }
    }

    /// Polls until the claim is bound. A lost claim ends the wait early.
    pub async fn wait_for_pvc_ready(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let polled = ctx
            .run(async {
                loop {
                    let pvc = self.gateway.get_pvc(ctx, namespace, name).await?;
                    match pvc.status.and_then(|s| s.phase).as_deref() {
                        Some("Bound") => return Ok(()),
                        Some("Lost") => {
                            return Err(Error::Precondition(format!("PVC ({}): ClaimLost", name)))
                        }
                        phase => debug!(pvc = %name, ?phase, "Waiting for PVC to bind"),
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await;
        match polled {
            Err(Error::DeadlineExceeded) => Err(Error::ProvisionTimeout(
                self.with_warnings(format!("PVC ({}) did not bind", name), namespace)
                    .await,
            )),
            other => other,
        }
    }

    // Appends the namespace's Warning events to a timeout message. The
    // request deadline is already spent, so the lookup gets its own.
    async fn with_warnings(&self, message: String, namespace: &str) -> String {
        let ctx = Context::with_timeout(std::time::Duration::from_secs(10));
        let events = match self.gateway.list_events(&ctx, namespace).await {
            Ok(events) => events,
            Err(_) => return message,
        };
        let warnings: Vec<String> = events
            .into_iter()
            .filter(|e| e.type_.as_deref() == Some("Warning"))
            .map(|e| {
                format!(
                    "{}: {}: {}",
                    e.involved_object.name.unwrap_or_default(),
                    e.reason.unwrap_or_default(),
                    e.message.unwrap_or_default()
                )
            })
            .collect();
        if warnings.is_empty() {
            message
        } else {
            format!("{}; warning events: [{}]", message, warnings.join("; "))
        }
    }
}

fn build_pvc(args: &CreatePvcArgs) -> Result<PersistentVolumeClaim> {
    if args.generate_name.is_empty() {
        return Err(Error::InvalidArgument("PVC generateName is required".into()));
    }
    if args.storage_class.is_empty() {
        return Err(Error::InvalidArgument("PVC storage class is required".into()));
    }
    if args.namespace.is_empty() {
        return Err(Error::InvalidArgument("PVC namespace is required".into()));
    }
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "storageClassName": args.storage_class,
        "resources": {
            "requests": { "storage": args.size.as_deref().unwrap_or(DEFAULT_PVC_SIZE) }
        },
    });
    if let Some(source) = &args.data_source {
        spec["dataSource"] = serde_json::to_value(source)?;
    }
    if let Some(mode) = args.volume_mode {
        spec["volumeMode"] = json!(mode.as_str());
    }
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "generateName": shorten(&args.generate_name),
            "namespace": args.namespace,
            "labels": created_by_labels(),
        },
        "spec": spec,
    }))?)
}

fn build_pod(args: &CreatePodArgs) -> Result<Pod> {
    let container_name = match (&args.name, &args.generate_name) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidArgument(
                "Pod name and generateName are mutually exclusive".into(),
            ))
        }
        (None, None) => {
            return Err(Error::InvalidArgument(
                "Pod name or generateName is required".into(),
            ))
        }
        (Some(name), None) => name.clone(),
        (None, Some(prefix)) => prefix.trim_end_matches('-').to_owned(),
    };
    if args.namespace.is_empty() {
        return Err(Error::InvalidArgument("Pod namespace is required".into()));
    }

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();
    for (index, (claim, path)) in args.pvc_paths.iter().enumerate() {
        let volume = format!("persistent-storage-{}", index);
        match (&path.mount_path, &path.device_path) {
            (Some(mount), None) => mounts.push(json!({ "name": volume, "mountPath": mount })),
            (None, Some(device)) => devices.push(json!({ "name": volume, "devicePath": device })),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "PVC ({}) needs exactly one of mount path or device path",
                    claim
                )))
            }
        }
        volumes.push(json!({ "name": volume, "persistentVolumeClaim": { "claimName": claim } }));
    }
    for (index, (config_map, path)) in args.config_maps.iter().enumerate() {
        let volume = format!("config-{}", index);
        mounts.push(json!({ "name": volume, "mountPath": path }));
        volumes.push(json!({ "name": volume, "configMap": { "name": config_map } }));
    }

    let mut container = json!({
        "name": container_name,
        "image": args.container_image.as_deref().unwrap_or(DEFAULT_POD_IMAGE),
        "imagePullPolicy": "IfNotPresent",
    });
    if !args.command.is_empty() {
        container["command"] = json!(args.command);
    }
    if !args.args.is_empty() {
        container["args"] = json!(args.args);
    }
    if !mounts.is_empty() {
        container["volumeMounts"] = Value::Array(mounts);
    }
    if !devices.is_empty() {
        container["volumeDevices"] = Value::Array(devices);
    }

    let mut spec = json!({
        "containers": [container],
        "volumes": volumes,
    });
    if let Some(uid) = args.run_as_user.filter(|uid| *uid > 0) {
        spec["securityContext"] = json!({ "runAsUser": uid, "fsGroup": uid });
    }
    if !args.node_selector.is_empty() {
        spec["nodeSelector"] = json!(args.node_selector);
    }

    let mut metadata = json!({
        "namespace": args.namespace,
        "labels": created_by_labels(),
    });
    match (&args.name, &args.generate_name) {
        (Some(name), _) => metadata["name"] = json!(shorten(name)),
        (_, Some(prefix)) => metadata["generateName"] = json!(shorten(prefix)),
        _ => {}
    }
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
        "spec": spec,
    }))?)
}

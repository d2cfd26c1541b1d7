//! In-memory cluster used by the unit tests.
//!
//! Objects are kept in maps keyed by namespace and name. Created pods and
//! claims settle immediately into the configured phases, snapshots become
//! ready with a bound content object, and the contents written by a
//! `sh -c '... "$1" > <file> ...' sh <text>` pod command travel with the
//! volume through snapshots and restores so data round-trips can be checked.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimStatus, Pod, PodStatus,
};
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::json;

use super::{
    ApiGroupInfo, ClusterGateway, ExecOutput, ExecTarget, GroupVersionResource,
    PortForwardRequest, ServerVersion,
};
use crate::context::Context;
use crate::defaults::{CREATED_BY_LABEL_KEY, SNAPSHOT_GROUP};
use crate::error::{Error, Result};

type Key = (String, String);

/// An exec call observed by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

pub(crate) type ExecHandler = Arc<dyn Fn(&ExecCall) -> Option<Result<ExecOutput>> + Send + Sync>;

pub(crate) struct FakeState {
    pub namespaces: BTreeSet<String>,
    pub storage_classes: BTreeMap<String, StorageClass>,
    pub csi_drivers: BTreeSet<String>,
    pub persistent_volumes: BTreeMap<String, PersistentVolume>,
    pub pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pub pods: BTreeMap<Key, Pod>,
    pub config_maps: BTreeMap<Key, ConfigMap>,
    pub events: BTreeMap<String, Vec<Event>>,
    /// Keyed by (resource, namespace or "", name).
    pub dynamic: BTreeMap<(String, String, String), DynamicObject>,
    pub groups: Vec<ApiGroupInfo>,
    pub version: ServerVersion,
    pub pod_phase: String,
    pub pvc_phase: String,
    pub snapshots_ready: bool,
    pub drop_data_source: bool,
    pub fail_creates: BTreeSet<String>,
    pub exec_calls: Vec<ExecCall>,
    pub exec_handler: Option<ExecHandler>,
    /// Execs never finish on their own; only the deadline or cancellation
    /// ends them.
    pub exec_hangs: bool,
    pub port_forwards: Vec<(String, u16, u16)>,
    pub fail_port_forward: bool,
    /// Every create / delete in call order, e.g. `create Pod ns/name`.
    pub operations: Vec<String>,
    /// File contents per volume, keyed by (namespace, claim).
    pub volume_data: BTreeMap<Key, BTreeMap<String, String>>,
    /// File contents captured by snapshots, keyed by (namespace, snapshot).
    pub snapshot_data: BTreeMap<Key, BTreeMap<String, String>>,
    counter: u64,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            namespaces: BTreeSet::new(),
            storage_classes: BTreeMap::new(),
            csi_drivers: BTreeSet::new(),
            persistent_volumes: BTreeMap::new(),
            pvcs: BTreeMap::new(),
            pods: BTreeMap::new(),
            config_maps: BTreeMap::new(),
            events: BTreeMap::new(),
            dynamic: BTreeMap::new(),
            groups: vec![ApiGroupInfo {
                name: String::new(),
                versions: vec!["v1".to_owned()],
                preferred_version: None,
            }],
            version: ServerVersion {
                major: "1".to_owned(),
                minor: "20".to_owned(),
                git_version: "v1.20.2".to_owned(),
            },
            pod_phase: "Running".to_owned(),
            pvc_phase: "Bound".to_owned(),
            snapshots_ready: true,
            drop_data_source: false,
            fail_creates: BTreeSet::new(),
            exec_calls: Vec::new(),
            exec_handler: None,
            exec_hangs: false,
            port_forwards: Vec::new(),
            fail_port_forward: false,
            operations: Vec::new(),
            volume_data: BTreeMap::new(),
            snapshot_data: BTreeMap::new(),
            counter: 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    state: Mutex<FakeState>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        ..Default::default()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        let fake = FakeGateway::default();
        fake.with_namespace("default");
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake cluster lock poisoned")
    }

    pub fn with_namespace(&self, name: &str) -> &Self {
        self.state().namespaces.insert(name.to_owned());
        self
    }

    pub fn with_version(&self, major: &str, minor: &str) -> &Self {
        let mut state = self.state();
        state.version = ServerVersion {
            major: major.to_owned(),
            minor: minor.to_owned(),
            git_version: format!("v{}.{}.0", major, minor.trim_end_matches('+')),
        };
        self
    }

    pub fn with_group(&self, name: &str, versions: &[&str], preferred: Option<&str>) -> &Self {
        self.state().groups.push(ApiGroupInfo {
            name: name.to_owned(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            preferred_version: preferred.map(str::to_owned),
        });
        self
    }

    pub fn with_snapshot_api(&self, version: &str) -> &Self {
        self.with_group(SNAPSHOT_GROUP, &[version], Some(version))
    }

    pub fn with_storage_class(&self, name: &str, provisioner: &str) -> &Self {
        let sc = StorageClass {
            metadata: meta(name),
            provisioner: provisioner.to_owned(),
            ..Default::default()
        };
        self.state().storage_classes.insert(name.to_owned(), sc);
        self
    }

    pub fn with_csi_driver(&self, name: &str) -> &Self {
        self.state().csi_drivers.insert(name.to_owned());
        self
    }

    pub fn with_volume_snapshot_class(&self, version: &str, name: &str, driver: &str) -> &Self {
        let driver_key = if version == "v1alpha1" {
            "snapshotter"
        } else {
            "driver"
        };
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": format!("{}/{}", SNAPSHOT_GROUP, version),
            "kind": "VolumeSnapshotClass",
            "metadata": { "name": name },
            driver_key: driver,
            "deletionPolicy": "Delete",
        }))
        .expect("valid snapshot class");
        self.state().dynamic.insert(
            ("volumesnapshotclasses".to_owned(), String::new(), name.to_owned()),
            object,
        );
        self
    }

    pub fn with_persistent_volume(&self, name: &str, csi_driver: Option<&str>) -> &Self {
        let pv: PersistentVolume = match csi_driver {
            Some(driver) => serde_json::from_value(json!({
                "metadata": { "name": name },
                "spec": { "csi": { "driver": driver, "volumeHandle": format!("vol-{}", name) } },
            })),
            None => serde_json::from_value(json!({
                "metadata": { "name": name },
                "spec": { "hostPath": { "path": "/tmp/data" } },
            })),
        }
        .expect("valid persistent volume");
        self.state().persistent_volumes.insert(name.to_owned(), pv);
        self
    }

    pub fn with_pvc(
        &self,
        namespace: &str,
        name: &str,
        storage_class: &str,
        volume_name: Option<&str>,
    ) -> &Self {
        let pvc: PersistentVolumeClaim = serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "storageClassName": storage_class,
                "volumeName": volume_name,
                "accessModes": ["ReadWriteOnce"],
            },
            "status": { "phase": if volume_name.is_some() { "Bound" } else { "Pending" } },
        }))
        .expect("valid claim");
        self.state().pvcs.insert(key(namespace, name), pvc);
        self
    }

    pub fn with_pod(&self, pod: Pod) -> &Self {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state().pods.insert(key(&namespace, &name), pod);
        self
    }

    pub fn with_config_map(&self, config_map: ConfigMap) -> &Self {
        let namespace = config_map.metadata.namespace.clone().unwrap_or_default();
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.state()
            .config_maps
            .insert(key(&namespace, &name), config_map);
        self
    }

    pub fn with_warning_event(&self, namespace: &str, object: &str, message: &str) -> &Self {
        let event: Event = serde_json::from_value(json!({
            "metadata": { "name": format!("{}.event", object), "namespace": namespace },
            "involvedObject": { "name": object },
            "type": "Warning",
            "reason": "ProvisioningFailed",
            "message": message,
        }))
        .expect("valid event");
        self.state()
            .events
            .entry(namespace.to_owned())
            .or_default()
            .push(event);
        self
    }

    pub fn with_snapshot(
        &self,
        version: &str,
        namespace: &str,
        name: &str,
        class: &str,
        pvc: &str,
    ) -> &Self {
        let object = snapshot_object(version, namespace, name, class, pvc);
        let mut state = self.state();
        let gvr =
            GroupVersionResource::new(SNAPSHOT_GROUP, version, "volumesnapshots", "VolumeSnapshot");
        let settled = state.settle_snapshot(&gvr, Some(namespace), object);
        state.dynamic.insert(
            ("volumesnapshots".to_owned(), namespace.to_owned(), name.to_owned()),
            settled,
        );
        self
    }

    pub fn with_exec_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&ExecCall) -> Option<Result<ExecOutput>> + Send + Sync + 'static,
    {
        self.state().exec_handler = Some(Arc::new(handler));
        self
    }

    pub fn fail_creates_of(&self, kind: &str) -> &Self {
        self.state().fail_creates.insert(kind.to_owned());
        self
    }

    /// Names of every object still carrying the created-by label.
    pub fn labelled_objects(&self) -> Vec<String> {
        let state = self.state();
        let labelled = |m: &ObjectMeta| {
            m.labels
                .as_ref()
                .map(|l| l.contains_key(CREATED_BY_LABEL_KEY))
                .unwrap_or(false)
        };
        let mut names = Vec::new();
        names.extend(
            state
                .pods
                .values()
                .filter(|p| labelled(&p.metadata))
                .map(|p| format!("Pod/{}", p.metadata.name.clone().unwrap_or_default())),
        );
        names.extend(
            state
                .pvcs
                .values()
                .filter(|p| labelled(&p.metadata))
                .map(|p| {
                    let name = p.metadata.name.clone().unwrap_or_default();
                    format!("PersistentVolumeClaim/{}", name)
                }),
        );
        names.extend(
            state
                .config_maps
                .values()
                .filter(|c| labelled(&c.metadata))
                .map(|c| format!("ConfigMap/{}", c.metadata.name.clone().unwrap_or_default())),
        );
        names.extend(
            state
                .dynamic
                .iter()
                .filter(|((_, _, name), _)| name.starts_with("kubestr-"))
                .map(|((resource, _, name), _)| format!("{}/{}", resource, name)),
        );
        names
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state().exec_calls.clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn dynamic_object(
        &self,
        resource: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.state()
            .dynamic
            .get(&(
                resource.to_owned(),
                namespace.unwrap_or("").to_owned(),
                name.to_owned(),
            ))
            .cloned()
    }
}

pub(crate) fn snapshot_object(
    version: &str,
    namespace: &str,
    name: &str,
    class: &str,
    pvc: &str,
) -> DynamicObject {
    let spec = if version == "v1alpha1" {
        json!({
            "snapshotClassName": class,
            "source": { "kind": "PersistentVolumeClaim", "name": pvc },
        })
    } else {
        json!({
            "volumeSnapshotClassName": class,
            "source": { "persistentVolumeClaimName": pvc },
        })
    };
    serde_json::from_value(json!({
        "apiVersion": format!("{}/{}", SNAPSHOT_GROUP, version),
        "kind": "VolumeSnapshot",
        "metadata": { "name": name, "namespace": namespace },
        "spec": spec,
    }))
    .expect("valid snapshot")
}

impl FakeState {
    fn next_name(&mut self, meta: &ObjectMeta) -> Result<String> {
        if let Some(name) = &meta.name {
            return Ok(name.clone());
        }
        match &meta.generate_name {
            Some(prefix) => {
                self.counter += 1;
                Ok(format!("{}{:05}", prefix, self.counter))
            }
            None => Err(Error::InvalidArgument("name or generateName is required".into())),
        }
    }

    fn check_create(&self, kind: &str) -> Result<()> {
        if self.fail_creates.contains(kind) {
            return Err(Error::Action(format!("admission webhook denied {}", kind)));
        }
        Ok(())
    }

    fn driver_of_class(&self, class: &str) -> String {
        self.dynamic
            .get(&("volumesnapshotclasses".to_owned(), String::new(), class.to_owned()))
            .and_then(|c| {
                c.data
                    .get("driver")
                    .or_else(|| c.data.get("snapshotter"))
                    .and_then(|d| d.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_default()
    }

    // Marks a new snapshot ready and binds it to a content object, creating
    // the content unless the snapshot was created from an existing one.
    fn settle_snapshot(
        &mut self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        mut object: DynamicObject,
    ) -> DynamicObject {
        let namespace = namespace.unwrap_or("default").to_owned();
        let name = object.metadata.name.clone().unwrap_or_default();
        let alpha = gvr.version == "v1alpha1";
        let spec = object.data.get("spec").cloned().unwrap_or_else(|| json!({}));
        let class = spec
            .get(if alpha { "snapshotClassName" } else { "volumeSnapshotClassName" })
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_owned();
        let source_pvc = if alpha {
            spec.pointer("/source/name")
        } else {
            spec.pointer("/source/persistentVolumeClaimName")
        }
        .and_then(|p| p.as_str())
        .map(str::to_owned);
        let existing_content = if alpha {
            spec.get("snapshotContentName")
        } else {
            spec.pointer("/source/volumeSnapshotContentName")
        }
        .and_then(|c| c.as_str())
        .map(str::to_owned);

        let content_name = existing_content
            .clone()
            .unwrap_or_else(|| format!("snapcontent-{}", name));
        if existing_content.is_none() {
            let driver = self.driver_of_class(&class);
            let handle = format!("snap-handle-{}", name);
            let content = if alpha {
                json!({
                    "apiVersion": gvr.api_version(),
                    "kind": "VolumeSnapshotContent",
                    "metadata": { "name": content_name },
                    "spec": {
                        "csiVolumeSnapshotSource": { "driver": driver, "snapshotHandle": handle },
                        "snapshotClassName": class,
                    },
                })
            } else {
                json!({
                    "apiVersion": gvr.api_version(),
                    "kind": "VolumeSnapshotContent",
                    "metadata": { "name": content_name },
                    "spec": {
                        "driver": driver,
                        "deletionPolicy": "Delete",
                        "volumeSnapshotClassName": class,
                    },
                    "status": { "snapshotHandle": handle, "readyToUse": true },
                })
            };
            let content: DynamicObject =
                serde_json::from_value(content).expect("valid snapshot content");
            self.dynamic.insert(
                ("volumesnapshotcontents".to_owned(), String::new(), content_name.clone()),
                content,
            );
        }
        if let Some(pvc) = source_pvc {
            if let Some(data) = self.volume_data.get(&key(&namespace, &pvc)).cloned() {
                self.snapshot_data.insert(key(&namespace, &name), data);
            }
        }

        let mut status = json!({
            "readyToUse": self.snapshots_ready,
            "restoreSize": "1Gi",
            "creationTime": "2021-03-04T05:06:07Z",
        });
        if alpha {
            if let Some(spec) = object.data.get_mut("spec") {
                spec["snapshotContentName"] = json!(content_name);
            }
        } else {
            status["boundVolumeSnapshotContentName"] = json!(content_name);
        }
        object.data["status"] = status;
        object.metadata.namespace = Some(namespace);
        object
    }

    fn record(&mut self, op: &str, kind: &str, namespace: &str, name: &str) {
        let target = if namespace.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", namespace, name)
        };
        self.operations.push(format!("{} {} {}", op, kind, target));
    }
}

// Pulls `sh -c '... "$1" > <path> ...' sh <text>` out of a pod's command
// line.
fn written_file(pod: &Pod) -> Option<(String, String)> {
    const REDIRECT: &str = "\"$1\" >";
    let container = pod.spec.as_ref()?.containers.first()?;
    let argv: Vec<&String> = container
        .command
        .iter()
        .flatten()
        .chain(container.args.iter().flatten())
        .collect();
    let script_at = argv.iter().position(|a| a.contains(REDIRECT))?;
    let script = argv[script_at];
    let rest = &script[script.find(REDIRECT)? + REDIRECT.len()..];
    let path = rest.split_whitespace().next()?.to_owned();
    let text = argv.get(script_at + 2)?.to_string();
    Some((path, text))
}

// Resolves an absolute path inside a pod to (claim, path within the volume).
fn claim_for_path(pod: &Pod, path: &str) -> Option<(String, String)> {
    let spec = pod.spec.as_ref()?;
    let container = spec.containers.first()?;
    let mount = container
        .volume_mounts
        .iter()
        .flatten()
        .find(|m| path.starts_with(&m.mount_path))?;
    let volume = spec
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == mount.name)?;
    let claim = volume.persistent_volume_claim.as_ref()?.claim_name.clone();
    Some((claim, path[mount.mount_path.len()..].to_owned()))
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn get_namespace(&self, _ctx: &Context, name: &str) -> Result<Namespace> {
        if self.state().namespaces.contains(name) {
            Ok(Namespace {
                metadata: meta(name),
                ..Default::default()
            })
        } else {
            Err(Error::not_found("Namespace", name))
        }
    }

    async fn get_storage_class(&self, _ctx: &Context, name: &str) -> Result<StorageClass> {
        self.state()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("StorageClass", name))
    }

    async fn list_storage_classes(&self, _ctx: &Context) -> Result<Vec<StorageClass>> {
        Ok(self.state().storage_classes.values().cloned().collect())
    }

    async fn get_csi_driver(&self, _ctx: &Context, name: &str) -> Result<CSIDriver> {
        if self.state().csi_drivers.contains(name) {
            Ok(CSIDriver {
                metadata: meta(name),
                ..Default::default()
            })
        } else {
            Err(Error::not_found("CSIDriver", name))
        }
    }

    async fn get_persistent_volume(&self, _ctx: &Context, name: &str) -> Result<PersistentVolume> {
        self.state()
            .persistent_volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    async fn get_pvc(
        &self,
        _ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim> {
        self.state()
            .pvcs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", name))
    }

    async fn list_pvcs(
        &self,
        _ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state();
        Ok(state
            .pvcs
            .iter()
            .filter(|((ns, _), pvc)| {
                in_namespace(ns, namespace) && matches_selector(&pvc.metadata, label_selector)
            })
            .map(|(_, pvc)| pvc.clone())
            .collect())
    }

    async fn create_pvc(
        &self,
        _ctx: &Context,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let mut state = self.state();
        state.check_create("PersistentVolumeClaim")?;
        let name = state.next_name(&pvc.metadata)?;
        let mut created = pvc.clone();
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(namespace.to_owned());
        let phase = state.pvc_phase.clone();
        if let Some(spec) = created.spec.as_mut() {
            if state.drop_data_source {
                spec.data_source = None;
            }
            if phase == "Bound" {
                spec.volume_name = Some(format!("pvc-{}", name));
            }
            if let Some(source) = &spec.data_source {
                if source.kind == "VolumeSnapshot" {
                    let restored = state.snapshot_data.get(&key(namespace, &source.name)).cloned();
                    if let Some(data) = restored {
                        state.volume_data.insert(key(namespace, &name), data);
                    }
                }
            }
        }
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some(phase),
            ..Default::default()
        });
        state.record("create", "PersistentVolumeClaim", namespace, &name);
        state.pvcs.insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn delete_pvc(&self, _ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        match state.pvcs.remove(&key(namespace, name)) {
            Some(_) => {
                state.record("delete", "PersistentVolumeClaim", namespace, name);
                Ok(())
            }
            None => Err(Error::not_found("PersistentVolumeClaim", name)),
        }
    }

    async fn get_pod(&self, _ctx: &Context, namespace: &str, name: &str) -> Result<Pod> {
        self.state()
            .pods
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Pod", name))
    }

    async fn list_pods(
        &self,
        _ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>> {
        let state = self.state();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                in_namespace(ns, namespace) && matches_selector(&pod.metadata, label_selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_pod(&self, _ctx: &Context, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut state = self.state();
        state.check_create("Pod")?;
        let name = state.next_name(&pod.metadata)?;
        let mut created = pod.clone();
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(namespace.to_owned());
        created.status = Some(PodStatus {
            phase: Some(state.pod_phase.clone()),
            ..Default::default()
        });
        if let Some((path, text)) = written_file(&created) {
            if let Some((claim, file)) = claim_for_path(&created, &path) {
                state
                    .volume_data
                    .entry(key(namespace, &claim))
                    .or_default()
                    .insert(file, format!("{}\n", text));
            }
        }
        state.record("create", "Pod", namespace, &name);
        state.pods.insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn delete_pod(&self, _ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        match state.pods.remove(&key(namespace, name)) {
            Some(_) => {
                state.record("delete", "Pod", namespace, name);
                Ok(())
            }
            None => Err(Error::not_found("Pod", name)),
        }
    }

    async fn get_config_map(
        &self,
        _ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap> {
        self.state()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("ConfigMap", name))
    }

    async fn list_config_maps(
        &self,
        _ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>> {
        let state = self.state();
        Ok(state
            .config_maps
            .iter()
            .filter(|((ns, _), cm)| {
                in_namespace(ns, namespace) && matches_selector(&cm.metadata, label_selector)
            })
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn create_config_map(
        &self,
        _ctx: &Context,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let mut state = self.state();
        state.check_create("ConfigMap")?;
        let name = state.next_name(&config_map.metadata)?;
        let mut created = config_map.clone();
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(namespace.to_owned());
        state.record("create", "ConfigMap", namespace, &name);
        state.config_maps.insert(key(namespace, &name), created.clone());
        Ok(created)
    }

    async fn delete_config_map(&self, _ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        match state.config_maps.remove(&key(namespace, name)) {
            Some(_) => {
                state.record("delete", "ConfigMap", namespace, name);
                Ok(())
            }
            None => Err(Error::not_found("ConfigMap", name)),
        }
    }

    async fn list_events(&self, _ctx: &Context, namespace: &str) -> Result<Vec<Event>> {
        Ok(self
            .state()
            .events
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_dynamic(
        &self,
        _ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        self.state()
            .dynamic
            .get(&(
                gvr.resource.clone(),
                namespace.unwrap_or("").to_owned(),
                name.to_owned(),
            ))
            .cloned()
            .ok_or_else(|| Error::not_found(gvr.kind.clone(), name))
    }

    async fn list_dynamic(
        &self,
        _ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let namespace = namespace.unwrap_or("");
        Ok(self
            .state()
            .dynamic
            .iter()
            .filter(|((resource, ns, _), _)| {
                resource == &gvr.resource && in_namespace(ns, namespace)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create_dynamic(
        &self,
        _ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        state.check_create(&gvr.kind)?;
        let name = state.next_name(&object.metadata)?;
        let mut created = object.clone();
        created.metadata.name = Some(name.clone());
        if gvr.resource == "volumesnapshots" {
            created = state.settle_snapshot(gvr, namespace, created);
        }
        let entry = (
            gvr.resource.clone(),
            namespace.unwrap_or("").to_owned(),
            name.clone(),
        );
        if state.dynamic.contains_key(&entry) {
            return Err(Error::Precondition(format!("{} {} already exists", gvr.kind, name)));
        }
        state.record("create", &gvr.kind, namespace.unwrap_or(""), &name);
        state.dynamic.insert(entry, created.clone());
        Ok(created)
    }

    async fn delete_dynamic(
        &self,
        _ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let entry = (
            gvr.resource.clone(),
            namespace.unwrap_or("").to_owned(),
            name.to_owned(),
        );
        match state.dynamic.remove(&entry) {
            Some(_) => {
                state.record("delete", &gvr.kind, namespace.unwrap_or(""), name);
                Ok(())
            }
            None => Err(Error::not_found(gvr.kind.clone(), name)),
        }
    }

    async fn server_groups(&self, _ctx: &Context) -> Result<Vec<ApiGroupInfo>> {
        Ok(self.state().groups.clone())
    }

    async fn server_version(&self, _ctx: &Context) -> Result<ServerVersion> {
        Ok(self.state().version.clone())
    }

    async fn exec(
        &self,
        ctx: &Context,
        target: ExecTarget<'_>,
        command: &[String],
    ) -> Result<ExecOutput> {
        let call = ExecCall {
            namespace: target.namespace.to_owned(),
            pod: target.pod.to_owned(),
            container: target.container.to_owned(),
            command: command.to_vec(),
        };
        let (handler, pod, hangs) = {
            let mut state = self.state();
            state.exec_calls.push(call.clone());
            (
                state.exec_handler.clone(),
                state.pods.get(&key(target.namespace, target.pod)).cloned(),
                state.exec_hangs,
            )
        };
        if hangs {
            return ctx.run(std::future::pending()).await;
        }
        if let Some(handler) = handler {
            if let Some(result) = handler(&call) {
                return result;
            }
        }
        let pod = pod.ok_or_else(|| Error::not_found("Pod", target.pod))?;
        if command.len() == 2 && command[0] == "cat" {
            let (claim, file) = claim_for_path(&pod, &command[1]).ok_or_else(|| {
                Error::Action(format!("cat: can't open '{}'", command[1]))
            })?;
            let state = self.state();
            let contents = state
                .volume_data
                .get(&key(target.namespace, &claim))
                .and_then(|files| files.get(&file))
                .cloned();
            return match contents {
                Some(stdout) => Ok(ExecOutput {
                    stdout,
                    stderr: String::new(),
                }),
                None => Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!("cat: can't open '{}': No such file or directory", command[1]),
                }),
            };
        }
        Ok(ExecOutput::default())
    }

    async fn port_forward(&self, _ctx: &Context, request: PortForwardRequest) -> Result<()> {
        {
            let mut state = self.state();
            if state.fail_port_forward {
                return Err(Error::Action(format!(
                    "unable to listen on port {}",
                    request.local_port
                )));
            }
            state.port_forwards.push((
                request.pod.clone(),
                request.local_port,
                request.pod_port,
            ));
        }
        let _ = request.ready.send(());
        request.stop.cancelled().await;
        Ok(())
    }
}

fn in_namespace(stored: &str, requested: &str) -> bool {
    requested.is_empty() || stored == requested
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = meta.labels.clone().unwrap_or_default();
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(|l| l == v).unwrap_or(false),
        None => labels.contains_key(term),
    })
}

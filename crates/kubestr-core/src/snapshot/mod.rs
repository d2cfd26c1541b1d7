//! CSI snapshot objects.
//!
//! The snapshot API has shipped as `v1alpha1`, `v1beta1` and `v1`, and the
//! three versions disagree on where fields live. [`SnapshotApi`] names the
//! version a cluster prefers and every conversion from the raw
//! [`DynamicObject`]s is dispatched on it here; the rest of the crate only
//! sees the typed views.

use std::fmt;

use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::Value;

use crate::defaults::SNAPSHOT_GROUP;
use crate::gateway::GroupVersionResource;

mod operator;

pub use operator::{CreateFromSourceArgs, CreateSnapshotArgs, SnapshotOperator};

/// A version of the `snapshot.storage.k8s.io` API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SnapshotApi {
    /// `v1alpha1`, served by Kubernetes 1.12 to 1.16.
    #[serde(rename = "v1alpha1")]
    V1Alpha1,
    /// `v1beta1`, served from Kubernetes 1.17.
    #[serde(rename = "v1beta1")]
    V1Beta1,
    /// `v1`, served from Kubernetes 1.20.
    #[serde(rename = "v1")]
    V1,
}

impl SnapshotApi {
    /// All versions, oldest first.
    pub const ALL: [SnapshotApi; 3] =
        [SnapshotApi::V1Alpha1, SnapshotApi::V1Beta1, SnapshotApi::V1];

    /// Parses a version string such as `v1beta1`.
    pub fn from_version(version: &str) -> Option<Self> {
        match version {
            "v1alpha1" => Some(SnapshotApi::V1Alpha1),
            "v1beta1" => Some(SnapshotApi::V1Beta1),
            "v1" => Some(SnapshotApi::V1),
            _ => None,
        }
    }

    /// The version string.
    pub fn version(&self) -> &'static str {
        match self {
            SnapshotApi::V1Alpha1 => "v1alpha1",
            SnapshotApi::V1Beta1 => "v1beta1",
            SnapshotApi::V1 => "v1",
        }
    }

    /// `<group>/<version>`.
    pub fn api_version(&self) -> String {
        format!("{}/{}", SNAPSHOT_GROUP, self.version())
    }

    /// Key holding the driver name on a VolumeSnapshotClass.
    pub fn driver_key(&self) -> &'static str {
        match self {
            SnapshotApi::V1Alpha1 => "snapshotter",
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => "driver",
        }
    }

    /// The `volumesnapshots` resource.
    pub fn volume_snapshots(&self) -> GroupVersionResource {
        GroupVersionResource::new(
            SNAPSHOT_GROUP,
            self.version(),
            "volumesnapshots",
            "VolumeSnapshot",
        )
    }

    /// The `volumesnapshotclasses` resource.
    pub fn volume_snapshot_classes(&self) -> GroupVersionResource {
        GroupVersionResource::new(
            SNAPSHOT_GROUP,
            self.version(),
            "volumesnapshotclasses",
            "VolumeSnapshotClass",
        )
    }

    /// The `volumesnapshotcontents` resource.
    pub fn volume_snapshot_contents(&self) -> GroupVersionResource {
        GroupVersionResource::new(
            SNAPSHOT_GROUP,
            self.version(),
            "volumesnapshotcontents",
            "VolumeSnapshotContent",
        )
    }

    /// Driver named by a VolumeSnapshotClass, if it has one.
    pub fn class_driver(&self, class: &DynamicObject) -> Option<String> {
        string_at(&class.data, &format!("/{}", self.driver_key()))
    }
}

impl fmt::Display for SnapshotApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version())
    }
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Version independent view of a VolumeSnapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    /// API version the object was read with.
    pub api: SnapshotApi,
    /// Snapshot name.
    pub name: String,
    /// Snapshot namespace.
    pub namespace: String,
    /// VolumeSnapshotClass the snapshot was taken with.
    pub class_name: Option<String>,
    /// PVC the snapshot was taken from.
    pub source_pvc: Option<String>,
    /// Pre-provisioned content the snapshot was created from.
    pub source_content: Option<String>,
    /// Content object the snapshot is bound to.
    pub bound_content: Option<String>,
    /// Whether the snapshot can be restored from.
    pub ready_to_use: bool,
    /// Minimum size of a volume restored from the snapshot.
    pub restore_size: Option<String>,
    /// When the snapshot was cut.
    pub creation_time: Option<String>,
}

impl VolumeSnapshot {
    /// Reads the fields of `object` according to `api`.
    pub fn from_dynamic(api: SnapshotApi, object: &DynamicObject) -> Self {
        let data = &object.data;
        let (class_name, source_pvc, source_content, bound_content) = match api {
            SnapshotApi::V1Alpha1 => (
                string_at(data, "/spec/snapshotClassName"),
                string_at(data, "/spec/source/name"),
                None,
                string_at(data, "/spec/snapshotContentName"),
            ),
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => (
                string_at(data, "/spec/volumeSnapshotClassName"),
                string_at(data, "/spec/source/persistentVolumeClaimName"),
                string_at(data, "/spec/source/volumeSnapshotContentName"),
                string_at(data, "/status/boundVolumeSnapshotContentName"),
            ),
        };
        VolumeSnapshot {
            api,
            name: object.metadata.name.clone().unwrap_or_default(),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
            class_name,
            source_pvc,
            // Alpha snapshots created from content carry the content name as
            // their binding.
            source_content: source_content.or_else(|| match api {
                SnapshotApi::V1Alpha1 if data.pointer("/spec/source").is_none() => {
                    string_at(data, "/spec/snapshotContentName")
                }
                _ => None,
            }),
            bound_content,
            ready_to_use: data
                .pointer("/status/readyToUse")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            restore_size: string_at(data, "/status/restoreSize"),
            creation_time: string_at(data, "/status/creationTime"),
        }
    }
}

/// The storage-side identity of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    /// Handle the CSI driver knows the snapshot by.
    pub handle: String,
    /// CSI driver that owns the snapshot.
    pub driver: String,
}

impl SnapshotSource {
    /// Reads the handle and driver off a VolumeSnapshotContent.
    pub fn from_content(api: SnapshotApi, content: &DynamicObject) -> Option<Self> {
        let data = &content.data;
        let (handle, driver) = match api {
            SnapshotApi::V1Alpha1 => (
                string_at(data, "/spec/csiVolumeSnapshotSource/snapshotHandle"),
                string_at(data, "/spec/csiVolumeSnapshotSource/driver"),
            ),
            SnapshotApi::V1Beta1 | SnapshotApi::V1 => (
                string_at(data, "/status/snapshotHandle")
                    .or_else(|| string_at(data, "/spec/source/snapshotHandle")),
                string_at(data, "/spec/driver"),
            ),
        };
        Some(SnapshotSource {
            handle: handle?,
            driver: driver?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn driver_key_depends_on_version() {
        assert_eq!(SnapshotApi::V1Alpha1.driver_key(), "snapshotter");
        assert_eq!(SnapshotApi::V1Beta1.driver_key(), "driver");
        assert_eq!(SnapshotApi::V1.driver_key(), "driver");

        let alpha = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1alpha1",
            "kind": "VolumeSnapshotClass",
            "metadata": { "name": "csi-snapclass" },
            "snapshotter": "hostpath.csi.k8s.io",
        }));
        assert_eq!(
            SnapshotApi::V1Alpha1.class_driver(&alpha).as_deref(),
            Some("hostpath.csi.k8s.io")
        );
        assert_eq!(SnapshotApi::V1.class_driver(&alpha), None);
    }

    #[test]
    fn reads_stable_snapshot() {
        let snap = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshot",
            "metadata": { "name": "snap1", "namespace": "apps" },
            "spec": {
                "volumeSnapshotClassName": "csi-snapclass",
                "source": { "persistentVolumeClaimName": "src" },
            },
            "status": {
                "boundVolumeSnapshotContentName": "snapcontent-1",
                "readyToUse": true,
                "restoreSize": "2Gi",
            },
        }));
        let typed = VolumeSnapshot::from_dynamic(SnapshotApi::V1, &snap);
        assert_eq!(typed.name, "snap1");
        assert_eq!(typed.namespace, "apps");
        assert_eq!(typed.class_name.as_deref(), Some("csi-snapclass"));
        assert_eq!(typed.source_pvc.as_deref(), Some("src"));
        assert_eq!(typed.bound_content.as_deref(), Some("snapcontent-1"));
        assert!(typed.ready_to_use);
        assert_eq!(typed.restore_size.as_deref(), Some("2Gi"));
    }

    #[test]
    fn reads_alpha_snapshot() {
        let snap = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1alpha1",
            "kind": "VolumeSnapshot",
            "metadata": { "name": "snap1", "namespace": "apps" },
            "spec": {
                "snapshotClassName": "csi-snapclass",
                "source": { "kind": "PersistentVolumeClaim", "name": "src" },
                "snapshotContentName": "snapcontent-1",
            },
            "status": { "readyToUse": false },
        }));
        let typed = VolumeSnapshot::from_dynamic(SnapshotApi::V1Alpha1, &snap);
        assert_eq!(typed.class_name.as_deref(), Some("csi-snapclass"));
        assert_eq!(typed.source_pvc.as_deref(), Some("src"));
        assert_eq!(typed.source_content, None);
        assert_eq!(typed.bound_content.as_deref(), Some("snapcontent-1"));
        assert!(!typed.ready_to_use);
    }

    #[test]
    fn reads_content_handles() {
        let beta = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1beta1",
            "kind": "VolumeSnapshotContent",
            "metadata": { "name": "c" },
            "spec": { "driver": "ebs.csi.aws.com" },
            "status": { "snapshotHandle": "snap-0123" },
        }));
        assert_eq!(
            SnapshotSource::from_content(SnapshotApi::V1Beta1, &beta),
            Some(SnapshotSource {
                handle: "snap-0123".into(),
                driver: "ebs.csi.aws.com".into()
            })
        );

        let alpha = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1alpha1",
            "kind": "VolumeSnapshotContent",
            "metadata": { "name": "c" },
            "spec": { "csiVolumeSnapshotSource": { "driver": "d", "snapshotHandle": "h" } },
        }));
        let source = SnapshotSource::from_content(SnapshotApi::V1Alpha1, &alpha).unwrap();
        assert_eq!(source.handle, "h");
        assert_eq!(source.driver, "d");

        let unbound = object(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshotContent",
            "metadata": { "name": "c" },
            "spec": { "driver": "d" },
        }));
        assert_eq!(SnapshotSource::from_content(SnapshotApi::V1, &unbound), None);
    }

    #[test]
    fn versions_round_trip_through_strings() {
        for api in SnapshotApi::ALL.iter() {
            assert_eq!(SnapshotApi::from_version(api.version()), Some(*api));
        }
        assert_eq!(SnapshotApi::from_version("v2"), None);
        assert_eq!(
            SnapshotApi::V1Beta1.volume_snapshots().api_version(),
            "snapshot.storage.k8s.io/v1beta1"
        );
    }
}

//! Access to the Kubernetes API.
//!
//! [`ClusterGateway`] is the single seam between the workflows and the
//! cluster. [`KubeGateway`] implements it on top of a [`kube::Client`]; the
//! test suite swaps in an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use kube::api::DynamicObject;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Result;

#[cfg(test)]
pub(crate) mod fake;
mod kube_gateway;

pub use kube_gateway::KubeGateway;

/// Addresses a resource that is only known at runtime, such as the CSI
/// snapshot objects whose API version differs between clusters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    /// API group, e.g. `snapshot.storage.k8s.io`.
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Plural resource name, e.g. `volumesnapshots`.
    pub resource: String,
    /// Kind, e.g. `VolumeSnapshot`.
    pub kind: String,
}

impl GroupVersionResource {
    /// Builds a resource address.
    pub fn new(group: &str, version: &str, resource: &str, kind: &str) -> Self {
        GroupVersionResource {
            group: group.to_owned(),
            version: version.to_owned(),
            resource: resource.to_owned(),
            kind: kind.to_owned(),
        }
    }

    /// The `apiVersion` string objects of this resource carry.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// One API group as reported by discovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiGroupInfo {
    /// Group name; empty for the core group.
    pub name: String,
    /// Versions served for the group.
    pub versions: Vec<String>,
    /// Version the server prefers, if it reports one.
    pub preferred_version: Option<String>,
}

/// The API server's version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServerVersion {
    /// Major version, as reported.
    pub major: String,
    /// Minor version, as reported; may carry a trailing `+`.
    pub minor: String,
    /// Full version string, e.g. `v1.20.2`.
    pub git_version: String,
}

/// Output of a command executed in a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout.
    pub stdout: String,
    /// Everything the command wrote to stderr.
    pub stderr: String,
}

/// Where to run a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget<'a> {
    /// Pod namespace.
    pub namespace: &'a str,
    /// Pod name.
    pub pod: &'a str,
    /// Container name.
    pub container: &'a str,
}

/// Port-forward parameters.
#[derive(Debug)]
pub struct PortForwardRequest {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Local port to listen on.
    pub local_port: u16,
    /// Port inside the pod.
    pub pod_port: u16,
    /// Fired once the local listener is accepting connections.
    pub ready: oneshot::Sender<()>,
    /// Stops the forward when cancelled.
    pub stop: CancellationToken,
}

/// Everything the workflows need from the cluster.
///
/// All methods take the request [`Context`] and fail with
/// [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded) once it
/// expires. A missing object is reported as
/// [`Error::NotFound`](crate::Error::NotFound).
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetches a namespace.
    async fn get_namespace(&self, ctx: &Context, name: &str) -> Result<Namespace>;

    /// Fetches a StorageClass.
    async fn get_storage_class(&self, ctx: &Context, name: &str) -> Result<StorageClass>;

    /// Lists all StorageClasses.
    async fn list_storage_classes(&self, ctx: &Context) -> Result<Vec<StorageClass>>;

    /// Fetches a CSIDriver object.
    async fn get_csi_driver(&self, ctx: &Context, name: &str) -> Result<CSIDriver>;

    /// Fetches a PersistentVolume.
    async fn get_persistent_volume(&self, ctx: &Context, name: &str) -> Result<PersistentVolume>;

    /// Fetches a PersistentVolumeClaim.
    async fn get_pvc(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim>;

    /// Lists PersistentVolumeClaims matching a label selector. An empty
    /// `namespace` lists across every namespace.
    async fn list_pvcs(
        &self,
        ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Creates a PersistentVolumeClaim and returns the persisted object.
    async fn create_pvc(
        &self,
        ctx: &Context,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Deletes a PersistentVolumeClaim.
    async fn delete_pvc(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()>;

    /// Fetches a Pod.
    async fn get_pod(&self, ctx: &Context, namespace: &str, name: &str) -> Result<Pod>;

    /// Lists Pods matching a label selector. An empty `namespace` lists
    /// across every namespace.
    async fn list_pods(&self, ctx: &Context, namespace: &str, label_selector: &str)
        -> Result<Vec<Pod>>;

    /// Creates a Pod and returns the persisted object.
    async fn create_pod(&self, ctx: &Context, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Deletes a Pod.
    async fn delete_pod(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()>;

    /// Fetches a ConfigMap.
    async fn get_config_map(&self, ctx: &Context, namespace: &str, name: &str)
        -> Result<ConfigMap>;

    /// Lists ConfigMaps matching a label selector. An empty `namespace`
    /// lists across every namespace.
    async fn list_config_maps(
        &self,
        ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>>;

    /// Creates a ConfigMap and returns the persisted object.
    async fn create_config_map(
        &self,
        ctx: &Context,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap>;

    /// Deletes a ConfigMap.
    async fn delete_config_map(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()>;

    /// Lists the events of a namespace.
    async fn list_events(&self, ctx: &Context, namespace: &str) -> Result<Vec<Event>>;

    /// Fetches an object of a runtime-addressed resource. `namespace` is
    /// `None` for cluster scoped resources.
    async fn get_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject>;

    /// Lists objects of a runtime-addressed resource. `None` lists a
    /// namespaced resource across every namespace.
    async fn list_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Creates an object of a runtime-addressed resource.
    async fn create_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Deletes an object of a runtime-addressed resource.
    async fn delete_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()>;

    /// Lists the API groups the server offers.
    async fn server_groups(&self, ctx: &Context) -> Result<Vec<ApiGroupInfo>>;

    /// Fetches the API server version.
    async fn server_version(&self, ctx: &Context) -> Result<ServerVersion>;

    /// Runs `command` in a container and collects its output.
    async fn exec(
        &self,
        ctx: &Context,
        target: ExecTarget<'_>,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Forwards a local port to a pod port until the request's stop token
    /// is cancelled. `ctx` only bounds setting the forward up; once ready it
    /// runs until stopped.
    async fn port_forward(&self, ctx: &Context, request: PortForwardRequest) -> Result<()>;
}

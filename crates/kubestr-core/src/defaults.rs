//! Names, labels, images and timeouts shared by the workflows.

use std::time::Duration;

/// Label stamped on every object the tool creates.
pub const CREATED_BY_LABEL_KEY: &str = "created-by-kubestr-csi";
/// Value of [`CREATED_BY_LABEL_KEY`].
pub const CREATED_BY_LABEL_VALUE: &str = "yes";
/// Additional label on ConfigMaps generated by the FIO runner.
pub const CREATED_BY_FIO_LABEL_KEY: &str = "createdbyfio";
/// Value of [`CREATED_BY_FIO_LABEL_KEY`].
pub const CREATED_BY_FIO_LABEL_VALUE: &str = "true";

/// Image used for provisioned pods unless the caller picks another.
pub const DEFAULT_POD_IMAGE: &str = "ghcr.io/kastenhq/kubestr:latest";
/// Image serving the browse UI.
pub const FILEBROWSER_IMAGE: &str = "filebrowser/filebrowser:v2";
/// Small image with `find` and `cp`.
pub const ALPINE_IMAGE: &str = "alpine:3.19";
/// Port the filebrowser listens on inside its pod.
pub const FILEBROWSER_PORT: u16 = 80;
/// Default local port for browse port-forwards.
pub const DEFAULT_LOCAL_PORT: u16 = 8080;

/// Namespace used when `POD_NAMESPACE` is not set.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Environment variable naming the namespace the tool runs in.
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Environment variable naming the pod the tool runs in.
pub const POD_NAME_ENV: &str = "HOSTNAME";

/// Size requested by provisioned PVCs when nothing else applies.
pub const DEFAULT_PVC_SIZE: &str = "1Gi";
/// Size of the FIO benchmark claim unless the caller picks another.
pub const DEFAULT_FIO_PVC_SIZE: &str = "100Gi";
/// Command keeping a pod alive until it is deleted.
pub const KEEP_ALIVE_COMMAND: &[&str] = &["tail", "-f", "/dev/null"];

/// Upper bound for a pod to disappear after delete.
pub const POD_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound for a PVC to disappear after delete.
pub const PVC_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound for removing one ledger entry during cleanup.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(150);
/// Interval between readiness polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// API group of the CSI snapshot resources.
pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
/// API group whose presence means RBAC is enabled.
pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
/// API group served by the aggregation layer.
pub const AGGREGATION_GROUP: &str = "apiregistration.k8s.io";

/// Prefix of snapshots created by the tool.
pub const SNAPSHOT_NAME_PREFIX: &str = "kubestr-snapshot-";
/// Prefix of the temporary objects created by the create-from-source check.
pub const CLONE_PREFIX: &str = "kubestr-clone-";

//! Groups the cluster's StorageClasses by provisioner and reports how well
//! each provisioner supports CSI snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::gateway::ClusterGateway;
use crate::snapshot::SnapshotApi;
use crate::validate::ArgumentValidator;

lazy_static! {
    static ref DNS_1123_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("DNS-1123 subdomain pattern is valid");
}

const DNS_1123_SUBDOMAIN_MAX_LEN: usize = 253;

/// Documentation for CSI drivers users commonly run into.
const KNOWN_DRIVERS: &[(&str, &str)] = &[
    ("ebs.csi.aws.com", "https://github.com/kubernetes-sigs/aws-ebs-csi-driver"),
    ("efs.csi.aws.com", "https://github.com/kubernetes-sigs/aws-efs-csi-driver"),
    (
        "pd.csi.storage.gke.io",
        "https://github.com/kubernetes-sigs/gcp-compute-persistent-disk-csi-driver",
    ),
    ("disk.csi.azure.com", "https://github.com/kubernetes-sigs/azuredisk-csi-driver"),
    ("file.csi.azure.com", "https://github.com/kubernetes-sigs/azurefile-csi-driver"),
    ("csi.vsphere.vmware.com", "https://github.com/kubernetes-sigs/vsphere-csi-driver"),
    ("hostpath.csi.k8s.io", "https://github.com/kubernetes-csi/csi-driver-host-path"),
    ("rbd.csi.ceph.com", "https://github.com/ceph/ceph-csi"),
    ("cephfs.csi.ceph.com", "https://github.com/ceph/ceph-csi"),
    ("driver.longhorn.io", "https://github.com/longhorn/longhorn"),
];

/// Documentation URL for a well-known CSI driver.
pub fn known_driver_url(driver: &str) -> Option<&'static str> {
    KNOWN_DRIVERS
        .iter()
        .find(|(name, _)| *name == driver)
        .map(|(_, url)| *url)
}

/// True when `name` is a DNS-1123 subdomain, the shape CSI driver names
/// take. In-tree provisioners are of the form `kubernetes.io/<name>`.
pub fn is_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= DNS_1123_SUBDOMAIN_MAX_LEN
        && !name.contains('/')
        && DNS_1123_SUBDOMAIN.is_match(name)
}

/// Severity of a [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StatusLevel {
    /// Informational.
    Info,
    /// Something is missing or misconfigured.
    Warning,
    /// The object cannot be used.
    Error,
}

/// A message attached to a report entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Severity.
    pub level: StatusLevel,
    /// Message.
    pub message: String,
}

impl Status {
    fn info(message: impl Into<String>) -> Self {
        Status {
            level: StatusLevel::Info,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Status {
            level: StatusLevel::Warning,
            message: message.into(),
        }
    }
}

/// A StorageClass in the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassInfo {
    /// Name.
    pub name: String,
    /// Provisioner parameters.
    pub parameters: BTreeMap<String, String>,
    /// What happens to released volumes.
    pub reclaim_policy: Option<String>,
    /// Findings.
    pub status: Vec<Status>,
}

/// A VolumeSnapshotClass in the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotClassInfo {
    /// Name.
    pub name: String,
    /// Driver taking the snapshots.
    pub driver: String,
    /// What happens to the content when a snapshot is deleted.
    pub deletion_policy: Option<String>,
    /// Findings.
    pub status: Vec<Status>,
}

/// One provisioner and the classes using it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerInfo {
    /// Provisioner name as written in the StorageClasses.
    pub name: String,
    /// Whether the provisioner is a CSI driver.
    #[serde(rename = "isCSI")]
    pub is_csi: bool,
    /// Documentation for well-known drivers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// StorageClasses using the provisioner.
    pub storage_classes: Vec<StorageClassInfo>,
    /// VolumeSnapshotClasses of the driver.
    pub volume_snapshot_classes: Vec<SnapshotClassInfo>,
    /// Provisioner level findings.
    pub status: Vec<Status>,
}

/// Enumerates provisioners. The StorageClass and VolumeSnapshotClass lists
/// are fetched at most once per inspector.
pub struct ProvisionerInspector {
    gateway: Arc<dyn ClusterGateway>,
    storage_classes: OnceCell<Vec<StorageClass>>,
    snapshot_classes: OnceCell<Vec<DynamicObject>>,
}

impl ProvisionerInspector {
    /// An inspector with empty caches.
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        ProvisionerInspector {
            gateway,
            storage_classes: OnceCell::new(),
            snapshot_classes: OnceCell::new(),
        }
    }

    /// Every StorageClass in the cluster.
    pub async fn storage_classes(&self, ctx: &Context) -> Result<Vec<StorageClass>> {
        let classes = self
            .storage_classes
            .get_or_try_init(|| async {
                debug!("Loading StorageClasses");
                self.gateway.list_storage_classes(ctx).await
            })
            .await?;
        Ok(classes.clone())
    }

    /// Every VolumeSnapshotClass of version `api`. The first call decides the
    /// version that is cached.
    pub async fn volume_snapshot_classes(
        &self,
        ctx: &Context,
        api: SnapshotApi,
    ) -> Result<Vec<DynamicObject>> {
        let classes = self
            .snapshot_classes
            .get_or_try_init(|| async {
                debug!(%api, "Loading VolumeSnapshotClasses");
                self.gateway
                    .list_dynamic(ctx, &api.volume_snapshot_classes(), None)
                    .await
            })
            .await?;
        Ok(classes.clone())
    }

    /// Distinct provisioners in first-seen order.
    pub async fn provisioner_names(&self, ctx: &Context) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for sc in self.storage_classes(ctx).await? {
            if !names.contains(&sc.provisioner) {
                names.push(sc.provisioner);
            }
        }
        Ok(names)
    }

    async fn is_csi(&self, ctx: &Context, provisioner: &str) -> Result<(bool, bool)> {
        match self.gateway.get_csi_driver(ctx, provisioner).await {
            Ok(_) => Ok((true, true)),
            Err(e) if e.is_not_found() => Ok((is_dns_subdomain(provisioner), false)),
            Err(e) => Err(e),
        }
    }

    /// Builds the provisioner report. Snapshot classes are only looked up
    /// when the cluster is `snapshot_capable`.
    pub async fn provisioners(
        &self,
        ctx: &Context,
        snapshot_capable: bool,
    ) -> Result<Vec<ProvisionerInfo>> {
        let api = if snapshot_capable {
            match ArgumentValidator::new(self.gateway.clone())
                .csi_snapshot_group_version(ctx)
                .await
            {
                Ok(api) => Some(api),
                Err(e) if e.kind() == ErrorKind::Precondition => {
                    debug!(error = %e, "No usable snapshot API");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let storage_classes = self.storage_classes(ctx).await?;
        let snapshot_classes = match api {
            Some(api) => self.volume_snapshot_classes(ctx, api).await?,
            None => Vec::new(),
        };

        let mut report = Vec::new();
        for name in self.provisioner_names(ctx).await? {
            let (is_csi, has_driver_object) = self.is_csi(ctx, &name).await?;
            let mut status = Vec::new();
            let mut volume_snapshot_classes = Vec::new();
            if is_csi {
                if !has_driver_object {
                    status.push(Status::warning(
                        "Missing CSIDriver object. Required by some provisioners.",
                    ));
                }
                match api {
                    None => status.push(Status::warning(
                        "Cluster is not CSI snapshot capable. Requires VolumeSnapshotDataSource feature gate.",
                    )),
                    Some(api) => {
                        volume_snapshot_classes = snapshot_classes
                            .iter()
                            .filter(|vsc| api.class_driver(vsc).as_deref() == Some(name.as_str()))
                            .map(|vsc| snapshot_class_info(api, vsc))
                            .collect();
                        if volume_snapshot_classes.is_empty() {
                            status.push(Status::warning(
                                "No VolumeSnapshotClasses found for this provisioner.",
                            ));
                        }
                    }
                }
            } else {
                status.push(Status::warning(
                    "This is not a CSI provisioner; snapshot workflows are unavailable.",
                ));
            }
            report.push(ProvisionerInfo {
                url: if is_csi {
                    known_driver_url(&name).map(str::to_owned)
                } else {
                    None
                },
                storage_classes: storage_classes
                    .iter()
                    .filter(|sc| sc.provisioner == name)
                    .map(storage_class_info)
                    .collect(),
                name,
                is_csi,
                volume_snapshot_classes,
                status,
            });
        }
        Ok(report)
    }
}

fn storage_class_info(sc: &StorageClass) -> StorageClassInfo {
    StorageClassInfo {
        name: sc.metadata.name.clone().unwrap_or_default(),
        parameters: sc.parameters.clone().unwrap_or_default(),
        reclaim_policy: sc.reclaim_policy.clone(),
        status: vec![Status::info("Valid StorageClass.")],
    }
}

fn snapshot_class_info(api: SnapshotApi, vsc: &DynamicObject) -> SnapshotClassInfo {
    SnapshotClassInfo {
        name: vsc.metadata.name.clone().unwrap_or_default(),
        driver: api.class_driver(vsc).unwrap_or_default(),
        deletion_policy: vsc
            .data
            .get("deletionPolicy")
            .and_then(|p| p.as_str())
            .map(str::to_owned),
        status: vec![Status::info("Valid VolumeSnapshotClass.")],
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::fake::FakeGateway;

    #[test]
    fn dns_subdomains() {
        assert!(is_dns_subdomain("ebs.csi.aws.com"));
        assert!(is_dns_subdomain("hostpath"));
        assert!(!is_dns_subdomain("kubernetes.io/aws-ebs"));
        assert!(!is_dns_subdomain("k8s.io/minikube-hostpath"));
        assert!(!is_dns_subdomain("Upper.Case"));
        assert!(!is_dns_subdomain("-leading.dash"));
        assert!(!is_dns_subdomain(""));
        assert!(!is_dns_subdomain(&"a".repeat(254)));
    }

    #[tokio::test]
    async fn in_tree_class_without_snapshots() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_storage_class("standard", "k8s.io/minikube-hostpath");
        let inspector = ProvisionerInspector::new(fake.clone());
        let report = inspector
            .provisioners(&Context::background(), true)
            .await
            .unwrap();

        assert_eq!(report.len(), 1);
        let provisioner = &report[0];
        assert_eq!(provisioner.name, "k8s.io/minikube-hostpath");
        assert!(!provisioner.is_csi);
        assert_eq!(provisioner.storage_classes.len(), 1);
        assert_eq!(provisioner.storage_classes[0].name, "standard");
        assert_eq!(
            provisioner.storage_classes[0].status,
            vec![Status::info("Valid StorageClass.")]
        );
        assert!(provisioner.volume_snapshot_classes.is_empty());
    }

    #[tokio::test]
    async fn csi_driver_with_matching_snapshot_classes() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_snapshot_api("v1")
            .with_storage_class("gp3", "ebs.csi.aws.com")
            .with_storage_class("gp2", "ebs.csi.aws.com")
            .with_csi_driver("ebs.csi.aws.com")
            .with_volume_snapshot_class("v1", "ebs-snap", "ebs.csi.aws.com")
            .with_volume_snapshot_class("v1", "gce-snap", "pd.csi.storage.gke.io");
        let inspector = ProvisionerInspector::new(fake.clone());
        let report = inspector
            .provisioners(&Context::background(), true)
            .await
            .unwrap();

        assert_eq!(report.len(), 1);
        let ebs = &report[0];
        assert!(ebs.is_csi);
        assert!(ebs.status.is_empty());
        assert_eq!(
            ebs.url.as_deref(),
            Some("https://github.com/kubernetes-sigs/aws-ebs-csi-driver")
        );
        assert_eq!(ebs.storage_classes.len(), 2);
        assert_eq!(ebs.volume_snapshot_classes.len(), 1);
        assert_eq!(ebs.volume_snapshot_classes[0].name, "ebs-snap");
        assert_eq!(ebs.volume_snapshot_classes[0].deletion_policy.as_deref(), Some("Delete"));
    }

    #[tokio::test]
    async fn csi_warnings() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_snapshot_api("v1beta1")
            .with_storage_class("fast", "fast.csi.example.com");
        let inspector = ProvisionerInspector::new(fake.clone());

        let capable = inspector
            .provisioners(&Context::background(), true)
            .await
            .unwrap();
        let messages: Vec<&str> = capable[0].status.iter().map(|s| s.message.as_str()).collect();
        assert!(capable[0].is_csi);
        assert!(messages[0].starts_with("Missing CSIDriver object"));
        assert!(messages[1].starts_with("No VolumeSnapshotClasses"));

        let incapable = inspector
            .provisioners(&Context::background(), false)
            .await
            .unwrap();
        assert!(incapable[0].status[1]
            .message
            .starts_with("Cluster is not CSI snapshot capable"));
    }

    #[tokio::test]
    async fn provisioners_keep_first_seen_order() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_storage_class("a", "z.csi.example.com")
            .with_storage_class("b", "a.csi.example.com")
            .with_storage_class("c", "z.csi.example.com");
        let inspector = ProvisionerInspector::new(fake.clone());
        let names = inspector
            .provisioner_names(&Context::background())
            .await
            .unwrap();
        assert_eq!(names, vec!["z.csi.example.com", "a.csi.example.com"]);
    }

    #[tokio::test]
    async fn storage_classes_are_cached() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_storage_class("a", "a.csi.example.com");
        let inspector = ProvisionerInspector::new(fake.clone());
        assert_eq!(inspector.storage_classes(&Context::background()).await.unwrap().len(), 1);
        fake.with_storage_class("b", "b.csi.example.com");
        assert_eq!(inspector.storage_classes(&Context::background()).await.unwrap().len(), 1);
    }
}

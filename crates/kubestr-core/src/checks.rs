//! Cluster-wide prerequisites: Kubernetes version, RBAC, the aggregation
//! layer and CSI snapshot support.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::defaults::{AGGREGATION_GROUP, CLEANUP_TIMEOUT, RBAC_GROUP, SNAPSHOT_GROUP};
use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, ServerVersion};
use crate::names::created_by_labels;

/// Oldest Kubernetes release the tool supports.
pub const MIN_VERSION: (u32, u32) = (1, 12);
/// First minor release with CSI snapshots enabled by default.
pub const SNAPSHOT_GA_MINOR: u32 = 17;
/// First minor release where the snapshot data source feature gate exists.
pub const SNAPSHOT_FEATURE_GATE_MINOR: u32 = 15;

/// Outcome of one check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Name of the check.
    pub name: String,
    /// Whether it passed.
    pub passed: bool,
    /// What was found.
    pub message: String,
}

impl CheckResult {
    fn from_result(name: &str, res: Result<String>) -> Self {
        match res {
            Ok(message) => CheckResult {
                name: name.to_owned(),
                passed: true,
                message,
            },
            Err(e) => CheckResult {
                name: name.to_owned(),
                passed: false,
                message: e.to_string(),
            },
        }
    }
}

/// Parses a server version into (major, minor). Providers append `+` to the
/// minor version, which is ignored.
pub fn parse_version(version: &ServerVersion) -> Result<(u32, u32)> {
    let number = |field: &str, value: &str| {
        value.trim_end_matches('+').parse::<u32>().map_err(|_| {
            Error::Precondition(format!(
                "Unable to parse Kubernetes {} version ({})",
                field, value
            ))
        })
    };
    Ok((
        number("major", &version.major)?,
        number("minor", &version.minor)?,
    ))
}

/// Runs the baseline checks against a cluster.
pub struct BaselineChecks {
    gateway: Arc<dyn ClusterGateway>,
    namespace: String,
}

impl BaselineChecks {
    /// Checks the cluster behind `gateway`. The feature gate check creates
    /// its claim in `namespace`.
    pub fn new(gateway: Arc<dyn ClusterGateway>, namespace: String) -> Self {
        BaselineChecks { gateway, namespace }
    }

    /// Fails unless the cluster runs at least [`MIN_VERSION`].
    pub async fn kubernetes_version(&self, ctx: &Context) -> Result<ServerVersion> {
        let version = self.gateway.server_version(ctx).await?;
        if parse_version(&version)? < MIN_VERSION {
            return Err(Error::Precondition(format!(
                "Kubernetes version ({}) is older than the minimum supported {}.{}",
                version.git_version, MIN_VERSION.0, MIN_VERSION.1
            )));
        }
        Ok(version)
    }

    /// True when the RBAC API group is served.
    pub async fn rbac_enabled(&self, ctx: &Context) -> Result<bool> {
        let groups = self.gateway.server_groups(ctx).await?;
        Ok(groups.iter().any(|g| g.name == RBAC_GROUP))
    }

    /// True when the aggregation layer serves `v1` or `v1beta1`.
    pub async fn aggregation_layer_enabled(&self, ctx: &Context) -> Result<bool> {
        let groups = self.gateway.server_groups(ctx).await?;
        Ok(groups
            .iter()
            .filter(|g| g.name == AGGREGATION_GROUP)
            .flat_map(|g| g.versions.iter())
            .any(|v| v == "v1" || v == "v1beta1"))
    }

    /// Whether the cluster can take CSI snapshots.
    ///
    /// Releases from 1.17 can; 1.15 and 1.16 can when the
    /// `VolumeSnapshotDataSource` feature gate is on, which is detected by
    /// creating a claim with a snapshot data source and checking whether the
    /// API server kept it.
    pub async fn csi_snapshot_capable(&self, ctx: &Context) -> Result<bool> {
        let version = self.gateway.server_version(ctx).await?;
        let (major, minor) = parse_version(&version)?;
        if major > 1 || minor >= SNAPSHOT_GA_MINOR {
            return Ok(true);
        }
        if minor < SNAPSHOT_FEATURE_GATE_MINOR {
            return Ok(false);
        }
        self.detect_snapshot_data_source(ctx).await
    }

    async fn detect_snapshot_data_source(&self, ctx: &Context) -> Result<bool> {
        let claim: PersistentVolumeClaim = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "generateName": "kubestr-feature-gate-check-",
                "namespace": self.namespace,
                "labels": created_by_labels(),
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": "1Gi" } },
                "dataSource": {
                    "apiGroup": SNAPSHOT_GROUP,
                    "kind": "VolumeSnapshot",
                    "name": "kubestr-feature-gate-check",
                },
            },
        }))?;
        let created = self.gateway.create_pvc(ctx, &self.namespace, &claim).await?;
        let enabled = created
            .spec
            .as_ref()
            .map(|s| s.data_source.is_some())
            .unwrap_or(false);
        debug!(enabled, "Checked VolumeSnapshotDataSource feature gate");

        let name = created.metadata.name.unwrap_or_default();
        let cleanup = Context::with_timeout(CLEANUP_TIMEOUT);
        if let Err(e) = self.gateway.delete_pvc(&cleanup, &self.namespace, &name).await {
            if !e.is_not_found() {
                warn!(pvc = %name, error = %e, "Failed to delete feature gate PVC");
            }
        }
        Ok(enabled)
    }

    /// Runs every check that gates the baseline.
    pub async fn run_all(&self, ctx: &Context) -> Vec<CheckResult> {
        let version = self
            .kubernetes_version(ctx)
            .await
            .map(|v| format!("Valid Kubernetes version ({})", v.git_version));
        let rbac = self.rbac_enabled(ctx).await.and_then(|enabled| {
            if enabled {
                Ok("Kubernetes RBAC is enabled".to_owned())
            } else {
                Err(Error::Precondition("Kubernetes RBAC is not enabled".into()))
            }
        });
        let aggregation = self.aggregation_layer_enabled(ctx).await.and_then(|enabled| {
            if enabled {
                Ok("Kubernetes aggregated layer is enabled".to_owned())
            } else {
                Err(Error::Precondition(
                    "Kubernetes aggregated layer is not enabled".into(),
                ))
            }
        });
        let results = vec![
            CheckResult::from_result("Kubernetes Version Check", version),
            CheckResult::from_result("RBAC Check", rbac),
            CheckResult::from_result("Aggregated Layer Check", aggregation),
        ];
        for result in &results {
            info!(check = %result.name, passed = result.passed, "{}", result.message);
        }
        results
    }
}

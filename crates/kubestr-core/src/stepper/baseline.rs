//! The default report: cluster checks plus the provisioner inventory.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::{Ledger, Workflow};
use crate::checks::CheckResult;
use crate::context::Context;
use crate::error::Result;
use crate::inspector::ProvisionerInfo;
use crate::toolkit::Toolkit;

/// Everything the baseline found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineReport {
    /// Results of the cluster checks.
    pub checks: Vec<CheckResult>,
    /// Whether the cluster can take CSI snapshots.
    pub csi_snapshot_capable: bool,
    /// Provisioners in first-seen order.
    pub provisioners: Vec<ProvisionerInfo>,
}

impl BaselineReport {
    /// True when every cluster check passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Runs the checks and inspects provisioners. Creates nothing beyond the
/// short-lived feature gate claim on 1.15 and 1.16 clusters.
pub struct Baseline {
    toolkit: Toolkit,
}

impl Baseline {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit) -> Self {
        Baseline { toolkit }
    }
}

#[async_trait]
impl Workflow for Baseline {
    type Prerequisites = Vec<CheckResult>;
    type Provisioned = ();
    type Output = BaselineReport;

    fn name(&self) -> &'static str {
        "baseline"
    }

    async fn validate(&self, ctx: &Context) -> Result<Vec<CheckResult>> {
        Ok(self.toolkit.checks().run_all(ctx).await)
    }

    async fn provision(
        &self,
        _ctx: &Context,
        _checks: &Vec<CheckResult>,
        _ledger: &mut Ledger,
    ) -> Result<()> {
        Ok(())
    }

    async fn act(
        &self,
        ctx: &Context,
        checks: &Vec<CheckResult>,
        _provisioned: &(),
        _ledger: &mut Ledger,
    ) -> Result<BaselineReport> {
        let csi_snapshot_capable = match self.toolkit.checks().csi_snapshot_capable(ctx).await {
            Ok(capable) => capable,
            Err(e) => {
                warn!(error = %e, "Unable to determine CSI snapshot support");
                false
            }
        };
        let provisioners = self
            .toolkit
            .inspector()
            .provisioners(ctx, csi_snapshot_capable)
            .await?;
        Ok(BaselineReport {
            checks: checks.clone(),
            csi_snapshot_capable,
            provisioners,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::defaults::{AGGREGATION_GROUP, RBAC_GROUP};
    use crate::gateway::fake::FakeGateway;
    use crate::inspector::{Status, StatusLevel};
    use crate::stepper::test::toolkit;
    use crate::stepper::Stepper;
    use std::sync::Arc;

    #[tokio::test]
    async fn minikube_without_snapshot_classes() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_version("1", "20")
            .with_group(RBAC_GROUP, &["v1"], Some("v1"))
            .with_group(AGGREGATION_GROUP, &["v1"], Some("v1"))
            .with_storage_class("standard", "k8s.io/minikube-hostpath");
        let toolkit = toolkit(&fake);
        let report = Stepper::new(&toolkit, true)
            .run(&Context::background(), &Baseline::new(toolkit.clone()))
            .await
            .unwrap();

        assert!(report.passed());
        assert!(report.csi_snapshot_capable);
        assert_eq!(report.provisioners.len(), 1);
        let provisioner = &report.provisioners[0];
        assert_eq!(provisioner.name, "k8s.io/minikube-hostpath");
        assert!(!provisioner.is_csi);
        assert_eq!(provisioner.storage_classes[0].name, "standard");
        assert_eq!(
            provisioner.storage_classes[0].status,
            vec![Status {
                level: StatusLevel::Info,
                message: "Valid StorageClass.".into()
            }]
        );
        assert!(fake.operations().is_empty());
    }

    #[tokio::test]
    async fn missing_rbac_fails_the_baseline() {
        let fake = Arc::new(FakeGateway::new());
        fake.with_group(AGGREGATION_GROUP, &["v1"], Some("v1"));
        let toolkit = toolkit(&fake);
        let report = Stepper::new(&toolkit, true)
            .run(&Context::background(), &Baseline::new(toolkit.clone()))
            .await
            .unwrap();
        assert!(!report.passed());
        let rbac = report.checks.iter().find(|c| c.name == "RBAC Check").unwrap();
        assert!(!rbac.passed);
        assert_eq!(rbac.message, "Kubernetes RBAC is not enabled");
    }
}

//! Shared handles the workflows are built from.

use std::env;
use std::sync::Arc;

use crate::checks::BaselineChecks;
use crate::cleaner::Cleaner;
use crate::creator::ApplicationCreator;
use crate::defaults::{DEFAULT_NAMESPACE, POD_NAMESPACE_ENV, POD_NAME_ENV};
use crate::gateway::ClusterGateway;
use crate::inspector::ProvisionerInspector;
use crate::snapshot::{SnapshotApi, SnapshotOperator};
use crate::validate::ArgumentValidator;

/// Where the tool itself is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// Namespace the tool runs in (`POD_NAMESPACE`, default `default`).
    pub namespace: String,
    /// Name of the pod the tool runs in (`HOSTNAME`), if any.
    pub pod_name: Option<String>,
}

impl RuntimeEnv {
    /// Builds an environment by hand.
    pub fn new(namespace: impl Into<String>, pod_name: Option<String>) -> Self {
        RuntimeEnv {
            namespace: namespace.into(),
            pod_name,
        }
    }

    /// Reads `POD_NAMESPACE` and `HOSTNAME`.
    pub fn from_env() -> Self {
        let namespace = env::var(POD_NAMESPACE_ENV)
            .ok()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());
        let pod_name = env::var(POD_NAME_ENV).ok().filter(|n| !n.is_empty());
        RuntimeEnv::new(namespace, pod_name)
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        RuntimeEnv::new(DEFAULT_NAMESPACE, None)
    }
}

/// A cluster connection plus the runtime environment, handing out the
/// components that operate on them.
#[derive(Clone)]
pub struct Toolkit {
    gateway: Arc<dyn ClusterGateway>,
    env: RuntimeEnv,
}

impl Toolkit {
    /// Bundles `gateway` and `env`.
    pub fn new(gateway: Arc<dyn ClusterGateway>, env: RuntimeEnv) -> Self {
        Toolkit { gateway, env }
    }

    /// The cluster connection.
    pub fn gateway(&self) -> Arc<dyn ClusterGateway> {
        self.gateway.clone()
    }

    /// The runtime environment.
    pub fn env(&self) -> &RuntimeEnv {
        &self.env
    }

    /// Validates object references.
    pub fn validator(&self) -> ArgumentValidator {
        ArgumentValidator::new(self.gateway.clone())
    }

    /// Creates transient PVCs and pods.
    pub fn creator(&self) -> ApplicationCreator {
        ApplicationCreator::new(self.gateway.clone(), self.env.clone())
    }

    /// Removes transient objects.
    pub fn cleaner(&self) -> Cleaner {
        Cleaner::new(self.gateway.clone())
    }

    /// Operates on snapshot objects of version `api`.
    pub fn snapshots(&self, api: SnapshotApi) -> SnapshotOperator {
        SnapshotOperator::new(self.gateway.clone(), api)
    }

    /// Cluster-wide capability checks.
    pub fn checks(&self) -> BaselineChecks {
        BaselineChecks::new(self.gateway.clone(), self.env.namespace.clone())
    }

    /// A fresh provisioner inspector with empty caches.
    pub fn inspector(&self) -> ProvisionerInspector {
        ProvisionerInspector::new(self.gateway.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_environment() {
        let env = RuntimeEnv::default();
        assert_eq!(env.namespace, "default");
        assert_eq!(env.pod_name, None);
    }
}

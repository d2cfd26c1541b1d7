//! Runs an FIO benchmark against a StorageClass.
//!
//! The job file is copied into a labelled ConfigMap that is mounted into
//! the benchmark pod next to a fresh claim of the class under test. FIO's
//! JSON report is returned both verbatim and parsed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ::fio::{FioReport, JobFile};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    command, exec_checked, provision_pod, provision_pvc, wait_until_ready, CreatedObject, Ledger,
    PodOptions, PodRef, Workflow,
};
use crate::context::Context;
use crate::creator::{CreatePvcArgs, VolumePath};
use crate::defaults::{
    CREATED_BY_FIO_LABEL_KEY, CREATED_BY_FIO_LABEL_VALUE, DEFAULT_FIO_PVC_SIZE,
    KEEP_ALIVE_COMMAND,
};
use crate::error::{Error, Result, StageExt};
use crate::names::created_by_labels;
use crate::toolkit::Toolkit;

/// ConfigMap key holding the StorageClass name.
pub const STORAGE_CLASS_KEY: &str = "storageclass";
/// ConfigMap key holding the claim size.
pub const PVC_SIZE_KEY: &str = "pvcsize";

const DATASET_DIR: &str = "/dataset";
const CONFIG_DIR: &str = "/etc/fio-config";

/// Inputs of a benchmark.
#[derive(Clone, Debug, Default)]
pub struct FioArgs {
    /// StorageClass under test.
    pub storage_class: String,
    /// Size of the benchmarked claim.
    pub pvc_size: Option<String>,
    /// ConfigMap holding the job file.
    pub config_map: Option<String>,
    /// Local job file.
    pub fio_file: Option<PathBuf>,
    /// Pod settings.
    pub pod: PodOptions,
}

/// Outcome of a benchmark.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FioResult {
    /// StorageClass that was benchmarked.
    pub storage_class: String,
    /// Size of the benchmarked claim.
    pub size: String,
    /// Name of the job file.
    pub job: String,
    /// FIO's output as printed.
    #[serde(skip)]
    pub raw: String,
    /// The parsed report.
    pub report: FioReport,
}

/// Finds the job in a caller supplied ConfigMap: the first key that is not
/// one of the bookkeeping keys.
pub fn job_from_config_map(config_map: &ConfigMap) -> Result<JobFile> {
    let name = config_map.metadata.name.as_deref().unwrap_or_default();
    config_map
        .data
        .iter()
        .flatten()
        .find(|(key, _)| key.as_str() != STORAGE_CLASS_KEY && key.as_str() != PVC_SIZE_KEY)
        .map(|(key, contents)| JobFile::new(key.clone(), contents.clone()))
        .ok_or_else(|| {
            Error::InvalidArgument(format!("ConfigMap ({}) does not contain an FIO job", name))
        })
}

/// The benchmark workflow.
pub struct FioWorkflow {
    toolkit: Toolkit,
    args: FioArgs,
}

impl FioWorkflow {
    /// Builds the workflow.
    pub fn new(toolkit: Toolkit, args: FioArgs) -> Self {
        FioWorkflow { toolkit, args }
    }

    fn size(&self) -> &str {
        self.args.pvc_size.as_deref().unwrap_or(DEFAULT_FIO_PVC_SIZE)
    }

    async fn load_job(&self, ctx: &Context) -> Result<JobFile> {
        match (&self.args.config_map, &self.args.fio_file) {
            (Some(_), Some(_)) => Err(Error::InvalidArgument(
                "Either a ConfigMap or a local FIO file may be given, not both".into(),
            )),
            (Some(name), None) => {
                let config_map = self
                    .toolkit
                    .gateway()
                    .get_config_map(ctx, &self.args.pod.namespace, name)
                    .await
                    .stage("Failed to load FIO ConfigMap")?;
                job_from_config_map(&config_map)
            }
            (None, Some(path)) => {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .with_stage(|| format!("Failed to read FIO file {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "fio-job".to_owned());
                Ok(JobFile::new(name, contents))
            }
            (None, None) => Ok(JobFile::default_job()),
        }
    }

    async fn create_config_map(
        &self,
        ctx: &Context,
        job: &JobFile,
        ledger: &mut Ledger,
    ) -> Result<String> {
        let mut labels = created_by_labels();
        labels.insert(
            CREATED_BY_FIO_LABEL_KEY.to_owned(),
            CREATED_BY_FIO_LABEL_VALUE.to_owned(),
        );
        let mut data = BTreeMap::new();
        data.insert(STORAGE_CLASS_KEY.to_owned(), self.args.storage_class.clone());
        data.insert(PVC_SIZE_KEY.to_owned(), self.size().to_owned());
        data.insert(job.name.clone(), job.contents.clone());
        let config_map: ConfigMap = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "generateName": "kubestr-fio-",
                "namespace": self.args.pod.namespace,
                "labels": labels,
            },
            "data": data,
        }))?;
        let created = self
            .toolkit
            .gateway()
            .create_config_map(ctx, &self.args.pod.namespace, &config_map)
            .await?;
        let name = created.metadata.name.unwrap_or_default();
        ledger.record(CreatedObject::FioConfigMap {
            namespace: self.args.pod.namespace.clone(),
            name: name.clone(),
        });
        info!(config_map = %name, job = %job.name, "Created FIO ConfigMap");
        Ok(name)
    }
}

#[async_trait]
impl Workflow for FioWorkflow {
    type Prerequisites = JobFile;
    type Provisioned = PodRef;
    type Output = FioResult;

    fn name(&self) -> &'static str {
        "fio"
    }

    async fn validate(&self, ctx: &Context) -> Result<JobFile> {
        let job = self.load_job(ctx).await?;
        let validator = self.toolkit.validator();
        validator
            .validate_namespace(ctx, &self.args.pod.namespace)
            .await
            .stage("Failed to find namespace")?;
        validator
            .validate_storage_class(ctx, &self.args.storage_class)
            .await
            .stage("Failed to find StorageClass")?;
        debug!(job = %job.name, jobs = ?job.job_names(), "Loaded FIO job");
        Ok(job)
    }

    async fn provision(
        &self,
        ctx: &Context,
        job: &JobFile,
        ledger: &mut Ledger,
    ) -> Result<PodRef> {
        let config_map = self
            .create_config_map(ctx, job, ledger)
            .await
            .stage("Failed to create FIO ConfigMap")?;
        let creator = self.toolkit.creator();
        let pvc = provision_pvc(
            &creator,
            ctx,
            &CreatePvcArgs {
                generate_name: "kubestr-fio-pvc-".to_owned(),
                storage_class: self.args.storage_class.clone(),
                namespace: self.args.pod.namespace.clone(),
                size: Some(self.size().to_owned()),
                ..Default::default()
            },
            ledger,
        )
        .await
        .stage("Failed to create FIO PVC")?;

        let mut pod_args = self.args.pod.pod_args("kubestr-fio-pod-");
        pod_args.command = command(KEEP_ALIVE_COMMAND);
        pod_args
            .pvc_paths
            .insert(pvc.clone(), VolumePath::mount(DATASET_DIR));
        pod_args
            .config_maps
            .insert(config_map, CONFIG_DIR.to_owned());
        let pod = provision_pod(&creator, ctx, &pod_args, ledger)
            .await
            .stage("Failed to create FIO pod")?;
        wait_until_ready(&creator, ctx, &[&pvc], &pod)
            .await
            .stage("FIO pod did not become ready")?;
        Ok(pod)
    }

    async fn act(
        &self,
        ctx: &Context,
        job: &JobFile,
        pod: &PodRef,
        _ledger: &mut Ledger,
    ) -> Result<FioResult> {
        info!(storage_class = %self.args.storage_class, job = %job.name, "Running FIO");
        let raw = exec_checked(
            self.toolkit.gateway().as_ref(),
            ctx,
            pod,
            &[
                "fio".to_owned(),
                "--directory".to_owned(),
                DATASET_DIR.to_owned(),
                format!("{}/{}", CONFIG_DIR, job.name),
                "--output-format=json".to_owned(),
            ],
        )
        .await
        .stage("FIO failed")?;
        let report = ::fio::parse(&raw).map_err(|e| Error::Action(e.to_string()))?;
        Ok(FioResult {
            storage_class: self.args.storage_class.clone(),
            size: self.size().to_owned(),
            job: job.name.clone(),
            raw,
            report,
        })
    }
}

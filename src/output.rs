//! Rendering of workflow results as text or JSON.

use std::fmt::Write;
use std::str::FromStr;

use kubestr_core::checks::CheckResult;
use kubestr_core::inspector::{ProvisionerInfo, Status, StatusLevel};
use kubestr_core::stepper::baseline::BaselineReport;
use kubestr_core::stepper::benchmark::FioResult;
use kubestr_core::stepper::block_mount::BlockMountResult;
use kubestr_core::stepper::browse::BrowseOutput;
use kubestr_core::stepper::csi_restore::CsiRestoreResult;
use kubestr_core::stepper::file_restore::FileRestoreOutput;
use serde::Serialize;

/// How results are printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "unknown output format {:?}; expected text or json",
                other
            )),
        }
    }
}

/// A result with a human readable rendering.
pub trait Render: Serialize {
    fn text(&self) -> String;
}

/// Renders `value` in `format`.
pub fn render<T: Render>(value: &T, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Text => Ok(value.text()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
    }
}

/// Prints `value` on stdout.
pub fn emit<T: Render>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    println!("{}", render(value, format)?);
    Ok(())
}

fn status_line(out: &mut String, indent: &str, status: &Status) {
    let marker = match status.level {
        StatusLevel::Info => "",
        StatusLevel::Warning => "WARNING: ",
        StatusLevel::Error => "ERROR: ",
    };
    let _ = writeln!(out, "{}{}{}", indent, marker, status.message);
}

fn check_text(out: &mut String, check: &CheckResult) {
    let _ = writeln!(out, "{}:", check.name);
    let _ = writeln!(
        out,
        "  {}{}",
        if check.passed { "" } else { "FAILED: " },
        check.message
    );
}

fn provisioner_text(out: &mut String, provisioner: &ProvisionerInfo) {
    let _ = writeln!(out, "{}:", provisioner.name);
    for status in &provisioner.status {
        status_line(out, "    ", status);
    }
    if provisioner.is_csi {
        let _ = writeln!(out, "    This is a CSI driver!");
    }
    if let Some(url) = &provisioner.url {
        let _ = writeln!(out, "    More information can be found here: {}", url);
    }
    let _ = writeln!(out, "    Storage Classes:");
    for sc in &provisioner.storage_classes {
        let _ = writeln!(out, "      * {}", sc.name);
        for status in &sc.status {
            status_line(out, "          ", status);
        }
    }
    if !provisioner.volume_snapshot_classes.is_empty() {
        let _ = writeln!(out, "    Volume Snapshot Classes:");
        for vsc in &provisioner.volume_snapshot_classes {
            let _ = writeln!(out, "      * {}", vsc.name);
            for status in &vsc.status {
                status_line(out, "          ", status);
            }
        }
    }
}

impl Render for BaselineReport {
    fn text(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            check_text(&mut out, check);
        }
        let _ = writeln!(
            out,
            "CSI snapshot support: {}",
            if self.csi_snapshot_capable { "yes" } else { "no" }
        );
        let _ = writeln!(out, "Available Storage Provisioners:");
        for provisioner in &self.provisioners {
            provisioner_text(&mut out, provisioner);
        }
        out
    }
}

impl Render for FioResult {
    fn text(&self) -> String {
        format!(
            "FIO test results:\n  StorageClass: {}\n  Size: {}\n  Job: {}\n\n{}",
            self.storage_class, self.size, self.job, self.report
        )
    }
}

impl Render for CsiRestoreResult {
    fn text(&self) -> String {
        format!(
            "CSI checker test:\n  Created original PVC {} used by pod {}\n  Created snapshot {}\n  Restored PVC {} used by pod {}\n  Marker {} survived the round trip\nCSI application successfully snapshotted and restored.",
            self.original_pvc,
            self.original_pod,
            self.snapshot.name,
            self.cloned_pvc,
            self.cloned_pod,
            self.marker
        )
    }
}

impl Render for BrowseOutput {
    fn text(&self) -> String {
        match self {
            BrowseOutput::Tree { listing } => listing.trim_end().to_owned(),
            BrowseOutput::Served { url } => format!("Stopped serving {}", url),
        }
    }
}

impl Render for FileRestoreOutput {
    fn text(&self) -> String {
        match self {
            FileRestoreOutput::Copied { path, pvc } => {
                format!("Restored {} from the snapshot into PVC {}", path, pvc)
            }
            FileRestoreOutput::Served { url } => format!("Stopped serving {}", url),
        }
    }
}

impl Render for BlockMountResult {
    fn text(&self) -> String {
        format!(
            "Block mount check for StorageClass {}:\n  {}\nStorageClass supports raw block volumes.",
            self.storage_class, self.listing
        )
    }
}

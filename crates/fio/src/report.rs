//! Typed model of FIO's JSON report.
//!
//! Only the fields the summary needs are modelled; everything else FIO
//! emits is ignored on deserialization.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Failures turning FIO output into a [`FioReport`].
#[derive(Error, Debug)]
pub enum ParseError {
    /// FIO printed nothing that looks like a JSON document.
    #[error("fio output did not contain a JSON report")]
    MissingReport,
    /// The JSON document could not be decoded.
    #[error("unable to parse fio output: {0}")]
    Json(#[from] serde_json::Error),
    /// The report decoded but holds no jobs.
    #[error("fio report contains no jobs")]
    NoJobs,
}

/// The top level FIO report.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FioReport {
    /// Version string of the fio binary that ran the jobs.
    #[serde(rename = "fio version", default)]
    pub fio_version: String,
    /// Human readable time the run finished.
    #[serde(default)]
    pub time: String,
    /// Options from the `[global]` section.
    #[serde(rename = "global options", default)]
    pub global_options: BTreeMap<String, String>,
    /// One entry per job, in job file order.
    #[serde(default)]
    pub jobs: Vec<FioJob>,
    /// Per device utilisation.
    #[serde(default)]
    pub disk_util: Vec<DiskUtil>,
}

/// Results of a single FIO job.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FioJob {
    /// Job name.
    #[serde(default)]
    pub jobname: String,
    /// Non-zero when the job failed.
    #[serde(default)]
    pub error: i64,
    /// Options as written in the job section.
    #[serde(rename = "job options", default)]
    pub job_options: BTreeMap<String, String>,
    /// Read statistics.
    #[serde(default)]
    pub read: FioStats,
    /// Write statistics.
    #[serde(default)]
    pub write: FioStats,
}

/// Bandwidth and IOPS statistics for one direction of a job.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FioStats {
    /// Bytes transferred.
    #[serde(default)]
    pub io_bytes: u64,
    /// Average bandwidth in KiB/s.
    #[serde(default)]
    pub bw: f64,
    /// Average IOPS.
    #[serde(default)]
    pub iops: f64,
    /// Runtime in milliseconds.
    #[serde(default)]
    pub runtime: u64,
    /// Total IOs issued.
    #[serde(default)]
    pub total_ios: u64,
    /// Minimum sampled bandwidth in KiB/s.
    #[serde(default)]
    pub bw_min: f64,
    /// Maximum sampled bandwidth in KiB/s.
    #[serde(default)]
    pub bw_max: f64,
    /// Mean sampled bandwidth in KiB/s.
    #[serde(default)]
    pub bw_mean: f64,
    /// Minimum sampled IOPS.
    #[serde(default)]
    pub iops_min: f64,
    /// Maximum sampled IOPS.
    #[serde(default)]
    pub iops_max: f64,
    /// Mean sampled IOPS.
    #[serde(default)]
    pub iops_mean: f64,
}

/// Utilisation of a block device during the run.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DiskUtil {
    /// Device name.
    #[serde(default)]
    pub name: String,
    /// Read IOs completed.
    #[serde(default)]
    pub read_ios: u64,
    /// Write IOs completed.
    #[serde(default)]
    pub write_ios: u64,
    /// Device utilisation in percent.
    #[serde(default)]
    pub util: f64,
}

/// Parses the stdout of `fio --output-format=json`.
///
/// fio may print warnings ahead of the report, so anything before the first
/// `{` is skipped.
pub fn parse(output: &str) -> Result<FioReport, ParseError> {
    let start = output.find('{').ok_or(ParseError::MissingReport)?;
    if start > 0 {
        debug!(
            skipped = %output[..start].trim(),
            "Ignoring text ahead of fio report"
        );
    }
    let report: FioReport = serde_json::from_str(&output[start..])?;
    if report.jobs.is_empty() {
        return Err(ParseError::NoJobs);
    }
    Ok(report)
}

impl FioStats {
    fn is_empty(&self) -> bool {
        self.iops == 0.0 && self.bw == 0.0 && self.total_ios == 0
    }
}

impl FioJob {
    fn option(&self, keys: &[&str]) -> &str {
        keys.iter()
            .find_map(|k| self.job_options.get(*k))
            .map(String::as_str)
            .unwrap_or("")
    }
}

impl fmt::Display for FioStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  IOPS={:.2} BW(KiB/s)={:.0}", self.iops, self.bw)?;
        writeln!(
            f,
            "  iops: min={:.0} max={:.0} avg={:.2}",
            self.iops_min, self.iops_max, self.iops_mean
        )?;
        writeln!(
            f,
            "  bw(KiB/s): min={:.0} max={:.0} avg={:.2}",
            self.bw_min, self.bw_max, self.bw_mean
        )
    }
}

impl fmt::Display for FioJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JobName: {}", self.jobname)?;
        writeln!(
            f,
            "  blocksize={} filesize={} iodepth={} rw={}",
            self.option(&["bs", "blocksize"]),
            self.option(&["size", "filesize"]),
            self.option(&["iodepth"]),
            self.option(&["rw", "readwrite"]),
        )?;
        if !self.read.is_empty() {
            writeln!(f, "read:")?;
            write!(f, "{}", self.read)?;
        }
        if !self.write.is_empty() {
            writeln!(f, "write:")?;
            write!(f, "{}", self.write)?;
        }
        Ok(())
    }
}

impl fmt::Display for FioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for job in &self.jobs {
            writeln!(f, "{}", job)?;
        }
        if !self.disk_util.is_empty() {
            writeln!(f, "Disk stats (read/write):")?;
            for disk in &self.disk_util {
                writeln!(
                    f,
                    "  {}: ios={}/{} util={:.2}%",
                    disk.name, disk.read_ios, disk.write_ios, disk.util
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const REPORT: &str = r#"{
      "fio version" : "fio-3.20",
      "time" : "Thu Oct 15 18:21:19 2020",
      "global options" : { "randrepeat" : "0", "direct" : "1" },
      "jobs" : [
        {
          "jobname" : "read_iops",
          "error" : 0,
          "job options" : { "name" : "read_iops", "bs" : "4K", "iodepth" : "64", "size" : "2G", "rw" : "randread" },
          "read" : { "io_bytes" : 61046784, "bw" : 3973, "iops" : 982.05, "runtime" : 15005, "total_ios" : 14904,
                     "bw_min" : 3336, "bw_max" : 4600, "bw_mean" : 3978.5, "iops_min" : 834, "iops_max" : 1150, "iops_mean" : 994.4 },
          "write" : { "io_bytes" : 0, "bw" : 0, "iops" : 0.0, "runtime" : 0, "total_ios" : 0 }
        },
        {
          "jobname" : "write_iops",
          "error" : 0,
          "job options" : { "name" : "write_iops", "bs" : "4K", "iodepth" : "64", "size" : "2G", "readwrite" : "randwrite" },
          "read" : { "io_bytes" : 0, "bw" : 0, "iops" : 0.0, "runtime" : 0, "total_ios" : 0 },
          "write" : { "io_bytes" : 23810048, "bw" : 1561, "iops" : 390.52, "runtime" : 15053, "total_ios" : 5813,
                      "bw_min" : 1000, "bw_max" : 2000, "bw_mean" : 1560.1, "iops_min" : 250, "iops_max" : 500, "iops_mean" : 390.1 }
        }
      ],
      "disk_util" : [ { "name" : "rbd4", "read_ios" : 16117, "write_ios" : 7003, "util" : 99.5 } ]
    }"#;

    #[test]
    fn parses_jobs_in_order() {
        let report = parse(REPORT).expect("report should parse");
        assert_eq!(report.fio_version, "fio-3.20");
        assert_eq!(report.jobs.len(), 2);
        assert_eq!(report.jobs[0].read.iops, 982.05);
        assert_eq!(report.jobs[1].write.iops, 390.52);
        assert_eq!(report.disk_util[0].name, "rbd4");
    }

    #[test]
    fn summary_mentions_both_directions() {
        let summary = parse(REPORT).unwrap().to_string();
        assert!(summary.contains("JobName: read_iops"));
        assert!(summary.contains("blocksize=4K filesize=2G iodepth=64 rw=randread"));
        assert!(summary.contains("IOPS=982.05"));
        assert!(summary.contains("rw=randwrite"));
        assert!(summary.contains("IOPS=390.52"));
        assert!(summary.contains("rbd4: ios=16117/7003"));
    }

    #[test]
    fn leading_warnings_are_skipped() {
        let noisy = format!("fio: native_fallocate call failed\n{}", REPORT);
        assert!(parse(&noisy).is_ok());
    }

    #[test]
    fn rejects_output_without_report() {
        assert!(matches!(
            parse("fio: failed to open /dataset"),
            Err(ParseError::MissingReport)
        ));
        assert!(matches!(parse(r#"{"jobs": []}"#), Err(ParseError::NoJobs)));
        assert!(matches!(parse("{ not json"), Err(ParseError::Json(_))));
    }
}

//! Built-in FIO job files.

/// Name of the built-in job used when the caller brings none of their own.
pub const DEFAULT_JOB_NAME: &str = "default-fio";

const DEFAULT_JOB_FILE: &str = r#"[global]
randrepeat=0
verify=0
ioengine=libaio
direct=1
gtod_reduce=1
[job1]
name=read_iops
bs=4K
iodepth=64
size=2G
readwrite=randread
time_based
ramp_time=2s
runtime=15s
[job2]
name=write_iops
bs=4K
iodepth=64
size=2G
readwrite=randwrite
time_based
ramp_time=2s
runtime=15s
"#;

/// A named FIO job file.
///
/// The name is used as the key under which the file is stored in a
/// ConfigMap and therefore as the file name inside the FIO pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFile {
    /// Key of the job file.
    pub name: String,
    /// Raw FIO job file contents.
    pub contents: String,
}

impl JobFile {
    /// Creates a job file from a name and its contents.
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        JobFile {
            name: name.into(),
            contents: contents.into(),
        }
    }

    /// The built-in random read / random write job.
    pub fn default_job() -> Self {
        JobFile::new(DEFAULT_JOB_NAME, DEFAULT_JOB_FILE)
    }

    /// Returns the names of the jobs declared in the file, skipping the
    /// `[global]` section. A job's `name=` option wins over its section
    /// header.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut in_job = false;
        for line in self.contents.lines().map(str::trim) {
            if line.starts_with('[') && line.ends_with(']') {
                let section = &line[1..line.len() - 1];
                in_job = section != "global";
                if in_job {
                    names.push(section.to_owned());
                }
            } else if in_job {
                if let Some(name) = line.strip_prefix("name=") {
                    if let Some(last) = names.last_mut() {
                        *last = name.trim().to_owned();
                    }
                }
            }
        }
        names
    }
}

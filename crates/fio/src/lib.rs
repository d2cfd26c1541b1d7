//! FIO job templates and a typed model of the JSON report written by
//! `fio --output-format=json`.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod report;
pub mod template;

#[doc(inline)]
pub use report::{parse, FioJob, FioReport, FioStats, ParseError};
#[doc(inline)]
pub use template::{JobFile, DEFAULT_JOB_NAME};

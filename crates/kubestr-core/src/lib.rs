//! The ephemeral-workload engine behind `kubestr`.
//!
//! Every feature of the tool follows the same shape: validate a handful of
//! related cluster objects, provision a short-lived PersistentVolumeClaim and
//! a Pod that mounts it, wait for them to become ready, run a feature
//! specific action and finally remove everything that was created. The
//! [`Stepper`](stepper::Stepper) owns that protocol; the individual
//! workflows under [`stepper`] only supply the validate / provision / act
//! steps.
//!
//! All cluster access goes through the [`ClusterGateway`] trait so the
//! workflows can be exercised against an in-memory cluster in tests.

#![warn(missing_docs)]

pub mod checks;
pub mod cleaner;
pub mod context;
pub mod creator;
pub mod defaults;
pub mod error;
pub mod gateway;
pub mod inspector;
pub mod names;
pub mod portforward;
pub mod snapshot;
pub mod stepper;
pub mod toolkit;
pub mod validate;

#[doc(inline)]
pub use context::Context;
#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(inline)]
pub use gateway::{ClusterGateway, KubeGateway};
#[doc(inline)]
pub use toolkit::{RuntimeEnv, Toolkit};

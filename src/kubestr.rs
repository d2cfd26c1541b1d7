use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kubestr_core::portforward::PortForwardOptions;
use kubestr_core::stepper::baseline::Baseline;
use kubestr_core::stepper::benchmark::{FioArgs, FioWorkflow};
use kubestr_core::stepper::block_mount::{BlockMount, BlockMountArgs};
use kubestr_core::stepper::browse::{
    BrowseOptions, PvcBrowse, PvcBrowseArgs, SnapshotBrowse, SnapshotBrowseArgs,
};
use kubestr_core::stepper::csi_restore::{CsiRestore, CsiRestoreArgs};
use kubestr_core::stepper::file_restore::{FileRestore, FileRestoreArgs};
use kubestr_core::stepper::{PodOptions, Stepper};
use kubestr_core::context::cancel_on_signal;
use kubestr_core::{Context, KubeGateway, RuntimeEnv, Toolkit};
use structopt::clap::ErrorKind as ClapErrorKind;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod output;

use output::{emit, OutputFormat};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "kubestr",
    about = "Explores the storage options of a Kubernetes cluster. Without a subcommand it checks the cluster and lists its storage provisioners."
)]
struct Opts {
    #[structopt(
        short = "o",
        long = "output",
        default_value = "text",
        possible_values = &["text", "json"],
        help = "Output format"
    )]
    output: OutputFormat,

    #[structopt(
        long = "timeout",
        default_value = "300",
        help = "Seconds a run may take before it is abandoned"
    )]
    timeout: u64,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(StructOpt, Debug, Clone)]
struct CommonOpts {
    #[structopt(
        short = "n",
        long = "namespace",
        env = "POD_NAMESPACE",
        default_value = "default",
        help = "Namespace for the objects the run creates"
    )]
    namespace: String,

    #[structopt(
        short = "u",
        long = "runasuser",
        help = "User ID the created pods run as; also used as their fsGroup"
    )]
    run_as_user: Option<i64>,

    #[structopt(
        short = "i",
        long = "image",
        help = "Image for the created pods, replacing the kubestr image"
    )]
    image: Option<String>,

    #[structopt(
        long = "node-selector",
        use_delimiter = true,
        help = "Node selector for the created pods as key=value pairs separated by ','"
    )]
    node_selector: Vec<String>,

    #[structopt(
        name = "cleanup",
        long = "cleanup",
        overrides_with = "no-cleanup",
        help = "Delete the created objects when done (the default)"
    )]
    cleanup: bool,

    #[structopt(
        name = "no-cleanup",
        long = "no-cleanup",
        overrides_with = "cleanup",
        help = "Leave the created objects in place"
    )]
    no_cleanup: bool,
}

impl CommonOpts {
    // The two flags override each other, so at most one is set.
    fn cleanup(&self) -> bool {
        self.cleanup || !self.no_cleanup
    }

    fn pod_options(&self) -> anyhow::Result<PodOptions> {
        let mut node_selector = BTreeMap::new();
        for pair in &self.node_selector {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("node selector {:?} is not key=value", pair))?;
            node_selector.insert(key.to_owned(), value.to_owned());
        }
        Ok(PodOptions {
            namespace: self.namespace.clone(),
            run_as_user: self.run_as_user,
            container_image: self.image.clone(),
            node_selector,
        })
    }
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Benchmarks a StorageClass with FIO
    Fio {
        #[structopt(short = "s", long = "storageclass", help = "StorageClass to benchmark")]
        storage_class: String,

        #[structopt(
            short = "z",
            long = "size",
            help = "Size of the benchmarked PVC [default: 100Gi]"
        )]
        size: Option<String>,

        #[structopt(
            short = "c",
            long = "configmap",
            conflicts_with = "fiofile",
            help = "ConfigMap holding the FIO job file"
        )]
        config_map: Option<String>,

        #[structopt(
            name = "fiofile",
            short = "f",
            long = "fiofile",
            parse(from_os_str),
            help = "Local FIO job file"
        )]
        fio_file: Option<PathBuf>,

        #[structopt(flatten)]
        common: CommonOpts,
    },

    /// Checks that a CSI driver can snapshot and restore a volume
    Csicheck {
        #[structopt(short = "s", long = "storageclass", help = "StorageClass to provision from")]
        storage_class: String,

        #[structopt(
            short = "v",
            long = "volumesnapshotclass",
            help = "VolumeSnapshotClass to snapshot with"
        )]
        volume_snapshot_class: String,

        #[structopt(long = "skipcfscheck", help = "Skip the create-from-source check")]
        skip_cfs_check: bool,

        #[structopt(flatten)]
        common: CommonOpts,
    },

    /// Browses the contents of a PVC or a snapshot
    Browse(BrowseCommand),

    /// Restores files from a snapshot into its source PVC
    Filerestore {
        #[structopt(short = "s", long = "fromSnapshot", help = "Snapshot to restore from")]
        snapshot: String,

        #[structopt(
            short = "v",
            long = "toPVC",
            help = "PVC to restore into [default: the snapshot's source PVC]"
        )]
        pvc: Option<String>,

        #[structopt(
            short = "p",
            long = "path",
            help = "Absolute path to copy; without it a file browser is served"
        )]
        path: Option<String>,

        #[structopt(
            long = "localport",
            default_value = "8080",
            help = "Local port for the file browser"
        )]
        local_port: u16,

        #[structopt(flatten)]
        common: CommonOpts,
    },

    /// Checks that a StorageClass can provision raw block volumes
    Blockmount {
        #[structopt(short = "s", long = "storageclass", help = "StorageClass to check")]
        storage_class: String,

        #[structopt(short = "z", long = "size", help = "Size of the block PVC [default: 1Gi]")]
        size: Option<String>,

        #[structopt(flatten)]
        common: CommonOpts,
    },
}

#[derive(StructOpt, Debug)]
enum BrowseCommand {
    /// Browses a PVC through a snapshot of it
    Pvc {
        #[structopt(help = "PVC to browse")]
        pvc: String,

        #[structopt(
            short = "v",
            long = "volumesnapshotclass",
            help = "VolumeSnapshotClass used to snapshot the PVC"
        )]
        volume_snapshot_class: String,

        #[structopt(
            long = "localport",
            default_value = "8080",
            help = "Local port for the file browser"
        )]
        local_port: u16,

        #[structopt(
            long = "show-tree",
            help = "Print the directory tree instead of serving a browser"
        )]
        show_tree: bool,

        #[structopt(flatten)]
        common: CommonOpts,
    },

    /// Browses a snapshot
    Snapshot {
        #[structopt(help = "Snapshot to browse")]
        snapshot: String,

        #[structopt(
            short = "s",
            long = "storageclass",
            help = "StorageClass to restore into [default: the first class of the snapshot's driver]"
        )]
        storage_class: Option<String>,

        #[structopt(
            long = "localport",
            default_value = "8080",
            help = "Local port for the file browser"
        )]
        local_port: u16,

        #[structopt(
            long = "show-tree",
            help = "Print the directory tree instead of serving a browser"
        )]
        show_tree: bool,

        #[structopt(flatten)]
        common: CommonOpts,
    },
}

fn browse_options(local_port: u16, show_tree: bool) -> BrowseOptions {
    BrowseOptions {
        show_tree,
        forward: PortForwardOptions::new(local_port),
    }
}

/// Runs the selected workflow. Returns whether the cluster passed.
async fn execute(opts: Opts) -> anyhow::Result<bool> {
    let interrupt = CancellationToken::new();
    let _signals = cancel_on_signal(interrupt.clone());
    let ctx = Context::with_timeout(Duration::from_secs(opts.timeout)).with_cancellation(interrupt);
    let gateway = KubeGateway::try_default()
        .await
        .context("Failed to load a Kubernetes configuration")?;
    let toolkit = Toolkit::new(Arc::new(gateway), RuntimeEnv::from_env());
    let format = opts.output;

    match opts.command {
        None => {
            let report = Stepper::new(&toolkit, true)
                .run(&ctx, &Baseline::new(toolkit.clone()))
                .await?;
            emit(&report, format)?;
            Ok(report.passed())
        }
        Some(Command::Fio {
            storage_class,
            size,
            config_map,
            fio_file,
            common,
        }) => {
            let workflow = FioWorkflow::new(
                toolkit.clone(),
                FioArgs {
                    storage_class,
                    pvc_size: size,
                    config_map,
                    fio_file,
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
        Some(Command::Csicheck {
            storage_class,
            volume_snapshot_class,
            skip_cfs_check,
            common,
        }) => {
            let workflow = CsiRestore::new(
                toolkit.clone(),
                CsiRestoreArgs {
                    storage_class,
                    volume_snapshot_class,
                    skip_cfs_check,
                    marker: None,
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
        Some(Command::Browse(BrowseCommand::Pvc {
            pvc,
            volume_snapshot_class,
            local_port,
            show_tree,
            common,
        })) => {
            let workflow = PvcBrowse::new(
                toolkit.clone(),
                PvcBrowseArgs {
                    pvc,
                    volume_snapshot_class,
                    browse: browse_options(local_port, show_tree),
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
        Some(Command::Browse(BrowseCommand::Snapshot {
            snapshot,
            storage_class,
            local_port,
            show_tree,
            common,
        })) => {
            let workflow = SnapshotBrowse::new(
                toolkit.clone(),
                SnapshotBrowseArgs {
                    snapshot,
                    storage_class,
                    browse: browse_options(local_port, show_tree),
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
        Some(Command::Filerestore {
            snapshot,
            pvc,
            path,
            local_port,
            common,
        }) => {
            let workflow = FileRestore::new(
                toolkit.clone(),
                FileRestoreArgs {
                    snapshot,
                    pvc,
                    path,
                    forward: PortForwardOptions::new(local_port),
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
        Some(Command::Blockmount {
            storage_class,
            size,
            common,
        }) => {
            let workflow = BlockMount::new(
                toolkit.clone(),
                BlockMountArgs {
                    storage_class,
                    pvc_size: size,
                    pod: common.pod_options()?,
                },
            );
            let result = Stepper::new(&toolkit, common.cleanup())
                .run(&ctx, &workflow)
                .await?;
            emit(&result, format)?;
            Ok(true)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn run(opts: Opts) -> i32 {
    init_tracing();
    match execute(opts).await {
        Ok(true) => 0,
        Ok(false) => {
            error!("The cluster did not pass all checks");
            1
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "kubestr failed");
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn main() {
    let code = match Opts::from_iter_safe(std::env::args_os()) {
        Ok(opts) => run(opts),
        Err(e) => match e.kind {
            ClapErrorKind::HelpDisplayed | ClapErrorKind::VersionDisplayed => {
                println!("{}", e.message);
                0
            }
            _ => {
                eprintln!("{}", e.message);
                2
            }
        },
    };
    std::process::exit(code);
}

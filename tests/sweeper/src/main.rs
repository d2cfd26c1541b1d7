//! Deletes objects a kubestr run left behind, for example after `--no-cleanup`
//! or an interrupted run. Everything carrying the kubestr label is a target.

use std::sync::Arc;

use kubestr_core::cleaner::{Cleaner, Leftover};
use kubestr_core::snapshot::SnapshotApi;
use kubestr_core::{Context, ErrorKind, KubeGateway, RuntimeEnv, Toolkit};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let result = sweep_all_leftovers().await;

    match &result {
        Ok(message) => println!("{}", message),
        Err(e) => println!("{}", e),
    };

    result.map(|_| ())
}

async fn sweep_all_leftovers() -> anyhow::Result<&'static str> {
    let gateway = KubeGateway::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to acquire Kubernetes client: {}", e))?;
    let toolkit = Toolkit::new(Arc::new(gateway), RuntimeEnv::from_env());
    let ctx = Context::background();

    let snapshots = snapshot_api(&toolkit, &ctx).await?;
    let cleaner = toolkit.cleaner();

    println!("Finding kubestr objects...");
    let leftovers = cleaner.find_leftovers(&ctx, snapshots).await?;

    if leftovers.is_empty() {
        return Ok("No kubestr objects found");
    }
    if !confirm_sweep(&leftovers) {
        return Ok("Operation cancelled");
    }

    // Leftovers arrive in removal order. A kind is only started once the
    // kinds before it are gone.
    let mut remaining = leftovers.as_slice();
    while let Some(first) = remaining.first() {
        let count = remaining.iter().take_while(|l| l.kind == first.kind).count();
        let (batch, rest) = remaining.split_at(count);
        remaining = rest;

        let removals = batch
            .iter()
            .map(|l| remove_leftover(&cleaner, &ctx, snapshots, l));
        let results = futures::future::join_all(removals).await;
        let (_, errors) = results.partition_success();
        if !errors.is_empty() {
            return Err(sweep_failure_error(&errors));
        }
    }

    Ok("All kubestr objects deleted; volumes may take a moment to be released")
}

/// The snapshot API version the cluster serves, if any.
async fn snapshot_api(toolkit: &Toolkit, ctx: &Context) -> anyhow::Result<Option<SnapshotApi>> {
    match toolkit.validator().csi_snapshot_group_version(ctx).await {
        Ok(api) => Ok(Some(api)),
        // No snapshot CRDs means no snapshot objects to sweep.
        Err(e) if e.kind() == ErrorKind::Precondition => {
            println!("Skipping snapshot objects: {}", e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove_leftover(
    cleaner: &Cleaner,
    ctx: &Context,
    snapshots: Option<SnapshotApi>,
    leftover: &Leftover,
) -> anyhow::Result<()> {
    cleaner
        .remove(ctx, snapshots, leftover)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", leftover, e))
}

fn sweep_failure_error(errors: &[anyhow::Error]) -> anyhow::Error {
    let message_list = errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::anyhow!("Some kubestr objects were not deleted:\n{}", message_list)
}

fn confirm_sweep(leftovers: &[Leftover]) -> bool {
    println!("Delete these objects?");
    for leftover in leftovers {
        println!("  {}", leftover);
    }
    println!("(y/n) ");
    let mut response = String::new();
    match std::io::stdin().read_line(&mut response) {
        Err(e) => {
            eprintln!("Error reading response: {}", e);
            confirm_sweep(leftovers)
        }
        Ok(_) => response.starts_with('y') || response.starts_with('Y'),
    }
}

trait ResultSequence {
    type SuccessItem;
    type FailureItem;
    fn partition_success(self) -> (Vec<Self::SuccessItem>, Vec<Self::FailureItem>);
}

impl<T, E> ResultSequence for Vec<Result<T, E>> {
    type SuccessItem = T;
    type FailureItem = E;
    fn partition_success(self) -> (Vec<Self::SuccessItem>, Vec<Self::FailureItem>) {
        let mut successes = vec![];
        let mut failures = vec![];
        for result in self {
            match result {
                Ok(value) => successes.push(value),
                Err(e) => failures.push(e),
            }
        }
        (successes, failures)
    }
}

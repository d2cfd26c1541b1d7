//! Serves a pod port on localhost until the user stops it.
//!
//! Three tasks cooperate: the forwarder drives the gateway's port-forward,
//! the signal task turns SIGINT or SIGTERM into a cancelled stop token and
//! the calling task coordinates, reporting readiness once the local
//! listener is up and returning when the forward ends. A stop requested by
//! a signal is a normal, successful exit.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{cancel_on_signal, Context};
use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, PortForwardRequest};
use crate::stepper::PodRef;

/// How to expose a pod port.
#[derive(Clone, Debug)]
pub struct PortForwardOptions {
    /// Local port to listen on.
    pub local_port: u16,
    /// Open the URL in the default browser once serving.
    pub open_browser: bool,
    /// Ends the forward when cancelled. SIGINT, SIGTERM and cancelling the
    /// request context also end it.
    pub stop: CancellationToken,
}

impl PortForwardOptions {
    /// Forwards from `local_port` and opens a browser.
    pub fn new(local_port: u16) -> Self {
        PortForwardOptions {
            local_port,
            open_browser: true,
            stop: CancellationToken::new(),
        }
    }
}

/// URL the forwarded port is reachable at.
pub fn local_url(local_port: u16) -> String {
    format!("http://localhost:{}/", local_port)
}

/// Forwards `pod_port` of `pod` to the local port until stopped.
///
/// Returns the local URL after a clean stop. Failing to establish the
/// forward, or the forward breaking while in use, is an action failure.
pub async fn serve(
    gateway: Arc<dyn ClusterGateway>,
    ctx: &Context,
    pod: &PodRef,
    pod_port: u16,
    options: PortForwardOptions,
) -> Result<String> {
    let stop = options.stop.clone();
    let (ready_tx, ready_rx) = oneshot::channel();
    let request = PortForwardRequest {
        namespace: pod.namespace.clone(),
        pod: pod.name.clone(),
        local_port: options.local_port,
        pod_port,
        ready: ready_tx,
        stop: stop.clone(),
    };
    let setup = ctx.clone();
    let mut forwarder = tokio::spawn(async move { gateway.port_forward(&setup, request).await });
    let signals = cancel_on_signal(stop.clone());
    let url = local_url(options.local_port);

    let res = tokio::select! {
        ready = ready_rx => match ready {
            Ok(()) => {
                announce(&url, options.open_browser);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        debug!("Port-forward stop requested");
                        Ok(())
                    },
                    _ = ctx.cancelled() => {
                        debug!("Request cancelled; stopping port-forward");
                        Ok(())
                    },
                    finished = &mut forwarder => Err(forward_ended(finished)),
                }
            }
            Err(_) => Err(forward_ended((&mut forwarder).await)),
        },
        _ = stop.cancelled() => Ok(()),
        _ = ctx.cancelled() => Err(Error::Cancelled),
    };

    stop.cancel();
    signals.abort();
    if !forwarder.is_finished() {
        if let Err(e) = forwarder.await {
            warn!(error = %e, "Port-forward task did not shut down cleanly");
        }
    }
    res.map(|_| url)
}

fn announce(url: &str, open_browser: bool) {
    info!(%url, "Serving; press Ctrl-C to stop");
    println!("Port-forwarding {}, press Ctrl-C to stop", url);
    if open_browser {
        if let Err(e) = webbrowser::open(url) {
            warn!(error = %e, %url, "Unable to open a browser; visit the URL manually");
        }
    }
}

fn forward_ended(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> Error {
    match finished {
        Ok(Ok(())) => Error::Action("port-forward ended unexpectedly".into()),
        Ok(Err(e)) => Error::Action(format!("port-forward failed: {}", e)),
        Err(e) => Error::Action(format!("port-forward task failed: {}", e)),
    }
}

use std::net::SocketAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use kube::api::{Api, AttachParams, DeleteParams, DynamicObject, ListParams, PostParams};
use k8s_openapi::NamespaceResourceScope;
use kube::discovery::ApiResource;
use kube::Resource;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ApiGroupInfo, ClusterGateway, ExecOutput, ExecTarget, GroupVersionResource,
    PortForwardRequest, ServerVersion,
};
use crate::context::Context;
use crate::error::{Error, Result};

/// [`ClusterGateway`] backed by a live API server.
#[derive(Clone)]
pub struct KubeGateway {
    client: kube::Client,
}

impl KubeGateway {
    /// Wraps an existing client.
    pub fn new(client: kube::Client) -> Self {
        KubeGateway { client }
    }

    /// Connects using the standard kubeconfig / in-cluster discovery.
    pub async fn try_default() -> Result<Self> {
        Ok(KubeGateway::new(kube::Client::try_default().await?))
    }

    fn dynamic_api(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: gvr.api_version(),
            kind: gvr.kind.clone(),
            plural: gvr.resource.clone(),
        };
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

// Maps a 404 from the API server onto the crate's NotFound error so callers
// do not have to inspect kube's error response.
fn lookup_error(kind: &str, name: &str) -> impl FnOnce(kube::Error) -> Error {
    let kind = kind.to_owned();
    let name = name.to_owned();
    move |err| match &err {
        kube::Error::Api(response) if response.code == 404 => Error::not_found(kind, name),
        _ => Error::Kube(err),
    }
}

fn namespaced_or_all<K>(client: kube::Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, namespace)
    }
}

fn list_params(label_selector: &str) -> ListParams {
    if label_selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(label_selector)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_namespace(&self, ctx: &Context, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ctx.run(async { api.get(name).await.map_err(lookup_error("Namespace", name)) })
            .await
    }

    async fn get_storage_class(&self, ctx: &Context, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        ctx.run(async { api.get(name).await.map_err(lookup_error("StorageClass", name)) })
            .await
    }

    async fn list_storage_classes(&self, ctx: &Context) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        ctx.run(async { Ok(api.list(&ListParams::default()).await?.items) })
            .await
    }

    async fn get_csi_driver(&self, ctx: &Context, name: &str) -> Result<CSIDriver> {
        let api: Api<CSIDriver> = Api::all(self.client.clone());
        ctx.run(async { api.get(name).await.map_err(lookup_error("CSIDriver", name)) })
            .await
    }

    async fn get_persistent_volume(&self, ctx: &Context, name: &str) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        ctx.run(async {
            api.get(name)
                .await
                .map_err(lookup_error("PersistentVolume", name))
        })
        .await
    }

    async fn get_pvc(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async {
            api.get(name)
                .await
                .map_err(lookup_error("PersistentVolumeClaim", name))
        })
        .await
    }

    async fn list_pvcs(
        &self,
        ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = namespaced_or_all(self.client.clone(), namespace);
        ctx.run(async { Ok(api.list(&list_params(label_selector)).await?.items) })
            .await
    }

    async fn create_pvc(
        &self,
        ctx: &Context,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { Ok(api.create(&PostParams::default(), pvc).await?) })
            .await
    }

    async fn delete_pvc(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async {
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(lookup_error("PersistentVolumeClaim", name))?;
            Ok(())
        })
        .await
    }

    async fn get_pod(&self, ctx: &Context, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { api.get(name).await.map_err(lookup_error("Pod", name)) })
            .await
    }

    async fn list_pods(
        &self,
        ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = namespaced_or_all(self.client.clone(), namespace);
        ctx.run(async { Ok(api.list(&list_params(label_selector)).await?.items) })
            .await
    }

    async fn create_pod(&self, ctx: &Context, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { Ok(api.create(&PostParams::default(), pod).await?) })
            .await
    }

    async fn delete_pod(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async {
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(lookup_error("Pod", name))?;
            Ok(())
        })
        .await
    }

    async fn get_config_map(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { api.get(name).await.map_err(lookup_error("ConfigMap", name)) })
            .await
    }

    async fn list_config_maps(
        &self,
        ctx: &Context,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = namespaced_or_all(self.client.clone(), namespace);
        ctx.run(async { Ok(api.list(&list_params(label_selector)).await?.items) })
            .await
    }

    async fn create_config_map(
        &self,
        ctx: &Context,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { Ok(api.create(&PostParams::default(), config_map).await?) })
            .await
    }

    async fn delete_config_map(&self, ctx: &Context, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async {
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(lookup_error("ConfigMap", name))?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, ctx: &Context, namespace: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        ctx.run(async { Ok(api.list(&ListParams::default()).await?.items) })
            .await
    }

    async fn get_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(gvr, namespace);
        ctx.run(async { api.get(name).await.map_err(lookup_error(&gvr.kind, name)) })
            .await
    }

    async fn list_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic_api(gvr, namespace);
        ctx.run(async { Ok(api.list(&ListParams::default()).await?.items) })
            .await
    }

    async fn create_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(gvr, namespace);
        ctx.run(async { Ok(api.create(&PostParams::default(), object).await?) })
            .await
    }

    async fn delete_dynamic(
        &self,
        ctx: &Context,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let api = self.dynamic_api(gvr, namespace);
        ctx.run(async {
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(lookup_error(&gvr.kind, name))?;
            Ok(())
        })
        .await
    }

    async fn server_groups(&self, ctx: &Context) -> Result<Vec<ApiGroupInfo>> {
        ctx.run(async {
            let core = self.client.list_core_api_versions().await?;
            let mut groups = vec![ApiGroupInfo {
                name: String::new(),
                versions: core.versions,
                preferred_version: None,
            }];
            let listed = self.client.list_api_groups().await?;
            groups.extend(listed.groups.into_iter().map(|group| ApiGroupInfo {
                name: group.name,
                versions: group.versions.into_iter().map(|v| v.version).collect(),
                preferred_version: group.preferred_version.map(|v| v.version),
            }));
            Ok(groups)
        })
        .await
    }

    async fn server_version(&self, ctx: &Context) -> Result<ServerVersion> {
        ctx.run(async {
            let info = self.client.apiserver_version().await?;
            Ok(ServerVersion {
                major: info.major,
                minor: info.minor,
                git_version: info.git_version,
            })
        })
        .await
    }

    async fn exec(
        &self,
        ctx: &Context,
        target: ExecTarget<'_>,
        command: &[String],
    ) -> Result<ExecOutput> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), target.namespace);
        debug!(
            pod = target.pod,
            container = target.container,
            ?command,
            "Executing command"
        );
        ctx.run(async {
            let params = AttachParams::default()
                .container(target.container)
                .stdin(false)
                .stdout(true)
                .stderr(true);
            let mut attached = api.exec(target.pod, command.to_vec(), &params).await?;

            let stdout = attached.stdout();
            let stderr = attached.stderr();
            let status = attached.take_status();

            let read_stdout = async {
                let mut buf = String::new();
                if let Some(mut stream) = stdout {
                    stream.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = String::new();
                if let Some(mut stream) = stderr {
                    stream.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;

            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached
                .join()
                .await
                .map_err(|e| Error::Action(format!("exec stream failed: {}", e)))?;

            if let Some(status) = status {
                if status.status.as_deref() == Some("Failure") {
                    return Err(Error::Action(format!(
                        "command {:?} failed: {}. stderr: {}",
                        command,
                        status.message.unwrap_or_default(),
                        stderr.trim()
                    )));
                }
            }
            Ok(ExecOutput { stdout, stderr })
        })
        .await
    }

    async fn port_forward(&self, ctx: &Context, request: PortForwardRequest) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let pod = request.pod.clone();
        ctx.run(async { api.get(&pod).await.map_err(lookup_error("Pod", &pod)) })
            .await?;

        let addr = SocketAddr::from(([127, 0, 0, 1], request.local_port));
        let listener = ctx.run(async { Ok(TcpListener::bind(addr).await?) }).await?;
        info!(%addr, pod = %request.pod, port = request.pod_port, "Forwarding");
        // The receiver may have given up already; the forward still runs
        // until stopped.
        let _ = request.ready.send(());

        loop {
            tokio::select! {
                _ = request.stop.cancelled() => {
                    debug!(pod = %request.pod, "Port-forward stopped");
                    break;
                }
                accepted = listener.accept() => {
                    let (connection, peer) = accepted?;
                    debug!(%peer, "Accepted connection");
                    let api = api.clone();
                    let pod = request.pod.clone();
                    let port = request.pod_port;
                    let stop = request.stop.clone();
                    tokio::spawn(async move {
                        let forwarded = forward_connection(&api, &pod, port, connection, stop);
                        if let Err(e) = forwarded.await {
                            warn!(error = %e, %peer, "Forwarded connection failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn forward_connection(
    api: &Api<Pod>,
    pod: &str,
    port: u16,
    mut connection: TcpStream,
    stop: CancellationToken,
) -> Result<()> {
    let mut forwarder = api.portforward(pod, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| Error::Action(format!("port {} is not forwarded for pod {}", port, pod)))?;
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut connection, &mut upstream) => {
            copied?;
        }
        _ = stop.cancelled() => {}
    }
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| Error::Action(format!("port-forward to pod {} failed: {}", pod, e)))
}

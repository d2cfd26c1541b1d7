use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, PostParams};
use serde_json::json;

/// A namespace created for one test and deleted, with everything in it,
/// when the manager goes out of scope.
pub struct TestNamespace {
    name: String,
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let name = self.name.clone();
        let t = std::thread::spawn(move || {
            let rt =
                tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for cleanup");
            rt.block_on(delete_namespace(name))
        });

        let thread_result = t.join();
        let cleanup_result = thread_result.expect("Failed to clean up kubestr test namespace");
        cleanup_result.unwrap()
    }
}

impl TestNamespace {
    pub async fn create(prefix: &str) -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await?;
        let namespaces: Api<Namespace> = Api::all(client);
        let name = format!("{}-{}", prefix, std::process::id());
        let namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        }))?;
        namespaces.create(&PostParams::default(), &namespace).await?;
        Ok(TestNamespace { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// A free function so the Drop implementation can run it on its own runtime.
async fn delete_namespace(name: String) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await?;
    let namespaces: Api<Namespace> = Api::all(client);
    match namespaces.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Error cleaning up namespace {}: {}", name, e)),
    }
}

use crate::error::{
    InClusterConfig, K8sClientGeneration, KubeConfigMissing, KubeconfigBuild, ListServices, Result,
};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use snafu::ResultExt;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Label helm puts on every resource belonging to a release.
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// K8sClient is used to talk to the kube-apiserver.
#[derive(Clone)]
pub(crate) struct K8sClient {
    client: Client,
    namespace: String,
    /// Set only for out-of-cluster execution; propagated to helm subprocesses.
    kubeconfig: Option<PathBuf>,
}

impl K8sClient {
    /// Create a new K8sClient. Credentials come from the in-cluster service account when the
    /// in-cluster environment markers are present, otherwise from the configured kubeconfig
    /// file. Out-of-cluster execution without a kubeconfig path is an error.
    pub(crate) async fn new(namespace: &str, kubeconfig: Option<&Path>) -> Result<Self> {
        let (config, kubeconfig) = if in_cluster() {
            info!("Detected in-cluster environment, using in-cluster config");
            (Config::incluster().context(InClusterConfig)?, None)
        } else {
            let path = kubeconfig.ok_or(KubeConfigMissing.build())?;
            info!(kubeconfig = %path.display(), "Not an in-cluster environment, using kubeconfig");
            let kubeconfig_file =
                Kubeconfig::read_from(path).context(KubeconfigBuild { path })?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig_file, &KubeConfigOptions::default())
                    .await
                    .context(KubeconfigBuild { path })?;
            (config, Some(path.to_path_buf()))
        };

        let client = Client::try_from(config).context(K8sClientGeneration)?;

        Ok(Self {
            client,
            namespace: namespace.to_string(),
            kubeconfig,
        })
    }

    /// This is a getter for the underlying kube::Client.
    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    /// This is a getter for the kubeconfig path, if running out-of-cluster.
    pub(crate) fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// Best-effort check that the target namespace exists. Namespace provisioning is an
    /// operational concern, so absence is logged and never fatal.
    pub(crate) async fn check_namespace(&self) {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get(self.namespace.as_str()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                warn!(
                    namespace = %self.namespace,
                    "Target application namespace not found, please ensure it exists"
                );
            }
            Err(error) => {
                warn!(%error, namespace = %self.namespace, "Error checking namespace");
            }
        }
    }

    /// Collects externally reachable ports for a release: the first Service of type NodePort
    /// or LoadBalancer labeled with the release's instance label that carries at least one
    /// node port supplies the whole map.
    pub(crate) async fn release_node_ports(
        &self,
        release_name: &str,
    ) -> Result<BTreeMap<String, i32>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), self.namespace.as_str());
        let list_params =
            ListParams::default().labels(format!("{INSTANCE_LABEL}={release_name}").as_str());

        let service_list = services
            .list(&list_params)
            .await
            .context(ListServices { release_name })?;

        let mut node_ports: BTreeMap<String, i32> = BTreeMap::new();
        for service in service_list {
            let spec = match service.spec.as_ref() {
                Some(spec) => spec,
                None => continue,
            };
            match spec.type_.as_deref() {
                Some("NodePort") | Some("LoadBalancer") => {}
                _ => continue,
            }
            for port in spec.ports.iter().flatten() {
                if let Some(node_port) = port.node_port {
                    if node_port > 0 {
                        let key = port
                            .name
                            .clone()
                            .filter(|name| !name.is_empty())
                            .unwrap_or_else(|| port.port.to_string());
                        node_ports.insert(key, node_port);
                    }
                }
            }
            if !node_ports.is_empty() {
                break;
            }
        }

        Ok(node_ports)
    }
}

/// In-cluster execution is detected through the service environment markers the kubelet
/// injects into every container.
fn in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        && std::env::var_os("KUBERNETES_SERVICE_PORT").is_some()
}

use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// These are the supported configuration options for the app-store API server. Every option
/// may also be sourced from the environment.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), version)]
#[command(about = "HTTP facade over a Helm chart catalog", long_about = None)]
pub(crate) struct CliArgs {
    /// TCP port the API server listens on.
    #[arg(long, env = "APP_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to the YAML file defining the available charts.
    #[arg(long, env = "CHART_CONFIG_PATH", default_value = "charts.yaml")]
    chart_config: PathBuf,

    /// The Kubernetes Namespace all releases are installed into.
    #[arg(long, env = "APP_INSTALL_NAMESPACE", default_value = "app-store-apps")]
    namespace: String,

    /// Path to a kubeconfig file, for out-of-cluster execution.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// This is the helm storage driver, e.g. secret, configmap, memory, etc.
    #[arg(long, env = "HELM_DRIVER", default_value = "secret")]
    helm_driver: String,

    /// Timeout for helm install and uninstall operations.
    #[arg(long, env = "HELM_TIMEOUT", default_value = "300s")]
    helm_timeout: humantime::Duration,
}

impl CliArgs {
    pub(crate) fn args() -> Self {
        CliArgs::parse()
    }

    /// This returns the API server listen port.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// This returns the chart catalog file path.
    pub(crate) fn chart_config(&self) -> PathBuf {
        self.chart_config.clone()
    }

    /// This returns the Kubernetes Namespace for the Helm releases.
    pub(crate) fn namespace(&self) -> String {
        self.namespace.clone()
    }

    /// This returns the kubeconfig path, falling back to the standard per-user location when
    /// one is not configured.
    pub(crate) fn kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
        })
    }

    /// This returns the helm storage driver.
    pub(crate) fn helm_driver(&self) -> String {
        self.helm_driver.clone()
    }

    /// This returns the timeout for helm install and uninstall operations.
    pub(crate) fn helm_timeout(&self) -> Duration {
        self.helm_timeout.into()
    }
}

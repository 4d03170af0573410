use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use snafu::Snafu;
use std::path::PathBuf;

/// For use with multiple fallible operations which may fail for different reasons, but are
/// defined within the same scope and must return to the outer scope (calling scope) using
/// the try operator -- '?'.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(context(suffix(false)))]
pub(crate) enum Error {
    /// Error for when the chart catalog file could not be read.
    #[snafu(display("Failed to read chart catalog file {}: {}", path.display(), source))]
    CatalogFileRead {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Error for when the chart catalog file could not be parsed.
    #[snafu(display("Failed to parse chart catalog file {}: {}", path.display(), source))]
    CatalogParse {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    /// Error for when a chart name is not present in the loaded catalog.
    #[snafu(display("Chart '{}' not found in configured catalog", name))]
    ChartNotFound { name: String },

    /// Error for when out-of-cluster execution has no kubeconfig path configured.
    #[snafu(display(
        "Kubeconfig path is not set for out-of-cluster configuration and not in-cluster"
    ))]
    KubeConfigMissing,

    /// Error for when the in-cluster Kubernetes configuration could not be loaded.
    #[snafu(display("Failed to load in-cluster Kubernetes config: {}", source))]
    InClusterConfig { source: kube::config::InClusterError },

    /// Error for when a kubeconfig file could not be read or converted into a client config.
    #[snafu(display("Failed to load kubeconfig {}: {}", path.display(), source))]
    KubeconfigBuild {
        source: kube::config::KubeconfigError,
        path: PathBuf,
    },

    /// Error for when Kubernetes API client generation fails.
    #[snafu(display("Failed to generate kubernetes client: {}", source))]
    K8sClientGeneration { source: kube::Error },

    /// Error for a Kubernetes API LIST request for Service resources.
    #[snafu(display(
        "Failed to LIST Kubernetes services for release {}: {}",
        release_name,
        source
    ))]
    ListServices {
        source: kube::Error,
        release_name: String,
    },

    /// Error for a Kubernetes API LIST request for Node resources.
    #[snafu(display("Failed to LIST Kubernetes nodes: {}", source))]
    ListNodes { source: kube::Error },

    /// Error for a metrics API LIST request for node metrics.
    #[snafu(display("Failed to LIST node metrics: {}", source))]
    ListNodeMetrics { source: kube::Error },

    /// Error for when the metrics API request could not be built.
    #[snafu(display("Failed to build node metrics API request: {}", source))]
    MetricsRequest { source: http::Error },

    /// Error for when a cluster query did not complete within its deadline.
    #[snafu(display("Timed out while listing {}", what))]
    ListTimeout { what: String },

    /// Error for when a Helm command could not be executed at all.
    #[snafu(display(
        "Failed to run Helm command,\ncommand: {},\nargs: {:?},\ncommand_error: {}",
        command,
        args,
        source
    ))]
    HelmCommand {
        source: std::io::Error,
        command: String,
        args: Vec<String>,
    },

    /// Error for when the `helm version` command fails.
    #[snafu(display(
        "`helm version` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmVersionCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when Helm v3.x.y is not present in $PATH.
    #[snafu(display("Helm version {} does not start with 'v3.x.y'", version))]
    HelmVersion { version: String },

    /// Error for when the `helm repo update` command fails.
    #[snafu(display(
        "`helm repo update` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmRepoUpdateCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when the `helm history` command fails for a reason other than the release
    /// being absent.
    #[snafu(display(
        "`helm history` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmHistoryCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when the `helm install` command fails.
    #[snafu(display(
        "`helm install` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmInstallCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when the `helm list` command fails.
    #[snafu(display(
        "`helm list` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmListCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when the `helm uninstall` command fails.
    #[snafu(display(
        "`helm uninstall` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmUninstallCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when the `helm status` command fails.
    #[snafu(display(
        "`helm status` command failed,\ncommand: {},\nargs: {:?},\nstd_err: {}",
        command,
        args,
        std_err
    ))]
    HelmStatusCommand {
        command: String,
        args: Vec<String>,
        std_err: String,
    },

    /// Error for when a chart reference could not be resolved against the repository index,
    /// even after a repository synchronization pass.
    #[snafu(display(
        "Could not locate chart '{}' (version '{}') after repo update: {}",
        chart,
        version,
        std_err
    ))]
    ChartResolution {
        chart: String,
        version: String,
        std_err: String,
    },

    /// Error for when a Helm release already exists in the target namespace.
    #[snafu(display("Release '{}' already exists in namespace '{}'", name, namespace))]
    ReleaseAlreadyExists { name: String, namespace: String },

    /// Error for when a Helm release is not found in the target namespace.
    #[snafu(display("Release '{}' not found in namespace '{}'", name, namespace))]
    ReleaseNotFound { name: String, namespace: String },

    /// Error for when the Helm client builder is missing its namespace.
    #[snafu(display("Helm client builder requires a namespace"))]
    HelmClientNs,

    /// Error for when a std::process::Command output could not be converted to a string.
    #[snafu(display("Failed to convert command output to UTF-8 string: {}", source))]
    U8VectorToString { source: std::str::Utf8Error },

    /// Error for when JSON command output could not be deserialized.
    #[snafu(display("Failed to parse JSON for {}: {}", what, source))]
    JsonParse {
        source: serde_json::Error,
        what: String,
    },

    /// Error for when install values could not be serialized to YAML.
    #[snafu(display("Failed to serialize install values to YAML: {}", source))]
    ValuesSerialize { source: serde_yaml::Error },

    /// Error for when the temporary install values file could not be created.
    #[snafu(display("Failed to create temporary values file: {}", source))]
    ValuesFileCreate { source: std::io::Error },

    /// Error for when regular expression parsing or compilation fails.
    #[snafu(display("Failed to compile regex {}: {}", expression, source))]
    RegexCompile {
        source: regex::Error,
        expression: String,
    },

    /// Error for when the HTTP server could not bind its listen address.
    #[snafu(display("Failed to bind HTTP server to {}: {}", addr, source))]
    HttpServerBind {
        source: std::io::Error,
        addr: String,
    },

    /// Error for when the HTTP server exited with an error.
    #[snafu(display("HTTP server exited with an error: {}", source))]
    HttpServerRun { source: std::io::Error },
}

/// A wrapper around Result<T, Error>.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps error variants to HTTP status codes. Handlers never inspect error message text; the
/// not-found/conflict distinction is made once, where the error is produced.
impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::ChartNotFound { .. } | Error::ReleaseNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_map_to_404() {
        let chart = Error::ChartNotFound {
            name: "nginx".to_string(),
        };
        let release = Error::ReleaseNotFound {
            name: "nginx".to_string(),
            namespace: "app-store-apps".to_string(),
        };
        assert_eq!(chart.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(release.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_and_backend_variants_map_to_500() {
        let conflict = Error::ReleaseAlreadyExists {
            name: "nginx".to_string(),
            namespace: "app-store-apps".to_string(),
        };
        let backend = Error::HelmListCommand {
            command: "helm".to_string(),
            args: vec![],
            std_err: "boom".to_string(),
        };
        assert_eq!(conflict.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(backend.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

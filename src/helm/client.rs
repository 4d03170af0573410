use crate::{
    catalog::ChartDefinition,
    error::{
        ChartResolution, HelmClientNs, HelmCommand, HelmHistoryCommand, HelmInstallCommand,
        HelmListCommand, HelmRepoUpdateCommand, HelmStatusCommand, HelmUninstallCommand,
        HelmVersion, HelmVersionCommand, JsonParse, RegexCompile, ReleaseAlreadyExists,
        ReleaseNotFound, Result, U8VectorToString, ValuesFileCreate, ValuesSerialize,
    },
    helm::types::{HelmHistoryRecord, HelmListElement, InstalledRelease, ReleaseInfo},
    k8s::K8sClient,
    vec_to_strings,
};
use regex::Regex;
use serde_json::{Map, Value};
use snafu::{ensure, ResultExt};
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    str,
    sync::Arc,
    time::Duration,
};
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

/// This is a builder for HelmReleaseClient.
#[derive(Default)]
pub(crate) struct HelmReleaseClientBuilder {
    namespace: Option<String>,
    storage_driver: Option<String>,
    kubeconfig: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl HelmReleaseClientBuilder {
    /// This is a builder option to add Namespace. This is mandatory,
    /// because all helm releases are tied to a Namespace.
    #[must_use]
    pub(crate) fn with_namespace<J>(mut self, ns: J) -> Self
    where
        J: ToString,
    {
        self.namespace = Some(ns.to_string());
        self
    }

    /// This is a builder option to set the helm storage driver, e.g. secret, configmap.
    #[must_use]
    pub(crate) fn with_storage_driver<J>(mut self, driver: J) -> Self
    where
        J: ToString,
    {
        self.storage_driver = Some(driver.to_string());
        self
    }

    /// This is a builder option to set a kubeconfig path for out-of-cluster execution. The
    /// path is propagated to every helm subprocess.
    #[must_use]
    pub(crate) fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// This is a builder option to set the install/uninstall timeout.
    #[must_use]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the HelmReleaseClient. Validates that a helm v3 binary is present in $PATH and
    /// runs a best-effort existence check of the target namespace.
    pub(crate) async fn build(self, k8s: &K8sClient) -> Result<HelmReleaseClient> {
        let namespace = self.namespace.ok_or(HelmClientNs.build())?;
        let client = HelmReleaseClient {
            namespace,
            storage_driver: self.storage_driver.unwrap_or_default(),
            kubeconfig: self.kubeconfig,
            timeout: self.timeout.unwrap_or(Duration::from_secs(300)),
            repo_lock: Arc::new(Mutex::new(())),
        };
        client.validate_helm_v3().await?;
        k8s.check_namespace().await;
        Ok(client)
    }
}

/// This type has functions which execute helm commands to fetch info about and modify helm
/// releases in one fixed Namespace.
#[derive(Clone)]
pub(crate) struct HelmReleaseClient {
    namespace: String,
    storage_driver: String,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
    /// Serializes repository add/update passes. Shared across clones, so concurrent callers
    /// on the same logical client block each other.
    repo_lock: Arc<Mutex<()>>,
}

impl HelmReleaseClient {
    /// This creates an empty builder.
    pub(crate) fn builder() -> HelmReleaseClientBuilder {
        HelmReleaseClientBuilder::default()
    }

    /// This is a getter for the bound Namespace.
    pub(crate) fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    /// Prepares a helm Command with the storage driver and kubeconfig environment applied.
    /// Commands run through the tokio process driver, so a slow helm invocation never ties
    /// up a server worker thread.
    fn helm_command(&self) -> Command {
        let mut command = Command::new("helm");
        if !self.storage_driver.is_empty() {
            command.env("HELM_DRIVER", self.storage_driver.as_str());
        }
        if let Some(kubeconfig) = self.kubeconfig.as_ref() {
            command.env("KUBECONFIG", kubeconfig);
        }
        command
    }

    /// Runs command `helm version --short` and validates the output against v3.x.y.
    async fn validate_helm_v3(&self) -> Result<()> {
        let command: &str = "helm";
        let args: Vec<String> = vec_to_strings!["version", "--short"];

        debug!(%command, ?args, "Helm version command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        let stdout_str = str::from_utf8(output.stdout.as_slice()).context(U8VectorToString)?;
        ensure!(
            output.status.success(),
            HelmVersionCommand {
                command: command.to_string(),
                args,
                std_err: str::from_utf8(output.stderr.as_slice())
                    .context(U8VectorToString)?
                    .to_string()
            }
        );

        let expression: &str = r"^(v3\.[0-9]+\.[0-9])";
        if !Regex::new(expression)
            .context(RegexCompile { expression })?
            .is_match(stdout_str)
        {
            return HelmVersion {
                version: stdout_str.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    /// Registers and refreshes each distinct repository referenced by the chart definitions.
    /// The whole pass holds this client's repository lock: concurrent callers block until the
    /// in-flight pass completes, so two near-simultaneous installs cannot corrupt the shared
    /// repository index cache on disk.
    ///
    /// Individual registration failures are logged and skipped. A failure of the final index
    /// refresh is returned as an error; already-registered repositories stand.
    pub(crate) async fn sync_repositories(&self, charts: &[ChartDefinition]) -> Result<()> {
        let _guard = self.repo_lock.lock().await;

        let mut added = 0_usize;
        for (repo_name, repo_url) in repositories_to_sync(charts) {
            info!(repo = %repo_name, url = %repo_url, "Ensuring helm repository");

            let command: &str = "helm";
            let args: Vec<String> =
                vec_to_strings!["repo", "add", repo_name, repo_url, "--force-update"];

            debug!(%command, ?args, "Helm repo add command");

            let output = self
                .helm_command()
                .args(args.clone())
                .output()
                .await
                .context(HelmCommand {
                    command: command.to_string(),
                    args,
                })?;

            if output.status.success() {
                added += 1;
            } else {
                let std_err = String::from_utf8_lossy(output.stderr.as_slice());
                warn!(repo = %repo_name, %std_err, "Failed to add helm repository, skipping");
            }
        }

        if added > 0 {
            info!("Updating helm repository indexes");

            let command: &str = "helm";
            let args: Vec<String> = vec_to_strings!["repo", "update"];

            debug!(%command, ?args, "Helm repo update command");

            let output = self
                .helm_command()
                .args(args.clone())
                .output()
                .await
                .context(HelmCommand {
                    command: command.to_string(),
                    args: args.clone(),
                })?;

            ensure!(
                output.status.success(),
                HelmRepoUpdateCommand {
                    command: command.to_string(),
                    args,
                    std_err: str::from_utf8(output.stderr.as_slice())
                        .context(U8VectorToString)?
                        .to_string()
                }
            );
        }

        Ok(())
    }

    /// Resolution probe: runs `helm show chart <ref> [--version]`, which fails exactly where
    /// repository-aware chart resolution fails (unknown repository, stale index, bad version).
    async fn resolve_chart(&self, chart: &ChartDefinition) -> Result<()> {
        let command: &str = "helm";
        let mut args: Vec<String> = vec_to_strings!["show", "chart", chart.chart()];
        if let Some(version) = chart.version() {
            args.extend(vec_to_strings!["--version", version]);
        }

        debug!(%command, ?args, "Helm show chart command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args,
            })?;

        ensure!(
            output.status.success(),
            ChartResolution {
                chart: chart.chart().to_string(),
                version: chart.version().unwrap_or_default().to_string(),
                std_err: String::from_utf8_lossy(output.stderr.as_slice()).to_string()
            }
        );

        Ok(())
    }

    /// Queries release history (depth 1) for the duplicate pre-check. A "not found" failure
    /// means the name is free. This check and a subsequent install are not atomic across
    /// concurrent callers; helm's own release storage rejects the loser of that race.
    async fn release_exists(&self, release_name: &str) -> Result<bool> {
        let command: &str = "helm";
        let args: Vec<String> = vec_to_strings![
            "history",
            release_name,
            "-n",
            self.namespace,
            "--max",
            "1",
            "-o",
            "json"
        ];

        debug!(%command, ?args, "Helm history command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        if output.status.success() {
            let records: Vec<HelmHistoryRecord> = serde_json::from_slice(output.stdout.as_slice())
                .context(JsonParse {
                    what: "helm history output",
                })?;
            return Ok(!records.is_empty());
        }

        let std_err = str::from_utf8(output.stderr.as_slice()).context(U8VectorToString)?;
        if is_release_not_found(std_err) {
            return Ok(false);
        }

        HelmHistoryCommand {
            command: command.to_string(),
            args,
            std_err: std_err.to_string(),
        }
        .fail()
    }

    /// Installs a chart as a named release in the bound Namespace, waiting for workload
    /// readiness up to the configured timeout. The release name defaults to the chart's
    /// catalog short name.
    pub(crate) async fn install_chart(
        &self,
        chart: &ChartDefinition,
        requested_name: Option<String>,
        values: Option<&Map<String, Value>>,
    ) -> Result<InstalledRelease> {
        let release_name = effective_release_name(requested_name, chart);

        ensure!(
            !self.release_exists(release_name.as_str()).await?,
            ReleaseAlreadyExists {
                name: release_name.clone(),
                namespace: self.namespace.clone()
            }
        );

        if let Err(error) = self.resolve_chart(chart).await {
            warn!(
                %error,
                chart = %chart.chart(),
                "Chart resolution failed, attempting repo update before retry"
            );
            if let Err(error) = self.sync_repositories(std::slice::from_ref(chart)).await {
                warn!(%error, chart = %chart.chart(), "Repo update failed during chart resolution");
            }
            self.resolve_chart(chart).await?;
        }

        // The temp file must outlive the install command run below.
        let values_file = match values {
            Some(values) if !values.is_empty() => {
                let file = tempfile::NamedTempFile::new().context(ValuesFileCreate)?;
                serde_yaml::to_writer(file.as_file(), values).context(ValuesSerialize)?;
                Some(file)
            }
            _ => None,
        };

        let command: &str = "helm";
        let mut args: Vec<String> = vec_to_strings![
            "install",
            release_name,
            chart.chart(),
            "-n",
            self.namespace,
            "--wait",
            "--timeout",
            format!("{}s", self.timeout.as_secs())
        ];
        if let Some(version) = chart.version() {
            args.extend(vec_to_strings!["--version", version]);
        }
        if let Some(file) = values_file.as_ref() {
            args.extend(vec_to_strings!["--values", file.path().display()]);
        }
        args.extend(vec_to_strings!["-o", "json"]);

        info!(
            chart = %chart.chart(),
            release = %release_name,
            namespace = %self.namespace,
            "Installing chart"
        );
        debug!(%command, ?args, "Helm install command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        ensure!(
            output.status.success(),
            HelmInstallCommand {
                command: command.to_string(),
                args,
                std_err: str::from_utf8(output.stderr.as_slice())
                    .context(U8VectorToString)?
                    .to_string()
            }
        );

        let release: InstalledRelease = serde_json::from_slice(output.stdout.as_slice())
            .context(JsonParse {
                what: "helm install output",
            })?;

        info!(
            release = %release.name,
            revision = release.version,
            "Successfully installed chart"
        );
        Ok(release)
    }

    /// Enumerates all releases (any lifecycle status) in the bound Namespace and enriches
    /// each with its externally reachable ports. Port lookup is best-effort: a failure is
    /// logged and yields an empty port map for that release.
    pub(crate) async fn list_releases(&self, k8s: &K8sClient) -> Result<Vec<ReleaseInfo>> {
        let command: &str = "helm";
        let args: Vec<String> = vec_to_strings!["list", "-n", self.namespace, "--all", "-o", "json"];

        debug!(%command, ?args, "Helm list command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        ensure!(
            output.status.success(),
            HelmListCommand {
                command: command.to_string(),
                args,
                std_err: str::from_utf8(output.stderr.as_slice())
                    .context(U8VectorToString)?
                    .to_string()
            }
        );

        let elements: Vec<HelmListElement> = serde_json::from_slice(output.stdout.as_slice())
            .context(JsonParse {
                what: "helm list output",
            })?;

        let mut releases = Vec::with_capacity(elements.len());
        for element in elements {
            let (chart_name, chart_version) = split_chart_field(element.chart.as_str())?;
            let node_ports = match k8s.release_node_ports(element.name.as_str()).await {
                Ok(ports) => ports,
                Err(error) => {
                    warn!(%error, release = %element.name, "Could not list services for release");
                    BTreeMap::new()
                }
            };
            releases.push(ReleaseInfo {
                name: element.name,
                namespace: element.namespace,
                version: element.revision.parse().unwrap_or_default(),
                updated: element.updated,
                status: element.status,
                chart: chart_name,
                chart_version,
                app_version: element.app_version,
                node_ports,
            });
        }

        Ok(releases)
    }

    /// Removes a release from the bound Namespace. An absent release is a typed not-found
    /// error, distinct from other backend failures.
    pub(crate) async fn uninstall_release(&self, release_name: &str) -> Result<()> {
        let command: &str = "helm";
        let args: Vec<String> = vec_to_strings![
            "uninstall",
            release_name,
            "-n",
            self.namespace,
            "--timeout",
            format!("{}s", self.timeout.as_secs())
        ];

        info!(release = %release_name, namespace = %self.namespace, "Uninstalling release");
        debug!(%command, ?args, "Helm uninstall command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        if output.status.success() {
            info!(release = %release_name, "Successfully uninstalled release");
            return Ok(());
        }

        let std_err = str::from_utf8(output.stderr.as_slice()).context(U8VectorToString)?;
        if is_release_not_found(std_err) {
            return ReleaseNotFound {
                name: release_name.to_string(),
                namespace: self.namespace.clone(),
            }
            .fail();
        }

        HelmUninstallCommand {
            command: command.to_string(),
            args,
            std_err: std_err.to_string(),
        }
        .fail()
    }

    /// Returns the full structured status payload for one release, as reported by
    /// `helm status -o json`.
    pub(crate) async fn release_status(&self, release_name: &str) -> Result<Value> {
        let command: &str = "helm";
        let args: Vec<String> =
            vec_to_strings!["status", release_name, "-n", self.namespace, "-o", "json"];

        debug!(%command, ?args, "Helm status command");

        let output = self
            .helm_command()
            .args(args.clone())
            .output()
            .await
            .context(HelmCommand {
                command: command.to_string(),
                args: args.clone(),
            })?;

        if !output.status.success() {
            let std_err = str::from_utf8(output.stderr.as_slice()).context(U8VectorToString)?;
            if is_release_not_found(std_err) {
                return ReleaseNotFound {
                    name: release_name.to_string(),
                    namespace: self.namespace.clone(),
                }
                .fail();
            }
            return HelmStatusCommand {
                command: command.to_string(),
                args,
                std_err: std_err.to_string(),
            }
            .fail();
        }

        serde_json::from_slice(output.stdout.as_slice()).context(JsonParse {
            what: "helm status output",
        })
    }
}

/// Derives the distinct repositories to register for a set of chart definitions. The
/// repository name is the prefix of the chart reference before the first '/'. Malformed
/// references and definitions without a repository URL are skipped.
fn repositories_to_sync(charts: &[ChartDefinition]) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut repositories = Vec::new();

    for chart in charts {
        let repo_url = match chart.repo_url() {
            Some(url) => url,
            None => {
                warn!(
                    chart = %chart.chart(),
                    "Skipping repo for chart: no repository URL configured"
                );
                continue;
            }
        };
        let repo_name = match chart.chart().split_once('/') {
            Some((prefix, _)) if !prefix.is_empty() => prefix,
            _ => {
                warn!(
                    chart = %chart.chart(),
                    "Skipping repo for chart: invalid format, expected repo/chartname"
                );
                continue;
            }
        };
        if seen.insert(repo_name.to_string()) {
            repositories.push((repo_name.to_string(), repo_url.to_string()));
        }
    }

    repositories
}

/// The release name defaults to the chart's catalog short name when the caller supplies none.
fn effective_release_name(requested: Option<String>, chart: &ChartDefinition) -> String {
    requested
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| chart.name().to_string())
}

/// Single point where helm CLI failure text is classified. Helm reports absent releases as
/// "Error: release: not found" on stderr; there is no structured error channel. The full
/// "release: not found" marker is required so that unrelated failures mentioning a missing
/// resource are not mistaken for an absent release.
fn is_release_not_found(std_err: &str) -> bool {
    std_err.contains("release: not found")
}

/// Splits the `chart` field of helm list output ("<name>-<version>") at the hyphen preceding
/// a semver-looking suffix. Output without such a suffix yields an empty version.
fn split_chart_field(chart: &str) -> Result<(String, String)> {
    let expression: &str = r"^(.+?)-(v?[0-9]+\.[0-9]+\.[0-9][0-9A-Za-z.+-]*)$";
    let regex = Regex::new(expression).context(RegexCompile { expression })?;

    match regex.captures(chart) {
        Some(captures) => Ok((captures[1].to_string(), captures[2].to_string())),
        None => Ok((chart.to_string(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ChartDefinition;

    const BITNAMI: &str = "https://charts.bitnami.com/bitnami";

    #[test]
    fn repositories_dedup_by_derived_name() {
        let charts = vec![
            ChartDefinition::new("nginx", "bitnami/nginx", Some("15.1.2"), Some(BITNAMI)),
            ChartDefinition::new("redis", "bitnami/redis", None, Some(BITNAMI)),
            ChartDefinition::new("grafana", "grafana/grafana", None, Some("https://grafana.github.io/helm-charts")),
        ];

        let repositories = repositories_to_sync(charts.as_slice());
        assert_eq!(
            repositories,
            vec![
                ("bitnami".to_string(), BITNAMI.to_string()),
                (
                    "grafana".to_string(),
                    "https://grafana.github.io/helm-charts".to_string()
                ),
            ]
        );
    }

    #[test]
    fn repositories_skip_malformed_and_url_less_charts() {
        let charts = vec![
            // No '/' separator in the chart reference.
            ChartDefinition::new("plain", "plainchart", None, Some(BITNAMI)),
            // No repository URL.
            ChartDefinition::new("local", "local/thing", None, None),
        ];

        assert!(repositories_to_sync(charts.as_slice()).is_empty());
    }

    #[test]
    fn release_name_defaults_to_catalog_short_name() {
        let chart = ChartDefinition::new("nginx", "bitnami/nginx", None, Some(BITNAMI));

        assert_eq!(effective_release_name(None, &chart), "nginx");
        assert_eq!(effective_release_name(Some(String::new()), &chart), "nginx");
        assert_eq!(
            effective_release_name(Some("my-nginx".to_string()), &chart),
            "my-nginx"
        );
    }

    #[test]
    fn chart_field_splits_name_and_version() {
        assert_eq!(
            split_chart_field("nginx-15.1.2").expect("should split"),
            ("nginx".to_string(), "15.1.2".to_string())
        );
        assert_eq!(
            split_chart_field("argo-cd-5.4.3").expect("should split"),
            ("argo-cd".to_string(), "5.4.3".to_string())
        );
        assert_eq!(
            split_chart_field("thing-1.2.3-beta.1").expect("should split"),
            ("thing".to_string(), "1.2.3-beta.1".to_string())
        );
        assert_eq!(
            split_chart_field("versionless").expect("should split"),
            ("versionless".to_string(), String::new())
        );
    }

    #[test]
    fn not_found_classification() {
        assert!(is_release_not_found("Error: release: not found"));
        assert!(is_release_not_found(
            "Error: uninstall: Release not loaded: nginx: release: not found"
        ));
        assert!(!is_release_not_found("Error: Kubernetes cluster unreachable"));
        // A missing cluster resource is not a missing release.
        assert!(!is_release_not_found(
            "Error: secrets \"sh.helm.release.v1.nginx.v1\" not found"
        ));
    }

    fn test_client() -> HelmReleaseClient {
        HelmReleaseClient {
            namespace: "app-store-apps".to_string(),
            storage_driver: String::new(),
            kubeconfig: None,
            timeout: Duration::from_secs(300),
            repo_lock: Arc::new(Mutex::new(())),
        }
    }

    #[test]
    fn clones_share_the_repository_lock() {
        let client = test_client();
        let clone = client.clone();

        assert!(Arc::ptr_eq(&client.repo_lock, &clone.repo_lock));
    }

    // Runs on a current-thread runtime: the sync passes must yield while holding the lock
    // instead of blocking the executor, or this join would never complete.
    #[tokio::test]
    async fn concurrent_repository_syncs_serialize_without_starving_the_runtime() {
        let client = test_client();
        let clone = client.clone();

        let (first, second) = tokio::join!(
            client.sync_repositories(&[]),
            clone.sync_repositories(&[])
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
    }
}

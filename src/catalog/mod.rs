use crate::error::{CatalogFileRead, CatalogParse, ChartNotFound, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{fs, path::Path};
use tracing::info;

/// One entry in the statically configured chart catalog.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ChartDefinition {
    /// User-friendly short name, e.g. "nginx". Also the default release name.
    name: String,
    /// Full chart reference, e.g. "bitnami/nginx".
    chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl ChartDefinition {
    /// This is a getter for the catalog short name.
    pub(crate) fn name(&self) -> &str {
        self.name.as_str()
    }

    /// This is a getter for the full chart reference.
    pub(crate) fn chart(&self) -> &str {
        self.chart.as_str()
    }

    /// This is a getter for the chart version, if one is pinned.
    pub(crate) fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// This is a getter for the chart repository URL. Empty URLs count as absent.
    pub(crate) fn repo_url(&self) -> Option<&str> {
        self.repo_url.as_deref().filter(|url| !url.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn new(name: &str, chart: &str, version: Option<&str>, repo_url: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            chart: chart.to_string(),
            version: version.map(ToString::to_string),
            repo_url: repo_url.map(ToString::to_string),
            description: None,
        }
    }
}

/// This struct is used to deserialize the chart catalog file.
#[derive(Deserialize)]
struct ChartRegistry {
    charts: Vec<ChartDefinition>,
}

/// The immutable chart catalog, loaded once at startup.
#[derive(Clone)]
pub(crate) struct Catalog {
    charts: Vec<ChartDefinition>,
}

impl Catalog {
    /// Load chart definitions from a YAML catalog file.
    pub(crate) fn load(path: &Path) -> Result<Catalog> {
        let contents = fs::read(path).context(CatalogFileRead { path })?;
        let registry: ChartRegistry =
            serde_yaml::from_slice(contents.as_slice()).context(CatalogParse { path })?;

        info!(
            count = registry.charts.len(),
            path = %path.display(),
            "Loaded chart catalog"
        );

        Ok(Catalog {
            charts: registry.charts,
        })
    }

    /// All configured chart definitions, in file order.
    pub(crate) fn charts(&self) -> &[ChartDefinition] {
        self.charts.as_slice()
    }

    /// Fetches a chart definition by its catalog short name. Uniqueness of names is not
    /// enforced at load time; the first match wins.
    pub(crate) fn chart_by_name(&self, name: &str) -> Result<&ChartDefinition> {
        self.charts
            .iter()
            .find(|chart| chart.name() == name)
            .ok_or_else(|| ChartNotFound { name }.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG_YAML: &str = r#"
charts:
  - name: nginx
    chart: bitnami/nginx
    version: "15.1.2"
    repo_url: https://charts.bitnami.com/bitnami
    description: Web server
  - name: redis
    chart: bitnami/redis
    repo_url: https://charts.bitnami.com/bitnami
"#;

    fn write_catalog(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(contents.as_bytes())
            .expect("failed to write catalog");
        file
    }

    #[test]
    fn loads_catalog_from_file() {
        let file = write_catalog(CATALOG_YAML);
        let catalog = Catalog::load(file.path()).expect("catalog should load");

        assert_eq!(catalog.charts().len(), 2);
        assert_eq!(catalog.charts()[0].chart(), "bitnami/nginx");
        assert_eq!(catalog.charts()[0].version(), Some("15.1.2"));
        assert_eq!(catalog.charts()[1].version(), None);
    }

    #[test]
    fn lookup_by_name_returns_match_or_not_found() {
        let file = write_catalog(CATALOG_YAML);
        let catalog = Catalog::load(file.path()).expect("catalog should load");

        assert_eq!(
            catalog
                .chart_by_name("redis")
                .expect("redis should be present")
                .chart(),
            "bitnami/redis"
        );
        assert!(matches!(
            catalog.chart_by_name("absent"),
            Err(crate::error::Error::ChartNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_names_resolve_to_first_match() {
        let file = write_catalog(
            r#"
charts:
  - name: nginx
    chart: bitnami/nginx
    version: "1.0.0"
  - name: nginx
    chart: other/nginx
    version: "2.0.0"
"#,
        );
        let catalog = Catalog::load(file.path()).expect("catalog should load");

        let chart = catalog
            .chart_by_name("nginx")
            .expect("nginx should be present");
        assert_eq!(chart.chart(), "bitnami/nginx");
    }

    #[test]
    fn empty_repo_url_counts_as_absent() {
        let file = write_catalog(
            r#"
charts:
  - name: local
    chart: local/thing
    repo_url: ""
"#,
        );
        let catalog = Catalog::load(file.path()).expect("catalog should load");
        assert_eq!(catalog.charts()[0].repo_url(), None);
    }
}

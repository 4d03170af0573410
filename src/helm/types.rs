use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// This struct is used to deserialize the output of `helm list -n <namespace> --all -o json`.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct HelmListElement {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) revision: String,
    pub(crate) updated: String,
    pub(crate) status: String,
    /// Chart name with its version appended, e.g. "nginx-15.1.2".
    pub(crate) chart: String,
    #[serde(default)]
    pub(crate) app_version: String,
}

/// This struct is used to deserialize the release object printed by
/// `helm install -o json` and `helm history -o json` entries.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct InstalledRelease {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) version: i64,
    pub(crate) info: ReleaseStateInfo,
}

/// The `info` block of a helm release object.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ReleaseStateInfo {
    #[serde(default)]
    pub(crate) status: String,
}

/// One record of `helm history -o json` output. Only presence matters for the duplicate
/// pre-check, so most fields are left out.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct HelmHistoryRecord {
    #[allow(dead_code)]
    pub(crate) revision: i64,
}

/// Read-only projection of an installed release, enriched with externally reachable ports.
/// Computed per request; authoritative state lives in helm's release storage.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ReleaseInfo {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) version: i64,
    pub(crate) updated: String,
    pub(crate) status: String,
    pub(crate) chart: String,
    pub(crate) chart_version: String,
    pub(crate) app_version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) node_ports: BTreeMap<String, i32>,
}

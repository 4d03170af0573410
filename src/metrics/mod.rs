use crate::error::{ListNodeMetrics, ListNodes, ListTimeout, MetricsRequest, Result};
use k8s_openapi::{
    api::core::v1::Node,
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use kube::{
    api::{Api, ListParams},
    Client,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{collections::HashMap, time::Duration};
use tracing::warn;

/// The metrics.k8s.io API is an aggregated API without generated client bindings, so node
/// metrics are fetched with a raw GET against its list endpoint.
const NODE_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/nodes";

/// Upper bound on each cluster query backing a snapshot. Snapshots feed a periodic stream,
/// so a slow apiserver must not pile up in-flight requests.
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// One node metrics object from the metrics.k8s.io list endpoint.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct NodeMetrics {
    pub(crate) metadata: ObjectMeta,
    pub(crate) usage: ResourceUsage,
}

/// The `usage` block of a node metrics object.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ResourceUsage {
    pub(crate) cpu: Quantity,
    pub(crate) memory: Quantity,
}

/// List envelope for node metrics objects.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct NodeMetricsList {
    pub(crate) items: Vec<NodeMetrics>,
}

/// Per-node slice of a cluster metrics snapshot.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct NodeUsage {
    pub(crate) name: String,
    pub(crate) cpu_usage_milli_cores: i64,
    pub(crate) memory_usage_bytes: i64,
    pub(crate) cpu_available_milli_cores: i64,
    pub(crate) memory_available_bytes: i64,
    pub(crate) cpu_usage_percentage: f64,
    pub(crate) mem_usage_percentage: f64,
}

/// Point-in-time aggregate of CPU and memory usage against capacity across all nodes.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ClusterMetrics {
    pub(crate) total_cpu_usage_milli_cores: i64,
    pub(crate) total_cpu_capacity_milli_cores: i64,
    pub(crate) total_memory_usage_bytes: i64,
    pub(crate) total_memory_capacity_bytes: i64,
    pub(crate) average_cpu_usage_percentage: f64,
    pub(crate) average_mem_usage_percentage: f64,
    pub(crate) nodes: Vec<NodeUsage>,
}

/// Computes cluster metrics snapshots by joining the node inventory with live readings from
/// the metrics.k8s.io aggregated API.
#[derive(Clone)]
pub(crate) struct MetricsService {
    client: Client,
}

impl MetricsService {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Produces one snapshot. Both cluster queries are bounded by a deadline; a node without
    /// a metrics reading (metrics-server lag after node join) is reported with zero usage
    /// rather than dropped.
    pub(crate) async fn snapshot(&self) -> Result<ClusterMetrics> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = tokio::time::timeout(QUERY_TIMEOUT, nodes.list(&ListParams::default()))
            .await
            .map_err(|_| ListTimeout { what: "nodes" }.build())?
            .context(ListNodes)?;

        let request = http::Request::builder()
            .method("GET")
            .uri(NODE_METRICS_PATH)
            .body(Vec::new())
            .context(MetricsRequest)?;
        let metrics_list: NodeMetricsList =
            tokio::time::timeout(QUERY_TIMEOUT, self.client.request(request))
                .await
                .map_err(|_| {
                    ListTimeout {
                        what: "node metrics",
                    }
                    .build()
                })?
                .context(ListNodeMetrics)?;

        Ok(aggregate(node_list.items.as_slice(), metrics_list.items.as_slice()))
    }
}

/// Joins nodes with their metrics readings by node name and computes per-node and
/// cluster-wide figures. Capacity is the node's allocatable quantity, not its raw
/// capacity, so system and kubelet reservations count against usage headroom.
/// Percentages are zero when the corresponding capacity is zero.
fn aggregate(nodes: &[Node], metrics: &[NodeMetrics]) -> ClusterMetrics {
    let readings: HashMap<&str, (i64, i64)> = metrics
        .iter()
        .filter_map(|reading| {
            reading.metadata.name.as_deref().map(|name| {
                (
                    name,
                    (
                        parse_cpu_millicores(&reading.usage.cpu).unwrap_or_default(),
                        parse_memory_bytes(&reading.usage.memory).unwrap_or_default(),
                    ),
                )
            })
        })
        .collect();

    let mut node_usages = Vec::with_capacity(nodes.len());
    for node in nodes {
        let name = node.metadata.name.clone().unwrap_or_default();

        let allocatable = node
            .status
            .as_ref()
            .and_then(|status| status.allocatable.as_ref());
        let cpu_capacity = allocatable
            .and_then(|allocatable| allocatable.get("cpu"))
            .and_then(parse_cpu_millicores)
            .unwrap_or_default();
        let memory_capacity = allocatable
            .and_then(|allocatable| allocatable.get("memory"))
            .and_then(parse_memory_bytes)
            .unwrap_or_default();

        let (cpu_usage, memory_usage) = match readings.get(name.as_str()) {
            Some(reading) => *reading,
            None => {
                warn!(node = %name, "No metrics reading for node, reporting zero usage");
                (0, 0)
            }
        };

        node_usages.push(NodeUsage {
            name,
            cpu_usage_milli_cores: cpu_usage,
            memory_usage_bytes: memory_usage,
            cpu_available_milli_cores: cpu_capacity - cpu_usage,
            memory_available_bytes: memory_capacity - memory_usage,
            cpu_usage_percentage: percentage(cpu_usage, cpu_capacity),
            mem_usage_percentage: percentage(memory_usage, memory_capacity),
        });
    }

    let total_cpu_usage = node_usages.iter().map(|n| n.cpu_usage_milli_cores).sum();
    let total_memory_usage = node_usages.iter().map(|n| n.memory_usage_bytes).sum();
    let total_cpu_capacity = node_usages
        .iter()
        .map(|n| n.cpu_usage_milli_cores + n.cpu_available_milli_cores)
        .sum();
    let total_memory_capacity = node_usages
        .iter()
        .map(|n| n.memory_usage_bytes + n.memory_available_bytes)
        .sum();

    ClusterMetrics {
        total_cpu_usage_milli_cores: total_cpu_usage,
        total_cpu_capacity_milli_cores: total_cpu_capacity,
        total_memory_usage_bytes: total_memory_usage,
        total_memory_capacity_bytes: total_memory_capacity,
        average_cpu_usage_percentage: percentage(total_cpu_usage, total_cpu_capacity),
        average_mem_usage_percentage: percentage(total_memory_usage, total_memory_capacity),
        nodes: node_usages,
    }
}

fn percentage(usage: i64, capacity: i64) -> f64 {
    if capacity <= 0 {
        return 0.0;
    }
    usage as f64 * 100.0 / capacity as f64
}

/// Parses a Kubernetes CPU quantity into millicores. CPU quantities appear as nanocores
/// ("1234567n") or microcores ("1234u") from the metrics API, millicores ("250m") in pod
/// specs, and plain core counts ("4", "0.5") in node capacity.
fn parse_cpu_millicores(quantity: &Quantity) -> Option<i64> {
    let value = quantity.0.trim();
    if let Some(nanos) = value.strip_suffix('n') {
        return nanos.parse::<i64>().ok().map(|n| n / 1_000_000);
    }
    if let Some(micros) = value.strip_suffix('u') {
        return micros.parse::<i64>().ok().map(|u| u / 1_000);
    }
    if let Some(millis) = value.strip_suffix('m') {
        return millis.parse::<i64>().ok();
    }
    value.parse::<f64>().ok().map(|cores| (cores * 1000.0) as i64)
}

/// Parses a Kubernetes memory quantity into bytes. Binary suffixes (Ki..Ei) are powers of
/// 1024, decimal suffixes (k/K..E) powers of 1000, no suffix is plain bytes.
fn parse_memory_bytes(quantity: &Quantity) -> Option<i64> {
    const BINARY: [(&str, i64); 6] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
    ];
    const DECIMAL: [(&str, i64); 7] = [
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    let value = quantity.0.trim();
    for (suffix, multiplier) in BINARY {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| (n * multiplier as f64) as i64);
        }
    }
    for (suffix, multiplier) in DECIMAL {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| (n * multiplier as f64) as i64);
        }
    }
    value.parse::<f64>().ok().map(|bytes| bytes as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use std::collections::BTreeMap;

    fn quantity(value: &str) -> Quantity {
        Quantity(value.to_string())
    }

    fn resources(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
        let mut resources = BTreeMap::new();
        resources.insert("cpu".to_string(), quantity(cpu));
        resources.insert("memory".to_string(), quantity(memory));
        resources
    }

    // Raw capacity is deliberately larger than allocatable, the way real nodes report it.
    fn node(name: &str, cpu: &str, memory: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(resources("64", "256Gi")),
                allocatable: Some(resources(cpu, memory)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reading(name: &str, cpu: &str, memory: &str) -> NodeMetrics {
        NodeMetrics {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            usage: ResourceUsage {
                cpu: quantity(cpu),
                memory: quantity(memory),
            },
        }
    }

    #[test]
    fn cpu_quantities_convert_to_millicores() {
        assert_eq!(parse_cpu_millicores(&quantity("1500000000n")), Some(1500));
        assert_eq!(parse_cpu_millicores(&quantity("250000u")), Some(250));
        assert_eq!(parse_cpu_millicores(&quantity("250m")), Some(250));
        assert_eq!(parse_cpu_millicores(&quantity("4")), Some(4000));
        assert_eq!(parse_cpu_millicores(&quantity("0.5")), Some(500));
        assert_eq!(parse_cpu_millicores(&quantity("bogus")), None);
    }

    #[test]
    fn memory_quantities_convert_to_bytes() {
        assert_eq!(parse_memory_bytes(&quantity("8Gi")), Some(8 * (1 << 30)));
        assert_eq!(parse_memory_bytes(&quantity("512Ki")), Some(512 * 1024));
        assert_eq!(parse_memory_bytes(&quantity("2G")), Some(2_000_000_000));
        assert_eq!(parse_memory_bytes(&quantity("128974848")), Some(128_974_848));
        assert_eq!(parse_memory_bytes(&quantity("bogus")), None);
    }

    #[test]
    fn aggregate_joins_usage_with_capacity() {
        let nodes = vec![node("a", "4", "8Gi"), node("b", "2", "4Gi")];
        let metrics = vec![
            reading("a", "1000m", "4Gi"),
            reading("b", "500m", "1Gi"),
        ];

        let snapshot = aggregate(nodes.as_slice(), metrics.as_slice());

        assert_eq!(snapshot.total_cpu_usage_milli_cores, 1500);
        assert_eq!(snapshot.total_cpu_capacity_milli_cores, 6000);
        assert_eq!(snapshot.total_memory_usage_bytes, 5 * (1 << 30));
        assert_eq!(snapshot.total_memory_capacity_bytes, 12 * (1 << 30));
        assert!((snapshot.average_cpu_usage_percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes[0].cpu_available_milli_cores, 3000);
        assert!((snapshot.nodes[0].cpu_usage_percentage - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percentages_divide_by_allocatable_not_raw_capacity() {
        let nodes = vec![Node {
            metadata: ObjectMeta {
                name: Some("reserved".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(resources("8", "16Gi")),
                allocatable: Some(resources("4", "8Gi")),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let metrics = vec![reading("reserved", "2", "4Gi")];

        let snapshot = aggregate(nodes.as_slice(), metrics.as_slice());

        assert_eq!(snapshot.total_cpu_capacity_milli_cores, 4000);
        assert_eq!(snapshot.total_memory_capacity_bytes, 8 * (1 << 30));
        assert!((snapshot.nodes[0].cpu_usage_percentage - 50.0).abs() < f64::EPSILON);
        assert!((snapshot.nodes[0].mem_usage_percentage - 50.0).abs() < f64::EPSILON);
        assert!((snapshot.average_cpu_usage_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn node_without_reading_reports_zero_usage() {
        let nodes = vec![node("a", "4", "8Gi"), node("late-joiner", "4", "8Gi")];
        let metrics = vec![reading("a", "2", "4Gi")];

        let snapshot = aggregate(nodes.as_slice(), metrics.as_slice());

        assert_eq!(snapshot.nodes.len(), 2);
        let late = &snapshot.nodes[1];
        assert_eq!(late.cpu_usage_milli_cores, 0);
        assert_eq!(late.memory_usage_bytes, 0);
        assert_eq!(late.cpu_available_milli_cores, 4000);
        assert_eq!(late.cpu_usage_percentage, 0.0);
    }

    #[test]
    fn zero_capacity_yields_zero_percentages() {
        let nodes = vec![Node {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }];

        let snapshot = aggregate(nodes.as_slice(), &[]);

        assert_eq!(snapshot.average_cpu_usage_percentage, 0.0);
        assert_eq!(snapshot.average_mem_usage_percentage, 0.0);
        assert_eq!(snapshot.nodes[0].mem_usage_percentage, 0.0);
    }

    #[test]
    fn node_metrics_list_parses_metrics_api_payload() {
        let payload = r#"{
            "kind": "NodeMetricsList",
            "apiVersion": "metrics.k8s.io/v1beta1",
            "items": [{
                "metadata": {"name": "worker-0"},
                "timestamp": "2024-03-01T10:00:00Z",
                "window": "10.062s",
                "usage": {"cpu": "156340411n", "memory": "2576692Ki"}
            }]
        }"#;

        let list: NodeMetricsList =
            serde_json::from_str(payload).expect("metrics payload should parse");
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].metadata.name.as_deref(), Some("worker-0"));
        assert_eq!(parse_cpu_millicores(&list.items[0].usage.cpu), Some(156));
    }
}

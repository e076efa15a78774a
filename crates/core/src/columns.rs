//! Built-in columns and projectors for human-readable listings.
//!
//! This module provides:
//! - Stable column IDs + specs (labels, kinds)
//! - A small registry mapping a kind to its column set
//! - A JSON projector for built-ins that renders the kind-specific cells
//! - Age rendering and tab-aligned table formatting

#![forbid(unsafe_code)]

use std::sync::Arc;

use smallvec::SmallVec;

use crate::ObjectRecord;

/// Entry representing a projected field: `(ColumnId, RenderedValue)`
pub type ProjectedEntry = (u32, String);

/// Projector takes a raw JSON object and yields rendered projected scalars.
pub trait Projector: Send + Sync {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Namespace,
    Name,
    Age,
    Projected(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub label: &'static str,
}

// ---------------- Column IDs (stable) ----------------
// Pods
pub const POD_READY: u32 = 10_001;
pub const POD_STATUS: u32 = 10_002;
pub const POD_RESTARTS: u32 = 10_003;

// Deployments
pub const DEP_READY: u32 = 11_001;
pub const DEP_UPDATED: u32 = 11_002;
pub const DEP_AVAILABLE: u32 = 11_003;

// Services
pub const SVC_TYPE: u32 = 13_001;
pub const SVC_CLUSTER_IP: u32 = 13_002;
pub const SVC_EXTERNAL_IP: u32 = 13_003;
pub const SVC_PORTS: u32 = 13_004;

fn col(kind: ColumnKind, label: &'static str) -> ColumnSpec {
    ColumnSpec { kind, label }
}

/// Return full column set for a built-in kind, including Namespace/Name/Age.
/// Falls back to Name/Age when no opinionated columns are known.
pub fn builtin_columns_for(kind: &str, all_namespaces: bool) -> Vec<ColumnSpec> {
    let mut cols: Vec<ColumnSpec> = Vec::new();
    if all_namespaces {
        cols.push(col(ColumnKind::Namespace, "NAMESPACE"));
    }
    cols.push(col(ColumnKind::Name, "NAME"));

    match kind {
        "Deployment" => {
            cols.push(col(ColumnKind::Projected(DEP_READY), "READY"));
            cols.push(col(ColumnKind::Projected(DEP_UPDATED), "UP-TO-DATE"));
            cols.push(col(ColumnKind::Projected(DEP_AVAILABLE), "AVAILABLE"));
        }
        "Pod" => {
            cols.push(col(ColumnKind::Projected(POD_READY), "READY"));
            cols.push(col(ColumnKind::Projected(POD_STATUS), "STATUS"));
            cols.push(col(ColumnKind::Projected(POD_RESTARTS), "RESTARTS"));
        }
        "Service" => {
            cols.push(col(ColumnKind::Projected(SVC_TYPE), "TYPE"));
            cols.push(col(ColumnKind::Projected(SVC_CLUSTER_IP), "CLUSTER-IP"));
            cols.push(col(ColumnKind::Projected(SVC_EXTERNAL_IP), "EXTERNAL-IP"));
            cols.push(col(ColumnKind::Projected(SVC_PORTS), "PORT(S)"));
        }
        _ => {}
    }

    cols.push(col(ColumnKind::Age, "AGE"));
    cols
}

/// Return a JSON projector for a supported built-in kind.
pub fn builtin_projector_for(kind: &str) -> Option<Arc<dyn Projector>> {
    match kind {
        "Deployment" | "Pod" | "Service" => Some(Arc::new(BuiltinProjector { kind: kind.to_string() })),
        _ => None,
    }
}

struct BuiltinProjector {
    kind: String,
}

impl BuiltinProjector {
    fn project_pod(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let mut ready = 0u32;
        let mut total = 0u32;
        let mut restarts = 0u64;
        if let Some(cs) = raw.pointer("/status/containerStatuses").and_then(|v| v.as_array()) {
            total = cs.len() as u32;
            for c in cs {
                if c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false) {
                    ready += 1;
                }
                restarts += c.get("restartCount").and_then(|v| v.as_u64()).unwrap_or(0);
            }
        }
        out.push((POD_READY, format!("{}/{}", ready, total)));
        // Status (reason wins over phase, as kubectl shows Evicted etc.)
        let phase = raw.pointer("/status/phase").and_then(|v| v.as_str()).unwrap_or("");
        let reason = raw.pointer("/status/reason").and_then(|v| v.as_str()).unwrap_or("");
        let status = if !reason.is_empty() { reason } else { phase };
        out.push((POD_STATUS, if status.is_empty() { "Unknown".to_string() } else { status.to_string() }));
        out.push((POD_RESTARTS, restarts.to_string()));
        out
    }

    fn project_deployment(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let desired = desired_replicas(raw);
        let ready = raw.pointer("/status/readyReplicas").and_then(|v| v.as_u64()).unwrap_or(0);
        let updated = raw.pointer("/status/updatedReplicas").and_then(|v| v.as_u64()).unwrap_or(0);
        let available = raw.pointer("/status/availableReplicas").and_then(|v| v.as_u64()).unwrap_or(0);
        out.push((DEP_READY, format!("{}/{}", ready, desired)));
        out.push((DEP_UPDATED, updated.to_string()));
        out.push((DEP_AVAILABLE, available.to_string()));
        out
    }

    fn project_service(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let svc_type = raw.pointer("/spec/type").and_then(|v| v.as_str()).unwrap_or("ClusterIP");
        out.push((SVC_TYPE, svc_type.to_string()));
        let cluster_ip = raw.pointer("/spec/clusterIP").and_then(|v| v.as_str()).unwrap_or("<none>");
        out.push((SVC_CLUSTER_IP, cluster_ip.to_string()));
        // Load balancer ingress first, then spec.externalIPs
        let mut eps: Vec<String> = Vec::new();
        if let Some(arr) = raw.pointer("/status/loadBalancer/ingress").and_then(|v| v.as_array()) {
            for it in arr {
                if let Some(ip) = it.get("ip").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
                    eps.push(ip.to_string());
                } else if let Some(h) = it.get("hostname").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
                    eps.push(h.to_string());
                }
            }
        }
        if eps.is_empty() {
            if let Some(arr) = raw.pointer("/spec/externalIPs").and_then(|v| v.as_array()) {
                eps.extend(arr.iter().filter_map(|it| it.as_str().map(|s| s.to_string())));
            }
        }
        out.push((SVC_EXTERNAL_IP, if eps.is_empty() { "<none>".to_string() } else { eps.join(",") }));
        let mut ports: Vec<String> = Vec::new();
        if let Some(arr) = raw.pointer("/spec/ports").and_then(|v| v.as_array()) {
            for p in arr {
                let port = p.get("port").and_then(|v| v.as_u64()).unwrap_or(0);
                let proto = p.get("protocol").and_then(|v| v.as_str()).unwrap_or("TCP");
                match p.get("nodePort").and_then(|v| v.as_u64()).filter(|n| *n != 0) {
                    Some(node_port) => ports.push(format!("{}:{}/{}", port, node_port, proto)),
                    None => ports.push(format!("{}/{}", port, proto)),
                }
            }
        }
        out.push((SVC_PORTS, ports.join(",")));
        out
    }
}

impl Projector for BuiltinProjector {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        match self.kind.as_str() {
            "Pod" => self.project_pod(raw),
            "Deployment" => self.project_deployment(raw),
            "Service" => self.project_service(raw),
            _ => SmallVec::new(),
        }
    }
}

/// `spec.replicas`, defaulting to 1 like the API server does.
pub fn desired_replicas(raw: &serde_json::Value) -> u64 {
    raw.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1)
}

/// Elapsed time truncated to whole days, hours or minutes.
pub fn render_age(elapsed_secs: i64) -> String {
    let secs = elapsed_secs.max(0);
    if secs >= 86_400 {
        format!("{}d", secs / 86_400)
    } else if secs >= 3_600 {
        format!("{}h", secs / 3_600)
    } else {
        format!("{}m", secs / 60)
    }
}

/// Render one listing row for `rec` against `cols`.
pub fn render_row(cols: &[ColumnSpec], projector: Option<&dyn Projector>, rec: &ObjectRecord, now_ts: i64) -> Vec<String> {
    let projected = projector.map(|p| p.project(&rec.raw)).unwrap_or_default();
    cols.iter()
        .map(|c| match &c.kind {
            ColumnKind::Namespace => rec.key.namespace.clone().unwrap_or_else(|| "-".to_string()),
            ColumnKind::Name => rec.key.name.clone(),
            ColumnKind::Age => match rec.creation_ts {
                Some(ts) => render_age(now_ts - ts),
                None => "<unknown>".to_string(),
            },
            ColumnKind::Projected(id) => projected
                .iter()
                .find(|(pid, _)| pid == id)
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
        })
        .collect()
}

/// Left-aligned table with three spaces between columns, like `tabwriter`.
pub fn format_table(cols: &[ColumnSpec], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = cols.iter().map(|c| c.label.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }
    let mut out = String::new();
    let header: Vec<String> = cols.iter().map(|c| c.label.to_string()).collect();
    for row in std::iter::once(&header).chain(rows.iter()) {
        let last = row.len().saturating_sub(1);
        for (i, cell) in row.iter().enumerate() {
            out.push_str(cell);
            if i < last {
                let pad = widths.get(i).copied().unwrap_or(0).saturating_sub(cell.chars().count()) + 3;
                out.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, raw: serde_json::Value) -> ObjectRecord {
        ObjectRecord::from_raw(kind, raw).unwrap()
    }

    #[test]
    fn age_truncates_to_whole_units() {
        assert_eq!(render_age(59), "0m");
        assert_eq!(render_age(61 * 60), "1h");
        assert_eq!(render_age(3 * 3600 + 59 * 60), "3h");
        assert_eq!(render_age(86_400 * 2 + 23 * 3600), "2d");
        assert_eq!(render_age(-5), "0m");
    }

    #[test]
    fn deployment_row() {
        let rec = record("Deployment", serde_json::json!({
            "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "1", "creationTimestamp": "2020-01-01T00:00:00Z" },
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 2, "updatedReplicas": 3, "availableReplicas": 2 },
        }));
        let cols = builtin_columns_for("Deployment", true);
        let proj = builtin_projector_for("Deployment");
        let row = render_row(&cols, proj.as_deref(), &rec, rec.creation_ts.unwrap() + 7200);
        assert_eq!(row, vec!["prod", "web", "2/3", "3", "2", "2h"]);
    }

    #[test]
    fn service_row_prefers_load_balancer_ingress() {
        let rec = record("Service", serde_json::json!({
            "metadata": { "name": "lb", "namespace": "d", "resourceVersion": "5" },
            "spec": {
                "type": "LoadBalancer",
                "clusterIP": "10.0.0.1",
                "externalIPs": ["1.1.1.1"],
                "ports": [{ "port": 80, "nodePort": 30080, "protocol": "TCP" }, { "port": 53, "protocol": "UDP" }],
            },
            "status": { "loadBalancer": { "ingress": [{ "hostname": "lb.example.com" }] } },
        }));
        let cols = builtin_columns_for("Service", false);
        let proj = builtin_projector_for("Service");
        let row = render_row(&cols, proj.as_deref(), &rec, 0);
        assert_eq!(row, vec!["lb", "LoadBalancer", "10.0.0.1", "lb.example.com", "80:30080/TCP,53/UDP", "<unknown>"]);
    }

    #[test]
    fn pod_row_counts_ready_and_restarts() {
        let rec = record("Pod", serde_json::json!({
            "metadata": { "name": "p", "namespace": "d", "resourceVersion": "9" },
            "status": {
                "phase": "Running",
                "containerStatuses": [{ "ready": true, "restartCount": 2 }, { "ready": false, "restartCount": 1 }],
            },
        }));
        let cols = builtin_columns_for("Pod", false);
        let proj = builtin_projector_for("Pod");
        let row = render_row(&cols, proj.as_deref(), &rec, 0);
        assert_eq!(&row[1..4], &["1/2", "Running", "3"]);
    }

    #[test]
    fn table_pads_columns() {
        let cols = vec![col(ColumnKind::Name, "NAME"), col(ColumnKind::Age, "AGE")];
        let rows = vec![vec!["a-long-name".to_string(), "1d".to_string()]];
        let out = format_table(&cols, &rows);
        assert_eq!(out, "NAME          AGE\na-long-name   1d\n");
    }
}

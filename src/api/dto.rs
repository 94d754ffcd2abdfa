//! Request and response bodies of the control API.

use crate::export::Consolidation;
use crate::graph::{Graph, Layer, LayerStatus, Node};
use crate::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct GraphDto {
    pub layers: Vec<LayerDto>,
}

#[derive(Debug, Serialize)]
pub struct LayerDto {
    pub name: String,
    pub status: LayerStatus,
    pub nodes: Vec<NodeDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeDto {
    pub name: String,
    pub operation: String,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub in_schema: String,
    pub out_schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<serde_json::Value>,
}

impl NodeDto {
    pub fn of(node: &Node) -> NodeDto {
        NodeDto {
            name: node.name.clone(),
            operation: node.operation.to_string(),
            parents: node.parents.clone(),
            children: node.children.clone(),
            signature: node.signature.clone(),
            pid: node.pid,
            in_schema: node.in_schema.to_string(),
            out_schema: node.out_schema.to_string(),
            last_report: node.last_report.as_ref().map(|r| r.body.clone()),
        }
    }
}

impl LayerDto {
    pub fn of(layer: &Layer) -> LayerDto {
        LayerDto {
            name: layer.name.clone(),
            status: layer.status,
            nodes: layer.nodes.values().map(NodeDto::of).collect(),
            last_started: layer.last_started,
            last_stopped: layer.last_stopped,
            timeout: layer.timeout,
            last_error: layer.last_error.clone(),
        }
    }
}

impl GraphDto {
    pub fn of(graph: &Graph) -> GraphDto {
        GraphDto {
            layers: graph.layers.values().map(LayerDto::of).collect(),
        }
    }
}

/// GET|POST /export/:layer/:node
#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    /// Only tuples with a sequence number above this one
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Long-poll up to this many seconds when nothing is new
    #[serde(default)]
    pub wait_up_to: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub fields: Vec<String>,
    pub tuples: Vec<ExportedTuple>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExportedTuple {
    pub seq: u64,
    pub values: Vec<serde_json::Value>,
}

/// POST /complete/nodes and /complete/fields
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub prefix: String,
    /// Restrict field completion to one node
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub completions: Vec<String>,
}

/// POST /timeseries
#[derive(Debug, Deserialize)]
pub struct TimeseriesRequest {
    pub node: String,
    pub data_field: String,
    pub max_points: usize,
    pub from: f64,
    pub to: f64,
    pub consolidation: Consolidation,
}

#[derive(Debug, Serialize)]
pub struct TimeseriesResponse {
    pub points: Vec<(f64, Option<f64>)>,
}

/// A scalar value rendered for JSON clients.
pub fn value_to_json(v: &Value) -> serde_json::Value {
    use serde_json::json;
    match v {
        Value::Null(_) => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::I8(n) => json!(n),
        Value::I16(n) => json!(n),
        Value::I32(n) => json!(n),
        Value::I64(n) => json!(n),
        Value::I128(n) => json!(n.to_string()),
        Value::U8(n) => json!(n),
        Value::U16(n) => json!(n),
        Value::U32(n) => json!(n),
        Value::U64(n) => json!(n),
        Value::U128(n) => json!(n.to_string()),
        Value::Ip4(a) => json!(a.to_string()),
        Value::Ip6(a) => json!(a.to_string()),
        Value::Cidr4 { addr, prefix } => json!(format!("{addr}/{prefix}")),
        Value::Cidr6 { addr, prefix } => json!(format!("{addr}/{prefix}")),
    }
}

//! # Operator graph
//!
//! Layers of named nodes, the unit of compilation and lifecycle. Links
//! (parent/child) are stored as fully qualified `layer/node` names rather
//! than owning references; all mutation goes through the supervisor, which
//! owns the one [`Graph`] instance.
//!
//! Layer names are globally unique, node names unique within their layer. A
//! new layer may only link to layers that already exist, so the inter-layer
//! dependency relation stays acyclic by construction; cycles within one
//! layer are allowed.

use crate::error::{Result, WeirError};
use crate::expr::Operation;
use crate::schema::TupleSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Version tag folded into signatures: typed operations compiled by a
/// different engine version never share artifacts.
pub const ENGINE_VERSION: &str = concat!("weir-", env!("CARGO_PKG_VERSION"));

/// Lifecycle of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerStatus {
    Edition,
    Compiling,
    Compiled,
    Running,
}

/// Worker telemetry, refreshed by PUT /report. Volatile: not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub time: Option<DateTime<Utc>>,
    pub body: serde_json::Value,
}

/// One operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub layer: String,
    pub operation: Operation,
    /// Fully qualified parent names
    pub parents: Vec<String>,
    /// Fully qualified child names
    pub children: Vec<String>,
    pub in_schema: TupleSchema,
    pub out_schema: TupleSchema,
    /// Content hash of the typed operation; set by compile
    pub signature: Option<String>,
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(skip)]
    pub last_report: Option<Report>,
}

impl Node {
    pub fn new(layer: &str, name: &str, operation: Operation) -> Self {
        Node {
            name: name.to_string(),
            layer: layer.to_string(),
            operation,
            parents: Vec::new(),
            children: Vec::new(),
            in_schema: TupleSchema::new(),
            out_schema: TupleSchema::new(),
            signature: None,
            pid: None,
            last_report: None,
        }
    }

    pub fn fq_name(&self) -> String {
        format!("{}/{}", self.layer, self.name)
    }

    /// Hash of the canonical printed operation plus both schemas. Two nodes
    /// with equal signatures share one compiled artifact.
    pub fn compute_signature(&self) -> String {
        let mut canon = String::new();
        let _ = write!(
            canon,
            "{}\nin:{}\nout:{}\n{}",
            self.operation, self.in_schema, self.out_schema, ENGINE_VERSION
        );
        let mut hasher = Sha256::new();
        hasher.update(canon.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            let _ = write!(hex, "{b:02x}");
        }
        hex
    }
}

/// A named set of nodes sharing one lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub nodes: BTreeMap<String, Node>,
    pub status: LayerStatus,
    pub created: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    /// Idle TTL in seconds; layers with one are reaped once idle past it
    pub timeout: Option<f64>,
    /// Why the layer fell out of Running, when a worker aborted
    pub last_error: Option<String>,
}

impl Layer {
    pub fn new(name: &str) -> Self {
        Layer {
            name: name.to_string(),
            nodes: BTreeMap::new(),
            status: LayerStatus::Edition,
            created: None,
            last_started: None,
            last_stopped: None,
            timeout: None,
            last_error: None,
        }
    }

    /// Timestamp of the layer's most recent lifecycle activity.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [self.created, self.last_started, self.last_stopped]
            .into_iter()
            .flatten()
            .max()
    }
}

/// The whole operator graph: layer name -> layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub layers: BTreeMap<String, Layer>,
}

/// Split a fully qualified `layer/node` name.
pub fn split_fq(fq: &str) -> Option<(&str, &str)> {
    fq.split_once('/')
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn layer(&self, name: &str) -> Result<&Layer> {
        self.layers
            .get(name)
            .ok_or_else(|| WeirError::not_found(format!("layer '{name}'")))
    }

    pub fn layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| WeirError::not_found(format!("layer '{name}'")))
    }

    pub fn node(&self, fq: &str) -> Result<&Node> {
        let (layer, node) = split_fq(fq)
            .ok_or_else(|| WeirError::not_found(format!("malformed node name '{fq}'")))?;
        self.layer(layer)?
            .nodes
            .get(node)
            .ok_or_else(|| WeirError::not_found(format!("node '{fq}'")))
    }

    pub fn node_mut(&mut self, fq: &str) -> Result<&mut Node> {
        let (layer, node) = split_fq(fq)
            .ok_or_else(|| WeirError::not_found(format!("malformed node name '{fq}'")))?;
        let layer_name = layer.to_string();
        self.layer_mut(&layer_name)?
            .nodes
            .get_mut(node)
            .ok_or_else(|| WeirError::not_found(format!("node '{fq}'")))
    }

    /// Add a freshly parsed layer. Parent references are resolved here:
    /// unqualified names resolve within the new layer first, then as
    /// `layer/node` into existing layers. Links into layers that do not
    /// exist yet are rejected.
    pub fn add_layer(&mut self, mut layer: Layer) -> Result<()> {
        if self.layers.contains_key(&layer.name) {
            return Err(WeirError::invalid(format!(
                "layer '{}' already exists",
                layer.name
            )));
        }

        // resolve parent names to fully qualified form
        let local: Vec<String> = layer.nodes.keys().cloned().collect();
        let mut links: Vec<(String, String)> = Vec::new();
        for node in layer.nodes.values_mut() {
            let mut resolved = Vec::with_capacity(node.parents.len());
            for p in &node.parents {
                let fq = if let Some((l, n)) = split_fq(p) {
                    if l == layer.name {
                        if !local.contains(&n.to_string()) {
                            return Err(WeirError::not_found(format!("node '{p}'")));
                        }
                        p.clone()
                    } else {
                        // cross-layer link: target layer must already exist
                        self.node(p)?;
                        p.clone()
                    }
                } else if local.contains(p) {
                    format!("{}/{}", layer.name, p)
                } else {
                    return Err(WeirError::not_found(format!(
                        "parent '{p}' of node '{}/{}'",
                        layer.name, node.name
                    )));
                };
                links.push((fq.clone(), node.fq_name()));
                resolved.push(fq);
            }
            node.parents = resolved;
        }

        // wire children back-references
        for (parent_fq, child_fq) in links {
            if let Some((l, n)) = split_fq(&parent_fq) {
                if l == layer.name {
                    if let Some(p) = layer.nodes.get_mut(n) {
                        p.children.push(child_fq);
                    }
                } else if let Ok(p) = self.node_mut(&parent_fq) {
                    p.children.push(child_fq);
                }
            }
        }

        self.layers.insert(layer.name.clone(), layer);
        Ok(())
    }

    /// Drop a layer, unhooking its children references from other layers.
    /// Refused while nodes in other layers still consume from it.
    pub fn remove_layer(&mut self, name: &str) -> Result<()> {
        let layer = self.layer(name)?;
        if layer.status == LayerStatus::Running {
            return Err(WeirError::invalid(format!(
                "layer '{name}' is running; stop it first"
            )));
        }
        for node in layer.nodes.values() {
            for child in &node.children {
                if let Some((l, _)) = split_fq(child) {
                    if l != name {
                        return Err(WeirError::invalid(format!(
                            "layer '{name}' still feeds '{child}'"
                        )));
                    }
                }
            }
        }
        let removed = self
            .layers
            .remove(name)
            .unwrap_or_else(|| unreachable!("checked above"));
        // unhook from parents living in other layers
        for node in removed.nodes.values() {
            let fq = node.fq_name();
            for parent in &node.parents {
                if let Some((l, _)) = split_fq(parent) {
                    if l != name {
                        if let Ok(p) = self.node_mut(parent) {
                            p.children.retain(|c| c != &fq);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Node names of a layer sorted parents-first; nodes tied in a cycle
    /// keep their map order.
    pub fn topo_order(&self, layer_name: &str) -> Result<Vec<String>> {
        let layer = self.layer(layer_name)?;
        let mut order: Vec<String> = Vec::with_capacity(layer.nodes.len());
        let mut placed: Vec<String> = Vec::new();
        let mut remaining: Vec<&Node> = layer.nodes.values().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|node| {
                let ready = node.parents.iter().all(|p| {
                    match split_fq(p) {
                        Some((l, _)) if l == layer_name => placed.contains(p),
                        _ => true, // other layers start independently
                    }
                });
                if ready {
                    placed.push(node.fq_name());
                    order.push(node.name.clone());
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                // intra-layer cycle: flush the rest in map order
                for node in &remaining {
                    order.push(node.name.clone());
                }
                break;
            }
        }
        Ok(order)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| WeirError::fatal(format!("cannot serialize graph: {e}")))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // write-then-rename so a crash never leaves a torn graph file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut graph: Graph = serde_json::from_str(&data)
            .map_err(|e| WeirError::fatal(format!("cannot parse graph file: {e}")))?;
        // running state does not survive a restart
        for layer in graph.layers.values_mut() {
            if layer.status == LayerStatus::Running {
                layer.status = LayerStatus::Compiled;
            }
            for node in layer.nodes.values_mut() {
                node.pid = None;
                node.last_report = None;
            }
        }
        Ok(graph)
    }

    /// Render as graphviz dot.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph g {\n");
        for layer in self.layers.values() {
            let _ = writeln!(out, "  subgraph \"cluster_{}\" {{", layer.name);
            let _ = writeln!(out, "    label = \"{}\";", layer.name);
            for node in layer.nodes.values() {
                let _ = writeln!(out, "    \"{}\";", node.fq_name());
            }
            let _ = writeln!(out, "  }}");
        }
        for layer in self.layers.values() {
            for node in layer.nodes.values() {
                for child in &node.children {
                    let _ = writeln!(out, "  \"{}\" -> \"{child}\";", node.fq_name());
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Render as a mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        for layer in self.layers.values() {
            for node in layer.nodes.values() {
                for child in &node.children {
                    let _ = writeln!(out, "  {} --> {}", node.fq_name(), child);
                }
            }
        }
        out
    }
}

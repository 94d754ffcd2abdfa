//! # Graph supervisor
//!
//! Owns the graph and drives layer lifecycles: typing and artifact
//! generation on compile, ring-buffer and worker-process management on run
//! and stop, TTL reaping of ad-hoc layers, and child exit observation.
//! Workers never mutate the graph; everything here holds the single
//! `RwLock<Graph>` and persists it after each mutation.

use crate::config::Config;
use crate::error::{Result, WeirError};
use crate::export::{ExportDrain, ExportStore};
use crate::graph::{split_fq, Graph, Layer, LayerStatus, Node, Report};
use crate::parser::parse_operation;
use crate::ring::RingBuf;
use crate::runtime::Program;
use crate::typing::{infer, ParentSrc, TypeNode};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One node of a layer definition as submitted by a client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeDef {
    pub name: String,
    /// Operation source text
    pub operation: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// A layer definition as submitted by a client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LayerDef {
    pub name: String,
    pub nodes: Vec<NodeDef>,
    /// Idle TTL in seconds; reaped once idle past it
    #[serde(default)]
    pub timeout: Option<f64>,
}

pub struct Supervisor {
    pub config: Config,
    graph: RwLock<Graph>,
    pub export: Arc<ExportStore>,
    children: Mutex<HashMap<String, Child>>,
    drains: Mutex<HashMap<String, ExportDrain>>,
}

fn sanitize(fq: &str) -> String {
    fq.replace('/', "_")
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Arc<Supervisor>> {
        let graph_path = config.data.data_dir.join("graph.json");
        let graph = if graph_path.exists() {
            info!("loading graph from {}", graph_path.display());
            Graph::load(&graph_path)?
        } else {
            Graph::new()
        };
        let export = Arc::new(ExportStore::new(config.data.export_retention));
        Ok(Arc::new(Supervisor {
            config,
            graph: RwLock::new(graph),
            export,
            children: Mutex::new(HashMap::new()),
            drains: Mutex::new(HashMap::new()),
        }))
    }

    fn graph_path(&self) -> PathBuf {
        self.config.data.data_dir.join("graph.json")
    }

    fn artifact_path(&self, signature: &str) -> PathBuf {
        self.config
            .data
            .data_dir
            .join("bin")
            .join(format!("{signature}.json"))
    }

    fn input_ring_path(&self, node: &Node) -> PathBuf {
        let sig = node.signature.as_deref().unwrap_or("unsigned");
        self.config
            .data
            .data_dir
            .join("ringbufs")
            .join(format!("{}_{}.in.ring", &sig[..sig.len().min(16)], sanitize(&node.fq_name())))
    }

    fn export_ring_path(&self, node: &Node) -> PathBuf {
        let sig = node.signature.as_deref().unwrap_or("unsigned");
        self.config
            .data
            .data_dir
            .join("ringbufs")
            .join(format!("{}_{}.export.ring", &sig[..sig.len().min(16)], sanitize(&node.fq_name())))
    }

    fn ref_path(&self, fq: &str) -> PathBuf {
        self.config
            .data
            .data_dir
            .join("ringbufs")
            .join(format!("{}.out_ref", sanitize(fq)))
    }

    pub fn with_graph<T>(&self, f: impl FnOnce(&Graph) -> T) -> T {
        f(&self.graph.read())
    }

    fn save_graph(&self, graph: &Graph) -> Result<()> {
        graph.save(&self.graph_path())
    }

    // -- layer creation -----------------------------------------------------

    /// Parse and install a new layer, still in Edition.
    pub fn create_layer(&self, def: LayerDef) -> Result<()> {
        let mut layer = Layer::new(&def.name);
        layer.created = Some(Utc::now());
        layer.timeout = def.timeout;
        for nd in &def.nodes {
            let op = parse_operation(&nd.operation).map_err(|e| match e {
                WeirError::Syntax { message, .. } => {
                    WeirError::syntax(format!("{}/{}", def.name, nd.name), message)
                }
                other => other,
            })?;
            let mut node = Node::new(&def.name, &nd.name, op);
            // parents: the FROM clause and the explicit list both count
            let mut parents: Vec<String> = nd.parents.clone();
            for p in node.operation.parents() {
                if !parents.contains(p) {
                    parents.push(p.clone());
                }
            }
            node.parents = parents;
            if layer.nodes.insert(nd.name.clone(), node).is_some() {
                return Err(WeirError::invalid(format!(
                    "duplicate node '{}' in layer '{}'",
                    nd.name, def.name
                )));
            }
        }
        let mut graph = self.graph.write();
        graph.add_layer(layer)?;
        self.save_graph(&graph)?;
        info!(layer = %def.name, nodes = def.nodes.len(), "layer created");
        Ok(())
    }

    // -- compile ------------------------------------------------------------

    /// Type one layer and emit one artifact per unique signature.
    pub fn compile(&self, layer_name: &str) -> Result<()> {
        let mut graph = self.graph.write();
        match graph.layer(layer_name)?.status {
            LayerStatus::Compiled => return Ok(()),
            LayerStatus::Running => {
                return Err(WeirError::invalid(format!(
                    "layer '{layer_name}' is running"
                )))
            }
            LayerStatus::Edition | LayerStatus::Compiling => {}
        }
        graph.layer_mut(layer_name)?.status = LayerStatus::Compiling;

        let outcome = self.compile_locked(&mut graph, layer_name);
        match outcome {
            Ok(()) => {
                graph.layer_mut(layer_name)?.status = LayerStatus::Compiled;
                self.save_graph(&graph)?;
                info!(layer = %layer_name, "layer compiled");
                Ok(())
            }
            Err(e) => {
                graph.layer_mut(layer_name)?.status = LayerStatus::Edition;
                Err(e)
            }
        }
    }

    fn compile_locked(&self, graph: &mut Graph, layer_name: &str) -> Result<()> {
        let layer = graph.layer(layer_name)?;
        let node_names: Vec<String> = layer.nodes.keys().cloned().collect();
        let index: BTreeMap<&String, usize> = node_names.iter().zip(0..).collect();

        let mut tnodes: Vec<TypeNode> = Vec::with_capacity(node_names.len());
        for nname in &node_names {
            let node = &layer.nodes[nname];
            let mut tn = TypeNode::new(node.fq_name(), node.operation.clone());
            for p in &node.parents {
                let (pl, pn) = split_fq(p)
                    .ok_or_else(|| WeirError::not_found(format!("malformed parent '{p}'")))?;
                if pl == layer_name {
                    let idx = *index
                        .get(&pn.to_string())
                        .ok_or_else(|| WeirError::not_found(format!("node '{p}'")))?;
                    tn.parents.push(ParentSrc::Internal(idx));
                } else {
                    let pnode = graph.node(p)?;
                    if !pnode.out_schema.finished() {
                        return Err(WeirError::MissingDependency {
                            node: node.fq_name(),
                            parent: p.clone(),
                        });
                    }
                    tn.parents.push(ParentSrc::External(pnode.out_schema.clone()));
                }
            }
            tnodes.push(tn);
        }

        infer(&mut tnodes)?;

        let layer = graph.layer_mut(layer_name)?;
        for (nname, tn) in node_names.iter().zip(tnodes.into_iter()) {
            let node = layer
                .nodes
                .get_mut(nname)
                .unwrap_or_else(|| unreachable!("names enumerated above"));
            node.operation = tn.op;
            node.in_schema = tn.in_schema;
            node.out_schema = tn.out_schema;
            let signature = node.compute_signature();
            let artifact = self.artifact_path(&signature);
            if !artifact.exists() {
                Program {
                    signature: signature.clone(),
                    operation: node.operation.clone(),
                    in_schema: node.in_schema.clone(),
                    out_schema: node.out_schema.clone(),
                }
                .save(&artifact)?;
            }
            node.signature = Some(signature);
        }
        Ok(())
    }

    /// Compile every layer still in Edition, retrying for dependency order.
    /// A full round without progress means the dependencies form a loop.
    pub fn compile_all(&self) -> Result<()> {
        let names: Vec<String> = self.with_graph(|g| g.layers.keys().cloned().collect());
        let mut pending: Vec<String> = names
            .iter()
            .filter(|n| {
                self.with_graph(|g| {
                    g.layers
                        .get(*n)
                        .is_some_and(|l| l.status == LayerStatus::Edition)
                })
            })
            .cloned()
            .collect();
        let max_rounds = names.len().max(1);
        for _ in 0..max_rounds {
            if pending.is_empty() {
                return Ok(());
            }
            let mut still = Vec::new();
            for name in pending {
                match self.compile(&name) {
                    Ok(()) => {}
                    Err(WeirError::MissingDependency { .. }) => still.push(name),
                    Err(e) => return Err(e),
                }
            }
            pending = still;
        }
        match pending.first() {
            Some(layer) => Err(WeirError::DependencyLoop {
                layer: layer.clone(),
            }),
            None => Ok(()),
        }
    }

    // -- run ----------------------------------------------------------------

    /// Launch one worker per node, parents first.
    pub fn run(&self, layer_name: &str) -> Result<()> {
        let mut graph = self.graph.write();
        match graph.layer(layer_name)?.status {
            LayerStatus::Running => return Ok(()),
            LayerStatus::Compiled => {}
            _ => {
                return Err(WeirError::invalid(format!(
                    "layer '{layer_name}' is not compiled"
                )))
            }
        }

        let order = graph.topo_order(layer_name)?;

        // ring buffers first, so every ref file can name its targets
        for nname in &order {
            let node = &graph.layer(layer_name)?.nodes[nname];
            if !node.parents.is_empty() {
                RingBuf::create(&self.input_ring_path(node), self.config.runtime.ring_words)?;
            }
            if let Some(export) = node.operation.export() {
                RingBuf::create(&self.export_ring_path(node), self.config.runtime.ring_words)?;
                self.export.register(
                    &node.fq_name(),
                    node.out_schema.clone(),
                    export.event_time.clone(),
                );
            }
        }

        graph.layer_mut(layer_name)?.status = LayerStatus::Running;
        graph.layer_mut(layer_name)?.last_started = Some(Utc::now());
        graph.layer_mut(layer_name)?.last_error = None;

        // ref files for this layer and for external parents feeding it
        let mut refs_to_write: Vec<String> = Vec::new();
        for nname in &order {
            let node = &graph.layer(layer_name)?.nodes[nname];
            refs_to_write.push(node.fq_name());
            for p in &node.parents {
                if split_fq(p).is_some_and(|(l, _)| l != layer_name) {
                    refs_to_write.push(p.clone());
                }
            }
        }
        refs_to_write.dedup();
        for fq in &refs_to_write {
            self.write_ref_file(&graph, fq)?;
        }

        // spawn drains for exported nodes
        for nname in &order {
            let node = &graph.layer(layer_name)?.nodes[nname];
            if node.operation.export().is_some() {
                let fq = node.fq_name();
                let drain = ExportDrain::spawn(
                    Arc::clone(&self.export),
                    fq.clone(),
                    self.export_ring_path(node),
                )?;
                if let Some(old) = self.drains.lock().insert(fq, drain) {
                    old.stop();
                }
            }
        }

        // workers, parents first
        for nname in &order {
            let node = &graph.layer(layer_name)?.nodes[nname];
            let pid = self.spawn_worker(node)?;
            graph
                .layer_mut(layer_name)?
                .nodes
                .get_mut(nname)
                .unwrap_or_else(|| unreachable!("enumerated above"))
                .pid = Some(pid);
        }

        self.save_graph(&graph)?;
        info!(layer = %layer_name, workers = order.len(), "layer running");
        Ok(())
    }

    fn write_ref_file(&self, graph: &Graph, fq: &str) -> Result<()> {
        let node = graph.node(fq)?;
        let mut lines: Vec<String> = Vec::new();
        for child_fq in &node.children {
            let child = graph.node(child_fq)?;
            let running = graph
                .layers
                .get(&child.layer)
                .is_some_and(|l| l.status == LayerStatus::Running);
            if running {
                lines.push(self.input_ring_path(child).display().to_string());
            }
        }
        if node.operation.export().is_some() {
            lines.push(self.export_ring_path(node).display().to_string());
        }
        let path = self.ref_path(fq);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, lines.join("\n") + "\n")?;
        Ok(())
    }

    fn spawn_worker(&self, node: &Node) -> Result<u32> {
        let signature = node
            .signature
            .as_ref()
            .ok_or_else(|| WeirError::fatal(format!("node '{}' has no signature", node.fq_name())))?;
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg("worker")
            .env("program", self.artifact_path(signature))
            .env("output_ringbufs_ref", self.ref_path(&node.fq_name()))
            .env(
                "report_url",
                format!(
                    "http://{}/report/{}/{}",
                    self.config.http.listen, node.layer, node.name
                ),
            )
            .env("debug", "0");
        if !node.parents.is_empty() {
            cmd.env("input_ringbuf", self.input_ring_path(node));
        }
        let child = cmd.spawn()?;
        let pid = child.id();
        self.children.lock().insert(node.fq_name(), child);
        info!(node = %node.fq_name(), pid, "worker spawned");
        Ok(pid)
    }

    // -- stop ---------------------------------------------------------------

    /// Terminate a layer's workers, reap them, release its ring buffers.
    pub fn stop(&self, layer_name: &str) -> Result<()> {
        let mut graph = self.graph.write();
        match graph.layer(layer_name)?.status {
            LayerStatus::Compiled => return Ok(()),
            LayerStatus::Running => {}
            _ => {
                return Err(WeirError::NotRunning {
                    layer: layer_name.to_string(),
                })
            }
        }

        let node_names: Vec<String> = graph.layer(layer_name)?.nodes.keys().cloned().collect();

        for nname in &node_names {
            let fq = format!("{layer_name}/{nname}");
            if let Some(mut child) = self.children.lock().remove(&fq) {
                terminate(&mut child, Duration::from_millis(self.config.runtime.stop_grace_ms));
            }
            if let Some(drain) = self.drains.lock().remove(&fq) {
                drain.stop();
            }
        }

        graph.layer_mut(layer_name)?.status = LayerStatus::Compiled;
        graph.layer_mut(layer_name)?.last_stopped = Some(Utc::now());

        // unmap and unlink this layer's buffers, rewire external parents
        let mut parent_refs: Vec<String> = Vec::new();
        for nname in &node_names {
            let node = graph.layer(layer_name)?.nodes[nname].clone();
            graph
                .layer_mut(layer_name)?
                .nodes
                .get_mut(nname)
                .unwrap_or_else(|| unreachable!("enumerated above"))
                .pid = None;
            if !node.parents.is_empty() {
                let path = self.input_ring_path(&node);
                if path.exists() {
                    if let Ok(ring) = RingBuf::open(&path) {
                        let _ = ring.unlink();
                    } else {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
            if node.operation.export().is_some() {
                let _ = std::fs::remove_file(self.export_ring_path(&node));
            }
            for p in &node.parents {
                if split_fq(p).is_some_and(|(l, _)| l != layer_name) && !parent_refs.contains(p) {
                    parent_refs.push(p.clone());
                }
            }
        }
        for p in &parent_refs {
            if let Err(e) = self.write_ref_file(&graph, p) {
                warn!(parent = %p, "cannot rewrite ref file: {e}");
            }
        }

        self.save_graph(&graph)?;
        info!(layer = %layer_name, "layer stopped");
        Ok(())
    }

    // -- periodic duties ----------------------------------------------------

    /// Observe worker exits. A dead worker only takes its own node down;
    /// when the last one is gone the layer falls back to Compiled.
    pub fn reap_children(&self) {
        let mut exited: Vec<(String, Option<i32>)> = Vec::new();
        {
            let mut children = self.children.lock();
            let fqs: Vec<String> = children.keys().cloned().collect();
            for fq in fqs {
                if let Some(child) = children.get_mut(&fq) {
                    if let Ok(Some(status)) = child.try_wait() {
                        exited.push((fq.clone(), status.code()));
                        children.remove(&fq);
                    }
                }
            }
        }
        if exited.is_empty() {
            return;
        }
        let mut graph = self.graph.write();
        for (fq, code) in exited {
            if code == Some(0) {
                info!(node = %fq, "worker finished");
            } else {
                error!(node = %fq, code = ?code, "worker aborted");
            }
            let Ok(node) = graph.node_mut(&fq) else {
                continue;
            };
            node.pid = None;
            let layer_name = node.layer.clone();
            if code != Some(0) {
                if let Ok(layer) = graph.layer_mut(&layer_name) {
                    layer.last_error = Some(format!("worker {fq} exited with {code:?}"));
                    let all_dead = layer.nodes.values().all(|n| n.pid.is_none());
                    if all_dead {
                        layer.status = LayerStatus::Compiled;
                        layer.last_stopped = Some(Utc::now());
                    }
                }
            }
        }
        let _ = self.save_graph(&graph);
    }

    /// Stop and remove layers idle past their TTL.
    pub fn timeout_layers(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self.with_graph(|g| {
            g.layers
                .values()
                .filter(|l| {
                    l.timeout.is_some_and(|ttl| {
                        l.last_activity().is_some_and(|at| {
                            (now - at).num_milliseconds() as f64 / 1e3 > ttl
                        })
                    })
                })
                .map(|l| l.name.clone())
                .collect()
        });
        for name in expired {
            info!(layer = %name, "layer idle past its TTL, reaping");
            if let Err(e) = self.stop(&name) {
                if !matches!(e, WeirError::NotRunning { .. }) {
                    warn!(layer = %name, "cannot stop expired layer: {e}");
                    continue;
                }
            }
            let mut graph = self.graph.write();
            match graph.remove_layer(&name) {
                Ok(()) => {
                    let _ = self.save_graph(&graph);
                }
                Err(e) => warn!(layer = %name, "cannot remove expired layer: {e}"),
            }
        }
    }

    /// Record worker telemetry.
    pub fn report(&self, layer: &str, node: &str, body: serde_json::Value) -> Result<()> {
        let mut graph = self.graph.write();
        let n = graph.node_mut(&format!("{layer}/{node}"))?;
        n.last_report = Some(Report {
            time: Some(Utc::now()),
            body,
        });
        Ok(())
    }

    // -- autocompletion -----------------------------------------------------

    pub fn complete_nodes(&self, prefix: &str) -> Vec<String> {
        self.with_graph(|g| {
            g.layers
                .values()
                .flat_map(|l| l.nodes.values().map(Node::fq_name))
                .filter(|fq| fq.starts_with(prefix))
                .collect()
        })
    }

    pub fn complete_fields(&self, node: Option<&str>, prefix: &str) -> Vec<String> {
        self.with_graph(|g| {
            let mut out: Vec<String> = Vec::new();
            for layer in g.layers.values() {
                for n in layer.nodes.values() {
                    if node.is_some_and(|want| n.fq_name() != want) {
                        continue;
                    }
                    for f in n.out_schema.field_names() {
                        if f.starts_with(prefix) && !out.iter().any(|o| o == f) {
                            out.push(f.to_string());
                        }
                    }
                }
            }
            out.sort();
            out
        })
    }
}

/// SIGTERM, bounded wait, then SIGKILL.
fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id() as i32;
    // Safety: plain kill(2) on a pid we own.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = std::time::Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarType;

    fn test_supervisor() -> (tempfile::TempDir, Arc<Supervisor>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.data.data_dir = dir.path().to_path_buf();
        let sup = Supervisor::new(config).expect("supervisor");
        (dir, sup)
    }

    fn word_layer() -> LayerDef {
        LayerDef {
            name: "words".to_string(),
            nodes: vec![
                NodeDef {
                    name: "lines".to_string(),
                    operation: "YIELD \"hello world\" AS line EVERY 1".to_string(),
                    parents: vec![],
                },
                NodeDef {
                    name: "splitter".to_string(),
                    operation: "SELECT SPLIT(\" \", line) AS word FROM lines COMMIT WHEN true"
                        .to_string(),
                    parents: vec![],
                },
            ],
            timeout: None,
        }
    }

    #[test]
    fn create_and_compile_layer() {
        let (_dir, sup) = test_supervisor();
        sup.create_layer(word_layer()).expect("create");
        sup.compile("words").expect("compile");
        sup.with_graph(|g| {
            let layer = g.layer("words").expect("layer");
            assert_eq!(layer.status, LayerStatus::Compiled);
            let splitter = g.node("words/splitter").expect("node");
            assert!(splitter.signature.is_some());
            assert_eq!(
                splitter.out_schema.get("word").and_then(|t| t.scalar),
                Some(ScalarType::Str)
            );
        });
    }

    #[test]
    fn compile_is_idempotent_and_reuses_artifacts() {
        let (_dir, sup) = test_supervisor();
        sup.create_layer(word_layer()).expect("create");
        sup.compile("words").expect("compile");
        let sig = sup.with_graph(|g| {
            g.node("words/splitter")
                .expect("node")
                .signature
                .clone()
                .expect("signature")
        });
        let artifact = sup.artifact_path(&sig);
        assert!(artifact.exists());
        sup.compile("words").expect("second compile");
    }

    #[test]
    fn compile_reports_syntax_errors_with_node() {
        let (_dir, sup) = test_supervisor();
        sup.create_layer(LayerDef {
            name: "bad".to_string(),
            nodes: vec![NodeDef {
                name: "agg".to_string(),
                operation: "SELECT nope AS x FROM src COMMIT WHEN true".to_string(),
                parents: vec![],
            }],
            timeout: None,
        })
        .expect_err("parent 'src' does not exist");
    }

    #[test]
    fn stop_before_run_is_rejected() {
        let (_dir, sup) = test_supervisor();
        sup.create_layer(word_layer()).expect("create");
        assert!(matches!(
            sup.stop("words"),
            Err(WeirError::NotRunning { .. })
        ));
    }

    #[test]
    fn compile_all_detects_missing_dependency() {
        let (_dir, sup) = test_supervisor();
        sup.create_layer(word_layer()).expect("create base");
        sup.create_layer(LayerDef {
            name: "counts".to_string(),
            nodes: vec![NodeDef {
                name: "counter".to_string(),
                operation:
                    "SELECT SUM(1u32) AS count, word AS word FROM words/splitter GROUP BY word \
                     COMMIT AND KEEP ALL WHEN true"
                        .to_string(),
                parents: vec!["words/splitter".to_string()],
            }],
            timeout: None,
        })
        .expect("create counts");
        // counts depends on words; compile_all orders them
        sup.compile_all().expect("compile all");
        sup.with_graph(|g| {
            assert_eq!(g.layer("counts").expect("layer").status, LayerStatus::Compiled);
        });
    }
}

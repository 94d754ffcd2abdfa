//! Graph persistence and layer lifecycle bookkeeping.

use std::sync::Arc;
use weir::supervisor::{LayerDef, NodeDef, Supervisor};
use weir::{Config, Graph, LayerStatus};

fn supervisor_at(dir: &std::path::Path) -> Arc<Supervisor> {
    let mut config = Config::default();
    config.data.data_dir = dir.to_path_buf();
    Supervisor::new(config).expect("supervisor")
}

fn demo_layer() -> LayerDef {
    LayerDef {
        name: "demo".to_string(),
        nodes: vec![
            NodeDef {
                name: "src".to_string(),
                operation: "YIELD 1u32 AS n EVERY 1".to_string(),
                parents: vec![],
            },
            NodeDef {
                name: "agg".to_string(),
                operation: "SELECT SUM(n) AS total FROM src COMMIT WHEN true".to_string(),
                parents: vec![],
            },
        ],
        timeout: None,
    }
}

#[test]
fn graph_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let sup = supervisor_at(dir.path());
        sup.create_layer(demo_layer()).expect("create");
        sup.compile("demo").expect("compile");
    }
    // a new supervisor over the same data_dir sees the compiled layer
    let sup = supervisor_at(dir.path());
    sup.with_graph(|g| {
        let layer = g.layer("demo").expect("layer");
        assert_eq!(layer.status, LayerStatus::Compiled);
        let agg = g.node("demo/agg").expect("agg");
        assert!(agg.signature.is_some());
        assert!(agg.out_schema.finished());
        assert!(agg.pid.is_none(), "pids are volatile");
        assert!(agg.last_report.is_none(), "reports are volatile");
    });
}

#[test]
fn reloaded_graph_equals_saved_graph() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.json");
    let sup = supervisor_at(dir.path());
    sup.create_layer(demo_layer()).expect("create");
    sup.compile("demo").expect("compile");

    let reloaded = Graph::load(&path).expect("load");
    sup.with_graph(|g| {
        assert_eq!(g.layers.len(), reloaded.layers.len());
        for (name, layer) in &g.layers {
            let rl = reloaded.layers.get(name).expect("layer survived");
            assert_eq!(layer.status, rl.status);
            for (nname, node) in &layer.nodes {
                let rn = rl.nodes.get(nname).expect("node survived");
                assert_eq!(node.operation, rn.operation);
                assert_eq!(node.parents, rn.parents);
                assert_eq!(node.children, rn.children);
                assert_eq!(node.in_schema, rn.in_schema);
                assert_eq!(node.out_schema, rn.out_schema);
                assert_eq!(node.signature, rn.signature);
            }
        }
    });
}

#[test]
fn recompile_after_reload_reuses_signatures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sig1 = {
        let sup = supervisor_at(dir.path());
        sup.create_layer(demo_layer()).expect("create");
        sup.compile("demo").expect("compile");
        sup.with_graph(|g| g.node("demo/agg").expect("agg").signature.clone())
    };
    let sup = supervisor_at(dir.path());
    // force a recompile pass over the same definitions
    sup.with_graph(|g| {
        assert_eq!(g.layer("demo").expect("demo").status, LayerStatus::Compiled);
    });
    let sig2 = sup.with_graph(|g| g.node("demo/agg").expect("agg").signature.clone());
    assert_eq!(sig1, sig2);
}

#[test]
fn expired_layers_are_reaped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sup = supervisor_at(dir.path());
    let mut def = demo_layer();
    def.name = "ephemeral".to_string();
    def.timeout = Some(0.01);
    sup.create_layer(def).expect("create");
    std::thread::sleep(std::time::Duration::from_millis(50));
    sup.timeout_layers();
    sup.with_graph(|g| {
        assert!(
            !g.layers.contains_key("ephemeral"),
            "TTL-carrying layer should be gone"
        );
    });
}

#[test]
fn duplicate_layer_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sup = supervisor_at(dir.path());
    sup.create_layer(demo_layer()).expect("create");
    assert!(sup.create_layer(demo_layer()).is_err());
}

//! Type inference over whole layers, driven through the supervisor.

use weir::supervisor::{LayerDef, NodeDef, Supervisor};
use weir::value::ScalarType;
use weir::{Config, LayerStatus, WeirError};

fn test_supervisor() -> (tempfile::TempDir, std::sync::Arc<Supervisor>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.data.data_dir = dir.path().to_path_buf();
    let sup = Supervisor::new(config).expect("supervisor");
    (dir, sup)
}

fn layer(name: &str, nodes: &[(&str, &str)]) -> LayerDef {
    LayerDef {
        name: name.to_string(),
        nodes: nodes
            .iter()
            .map(|(n, op)| NodeDef {
                name: n.to_string(),
                operation: op.to_string(),
                parents: vec![],
            })
            .collect(),
        timeout: None,
    }
}

#[test]
fn schemas_flow_down_a_chain() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "chain",
        &[
            ("src", "YIELD 1u8 AS n, \"x\" AS tag"),
            ("mid", "SELECT n + 1u8 AS n2, * FROM src COMMIT WHEN true"),
            ("sink", "SELECT SUM(n2) AS total FROM mid COMMIT WHEN true"),
        ],
    ))
    .expect("create");
    sup.compile("chain").expect("compile");
    sup.with_graph(|g| {
        let mid = g.node("chain/mid").expect("mid");
        // SELECT * appended the inherited fields after n2
        let names: Vec<&str> = mid.out_schema.field_names().collect();
        assert_eq!(names, vec!["n2", "n", "tag"]);
        let sink = g.node("chain/sink").expect("sink");
        assert!(sink.in_schema.finished());
        assert_eq!(
            sink.in_schema.field_names().collect::<Vec<_>>(),
            vec!["n2", "n", "tag"]
        );
        // input fields are a subset of the parent's output fields
        for f in sink.in_schema.field_names() {
            assert!(mid.out_schema.contains(f), "field {f} appeared from nowhere");
        }
    });
}

#[test]
fn two_parent_widening_reaches_i32() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "mix",
        &[
            ("small", "YIELD 1u8 AS x"),
            ("wide", "YIELD 2i16 AS x"),
            ("join", "SELECT x AS x FROM small, wide COMMIT WHEN true"),
        ],
    ))
    .expect("create");
    sup.compile("mix").expect("compile");
    sup.with_graph(|g| {
        let join = g.node("mix/join").expect("join");
        assert_eq!(
            join.in_schema.get("x").and_then(|t| t.scalar),
            Some(ScalarType::I32)
        );
    });
}

#[test]
fn constant_widening_to_i16_comparison() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "hot",
        &[
            ("src", "YIELD 1i16 AS n"),
            ("agg", "SELECT SUM(1i16) > 500 AS hot FROM src COMMIT WHEN true"),
        ],
    ))
    .expect("create");
    sup.compile("hot").expect("compile");
    sup.with_graph(|g| {
        let agg = g.node("hot/agg").expect("agg");
        let hot = agg.out_schema.get("hot").expect("hot field");
        assert_eq!(hot.scalar, Some(ScalarType::Bool));
        assert_eq!(hot.nullable, Some(false));
    });
}

#[test]
fn nullable_where_fails_and_coalesce_fixes_it() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "guard",
        &[
            (
                "src",
                "READ FROM CSV \"mem.csv\" (time float, plugin string NULL, value float)",
            ),
            (
                "bad",
                "SELECT value AS value FROM src WHERE plugin = \"memory\" COMMIT WHEN true",
            ),
        ],
    ))
    .expect("create");
    match sup.compile("guard") {
        Err(WeirError::Syntax { node, message }) => {
            assert!(node.contains("bad"), "error should locate the node: {node}");
            assert!(
                message.contains("WHERE clause must not be nullable"),
                "{message}"
            );
        }
        other => panic!("expected a nullable-WHERE rejection, got {other:?}"),
    }
    // the compile failure left the layer editable
    sup.with_graph(|g| {
        assert_eq!(g.layer("guard").expect("layer").status, LayerStatus::Edition);
    });

    let (_dir2, sup2) = test_supervisor();
    sup2.create_layer(layer(
        "guard",
        &[
            (
                "src",
                "READ FROM CSV \"mem.csv\" (time float, plugin string NULL, value float)",
            ),
            (
                "ok",
                "SELECT value AS value FROM src \
                 WHERE COALESCE(plugin = \"memory\", false) COMMIT WHEN true",
            ),
        ],
    ))
    .expect("create");
    sup2.compile("guard").expect("COALESCE makes WHERE total");
}

#[test]
fn signatures_are_deterministic_and_shared() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "twins",
        &[
            ("src", "YIELD 1u32 AS n"),
            ("a", "SELECT n AS n FROM src COMMIT WHEN true"),
            ("b", "SELECT n AS n FROM src COMMIT WHEN true"),
        ],
    ))
    .expect("create");
    sup.compile("twins").expect("compile");
    let (sig_a, sig_b) = sup.with_graph(|g| {
        (
            g.node("twins/a").expect("a").signature.clone(),
            g.node("twins/b").expect("b").signature.clone(),
        )
    });
    assert!(sig_a.is_some());
    // same typed operation, same compiled artifact
    assert_eq!(sig_a, sig_b);

    // compiling an identical graph elsewhere produces the same signature
    let (_dir2, sup2) = test_supervisor();
    sup2.create_layer(layer(
        "twins",
        &[
            ("src", "YIELD 1u32 AS n"),
            ("a", "SELECT n AS n FROM src COMMIT WHEN true"),
            ("b", "SELECT n AS n FROM src COMMIT WHEN true"),
        ],
    ))
    .expect("create");
    sup2.compile("twins").expect("compile");
    let sig_a2 = sup2.with_graph(|g| g.node("twins/a").expect("a").signature.clone());
    assert_eq!(sig_a, sig_a2);
}

#[test]
fn cross_layer_dependency_requires_compiled_parent() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer("base", &[("src", "YIELD 1u32 AS n")]))
        .expect("create base");
    sup.create_layer(LayerDef {
        name: "top".to_string(),
        nodes: vec![NodeDef {
            name: "agg".to_string(),
            operation: "SELECT SUM(n) AS total FROM base/src COMMIT WHEN true".to_string(),
            parents: vec!["base/src".to_string()],
        }],
        timeout: None,
    })
    .expect("create top");

    assert!(matches!(
        sup.compile("top"),
        Err(WeirError::MissingDependency { .. })
    ));
    // the retry loop orders them
    sup.compile_all().expect("compile all");
    sup.with_graph(|g| {
        assert_eq!(g.layer("top").expect("top").status, LayerStatus::Compiled);
    });
}

#[test]
fn every_schema_field_is_fully_typed_after_compile() {
    let (_dir, sup) = test_supervisor();
    sup.create_layer(layer(
        "full",
        &[
            (
                "src",
                "READ FROM CSV \"d.csv\" (time float, kind string NULL, value float)",
            ),
            (
                "agg",
                "SELECT MIN(time) AS time, AVG(IF kind = \"free\" THEN value) AS free, * \
                 FROM src GROUP BY time // 30.0 COMMIT WHEN in.time > previous.time + 30.0",
            ),
        ],
    ))
    .expect("create");
    sup.compile("full").expect("compile");
    sup.with_graph(|g| {
        for fq in ["full/src", "full/agg"] {
            let node = g.node(fq).expect("node");
            assert!(node.in_schema.finished() && node.out_schema.finished());
            for f in node.out_schema.iter() {
                assert!(
                    f.typ.is_complete(),
                    "{fq} field {} is incomplete",
                    f.name
                );
            }
        }
        // AVG over a CASE without ELSE is nullable
        let agg = g.node("full/agg").expect("agg");
        assert_eq!(agg.out_schema.get("free").and_then(|t| t.nullable), Some(true));
    });
}

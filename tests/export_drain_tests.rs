//! Export path: tuples committed to an export ring buffer end up in the
//! retention store, long-poll-ready and sliceable.

use std::sync::Arc;
use std::time::{Duration, Instant};
use weir::codec::encode_tuple;
use weir::export::{Consolidation, ExportDrain, ExportStore};
use weir::ring::RingBuf;
use weir::schema::{ExprType, TupleSchema};
use weir::value::{ScalarType, Value};

fn schema() -> TupleSchema {
    let mut s = TupleSchema::new();
    s.push("time", ExprType::typed("time", ScalarType::Float, false))
        .expect("push");
    s.push("value", ExprType::typed("value", ScalarType::Float, false))
        .expect("push");
    s.set_finished();
    s
}

#[test]
fn drained_tuples_reach_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ring_path = dir.path().join("export.ring");
    let ring = RingBuf::create(&ring_path, 1024).expect("create");

    let store = Arc::new(ExportStore::new(100));
    store.register("demo/node", schema(), None);
    let drain =
        ExportDrain::spawn(Arc::clone(&store), "demo/node".to_string(), ring_path.clone())
            .expect("spawn drain");

    for i in 0..5 {
        let tuple = vec![Value::Float(f64::from(i)), Value::Float(f64::from(i) * 10.0)];
        ring.enqueue(&encode_tuple(&schema(), &tuple).expect("encode"))
            .expect("enqueue");
    }

    // the drain thread polls every few milliseconds
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let rows = store.fold_tuples("demo/node", None, None).expect("fold");
        if rows.len() == 5 {
            assert_eq!(rows[0].1[1], Value::Float(0.0));
            assert_eq!(rows[4].1[1], Value::Float(40.0));
            break;
        }
        assert!(Instant::now() < deadline, "drain never caught up");
        std::thread::sleep(Duration::from_millis(10));
    }
    drain.stop();
}

#[test]
fn drained_tuples_are_timeseries_queryable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ring_path = dir.path().join("export.ring");
    let ring = RingBuf::create(&ring_path, 1024).expect("create");

    let store = Arc::new(ExportStore::new(100));
    store.register(
        "demo/node",
        schema(),
        Some(weir::expr::EventTime {
            start_field: "time".to_string(),
            start_scale: 1.0,
            duration: weir::expr::EventDuration::Const(0.0),
        }),
    );
    let drain =
        ExportDrain::spawn(Arc::clone(&store), "demo/node".to_string(), ring_path.clone())
            .expect("spawn drain");

    for (t, v) in [(1.0, 5.0), (2.0, 15.0), (11.0, 100.0)] {
        let tuple = vec![Value::Float(t), Value::Float(v)];
        ring.enqueue(&encode_tuple(&schema(), &tuple).expect("encode"))
            .expect("enqueue");
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while store.fold_tuples("demo/node", None, None).expect("fold").len() < 3 {
        assert!(Instant::now() < deadline, "drain never caught up");
        std::thread::sleep(Duration::from_millis(10));
    }
    drain.stop();

    let pts = store
        .build_timeseries("demo/node", "value", 2, 0.0, 20.0, Consolidation::Avg)
        .expect("timeseries");
    assert_eq!(pts[0].1, Some(10.0)); // avg(5, 15) in [0, 10)
    assert_eq!(pts[1].1, Some(100.0)); // [10, 20)
}

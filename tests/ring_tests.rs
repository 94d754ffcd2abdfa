//! Ring buffer transport: FIFO laws, backpressure, capacity boundaries,
//! and tuple traffic through the word codec.

use weir::codec::{decode_tuple, encode_tuple};
use weir::ring::RingBuf;
use weir::schema::{ExprType, TupleSchema};
use weir::value::{ScalarType, Value};
use weir::WeirError;

fn ring(words: u32) -> (tempfile::TempDir, RingBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let rb = RingBuf::create(&dir.path().join("t.ring"), words).expect("create");
    (dir, rb)
}

#[test]
fn n_messages_in_n_messages_out() {
    let (_dir, rb) = ring(1024);
    let messages: Vec<Vec<u32>> = (0..100u32).map(|i| vec![i, i * 2, i * 3]).collect();
    for m in &messages {
        rb.enqueue(m).expect("enqueue");
    }
    for expect in &messages {
        assert_eq!(rb.dequeue().expect("dequeue").as_ref(), Some(expect));
    }
    assert_eq!(rb.dequeue().expect("dequeue"), None);
}

#[test]
fn interleaved_traffic_preserves_order() {
    let (_dir, rb) = ring(32);
    let mut sent = 0u32;
    let mut received = 0u32;
    while received < 1000 {
        if sent < 1000 && rb.enqueue(&[sent]).is_ok() {
            sent += 1;
        } else {
            if let Some(words) = rb.dequeue().expect("dequeue") {
                assert_eq!(words, vec![received]);
                received += 1;
            }
        }
    }
}

#[test]
fn oversized_message_fails_permanently() {
    let (_dir, rb) = ring(16);
    let too_big = vec![0u32; 16];
    for _ in 0..3 {
        assert!(matches!(
            rb.enqueue(&too_big),
            Err(WeirError::TooBig { .. })
        ));
    }
    // the ring still works for fitting messages
    rb.enqueue(&[1]).expect("enqueue");
    assert_eq!(rb.dequeue().expect("dequeue"), Some(vec![1]));
}

#[test]
fn backpressure_resolves_after_drain() {
    let (_dir, rb) = ring(16);
    let mut queued = 0;
    loop {
        match rb.enqueue(&[queued]) {
            Ok(()) => queued += 1,
            Err(WeirError::NoSpace) => break,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(queued > 0);
    let _ = rb.dequeue().expect("dequeue");
    rb.enqueue(&[99]).expect("space reclaimed");
}

#[test]
fn tuples_survive_the_wire() {
    let mut schema = TupleSchema::new();
    schema
        .push("time", ExprType::typed("time", ScalarType::Float, false))
        .expect("push");
    schema
        .push("word", ExprType::typed("word", ScalarType::Str, false))
        .expect("push");
    schema
        .push("count", ExprType::typed("count", ScalarType::U64, true))
        .expect("push");
    schema.set_finished();

    let (_dir, rb) = ring(4096);
    let tuples = vec![
        vec![
            Value::Float(1.5),
            Value::Str("hello".to_string()),
            Value::U64(1),
        ],
        vec![
            Value::Float(2.5),
            Value::Str("".to_string()),
            Value::Null(ScalarType::U64),
        ],
        vec![
            Value::Float(-3.25),
            Value::Str("snowman \u{2603}".to_string()),
            Value::U64(u64::MAX),
        ],
    ];
    for t in &tuples {
        rb.enqueue(&encode_tuple(&schema, t).expect("encode"))
            .expect("enqueue");
    }
    for expect in &tuples {
        let words = rb.dequeue().expect("dequeue").expect("message");
        assert_eq!(&decode_tuple(&schema, &words).expect("decode"), expect);
    }
}

#[test]
fn used_words_never_exceed_capacity() {
    let (_dir, rb) = ring(32);
    for i in 0..500u32 {
        if rb.enqueue(&[i, i]).is_err() {
            let _ = rb.dequeue().expect("dequeue");
        }
        assert!(rb.used_words() < rb.nb_words());
    }
}

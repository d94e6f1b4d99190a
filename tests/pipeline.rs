//! End-to-end scenarios: operator definitions are parsed and typed, and
//! tuples flow between runtimes through real memory-mapped ring buffers
//! using the wire codec, the way two worker processes would exchange
//! them.

use indexmap::IndexMap;
use sluice::lang::parse_operation;
use sluice::ringbuf::RingBuf;
use sluice::runtime::aggregate::AggregateRuntime;
use sluice::runtime::TypedProgram;
use sluice::signature::node_signature;
use sluice::typing::type_layer;
use sluice::wire::{decode_tuple, encode_tuple};
use sluice::Tuple;
use sluice_types::graph::{Node, NodeRef};
use sluice_types::scalar::ScalarValue;
use std::collections::HashMap;
use std::path::PathBuf;

fn typed_layer(defs: &[(&str, &str)]) -> IndexMap<String, Node> {
    let mut nodes = IndexMap::new();
    for (name, def) in defs {
        let (op, from) = parse_operation(name, def).unwrap();
        let parents = from.iter().map(|f| NodeRef::new("l", f.clone())).collect();
        let n = Node::new(*name, op, parents);
        nodes.insert(n.name.clone(), n);
    }
    type_layer("l", &mut nodes, &HashMap::new()).unwrap();
    nodes
}

fn runtime(node: &Node) -> AggregateRuntime {
    AggregateRuntime::new(
        &node.operation,
        &node.in_schema,
        &node.out_schema,
        HashMap::new(),
    )
    .unwrap()
}

fn tmp(name: &str) -> PathBuf {
    use std::sync::OnceLock;
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().to_path_buf();
        std::mem::forget(td); // keep it for the whole test run
        path
    })
    .join(name)
}

#[test]
fn word_count_through_ring_buffers() {
    let nodes = typed_layer(&[
        ("lines", r#"READ CSV FILE "/dev/null" (line string NOT NULL)"#),
        ("splitter", r#"SELECT SPLIT(line, " ") AS word FROM lines"#),
        (
            "counter",
            "SELECT SUM 1 AS count, word FROM splitter \
             GROUP BY word COMMIT WHEN true FLUSH WHEN false",
        ),
    ]);
    let mut splitter = runtime(&nodes["splitter"]);
    let mut counter = runtime(&nodes["counter"]);

    // One buffer between each pair, exactly like the supervisor wires it.
    let to_splitter = RingBuf::create(&tmp("wc-split.rb"), 1 << 10).unwrap();
    let to_counter = RingBuf::create(&tmp("wc-count.rb"), 1 << 10).unwrap();

    for line in ["hello world", "hello again"] {
        let tuple: Tuple = vec![ScalarValue::String(line.into())];
        to_splitter
            .enqueue(&encode_tuple(&nodes["lines"].out_schema, &tuple).unwrap())
            .unwrap();
    }

    // Splitter worker loop.
    while let Some(words) = to_splitter.dequeue().unwrap() {
        let tuple = decode_tuple(&nodes["splitter"].in_schema, &words).unwrap();
        for out in splitter.process(tuple).unwrap() {
            to_counter
                .enqueue(&encode_tuple(&nodes["splitter"].out_schema, &out).unwrap())
                .unwrap();
        }
    }

    // Counter worker loop.
    let mut emitted: Vec<(i32, String)> = Vec::new();
    while let Some(words) = to_counter.dequeue().unwrap() {
        let tuple = decode_tuple(&nodes["counter"].in_schema, &words).unwrap();
        for out in counter.process(tuple).unwrap() {
            let ScalarValue::I32(n) = out[0] else { panic!() };
            let ScalarValue::String(w) = &out[1] else { panic!() };
            emitted.push((n, w.clone()));
        }
    }
    assert_eq!(
        emitted,
        vec![
            (1, "hello".into()),
            (1, "world".into()),
            (2, "hello".into()),
            (1, "again".into()),
        ]
    );
}

#[test]
fn signatures_key_reusable_programs() {
    let build = || {
        typed_layer(&[
            ("src", r#"READ CSV FILE "/dev/null" (v float NOT NULL)"#),
            ("agg", "SELECT SUM v AS total FROM src COMMIT WHEN true"),
        ])
    };
    let a = build();
    let b = build();
    let sig = |nodes: &IndexMap<String, Node>, name: &str| {
        let n = &nodes[name];
        node_signature(&n.operation, &n.in_schema, &n.out_schema)
    };
    // Same typed operation, same signature: the artifact cache hits.
    assert_eq!(sig(&a, "agg"), sig(&b, "agg"));
    assert_ne!(sig(&a, "agg"), sig(&a, "src"));

    // And the artifact itself round-trips through disk.
    let n = &a["agg"];
    let program = TypedProgram {
        node: NodeRef::new("l", "agg"),
        operation: n.operation.clone(),
        in_schema: n.in_schema.clone(),
        out_schema: n.out_schema.clone(),
        signature: sig(&a, "agg"),
    };
    let path = tmp("agg-program.json");
    program.save(&path).unwrap();
    assert_eq!(TypedProgram::load(&path).unwrap(), program);
}

#[test]
fn exported_tuples_feed_time_series() {
    use sluice::export::{build_timeseries, Consolidation, RetainedTuples};

    let nodes = typed_layer(&[
        (
            "src",
            r#"READ CSV FILE "/dev/null" (t float NOT NULL, v float NOT NULL)"#,
        ),
        (
            "metrics",
            "SELECT t, v FROM src \
             EXPORT EVENT STARTING AT t WITH DURATION 0",
        ),
    ]);
    let metrics = &nodes["metrics"];
    let mut retained = RetainedTuples::new(
        metrics.out_schema.clone(),
        metrics.operation.event_time().cloned(),
        1000,
    );
    for (t, v) in [(1.0, 10.0), (11.0, 20.0), (12.0, 30.0)] {
        retained.push(vec![ScalarValue::Float(t), ScalarValue::Float(v)]);
    }
    let points = build_timeseries(&retained, "v", 0.0, 20.0, 2, Consolidation::Avg).unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].1, Some(10.0));
    assert_eq!(points[1].1, Some(25.0));
}

#[test]
fn parse_print_parse_is_identity_on_the_ast() {
    let sources = [
        "SELECT SUM 1 AS count, word FROM splitter GROUP BY word \
         COMMIT WHEN true FLUSH WHEN false",
        "YIELD 1u8 AS one EVERY 2 SECONDS",
        r#"SELECT AVG(IF kind = "free" THEN value) AS free, MIN time AS time
           FROM src GROUP BY time // 30 COMMIT WHEN in.time > previous.time + 30"#,
    ];
    for src in sources {
        let (op1, _) = parse_operation("n", src).unwrap();
        let (op2, _) = parse_operation("n", &op1.to_string()).unwrap();
        assert_eq!(op1, op2);
    }
}

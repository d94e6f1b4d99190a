use super::aggregate::AggregateRuntime;
use crate::lang::parse_operation;
use crate::typing::type_layer;
use crate::Tuple;
use indexmap::IndexMap;
use sluice_types::graph::{Node, NodeRef};
use sluice_types::scalar::ScalarValue;
use std::collections::HashMap;

/// Parse and type a CSV source plus one aggregate, and return the
/// aggregate's runtime.
fn runtime_of(source_def: &str, agg_def: &str) -> AggregateRuntime {
    let mut nodes = IndexMap::new();
    for (name, def) in [("src", source_def), ("agg", agg_def)] {
        let (op, from) = parse_operation(name, def).unwrap();
        let parents = from.iter().map(|f| NodeRef::new("l", f.clone())).collect();
        let n = Node::new(name, op, parents);
        nodes.insert(n.name.clone(), n);
    }
    type_layer("l", &mut nodes, &HashMap::new()).unwrap();
    let agg = &nodes["agg"];
    AggregateRuntime::new(
        &agg.operation,
        &agg.in_schema,
        &agg.out_schema,
        HashMap::new(),
    )
    .unwrap()
}

fn s(v: &str) -> ScalarValue {
    ScalarValue::String(v.into())
}

fn f(v: f64) -> ScalarValue {
    ScalarValue::Float(v)
}

#[test]
fn word_count_is_streaming() {
    let mut splitter = runtime_of(
        r#"READ CSV FILE "/dev/null" (line string NOT NULL)"#,
        r#"SELECT SPLIT(line, " ") AS word FROM src"#,
    );
    let mut counter = runtime_of(
        r#"READ CSV FILE "/dev/null" (word string NOT NULL)"#,
        "SELECT SUM 1 AS count, word FROM src GROUP BY word COMMIT WHEN true FLUSH WHEN false",
    );
    let mut emitted: Vec<(i32, String)> = Vec::new();
    for line in ["hello world", "hello again"] {
        for word in splitter.process(vec![s(line)]).unwrap() {
            for out in counter.process(word).unwrap() {
                let ScalarValue::I32(n) = out[0] else { panic!() };
                let ScalarValue::String(w) = &out[1] else { panic!() };
                emitted.push((n, w.clone()));
            }
        }
    }
    assert_eq!(
        emitted,
        vec![
            (1, "hello".to_string()),
            (1, "world".to_string()),
            (2, "hello".to_string()),
            (1, "again".to_string()),
        ]
    );
}

#[test]
fn collectd_memory_aggregation_commits_on_bucket_change() {
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (time float NOT NULL, type_instance string NULL, value float NOT NULL)"#,
        r#"SELECT AVG(IF type_instance = "free" THEN value) AS free,
                  AVG(IF type_instance = "used" THEN value) AS used,
                  AVG(IF type_instance = "cached" THEN value) AS cached,
                  AVG(IF type_instance = "buffered" THEN value) AS buffered,
                  MIN time AS time
           FROM src GROUP BY time // 30
           COMMIT WHEN in.time > previous.time + 30"#,
    );
    let mut emitted: Vec<Tuple> = Vec::new();
    for (time, inst, value) in [
        (0.0, "free", 1000.0),
        (10.0, "used", 600.0),
        (20.0, "cached", 300.0),
    ] {
        emitted.extend(agg.process(vec![f(time), s(inst), f(value)]).unwrap());
        assert!(emitted.is_empty(), "nothing may commit before the bucket closes");
    }
    // The fourth tuple opens bucket 1 and closes bucket 0.
    emitted.extend(agg.process(vec![f(31.0), s("free"), f(1100.0)]).unwrap());
    assert_eq!(emitted.len(), 1);
    let out = &emitted[0];
    assert_eq!(out[0], f(1000.0)); // free
    assert_eq!(out[1], f(600.0)); // used
    assert_eq!(out[2], f(300.0)); // cached
    assert_eq!(out[3], ScalarValue::Null); // buffered
    assert_eq!(out[4], f(0.0)); // time
    // Bucket 0 was reset; only bucket 1 remains.
    assert_eq!(agg.nb_groups(), 1);
}

#[test]
fn top_k_emits_only_when_the_condition_fires() {
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (account string NOT NULL, amount float NOT NULL)"#,
        "SELECT account, SUM amount AS total FROM src GROUP BY account \
         TOP 3 BY SUM amount WHEN in.#count >= 10",
    );
    let mut emitted: Vec<Tuple> = Vec::new();
    for i in 0..10 {
        let account = format!("acct-{i}");
        let amount = (i as f64 + 1.0) * 10.0;
        emitted.extend(agg.process(vec![s(&account), f(amount)]).unwrap());
        if i < 9 {
            assert!(emitted.is_empty(), "no output before the 10th tuple");
        }
    }
    assert_eq!(emitted.len(), 3);
    let accounts: Vec<&str> = emitted
        .iter()
        .map(|t| t[0].as_str().unwrap())
        .collect();
    assert_eq!(accounts, vec!["acct-9", "acct-8", "acct-7"]);
    assert_eq!(emitted[0][1], f(100.0));
    // The emission flushed the window.
    assert_eq!(agg.nb_groups(), 0);
}

#[test]
fn slide_drops_the_oldest_contributors() {
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (value float NOT NULL)"#,
        "SELECT SUM value AS total FROM src \
         COMMIT AND SLIDE 1 WHEN group.#count >= 3",
    );
    let mut emitted: Vec<Tuple> = Vec::new();
    for v in [1.0, 2.0, 3.0, 4.0] {
        emitted.extend(agg.process(vec![f(v)]).unwrap());
    }
    // 1+2+3 commits, slides to [2,3]; then 2+3+4 commits.
    assert_eq!(emitted, vec![vec![f(6.0)], vec![f(9.0)]]);
}

#[test]
fn where_discards_null_and_false() {
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (plugin string NULL, value float NOT NULL)"#,
        r#"SELECT value FROM src WHERE COALESCE(plugin = "memory", false)"#,
    );
    assert!(agg
        .process(vec![ScalarValue::Null, f(1.0)])
        .unwrap()
        .is_empty());
    assert!(agg.process(vec![s("cpu"), f(2.0)]).unwrap().is_empty());
    assert_eq!(
        agg.process(vec![s("memory"), f(3.0)]).unwrap(),
        vec![vec![f(3.0)]]
    );
}

#[test]
fn group_first_and_last_are_readable() {
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (time float NOT NULL, value float NOT NULL)"#,
        "SELECT group.first.time AS start, group.last.time AS stop, SUM value AS total \
         FROM src COMMIT WHEN group.#count >= 3",
    );
    let mut emitted: Vec<Tuple> = Vec::new();
    for (t, v) in [(0.0, 1.0), (10.0, 2.0), (20.0, 4.0)] {
        emitted.extend(agg.process(vec![f(t), f(v)]).unwrap());
    }
    assert_eq!(emitted, vec![vec![f(0.0), f(20.0), f(7.0)]]);
    // The default flush policy reset the group.
    assert_eq!(agg.nb_groups(), 0);
}

#[test]
fn keep_predicate_retains_matching_contributors() {
    // Keep only the contributors from the last 10 time units.
    let mut agg = runtime_of(
        r#"READ CSV FILE "/dev/null" (time float NOT NULL, value float NOT NULL)"#,
        "SELECT SUM value AS total, MAX time AS time FROM src \
         COMMIT AND KEEP (time > 10) WHEN group.#count >= 3",
    );
    let mut emitted: Vec<Tuple> = Vec::new();
    for (t, v) in [(5.0, 1.0), (11.0, 2.0), (12.0, 4.0), (13.0, 8.0)] {
        emitted.extend(agg.process(vec![f(t), f(v)]).unwrap());
    }
    // First commit at count 3: 1+2+4; contributor at t=5 is dropped,
    // then 2+4+8 commits on the next tuple.
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0][0], f(7.0));
    assert_eq!(emitted[1][0], f(14.0));
}

use super::*;
use crate::lang::parse_operation;
use sluice_types::expr::ExprType;
use sluice_types::scalar::ScalarType;

fn node_of(name: &str, src: &str) -> Node {
    let (op, from) = parse_operation(name, src).unwrap();
    let parents = from.iter().map(|f| NodeRef::new("l", f.clone())).collect();
    Node::new(name, op, parents)
}

fn typed(defs: &[(&str, &str)]) -> IndexMap<String, Node> {
    try_typed(defs).unwrap()
}

fn try_typed(defs: &[(&str, &str)]) -> Result<IndexMap<String, Node>, Error> {
    let mut nodes = IndexMap::new();
    for (name, src) in defs {
        let n = node_of(name, src);
        nodes.insert(n.name.clone(), n);
    }
    type_layer("l", &mut nodes, &HashMap::new())?;
    Ok(nodes)
}

fn out_typ<'a>(nodes: &'a IndexMap<String, Node>, node: &str, field: &str) -> &'a ExprType {
    &nodes[node].out_schema.get(field).unwrap().typ
}

const MEMSRC: &str = r#"READ CSV FILE "/tmp/mem.csv" (time float NOT NULL, plugin string NULL, type_instance string NULL, value float NOT NULL)"#;

#[test]
fn csv_source_schema_is_immediate() {
    let nodes = typed(&[("src", MEMSRC)]);
    let src = &nodes["src"];
    assert!(src.in_schema.finished && src.in_schema.is_empty());
    assert!(src.out_schema.finished);
    assert_eq!(
        out_typ(&nodes, "src", "plugin").scalar,
        Some(ScalarType::String)
    );
    assert_eq!(out_typ(&nodes, "src", "plugin").nullable, Some(true));
}

#[test]
fn constant_widening_through_comparison() {
    let nodes = typed(&[
        ("src", MEMSRC),
        ("hot", "SELECT SUM 1i16 > 500 AS hot FROM src"),
    ]);
    let t = out_typ(&nodes, "hot", "hot");
    assert_eq!(t.scalar, Some(ScalarType::Bool));
    assert_eq!(t.nullable, Some(false));
    // The bare 500 was widened to the SUM's i16.
    if let Operation::Aggregate { fields, .. } = &nodes["hot"].operation {
        if let Expr::Binary { left, right, .. } = &fields[0].expr {
            assert_eq!(left.typ().scalar, Some(ScalarType::I16));
            assert_eq!(right.typ().scalar, Some(ScalarType::I16));
        } else {
            panic!("not a comparison");
        }
    } else {
        panic!("not an aggregate");
    }
}

#[test]
fn two_parents_widen_the_shared_field() {
    let mut nodes = IndexMap::new();
    for n in [
        node_of("small", "YIELD 1u8 AS v"),
        node_of("wide", "YIELD 1i16 AS v"),
        node_of("merge", "SELECT v FROM small, wide"),
    ] {
        nodes.insert(n.name.clone(), n);
    }
    type_layer("l", &mut nodes, &HashMap::new()).unwrap();
    assert_eq!(
        nodes["merge"].in_schema.get("v").unwrap().typ.scalar,
        Some(ScalarType::I32)
    );
    assert_eq!(out_typ(&nodes, "merge", "v").scalar, Some(ScalarType::I32));
}

#[test]
fn unsuffixed_sum_defaults_to_i32() {
    let nodes = typed(&[
        ("src", MEMSRC),
        (
            "wc",
            "SELECT SUM 1 AS count, plugin FROM src GROUP BY plugin COMMIT WHEN true FLUSH WHEN false",
        ),
    ]);
    assert_eq!(out_typ(&nodes, "wc", "count").scalar, Some(ScalarType::I32));
    assert_eq!(out_typ(&nodes, "wc", "count").nullable, Some(false));
}

#[test]
fn nullable_where_is_rejected_and_coalesce_fixes_it() {
    let err = try_typed(&[
        ("src", MEMSRC),
        ("f", r#"SELECT value FROM src WHERE plugin = "memory""#),
    ])
    .unwrap_err();
    match err {
        Error::Syntax { node, message } => {
            assert_eq!(node, "l/f");
            assert_eq!(message, "WHERE clause must not be nullable");
        }
        other => panic!("unexpected {other:?}"),
    }
    let nodes = typed(&[
        ("src", MEMSRC),
        (
            "f",
            r#"SELECT value FROM src WHERE COALESCE(plugin = "memory", false)"#,
        ),
    ]);
    assert_eq!(out_typ(&nodes, "f", "value").scalar, Some(ScalarType::Float));
}

#[test]
fn select_star_appends_remaining_fields() {
    let nodes = typed(&[
        ("src", MEMSRC),
        ("all", "SELECT value * 2 AS double, * FROM src"),
    ]);
    let names: Vec<_> = nodes["all"].out_schema.names().cloned().collect();
    assert_eq!(names, vec!["double", "time", "plugin", "type_instance", "value"]);
    assert_eq!(
        out_typ(&nodes, "all", "plugin").nullable,
        Some(true),
        "inherited fields keep their type"
    );
}

#[test]
fn out_reference_must_point_backwards() {
    let err = try_typed(&[
        ("src", MEMSRC),
        ("bad", "SELECT out.b AS a, value AS b FROM src"),
    ])
    .unwrap_err();
    match err {
        Error::Syntax { message, .. } => {
            assert!(message.contains("earlier SELECT field"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    // Forward is fine, and resolves unqualified names out-ward when the
    // input lacks them.
    let nodes = typed(&[
        ("src", MEMSRC),
        ("ok", "SELECT value AS b, b * 2 AS a FROM src"),
    ]);
    assert_eq!(out_typ(&nodes, "ok", "a").scalar, Some(ScalarType::Float));
}

#[test]
fn unknown_field_is_reported() {
    let err = try_typed(&[("src", MEMSRC), ("bad", "SELECT nope FROM src")]).unwrap_err();
    match err {
        Error::Syntax { node, message } => {
            assert_eq!(node, "l/bad");
            assert!(message.contains("unknown field 'nope'"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn lag_offset_must_be_constant() {
    let err = try_typed(&[
        ("src", MEMSRC),
        ("bad", "SELECT LAG(value, value) AS l FROM src"),
    ])
    .unwrap_err();
    match err {
        Error::Syntax { message, .. } => {
            assert!(message.contains("LAG offset must be a constant"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn case_without_else_is_nullable_and_avg_absorbs_it() {
    let nodes = typed(&[
        ("src", MEMSRC),
        (
            "mem",
            r#"SELECT AVG(IF type_instance = "free" THEN value) AS free,
                      MIN time AS time
               FROM src GROUP BY time // 30
               COMMIT WHEN in.time > previous.time + 30"#,
        ),
    ]);
    let free = out_typ(&nodes, "mem", "free");
    assert_eq!(free.scalar, Some(ScalarType::Float));
    assert_eq!(free.nullable, Some(true));
    let time = out_typ(&nodes, "mem", "time");
    assert_eq!(time.scalar, Some(ScalarType::Float));
    assert_eq!(time.nullable, Some(false));
}

#[test]
fn group_count_is_u64() {
    let nodes = typed(&[
        ("src", MEMSRC),
        (
            "c",
            "SELECT group.#count AS n, plugin FROM src GROUP BY plugin COMMIT WHEN true",
        ),
    ]);
    assert_eq!(out_typ(&nodes, "c", "n").scalar, Some(ScalarType::U64));
    assert_eq!(out_typ(&nodes, "c", "n").nullable, Some(false));
}

#[test]
fn external_parents_come_from_other_layers() {
    let mut ext_schema = TupleSchema::new();
    ext_schema
        .add(
            "v",
            Field {
                rank: Some(0),
                typ: ExprType::make("v", Some(ScalarType::U8), Some(false)),
            },
        )
        .unwrap();
    ext_schema.finished = true;
    let mut external = HashMap::new();
    external.insert(NodeRef::new("base", "src"), ext_schema);

    let (op, _) = parse_operation("child", "SELECT v AS v").unwrap();
    let mut node = Node::new("child", op, vec![NodeRef::new("base", "src")]);
    let mut nodes = IndexMap::new();
    nodes.insert("child".to_string(), node.clone());
    type_layer("l", &mut nodes, &external).unwrap();
    assert_eq!(out_typ(&nodes, "child", "v").scalar, Some(ScalarType::U8));

    // Without the external schema the same layer cannot compile.
    let mut nodes2 = IndexMap::new();
    node.in_schema = TupleSchema::new();
    node.out_schema = TupleSchema::new();
    nodes2.insert("child".to_string(), node);
    match type_layer("l", &mut nodes2, &HashMap::new()) {
        Err(Error::MissingDependency { parent, .. }) => assert_eq!(parent, "base/src"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn stateful_slots_are_assigned_in_clause_order() {
    let nodes = typed(&[
        ("src", MEMSRC),
        (
            "s",
            "SELECT SUM value AS total, AVG value AS mean FROM src GROUP BY plugin COMMIT WHEN true",
        ),
    ]);
    let mut slots = Vec::new();
    for e in nodes["s"].operation.exprs() {
        e.visit(&mut |x| {
            if let Expr::Stateful { slot, .. } = x {
                slots.push(*slot);
            }
        });
    }
    assert_eq!(slots, vec![0, 1]);
    assert_eq!(nb_slots(&nodes["s"].operation), 2);
}

#[test]
fn generators_only_at_select_roots() {
    let err = try_typed(&[
        ("src", MEMSRC),
        ("bad", r#"SELECT SPLIT(plugin, ",") || "x" AS piece FROM src"#),
    ])
    .unwrap_err();
    match err {
        Error::Syntax { message, .. } => {
            assert!(message.contains("generators"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn intra_layer_cycles_type_when_fields_are_explicit() {
    // a reads from b and vice versa; both declare their fields, so the
    // fixed point can close the loop.
    let nodes = typed(&[
        ("src", MEMSRC),
        ("a", "SELECT value AS v FROM src, b WHERE value > 0"),
        ("b", "SELECT v AS v FROM a"),
    ]);
    assert!(nodes["a"].out_schema.finished);
    assert!(nodes["b"].out_schema.finished);
}

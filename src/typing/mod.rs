//! Bidirectional fixed-point type inference over one layer.
//!
//! Given nodes whose expressions are untyped and whose schemas are empty,
//! the typer produces, for every node, a fully typed input and output
//! schema, by iterating three monotone steps until nothing changes:
//!
//! 1. parent → input inheritance (adding fields, widening shared ones),
//! 2. input/operation → output typing (walking every expression and
//!    applying its operator's typing rule, widening as needed),
//! 3. completion (freezing schemas once their sources are frozen,
//!    expanding `SELECT *`, then defaulting leftover abstract types).
//!
//! Each step only adds a field, widens a numeric type (the lattice has
//! bounded height) or sets a nullability flag, so the iteration
//! terminates; a generous pass bound turns any bug into a hard error
//! instead of a spin.

use crate::error::Error;
use indexmap::IndexMap;
use sluice_types::expr::{BinaryOp, Expr, ExprType, StatefulFn, TuplePrefix, UnaryOp};
use sluice_types::graph::{Node, NodeRef};
use sluice_types::operation::{FlushHow, Operation};
use sluice_types::scalar::{larger_type, ScalarType, TypeError};
use sluice_types::schema::{Field, TupleSchema};
use std::collections::HashMap;

/// Which clause an expression is being typed in. Gates which tuple
/// prefixes are visible.
#[derive(Copy, Clone, PartialEq)]
enum Clause {
    /// WHERE and contributor predicates: the input tuple only.
    Where,
    /// GROUP BY: the input tuple only.
    Key,
    /// SELECT: input, earlier output fields, previous, group.
    Select,
    /// COMMIT/FLUSH/TOP conditions: everything.
    Commit,
}

/// Type every node of a layer in place.
///
/// `external` maps parents living in other (already compiled) layers to
/// their finished output schemas; in-layer parents are resolved against
/// `nodes` as they refine.
pub fn type_layer(
    layer: &str,
    nodes: &mut IndexMap<String, Node>,
    external: &HashMap<NodeRef, TupleSchema>,
) -> Result<(), Error> {
    let max_passes = 64 * (nodes.len() + 2);
    let mut guard = 0;
    loop {
        loop {
            guard += 1;
            if guard > max_passes {
                return Err(Error::fatal(format!(
                    "type inference did not converge on layer '{layer}'"
                )));
            }
            if !pass(layer, nodes, external)? {
                break;
            }
        }
        if finish_phase(layer, nodes, external)? {
            continue;
        }
        if !default_phase(nodes) {
            break;
        }
    }
    validate(layer, nodes)?;
    for node in nodes.values_mut() {
        assign_slots(&mut node.operation);
    }
    Ok(())
}

fn fq(layer: &str, node: &str) -> String {
    format!("{layer}/{node}")
}

/// One full pass over every node: inheritance then expression typing.
fn pass(
    layer: &str,
    nodes: &mut IndexMap<String, Node>,
    external: &HashMap<NodeRef, TupleSchema>,
) -> Result<bool, Error> {
    let mut changed = false;
    for idx in 0..nodes.len() {
        // Parent output schemas, cloned: peers keep refining while this
        // node is borrowed mutably.
        let parents: Vec<(String, TupleSchema)> = {
            let node = &nodes[idx];
            let mut v = Vec::with_capacity(node.parents.len());
            for p in &node.parents {
                let schema = if p.layer == layer {
                    nodes
                        .get(&p.node)
                        .map(|peer| peer.out_schema.clone())
                        .ok_or_else(|| {
                            Error::syntax(fq(layer, &node.name), format!("unknown parent '{p}'"))
                        })?
                } else {
                    external
                        .get(p)
                        .cloned()
                        .ok_or_else(|| Error::MissingDependency {
                            node: fq(layer, &node.name),
                            parent: p.to_string(),
                        })?
                };
                v.push((p.to_string(), schema));
            }
            v
        };
        let name = nodes[idx].name.clone();
        let node = &mut nodes[idx];
        let fqn = fq(layer, &name);
        changed |= inherit_inputs(&fqn, node, &parents)?;
        changed |= type_operation(&fqn, node)?;
    }
    Ok(changed)
}

/// Step 1: merge every parent's output schema into the input schema.
fn inherit_inputs(
    fqn: &str,
    node: &mut Node,
    parents: &[(String, TupleSchema)],
) -> Result<bool, Error> {
    let mut changed = false;
    for (pname, pschema) in parents {
        for (fname, pfield) in pschema.iter() {
            if let Some(dst) = node.in_schema.get_mut(fname) {
                changed |= merge_schema_field(fqn, fname, &pfield.typ, &mut dst.typ)?;
            } else if !node.in_schema.finished {
                let mut typ = pfield.typ.clone();
                typ.name = fname.clone();
                node.in_schema
                    .add(fname, Field { rank: None, typ })
                    .map_err(|e| Error::syntax(fqn, e))?;
                changed = true;
            } else {
                return Err(Error::syntax(
                    fqn,
                    format!("parent '{pname}' grew field '{fname}' after the input schema was frozen"),
                ));
            }
        }
    }
    Ok(changed)
}

/// Widen `dst` so it can hold `src`; fail when the two are unordered or
/// their known nullabilities disagree.
fn merge_schema_field(
    fqn: &str,
    fname: &str,
    src: &ExprType,
    dst: &mut ExprType,
) -> Result<bool, Error> {
    let mut changed = false;
    if let Some(s) = src.scalar {
        changed |= dst
            .widen_scalar(s)
            .map_err(|e| Error::syntax(fqn, format!("field '{fname}': {e}")))?;
    }
    if let Some(n) = src.nullable {
        match dst.nullable {
            None => {
                dst.nullable = Some(n);
                changed = true;
            }
            Some(d) if d == n => {}
            Some(_) => {
                return Err(Error::syntax(
                    fqn,
                    format!("nullability of field '{fname}' disagrees between parents"),
                ))
            }
        }
    }
    Ok(changed)
}

/// Step 2: type the operation's expressions against the schemas.
fn type_operation(fqn: &str, node: &mut Node) -> Result<bool, Error> {
    let Node {
        operation,
        in_schema,
        out_schema,
        ..
    } = node;
    match operation {
        Operation::ReadCsv { fields, .. } => {
            let mut changed = false;
            if !in_schema.finished {
                in_schema.finished = true;
                changed = true;
            }
            if out_schema.is_empty() {
                for (rank, c) in fields.iter().enumerate() {
                    out_schema
                        .add(
                            &c.name,
                            Field {
                                rank: Some(rank),
                                typ: ExprType::make(&c.name, Some(c.typ), Some(c.nullable)),
                            },
                        )
                        .map_err(|e| Error::syntax(fqn, e))?;
                }
                out_schema.finished = true;
                changed = true;
            }
            Ok(changed)
        }
        Operation::Listen { protocol } => {
            let mut changed = false;
            if !in_schema.finished {
                in_schema.finished = true;
                changed = true;
            }
            if out_schema.is_empty() {
                for (rank, c) in protocol.columns().iter().enumerate() {
                    out_schema
                        .add(
                            &c.name,
                            Field {
                                rank: Some(rank),
                                typ: ExprType::make(&c.name, Some(c.typ), Some(c.nullable)),
                            },
                        )
                        .map_err(|e| Error::syntax(fqn, e))?;
                }
                out_schema.finished = true;
                changed = true;
            }
            Ok(changed)
        }
        Operation::Yield { fields, .. } => {
            let mut changed = false;
            if !in_schema.finished {
                in_schema.finished = true;
                changed = true;
            }
            for rank in 0..fields.len() {
                let alias = fields[rank].alias.clone();
                if !out_schema.contains(&alias) {
                    out_schema
                        .add(
                            &alias,
                            Field {
                                rank: Some(rank),
                                typ: ExprType::unknown(&alias),
                            },
                        )
                        .map_err(|e| Error::syntax(fqn, e))?;
                    changed = true;
                }
                changed |= type_expr(
                    fqn,
                    &mut fields[rank].expr,
                    in_schema,
                    out_schema,
                    Clause::Select,
                    Some(rank),
                )?;
                let entry = out_schema.get_mut(&alias).unwrap();
                changed |= merge_types(fqn, fields[rank].expr.typ_mut(), &mut entry.typ)?;
            }
            Ok(changed)
        }
        Operation::Aggregate {
            fields,
            where_,
            key,
            top,
            commit_when,
            flush_when,
            flush_how,
            ..
        } => {
            let mut changed = false;
            for rank in 0..fields.len() {
                let alias = fields[rank].alias.clone();
                if !out_schema.contains(&alias) {
                    if out_schema.finished {
                        return Err(Error::syntax(
                            fqn,
                            format!("unknown output field '{alias}'"),
                        ));
                    }
                    out_schema
                        .add(
                            &alias,
                            Field {
                                rank: Some(rank),
                                typ: ExprType::unknown(&alias),
                            },
                        )
                        .map_err(|e| Error::syntax(fqn, e))?;
                    changed = true;
                }
                changed |= type_expr(
                    fqn,
                    &mut fields[rank].expr,
                    in_schema,
                    out_schema,
                    Clause::Select,
                    Some(rank),
                )?;
                let entry = out_schema.get_mut(&alias).unwrap();
                changed |= merge_types(fqn, fields[rank].expr.typ_mut(), &mut entry.typ)?;
            }
            if let Some(w) = where_ {
                changed |= type_expr(fqn, w, in_schema, out_schema, Clause::Where, None)?;
            }
            for k in key.iter_mut() {
                changed |= type_expr(fqn, k, in_schema, out_schema, Clause::Key, None)?;
            }
            if let Some(t) = top {
                changed |= type_expr(fqn, &mut t.by, in_schema, out_schema, Clause::Commit, None)?;
                if let Some(w) = &mut t.when {
                    changed |= type_expr(fqn, w, in_schema, out_schema, Clause::Commit, None)?;
                }
            }
            if let Some(c) = commit_when {
                changed |= type_expr(fqn, c, in_schema, out_schema, Clause::Commit, None)?;
            }
            if let Some(fl) = flush_when {
                changed |= type_expr(fqn, fl, in_schema, out_schema, Clause::Commit, None)?;
            }
            match flush_how {
                FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) => {
                    changed |= type_expr(fqn, e, in_schema, out_schema, Clause::Where, None)?;
                }
                _ => {}
            }
            Ok(changed)
        }
    }
}

/// Symmetric unification of two expression types (a SELECT expression
/// against its output-schema entry).
fn merge_types(fqn: &str, a: &mut ExprType, b: &mut ExprType) -> Result<bool, Error> {
    let mut changed = false;
    let lub = match (a.scalar, b.scalar) {
        (Some(x), Some(y)) => Some(
            larger_type(x, y)
                .map_err(|e| Error::syntax(fqn, format!("field '{}': {e}", b.name)))?,
        ),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    if let Some(l) = lub {
        changed |= widen(fqn, a, l)?;
        changed |= widen(fqn, b, l)?;
    }
    match (a.nullable, b.nullable) {
        (Some(x), None) => {
            b.nullable = Some(x);
            changed = true;
        }
        (None, Some(x)) => {
            a.nullable = Some(x);
            changed = true;
        }
        (Some(x), Some(y)) if x != y => {
            return Err(Error::syntax(
                fqn,
                format!("nullability of '{}' is contradictory", b.name),
            ))
        }
        _ => {}
    }
    Ok(changed)
}

fn widen(fqn: &str, t: &mut ExprType, s: ScalarType) -> Result<bool, Error> {
    t.widen_scalar(s)
        .map_err(|e| Error::syntax(fqn, format!("'{}': {e}", t.name)))
}

fn set_null(fqn: &str, t: &mut ExprType, n: bool) -> Result<bool, Error> {
    t.set_nullable(n)
        .map_err(|e: TypeError| Error::syntax(fqn, e.to_string()))
}

/// Nullability of an operator whose result is NULL iff any operand is:
/// known-true as soon as one operand is known nullable, known-false once
/// all are known non-nullable.
fn or_null(fqn: &str, t: &mut ExprType, inputs: &[Option<bool>]) -> Result<bool, Error> {
    if inputs.iter().any(|n| *n == Some(true)) {
        set_null(fqn, t, true)
    } else if inputs.iter().all(|n| *n == Some(false)) {
        set_null(fqn, t, false)
    } else {
        Ok(false)
    }
}

/// Unify several expression types over the numeric lattice: compute the
/// lub of the known scalars and widen every part toward it.
fn unify(fqn: &str, parts: &mut [&mut ExprType]) -> Result<bool, Error> {
    let mut lub: Option<ScalarType> = None;
    for p in parts.iter() {
        if let Some(s) = p.scalar {
            lub = Some(match lub {
                None => s,
                Some(l) => larger_type(l, s)
                    .map_err(|e| Error::syntax(fqn, format!("'{}': {e}", p.name)))?,
            });
        }
    }
    let mut changed = false;
    if let Some(l) = lub {
        for p in parts.iter_mut() {
            changed |= widen(fqn, p, l)?;
        }
    }
    Ok(changed)
}

/// The heart of step 2: type one expression tree bottom-up, then apply
/// the operator's typing rule and push the widened expectation back into
/// the operands.
fn type_expr(
    fqn: &str,
    e: &mut Expr,
    in_schema: &TupleSchema,
    out_schema: &TupleSchema,
    clause: Clause,
    rank: Option<usize>,
) -> Result<bool, Error> {
    match e {
        Expr::Const { .. } | Expr::Param { .. } => Ok(false),
        Expr::Field { typ, prefix, name } => {
            type_field(fqn, typ, prefix, name, in_schema, out_schema, clause, rank)
        }
        Expr::Unary { typ, op, operand } => {
            let mut ch = type_expr(fqn, operand, in_schema, out_schema, clause, rank)?;
            match op {
                UnaryOp::Not => {
                    ch |= widen(fqn, operand.typ_mut(), ScalarType::Bool)?;
                    ch |= widen(fqn, typ, ScalarType::Bool)?;
                    ch |= or_null(fqn, typ, &[operand.typ().nullable])?;
                }
                UnaryOp::Neg => {
                    if let Some(s) = operand.typ().scalar {
                        let signed = larger_type(s, ScalarType::I8)
                            .map_err(|e| Error::syntax(fqn, format!("'-': {e}")))?;
                        ch |= widen(fqn, typ, signed)?;
                    }
                    ch |= or_null(fqn, typ, &[operand.typ().nullable])?;
                }
                UnaryOp::Defined => {
                    ch |= widen(fqn, typ, ScalarType::Bool)?;
                    ch |= set_null(fqn, typ, false)?;
                }
            }
            Ok(ch)
        }
        Expr::Binary {
            typ,
            op,
            left,
            right,
        } => {
            let mut ch = type_expr(fqn, left, in_schema, out_schema, clause, rank)?;
            ch |= type_expr(fqn, right, in_schema, out_schema, clause, rank)?;
            let nulls = [left.typ().nullable, right.typ().nullable];
            match op {
                BinaryOp::And | BinaryOp::Or => {
                    ch |= widen(fqn, left.typ_mut(), ScalarType::Bool)?;
                    ch |= widen(fqn, right.typ_mut(), ScalarType::Bool)?;
                    ch |= widen(fqn, typ, ScalarType::Bool)?;
                    ch |= or_null(fqn, typ, &nulls)?;
                }
                BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::IDiv
                | BinaryOp::Mod
                | BinaryOp::Pow => {
                    ch |= unify(fqn, &mut [left.typ_mut(), right.typ_mut(), typ])?;
                    ch |= or_null(fqn, typ, &nulls)?;
                }
                BinaryOp::Div => {
                    ch |= unify(fqn, &mut [left.typ_mut(), right.typ_mut()])?;
                    ch |= widen(fqn, typ, ScalarType::Float)?;
                    ch |= or_null(fqn, typ, &nulls)?;
                }
                BinaryOp::Concat => {
                    ch |= widen(fqn, left.typ_mut(), ScalarType::String)?;
                    ch |= widen(fqn, right.typ_mut(), ScalarType::String)?;
                    ch |= widen(fqn, typ, ScalarType::String)?;
                    ch |= or_null(fqn, typ, &nulls)?;
                }
                BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Eq
                | BinaryOp::Ne => {
                    ch |= unify(fqn, &mut [left.typ_mut(), right.typ_mut()])?;
                    ch |= widen(fqn, typ, ScalarType::Bool)?;
                    ch |= or_null(fqn, typ, &nulls)?;
                }
            }
            Ok(ch)
        }
        Expr::Case { typ, whens, else_ } => {
            let mut ch = false;
            for w in whens.iter_mut() {
                ch |= type_expr(fqn, &mut w.cond, in_schema, out_schema, clause, rank)?;
                ch |= widen(fqn, w.cond.typ_mut(), ScalarType::Bool)?;
                ch |= type_expr(fqn, &mut w.then, in_schema, out_schema, clause, rank)?;
            }
            if let Some(el) = else_ {
                ch |= type_expr(fqn, el, in_schema, out_schema, clause, rank)?;
            }
            {
                let mut parts: Vec<&mut ExprType> =
                    whens.iter_mut().map(|w| w.then.typ_mut()).collect();
                if let Some(el) = else_ {
                    parts.push(el.typ_mut());
                }
                parts.push(typ);
                ch |= unify(fqn, &mut parts)?;
            }
            if else_.is_none() {
                // A CASE that can fall through is always nullable.
                ch |= set_null(fqn, typ, true)?;
            } else {
                let mut nulls: Vec<Option<bool>> =
                    whens.iter().map(|w| w.then.typ().nullable).collect();
                nulls.push(else_.as_ref().unwrap().typ().nullable);
                ch |= or_null(fqn, typ, &nulls)?;
            }
            Ok(ch)
        }
        Expr::Coalesce { typ, args } => {
            let mut ch = false;
            for a in args.iter_mut() {
                ch |= type_expr(fqn, a, in_schema, out_schema, clause, rank)?;
            }
            {
                let mut parts: Vec<&mut ExprType> = args.iter_mut().map(Expr::typ_mut).collect();
                parts.push(typ);
                ch |= unify(fqn, &mut parts)?;
            }
            // The value of a COALESCE is its last argument when all the
            // others are NULL, so it is exactly as nullable as that one.
            if let Some(n) = args.last().and_then(|a| a.typ().nullable) {
                ch |= set_null(fqn, typ, n)?;
            }
            Ok(ch)
        }
        Expr::Generator { typ, args, .. } => {
            // SPLIT(s, sep): both strings, pieces are strings.
            let mut ch = false;
            for a in args.iter_mut() {
                ch |= type_expr(fqn, a, in_schema, out_schema, clause, rank)?;
                ch |= widen(fqn, a.typ_mut(), ScalarType::String)?;
            }
            ch |= widen(fqn, typ, ScalarType::String)?;
            ch |= or_null(fqn, typ, &[args[0].typ().nullable])?;
            Ok(ch)
        }
        Expr::Stateful {
            typ, func, args, ..
        } => {
            let mut ch = false;
            for a in args.iter_mut() {
                ch |= type_expr(fqn, a, in_schema, out_schema, clause, rank)?;
            }
            type_stateful(fqn, typ, *func, args).map(|c| c | ch)
        }
    }
}

fn type_stateful(
    fqn: &str,
    typ: &mut ExprType,
    func: StatefulFn,
    args: &mut [Expr],
) -> Result<bool, Error> {
    // Constant-required arguments.
    let const_arg = match func {
        StatefulFn::Percentile => Some((0, "PERCENTILE rank")),
        StatefulFn::Lag => Some((0, "LAG offset")),
        StatefulFn::MovingAvg => Some((0, "MOVING_AVG size")),
        StatefulFn::Smooth => Some((0, "SMOOTH alpha")),
        StatefulFn::Remember => Some((1, "REMEMBER duration")),
        _ => None,
    };
    if let Some((i, what)) = const_arg {
        if !args[i].is_const() {
            return Err(Error::syntax(fqn, format!("{what} must be a constant")));
        }
    }
    let mut ch = false;
    match func {
        StatefulFn::AggrMin | StatefulFn::AggrMax | StatefulFn::AggrFirst | StatefulFn::AggrLast => {
            ch |= unify(fqn, &mut [args[0].typ_mut(), typ])?;
            ch |= or_null(fqn, typ, &[args[0].typ().nullable])?;
        }
        StatefulFn::AggrSum => {
            require_numeric(fqn, args[0].typ(), "SUM")?;
            ch |= unify(fqn, &mut [args[0].typ_mut(), typ])?;
            ch |= or_null(fqn, typ, &[args[0].typ().nullable])?;
        }
        StatefulFn::AggrAvg => {
            require_numeric(fqn, args[0].typ(), "AVG")?;
            ch |= widen(fqn, typ, ScalarType::Float)?;
            ch |= or_null(fqn, typ, &[args[0].typ().nullable])?;
        }
        StatefulFn::AggrAnd | StatefulFn::AggrOr => {
            ch |= widen(fqn, args[0].typ_mut(), ScalarType::Bool)?;
            ch |= widen(fqn, typ, ScalarType::Bool)?;
            ch |= or_null(fqn, typ, &[args[0].typ().nullable])?;
        }
        StatefulFn::Percentile => {
            require_numeric(fqn, args[1].typ(), "PERCENTILE")?;
            ch |= unify(fqn, &mut [args[1].typ_mut(), typ])?;
            ch |= or_null(fqn, typ, &[args[1].typ().nullable])?;
        }
        StatefulFn::Lag => {
            ch |= unify(fqn, &mut [args[1].typ_mut(), typ])?;
            // NULL until the offset-th tuple has been seen.
            ch |= set_null(fqn, typ, true)?;
        }
        StatefulFn::MovingAvg => {
            require_numeric(fqn, args[1].typ(), "MOVING_AVG")?;
            ch |= widen(fqn, typ, ScalarType::Float)?;
            ch |= or_null(fqn, typ, &[args[1].typ().nullable])?;
        }
        StatefulFn::LinReg => {
            require_numeric(fqn, args[0].typ(), "LIN_REG")?;
            require_numeric(fqn, args[1].typ(), "LIN_REG")?;
            ch |= widen(fqn, typ, ScalarType::Float)?;
            // Undefined before two points.
            ch |= set_null(fqn, typ, true)?;
        }
        StatefulFn::Smooth => {
            require_numeric(fqn, args[1].typ(), "SMOOTH")?;
            ch |= widen(fqn, typ, ScalarType::Float)?;
            ch |= or_null(fqn, typ, &[args[1].typ().nullable])?;
        }
        StatefulFn::Remember => {
            require_numeric(fqn, args[0].typ(), "REMEMBER time")?;
            ch |= widen(fqn, typ, ScalarType::Bool)?;
            ch |= set_null(fqn, typ, false)?;
        }
    }
    Ok(ch)
}

fn require_numeric(fqn: &str, t: &ExprType, what: &str) -> Result<(), Error> {
    match t.scalar {
        Some(s) if !s.is_numeric() => Err(Error::syntax(
            fqn,
            format!("{what} requires a numeric argument, not {s}"),
        )),
        _ => Ok(()),
    }
}

/// Step 3: resolve a field reference against the visible schemas.
#[allow(clippy::too_many_arguments)]
fn type_field(
    fqn: &str,
    typ: &mut ExprType,
    prefix: &mut TuplePrefix,
    name: &str,
    in_schema: &TupleSchema,
    out_schema: &TupleSchema,
    clause: Clause,
    rank: Option<usize>,
) -> Result<bool, Error> {
    let mut ch = false;
    if *prefix == TuplePrefix::Unqualified {
        // In-first bias: `out` is consulted only once `in` can no longer
        // gain this field.
        if name == "#count" || in_schema.contains(name) {
            *prefix = TuplePrefix::In;
            ch = true;
        } else if in_schema.finished {
            if out_schema.contains(name) {
                *prefix = TuplePrefix::Out;
                ch = true;
            } else {
                return Err(Error::syntax(fqn, format!("unknown field '{name}'")));
            }
        } else {
            return Ok(false); // wait for parent inheritance
        }
    }
    match *prefix {
        TuplePrefix::In | TuplePrefix::GroupFirst | TuplePrefix::GroupLast => {
            // group.first/group.last are group state: not visible to
            // WHERE or KEY, which only see the arriving tuple.
            if matches!(clause, Clause::Where | Clause::Key) && *prefix != TuplePrefix::In {
                return Err(Error::syntax(
                    fqn,
                    format!("'{}.{name}' is not visible in this clause", prefix.as_str()),
                ));
            }
            if name == "#count" {
                ch |= widen(fqn, typ, ScalarType::U64)?;
                ch |= set_null(fqn, typ, false)?;
            } else if let Some(fld) = in_schema.get(name) {
                if let Some(s) = fld.typ.scalar {
                    ch |= widen(fqn, typ, s)?;
                }
                if let Some(n) = fld.typ.nullable {
                    ch |= set_null(fqn, typ, n)?;
                }
            } else if in_schema.finished {
                return Err(Error::syntax(fqn, format!("unknown field '{name}'")));
            }
        }
        TuplePrefix::Group => {
            // The parser only lets `#count` through with this prefix.
            if matches!(clause, Clause::Where | Clause::Key) {
                return Err(Error::syntax(
                    fqn,
                    format!("'group.{name}' is not visible in this clause"),
                ));
            }
            ch |= widen(fqn, typ, ScalarType::U64)?;
            ch |= set_null(fqn, typ, false)?;
        }
        TuplePrefix::Out | TuplePrefix::Previous => {
            if matches!(clause, Clause::Where | Clause::Key) {
                return Err(Error::syntax(
                    fqn,
                    format!("'{}.{name}' is not visible in this clause", prefix.as_str()),
                ));
            }
            if let Some(fld) = out_schema.get(name) {
                if clause == Clause::Select && *prefix == TuplePrefix::Out {
                    // Only fields declared textually earlier are readable.
                    let earlier = match (fld.rank, rank) {
                        (Some(fr), Some(cr)) => fr < cr,
                        _ => false,
                    };
                    if !earlier {
                        return Err(Error::syntax(
                            fqn,
                            format!("'out.{name}' does not refer to an earlier SELECT field"),
                        ));
                    }
                }
                if let Some(s) = fld.typ.scalar {
                    ch |= widen(fqn, typ, s)?;
                }
                if let Some(n) = fld.typ.nullable {
                    ch |= set_null(fqn, typ, n)?;
                }
            } else if out_schema.finished {
                return Err(Error::syntax(fqn, format!("unknown field '{name}'")));
            }
        }
        TuplePrefix::Unqualified => unreachable!("resolved above"),
    }
    Ok(ch)
}

/// Step 4: freeze schemas whose sources are frozen, expand `SELECT *`.
fn finish_phase(
    layer: &str,
    nodes: &mut IndexMap<String, Node>,
    external: &HashMap<NodeRef, TupleSchema>,
) -> Result<bool, Error> {
    let mut changed = false;
    for idx in 0..nodes.len() {
        let parents_finished = {
            let node = &nodes[idx];
            node.parents.iter().all(|p| {
                if p.layer == layer {
                    nodes
                        .get(&p.node)
                        .map(|peer| peer.out_schema.finished)
                        .unwrap_or(false)
                } else {
                    external.contains_key(p)
                }
            })
        };
        let node = &mut nodes[idx];
        let fqn = fq(layer, &node.name);
        if !node.in_schema.finished && parents_finished {
            node.in_schema.finished = true;
            changed = true;
        }
        let all_others = matches!(
            &node.operation,
            Operation::Aggregate { all_others: true, .. }
        );
        if all_others && node.in_schema.finished {
            // SELECT *: append the input fields not already produced.
            let missing: Vec<(String, ExprType)> = node
                .in_schema
                .iter()
                .filter(|(n, _)| !node.out_schema.contains(n))
                .map(|(n, f)| (n.clone(), f.typ.clone()))
                .collect();
            for (n, typ) in missing {
                node.out_schema
                    .add(&n, Field { rank: None, typ })
                    .map_err(|e| Error::syntax(&fqn, e))?;
                changed = true;
            }
        }
        let out_ready = (!all_others || node.in_schema.finished)
            && !node.out_schema.is_empty()
            && node.out_schema.is_fully_typed()
            && node
                .out_schema
                .iter()
                .all(|(_, f)| !f.typ.scalar.unwrap().is_abstract());
        if !node.out_schema.finished && out_ready {
            node.out_schema.finished = true;
            changed = true;
        }
    }
    Ok(changed)
}

/// Once everything is stable, pin leftover abstract types: `num`
/// defaults to `i32`, unknown nullability to non-nullable.
fn default_phase(nodes: &mut IndexMap<String, Node>) -> bool {
    let mut changed = false;
    let mut fix = |t: &mut ExprType| {
        if t.scalar == Some(ScalarType::Num) {
            t.scalar = Some(ScalarType::I32);
            changed = true;
        }
        if t.nullable.is_none() && t.scalar.is_some() {
            t.nullable = Some(false);
            changed = true;
        }
    };
    for node in nodes.values_mut() {
        for e in node.operation.exprs_mut() {
            e.visit_mut(&mut |x| fix(x.typ_mut()));
        }
        for name in node.in_schema.names().cloned().collect::<Vec<_>>() {
            fix(&mut node.in_schema.get_mut(&name).unwrap().typ);
        }
        for name in node.out_schema.names().cloned().collect::<Vec<_>>() {
            fix(&mut node.out_schema.get_mut(&name).unwrap().typ);
        }
    }
    changed
}

/// Final validation: completeness plus the clause-level rules that only
/// make sense once nullability is known.
fn validate(layer: &str, nodes: &IndexMap<String, Node>) -> Result<(), Error> {
    for node in nodes.values() {
        let fqn = fq(layer, &node.name);
        if node.operation.is_source() && !node.parents.is_empty() {
            return Err(Error::syntax(&fqn, "source operations take no parents"));
        }
        if !node.in_schema.finished || !node.out_schema.finished {
            return Err(Error::syntax(
                &fqn,
                "could not finish typing (unresolvable dependency cycle?)",
            ));
        }
        for e in node.operation.exprs() {
            let mut err: Option<Error> = None;
            e.visit(&mut |x| {
                if err.is_some() {
                    return;
                }
                let t = x.typ();
                if !t.is_complete() || t.scalar.unwrap().is_abstract() {
                    err = Some(Error::syntax(
                        &fqn,
                        format!("cannot infer the type of '{}'", t.name),
                    ));
                    return;
                }
                if let Expr::Coalesce { args, .. } = x {
                    for a in &args[..args.len() - 1] {
                        if a.typ().nullable != Some(true) {
                            err = Some(Error::syntax(
                                &fqn,
                                "all COALESCE arguments but the last must be nullable",
                            ));
                            return;
                        }
                    }
                    if args.last().unwrap().typ().nullable != Some(false) {
                        err = Some(Error::syntax(
                            &fqn,
                            "the last COALESCE argument must not be nullable",
                        ));
                    }
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
        }
        if let Operation::Aggregate {
            fields,
            where_,
            key,
            top,
            commit_when,
            flush_when,
            flush_how,
            ..
        } = &node.operation
        {
            if let Some(w) = where_ {
                if w.typ().scalar != Some(ScalarType::Bool) {
                    return Err(Error::syntax(&fqn, "WHERE clause must be a boolean"));
                }
                if w.typ().nullable != Some(false) {
                    return Err(Error::syntax(&fqn, "WHERE clause must not be nullable"));
                }
            }
            // WHERE, KEY and contributor predicates run before or outside
            // the group's aggregate state: no stateful functions there.
            {
                let mut stateless = vec![];
                stateless.extend(where_.iter());
                stateless.extend(key.iter());
                if let FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) = flush_how {
                    stateless.push(e);
                }
                for e in stateless {
                    let mut bad = false;
                    e.visit(&mut |x| bad |= matches!(x, Expr::Stateful { .. }));
                    if bad {
                        return Err(Error::syntax(
                            &fqn,
                            "stateful functions are not allowed in WHERE, GROUP BY or KEEP/REMOVE",
                        ));
                    }
                }
            }
            for (what, cond) in [
                ("COMMIT WHEN", commit_when.as_ref()),
                ("FLUSH WHEN", flush_when.as_ref()),
                ("TOP WHEN", top.as_ref().and_then(|t| t.when.as_ref())),
            ] {
                if let Some(c) = cond {
                    if c.typ().scalar != Some(ScalarType::Bool) {
                        return Err(Error::syntax(
                            &fqn,
                            format!("{what} condition must be a boolean"),
                        ));
                    }
                }
            }
            // Generators may only stand at the root of a SELECT field.
            let mut nested = false;
            for f in fields {
                for c in f.expr.children() {
                    c.visit(&mut |x| nested |= matches!(x, Expr::Generator { .. }));
                }
            }
            for e in where_
                .iter()
                .chain(key.iter())
                .chain(commit_when.iter())
                .chain(flush_when.iter())
                .chain(top.iter().map(|t| &t.by))
            {
                e.visit(&mut |x| nested |= matches!(x, Expr::Generator { .. }));
            }
            if let FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) = flush_how {
                e.visit(&mut |x| nested |= matches!(x, Expr::Generator { .. }));
            }
            if nested {
                return Err(Error::syntax(
                    &fqn,
                    "generators are only allowed as the whole value of a SELECT field",
                ));
            }
        }
        if let Operation::Yield { fields, .. } = &node.operation {
            for f in fields {
                let mut bad = false;
                f.expr.visit(&mut |x| {
                    bad |= matches!(
                        x,
                        Expr::Field { .. } | Expr::Stateful { .. } | Expr::Generator { .. }
                    )
                });
                if bad {
                    return Err(Error::syntax(
                        &fqn,
                        "YIELD expressions must be computable without input",
                    ));
                }
            }
        }
        // Event-time fields must exist in the output schema.
        if let Some(et) = node.operation.event_time() {
            if !node.out_schema.contains(&et.start_field) {
                return Err(Error::syntax(
                    &fqn,
                    format!("EVENT STARTING AT names unknown field '{}'", et.start_field),
                ));
            }
            if let sluice_types::operation::EventDuration::StopField { field, .. } = &et.duration {
                if !node.out_schema.contains(field) {
                    return Err(Error::syntax(
                        &fqn,
                        format!("EVENT STOPPING AT names unknown field '{field}'"),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Assign state slots to stateful expressions, in canonical clause order.
/// Evaluation walks the same order, so slots line up deterministically.
fn assign_slots(op: &mut Operation) {
    let mut next = 0usize;
    for e in op.exprs_mut() {
        e.visit_mut(&mut |x| {
            if let Expr::Stateful { slot, .. } = x {
                *slot = next;
                next += 1;
            }
        });
    }
}

/// Number of state slots an operation needs per group.
pub fn nb_slots(op: &Operation) -> usize {
    let mut n = 0;
    for e in op.exprs() {
        e.visit(&mut |x| {
            if matches!(x, Expr::Stateful { .. }) {
                n += 1;
            }
        });
    }
    n
}

#[cfg(test)]
mod tests;

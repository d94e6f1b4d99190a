//! Tree-walking evaluation of typed expressions.
//!
//! The typer has pinned every node's scalar type before anything gets
//! here, so evaluation is mostly mechanical: fetch, widen to the node's
//! type, apply. NULL follows SQL: it propagates through operators,
//! three-valued AND/OR, and aggregates skip NULL inputs.

use crate::error::Error;
use crate::novelty::NoveltyFilter;
use crate::wire::encode_key;
use crate::Tuple;
use sluice_types::expr::{BinaryOp, Expr, ExprType, StatefulFn, TuplePrefix, UnaryOp};
use sluice_types::scalar::{ScalarType, ScalarValue};
use sluice_types::schema::TupleSchema;
use std::collections::{HashMap, VecDeque};

/// The tuples an expression can read from, per clause.
pub struct Env<'a> {
    pub input: Option<&'a Tuple>,
    pub in_schema: &'a TupleSchema,
    pub out_schema: &'a TupleSchema,
    /// The tentative OUT tuple; possibly partial (earlier fields only).
    pub out: Option<&'a [ScalarValue]>,
    pub previous: Option<&'a Tuple>,
    pub group_first: Option<&'a Tuple>,
    pub group_last: Option<&'a Tuple>,
    pub group_count: u64,
    pub node_count: u64,
    pub params: &'a HashMap<String, ScalarValue>,
}

/// Evaluate a constant expression (no tuples, no state).
pub fn eval_const(e: &Expr) -> Result<ScalarValue, Error> {
    let empty_schema = TupleSchema::new();
    let params = HashMap::new();
    let env = Env {
        input: None,
        in_schema: &empty_schema,
        out_schema: &empty_schema,
        out: None,
        previous: None,
        group_first: None,
        group_last: None,
        group_count: 0,
        node_count: 0,
        params: &params,
    };
    eval(e, &env, None)
}

/// Per-group state of one stateful call site.
pub enum AggrState {
    /// min/max/first/last/sum/and/or: a running accumulator.
    Simple {
        func: StatefulFn,
        acc: Option<ScalarValue>,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Percentile {
        rank: f64,
        values: Vec<f64>,
    },
    Lag {
        k: usize,
        buf: VecDeque<ScalarValue>,
    },
    MovingAvg {
        n: usize,
        buf: VecDeque<f64>,
    },
    LinReg {
        n: u64,
        sx: f64,
        sy: f64,
        sxx: f64,
        sxy: f64,
    },
    Smooth {
        alpha: f64,
        cur: Option<f64>,
    },
    Remember {
        filter: NoveltyFilter,
        last: bool,
    },
}

/// Build the state vector for an operation, one slot per stateful call
/// site, in slot order.
pub fn init_states(op: &sluice_types::operation::Operation) -> Result<Vec<AggrState>, Error> {
    let mut states: Vec<(usize, AggrState)> = Vec::new();
    for e in op.exprs() {
        let mut err = None;
        e.visit(&mut |x| {
            if let Expr::Stateful {
                slot, func, args, ..
            } = x
            {
                match init_state(*func, args) {
                    Ok(s) => states.push((*slot, s)),
                    Err(e) => err = Some(e),
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
    }
    states.sort_by_key(|(slot, _)| *slot);
    Ok(states.into_iter().map(|(_, s)| s).collect())
}

fn init_state(func: StatefulFn, args: &[Expr]) -> Result<AggrState, Error> {
    Ok(match func {
        StatefulFn::AggrMin
        | StatefulFn::AggrMax
        | StatefulFn::AggrSum
        | StatefulFn::AggrAnd
        | StatefulFn::AggrOr
        | StatefulFn::AggrFirst
        | StatefulFn::AggrLast => AggrState::Simple { func, acc: None },
        StatefulFn::AggrAvg => AggrState::Avg { sum: 0.0, count: 0 },
        StatefulFn::Percentile => {
            let rank = const_f64(&args[0])?;
            AggrState::Percentile {
                rank,
                values: Vec::new(),
            }
        }
        StatefulFn::Lag => {
            let k = const_f64(&args[0])? as usize;
            AggrState::Lag {
                k,
                buf: VecDeque::with_capacity(k + 1),
            }
        }
        StatefulFn::MovingAvg => {
            let n = (const_f64(&args[0])? as usize).max(1);
            AggrState::MovingAvg {
                n,
                buf: VecDeque::with_capacity(n),
            }
        }
        StatefulFn::LinReg => AggrState::LinReg {
            n: 0,
            sx: 0.0,
            sy: 0.0,
            sxx: 0.0,
            sxy: 0.0,
        },
        StatefulFn::Smooth => AggrState::Smooth {
            alpha: const_f64(&args[0])?,
            cur: None,
        },
        StatefulFn::Remember => AggrState::Remember {
            filter: NoveltyFilter::new(const_f64(&args[1])?),
            last: false,
        },
    })
}

fn const_f64(e: &Expr) -> Result<f64, Error> {
    eval_const(e)?
        .to_f64()
        .ok_or_else(|| Error::fatal("constant argument is not numeric"))
}

/// Fold the current input tuple into every stateful call site of the
/// operation, in slot order (inner sites before the expressions that
/// read them).
pub fn update_states(
    op: &sluice_types::operation::Operation,
    env: &Env,
    states: &mut [AggrState],
) -> Result<(), Error> {
    for e in op.exprs() {
        update_expr_states(e, env, states)?;
    }
    Ok(())
}

fn update_expr_states(e: &Expr, env: &Env, states: &mut [AggrState]) -> Result<(), Error> {
    for c in e.children() {
        update_expr_states(c, env, states)?;
    }
    if let Expr::Stateful {
        slot, func, args, ..
    } = e
    {
        update_state(*func, args, env, states, *slot)?;
    }
    Ok(())
}

fn update_state(
    func: StatefulFn,
    args: &[Expr],
    env: &Env,
    states: &mut [AggrState],
    slot: usize,
) -> Result<(), Error> {
    match func {
        StatefulFn::AggrMin
        | StatefulFn::AggrMax
        | StatefulFn::AggrSum
        | StatefulFn::AggrAnd
        | StatefulFn::AggrOr
        | StatefulFn::AggrFirst
        | StatefulFn::AggrLast => {
            let v = eval(&args[0], env, Some(&*states))?;
            if v.is_null() {
                return Ok(()); // aggregates skip NULL inputs
            }
            let AggrState::Simple { acc, .. } = &mut states[slot] else {
                return Err(Error::fatal("state slot mismatch"));
            };
            let new = match (acc.as_ref(), func) {
                (None, _) => v,
                (Some(a), StatefulFn::AggrMin) => {
                    if v.compare(a) == Some(std::cmp::Ordering::Less) {
                        v
                    } else {
                        a.clone()
                    }
                }
                (Some(a), StatefulFn::AggrMax) => {
                    if v.compare(a) == Some(std::cmp::Ordering::Greater) {
                        v
                    } else {
                        a.clone()
                    }
                }
                (Some(a), StatefulFn::AggrSum) => numeric_add(a, &v)?,
                (Some(a), StatefulFn::AggrAnd) => {
                    ScalarValue::Bool(a.as_bool().unwrap_or(true) && v.as_bool().unwrap_or(true))
                }
                (Some(a), StatefulFn::AggrOr) => {
                    ScalarValue::Bool(a.as_bool().unwrap_or(false) || v.as_bool().unwrap_or(false))
                }
                (Some(a), StatefulFn::AggrFirst) => a.clone(),
                (Some(_), StatefulFn::AggrLast) => v,
                _ => unreachable!(),
            };
            *acc = Some(new);
        }
        StatefulFn::AggrAvg => {
            let v = eval(&args[0], env, Some(&*states))?;
            if let Some(f) = v.to_f64() {
                let AggrState::Avg { sum, count } = &mut states[slot] else {
                    return Err(Error::fatal("state slot mismatch"));
                };
                *sum += f;
                *count += 1;
            }
        }
        StatefulFn::Percentile => {
            let v = eval(&args[1], env, Some(&*states))?;
            if let Some(f) = v.to_f64() {
                let AggrState::Percentile { values, .. } = &mut states[slot] else {
                    return Err(Error::fatal("state slot mismatch"));
                };
                values.push(f);
            }
        }
        StatefulFn::Lag => {
            let v = eval(&args[1], env, Some(&*states))?;
            let AggrState::Lag { k, buf } = &mut states[slot] else {
                return Err(Error::fatal("state slot mismatch"));
            };
            buf.push_back(v);
            while buf.len() > *k + 1 {
                buf.pop_front();
            }
        }
        StatefulFn::MovingAvg => {
            let v = eval(&args[1], env, Some(&*states))?;
            if let Some(f) = v.to_f64() {
                let AggrState::MovingAvg { n, buf } = &mut states[slot] else {
                    return Err(Error::fatal("state slot mismatch"));
                };
                buf.push_back(f);
                while buf.len() > *n {
                    buf.pop_front();
                }
            }
        }
        StatefulFn::LinReg => {
            let x = eval(&args[0], env, Some(&*states))?;
            let y = eval(&args[1], env, Some(&*states))?;
            if let (Some(x), Some(y)) = (x.to_f64(), y.to_f64()) {
                let AggrState::LinReg { n, sx, sy, sxx, sxy } = &mut states[slot] else {
                    return Err(Error::fatal("state slot mismatch"));
                };
                *n += 1;
                *sx += x;
                *sy += y;
                *sxx += x * x;
                *sxy += x * y;
            }
        }
        StatefulFn::Smooth => {
            let v = eval(&args[1], env, Some(&*states))?;
            if let Some(f) = v.to_f64() {
                let AggrState::Smooth { alpha, cur } = &mut states[slot] else {
                    return Err(Error::fatal("state slot mismatch"));
                };
                *cur = Some(match *cur {
                    None => f,
                    Some(prev) => *alpha * f + (1.0 - *alpha) * prev,
                });
            }
        }
        StatefulFn::Remember => {
            let t = eval(&args[0], env, Some(&*states))?;
            let v = eval(&args[2], env, Some(&*states))?;
            let Some(t) = t.to_f64() else { return Ok(()) };
            let bytes: Vec<u8> = encode_key(&[v])
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect();
            let AggrState::Remember { filter, last } = &mut states[slot] else {
                return Err(Error::fatal("state slot mismatch"));
            };
            *last = filter.remember(t, &bytes);
        }
    }
    Ok(())
}

fn read_state(state: &AggrState) -> ScalarValue {
    match state {
        AggrState::Simple { acc, .. } => acc.clone().unwrap_or(ScalarValue::Null),
        AggrState::Avg { sum, count } => {
            if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::Float(sum / *count as f64)
            }
        }
        AggrState::Percentile { rank, values } => {
            if values.is_empty() {
                return ScalarValue::Null;
            }
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((rank / 100.0) * sorted.len() as f64).ceil() as usize;
            ScalarValue::Float(sorted[idx.clamp(1, sorted.len()) - 1])
        }
        AggrState::Lag { k, buf } => {
            if buf.len() > *k {
                buf[buf.len() - 1 - *k].clone()
            } else {
                ScalarValue::Null
            }
        }
        AggrState::MovingAvg { buf, .. } => {
            if buf.is_empty() {
                ScalarValue::Null
            } else {
                ScalarValue::Float(buf.iter().sum::<f64>() / buf.len() as f64)
            }
        }
        AggrState::LinReg { n, sx, sy, sxx, sxy } => {
            if *n < 2 {
                return ScalarValue::Null;
            }
            let n = *n as f64;
            let denom = n * sxx - sx * sx;
            if denom.abs() < f64::EPSILON {
                ScalarValue::Null
            } else {
                ScalarValue::Float((n * sxy - sx * sy) / denom)
            }
        }
        AggrState::Smooth { cur, .. } => match cur {
            None => ScalarValue::Null,
            Some(f) => ScalarValue::Float(*f),
        },
        AggrState::Remember { last, .. } => ScalarValue::Bool(*last),
    }
}

/// Evaluate one typed expression. `states` carries the group's stateful
/// slots; clauses evaluated before any group exists pass `None`.
pub fn eval(e: &Expr, env: &Env, states: Option<&[AggrState]>) -> Result<ScalarValue, Error> {
    let v = match e {
        Expr::Const { value, .. } => value.clone(),
        Expr::Param { name, .. } => env
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| Error::fatal(format!("unbound parameter '${name}'")))?,
        Expr::Field { prefix, name, .. } => eval_field(prefix, name, env)?,
        Expr::Unary { op, operand, .. } => {
            let v = eval(operand, env, states)?;
            match op {
                UnaryOp::Defined => ScalarValue::Bool(!v.is_null()),
                UnaryOp::Not => match v.as_bool() {
                    None => ScalarValue::Null,
                    Some(b) => ScalarValue::Bool(!b),
                },
                UnaryOp::Neg => {
                    if v.is_null() {
                        ScalarValue::Null
                    } else {
                        negate(&v, e.typ())?
                    }
                }
            }
        }
        Expr::Binary {
            op, left, right, ..
        } => {
            let l = eval(left, env, states)?;
            match op {
                // Three-valued AND/OR short-circuit where they can.
                BinaryOp::And => match l.as_bool() {
                    Some(false) => ScalarValue::Bool(false),
                    l_known => {
                        let r = eval(right, env, states)?;
                        match (l_known, r.as_bool(), r.is_null()) {
                            (_, Some(false), _) => ScalarValue::Bool(false),
                            (Some(true), Some(true), _) => ScalarValue::Bool(true),
                            _ => ScalarValue::Null,
                        }
                    }
                },
                BinaryOp::Or => match l.as_bool() {
                    Some(true) => ScalarValue::Bool(true),
                    l_known => {
                        let r = eval(right, env, states)?;
                        match (l_known, r.as_bool(), r.is_null()) {
                            (_, Some(true), _) => ScalarValue::Bool(true),
                            (Some(false), Some(false), _) => ScalarValue::Bool(false),
                            _ => ScalarValue::Null,
                        }
                    }
                },
                _ => {
                    let r = eval(right, env, states)?;
                    if l.is_null() || r.is_null() {
                        ScalarValue::Null
                    } else {
                        apply_binary(*op, &l, &r, e.typ())?
                    }
                }
            }
        }
        Expr::Case { whens, else_, .. } => {
            let mut result = None;
            for w in whens {
                if eval(&w.cond, env, states)?.as_bool() == Some(true) {
                    result = Some(eval(&w.then, env, states)?);
                    break;
                }
            }
            match (result, else_) {
                (Some(v), _) => v,
                (None, Some(el)) => eval(el, env, states)?,
                (None, None) => ScalarValue::Null,
            }
        }
        Expr::Coalesce { args, .. } => {
            let mut result = ScalarValue::Null;
            for a in args {
                result = eval(a, env, states)?;
                if !result.is_null() {
                    break;
                }
            }
            result
        }
        Expr::Generator { .. } => {
            return Err(Error::fatal(
                "generator evaluated outside a SELECT field",
            ))
        }
        Expr::Stateful { slot, .. } => {
            let states = states.ok_or_else(|| {
                Error::fatal("stateful function in a stateless clause")
            })?;
            read_state(&states[*slot])
        }
    };
    cast_to_type(v, e.typ())
}

/// Evaluate a generator call site to its list of values.
pub fn eval_generator(
    e: &Expr,
    env: &Env,
    states: Option<&[AggrState]>,
) -> Result<Vec<ScalarValue>, Error> {
    let Expr::Generator { args, .. } = e else {
        return Err(Error::fatal("not a generator"));
    };
    // SPLIT(s, sep)
    let s = eval(&args[0], env, states)?;
    let sep = eval(&args[1], env, states)?;
    match (s.as_str(), sep.as_str()) {
        (Some(s), Some(sep)) if !sep.is_empty() => Ok(s
            .split(sep)
            .filter(|p| !p.is_empty())
            .map(|p| ScalarValue::String(p.to_string()))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

fn eval_field(prefix: &TuplePrefix, name: &str, env: &Env) -> Result<ScalarValue, Error> {
    let missing = |what: &str| Error::fatal(format!("no {what} tuple in this context"));
    match prefix {
        TuplePrefix::In | TuplePrefix::GroupFirst | TuplePrefix::GroupLast => {
            if name == "#count" {
                return Ok(ScalarValue::U64(match prefix {
                    TuplePrefix::In => env.node_count,
                    _ => env.group_count,
                }));
            }
            let tuple = match prefix {
                TuplePrefix::In => env.input.ok_or_else(|| missing("input"))?,
                TuplePrefix::GroupFirst => env.group_first.ok_or_else(|| missing("group.first"))?,
                TuplePrefix::GroupLast => env.group_last.ok_or_else(|| missing("group.last"))?,
                _ => unreachable!(),
            };
            let idx = env
                .in_schema
                .index_of(name)
                .ok_or_else(|| Error::fatal(format!("no input field '{name}'")))?;
            Ok(tuple[idx].clone())
        }
        TuplePrefix::Group => Ok(ScalarValue::U64(env.group_count)),
        TuplePrefix::Out | TuplePrefix::Previous => {
            let idx = env
                .out_schema
                .index_of(name)
                .ok_or_else(|| Error::fatal(format!("no output field '{name}'")))?;
            match prefix {
                TuplePrefix::Out => {
                    let out = env.out.ok_or_else(|| missing("output"))?;
                    out.get(idx).cloned().ok_or_else(|| {
                        Error::fatal(format!("output field '{name}' not built yet"))
                    })
                }
                _ => match env.previous {
                    Some(prev) => Ok(prev[idx].clone()),
                    // A group that never committed has no previous tuple
                    // yet; it reads as the OUT built so far.
                    None => Ok(env
                        .out
                        .and_then(|out| out.get(idx).cloned())
                        .unwrap_or(ScalarValue::Null)),
                },
            }
        }
        TuplePrefix::Unqualified => Err(Error::fatal(format!(
            "unresolved field reference '{name}'"
        ))),
    }
}

/// Bring a computed value to the expression's inferred type.
///
/// This is coercion by value, not by lattice: the typer already proved
/// the conversion safe in the widening direction, and literal constants
/// are carried as `i128` until here, so the only thing that matters at
/// run time is that the value fits.
fn cast_to_type(v: ScalarValue, typ: &ExprType) -> Result<ScalarValue, Error> {
    match typ.scalar {
        Some(t) if !t.is_abstract() => coerce(&v, t)
            .ok_or_else(|| Error::fatal(format!("'{}': value does not fit {t}", typ.name))),
        _ => Ok(v),
    }
}

fn coerce(v: &ScalarValue, t: ScalarType) -> Option<ScalarValue> {
    if v.is_null() {
        return Some(ScalarValue::Null);
    }
    if v.scalar_type() == Some(t) {
        return Some(v.clone());
    }
    match t {
        ScalarType::Float => v.to_f64().map(ScalarValue::Float),
        t if t.is_integer() => v.to_i128().and_then(|i| ScalarValue::int_of(t, i)),
        _ => None,
    }
}

fn negate(v: &ScalarValue, typ: &ExprType) -> Result<ScalarValue, Error> {
    match typ.scalar {
        Some(ScalarType::Float) => Ok(ScalarValue::Float(-v.to_f64().unwrap_or(0.0))),
        Some(t) if t.is_integer() => {
            let i = v
                .to_i128()
                .ok_or_else(|| Error::fatal("cannot negate a non-number"))?;
            ScalarValue::int_of(t, -i).ok_or_else(|| Error::fatal("negation overflow"))
        }
        _ => Err(Error::fatal("cannot negate a non-number")),
    }
}

fn numeric_add(a: &ScalarValue, b: &ScalarValue) -> Result<ScalarValue, Error> {
    match (a.to_i128(), b.to_i128()) {
        (Some(x), Some(y)) if !matches!(a, ScalarValue::Float(_)) => {
            let sum = x.checked_add(y).ok_or_else(|| Error::fatal("SUM overflow"))?;
            ScalarValue::int_of(a.scalar_type().unwrap(), sum)
                .or_else(|| Some(ScalarValue::I128(sum)))
                .ok_or_else(|| Error::fatal("SUM overflow"))
        }
        _ => {
            let (x, y) = (
                a.to_f64().ok_or_else(|| Error::fatal("SUM of non-number"))?,
                b.to_f64().ok_or_else(|| Error::fatal("SUM of non-number"))?,
            );
            Ok(ScalarValue::Float(x + y))
        }
    }
}

fn apply_binary(
    op: BinaryOp,
    l: &ScalarValue,
    r: &ScalarValue,
    typ: &ExprType,
) -> Result<ScalarValue, Error> {
    use BinaryOp::*;
    match op {
        Gt | Ge | Lt | Le | Eq | Ne => {
            // Operands were unified to a common type by the typer; widen
            // both to it so the comparison is apples to apples.
            let common = sluice_types::scalar::larger_type(
                l.scalar_type().unwrap(),
                r.scalar_type().unwrap(),
            )
            .map_err(|e| Error::fatal(e.to_string()))?;
            let (lc, rc) = (
                l.cast(common).map_err(|e| Error::fatal(e.to_string()))?,
                r.cast(common).map_err(|e| Error::fatal(e.to_string()))?,
            );
            let ord = lc
                .compare(&rc)
                .ok_or_else(|| Error::fatal("incomparable values"))?;
            let b = match op {
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Eq => ord.is_eq(),
                Ne => !ord.is_eq(),
                _ => unreachable!(),
            };
            Ok(ScalarValue::Bool(b))
        }
        Concat => {
            let (Some(a), Some(b)) = (l.as_str(), r.as_str()) else {
                return Err(Error::fatal("|| of non-strings"));
            };
            Ok(ScalarValue::String(format!("{a}{b}")))
        }
        Div => {
            let (a, b) = float_pair(l, r)?;
            Ok(ScalarValue::Float(a / b))
        }
        Add | Sub | Mul | IDiv | Mod | Pow => match typ.scalar {
            Some(ScalarType::Float) => {
                let (a, b) = float_pair(l, r)?;
                let v = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    IDiv => (a / b).floor(),
                    Mod => a.rem_euclid(b),
                    Pow => a.powf(b),
                    _ => unreachable!(),
                };
                Ok(ScalarValue::Float(v))
            }
            Some(t) if t.is_integer() => {
                let (a, b) = int_pair(l, r)?;
                let v = match op {
                    Add => a.checked_add(b),
                    Sub => a.checked_sub(b),
                    Mul => a.checked_mul(b),
                    IDiv => a.checked_div_euclid(b),
                    Mod => a.checked_rem_euclid(b),
                    Pow => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
                    _ => unreachable!(),
                }
                .ok_or_else(|| Error::fatal("integer arithmetic overflow or division by zero"))?;
                ScalarValue::int_of(t, v).ok_or_else(|| Error::fatal("arithmetic overflow"))
            }
            other => Err(Error::fatal(format!(
                "arithmetic on non-numeric type {other:?}"
            ))),
        },
        And | Or => unreachable!("handled by the caller"),
    }
}

fn float_pair(l: &ScalarValue, r: &ScalarValue) -> Result<(f64, f64), Error> {
    match (l.to_f64(), r.to_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::fatal("arithmetic on non-numbers")),
    }
}

fn int_pair(l: &ScalarValue, r: &ScalarValue) -> Result<(i128, i128), Error> {
    match (l.to_i128(), r.to_i128()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::fatal("integer arithmetic on non-integers")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::expr::ExprType;

    fn env_less<'a>(schema: &'a TupleSchema, params: &'a HashMap<String, ScalarValue>) -> Env<'a> {
        Env {
            input: None,
            in_schema: schema,
            out_schema: schema,
            out: None,
            previous: None,
            group_first: None,
            group_last: None,
            group_count: 0,
            node_count: 0,
            params,
        }
    }

    #[test]
    fn three_valued_logic() {
        let t = Expr::const_value(ScalarValue::Bool(true));
        let f = Expr::const_value(ScalarValue::Bool(false));
        let null = Expr::Const {
            typ: ExprType::make("null", Some(ScalarType::Bool), Some(true)),
            value: ScalarValue::Null,
        };
        let schema = TupleSchema::new();
        let params = HashMap::new();
        let env = env_less(&schema, &params);
        let and = |a: &Expr, b: &Expr| Expr::Binary {
            typ: ExprType::make("and", Some(ScalarType::Bool), Some(true)),
            op: BinaryOp::And,
            left: Box::new(a.clone()),
            right: Box::new(b.clone()),
        };
        assert_eq!(eval(&and(&t, &null), &env, None).unwrap(), ScalarValue::Null);
        assert_eq!(
            eval(&and(&f, &null), &env, None).unwrap(),
            ScalarValue::Bool(false)
        );
        assert_eq!(
            eval(&and(&t, &t), &env, None).unwrap(),
            ScalarValue::Bool(true)
        );
    }

    #[test]
    fn integer_division_floors() {
        let idiv = Expr::Binary {
            typ: ExprType::make("//", Some(ScalarType::I64), Some(false)),
            op: BinaryOp::IDiv,
            left: Box::new(Expr::const_value(ScalarValue::I64(-7))),
            right: Box::new(Expr::const_value(ScalarValue::I64(2))),
        };
        assert_eq!(eval_const(&idiv).unwrap(), ScalarValue::I64(-4));
    }

    #[test]
    fn states_fold_and_read() {
        use crate::lang::parse_operation;
        let (mut op, _) =
            parse_operation("t", "SELECT SUM v AS s, AVG v AS a, LAG(1, v) AS l, MIN v AS m")
                .unwrap();
        // Hand-type enough for evaluation: v is a float input field.
        let mut schema = TupleSchema::new();
        schema
            .add(
                "v",
                sluice_types::schema::Field {
                    rank: None,
                    typ: ExprType::make("v", Some(ScalarType::Float), Some(false)),
                },
            )
            .unwrap();
        schema.finished = true;
        let mut slot = 0;
        for e in op.exprs_mut() {
            e.visit_mut(&mut |x| {
                if let Expr::Field { typ, prefix, .. } = x {
                    *prefix = TuplePrefix::In;
                    typ.scalar = Some(ScalarType::Float);
                    typ.nullable = Some(false);
                }
                if let Expr::Stateful { slot: s, typ, .. } = x {
                    *s = slot;
                    slot += 1;
                    typ.scalar = Some(ScalarType::Float);
                }
            });
        }
        let mut states = init_states(&op).unwrap();
        let params = HashMap::new();
        for v in [10.0, 20.0, 30.0] {
            let tuple: Tuple = vec![ScalarValue::Float(v)];
            let env = Env {
                input: Some(&tuple),
                ..env_less(&schema, &params)
            };
            update_states(&op, &env, &mut states).unwrap();
        }
        assert_eq!(read_state(&states[0]), ScalarValue::Float(60.0));
        assert_eq!(read_state(&states[1]), ScalarValue::Float(20.0));
        assert_eq!(read_state(&states[2]), ScalarValue::Float(20.0)); // lag 1
        assert_eq!(read_state(&states[3]), ScalarValue::Float(10.0));
    }

    #[test]
    fn split_generator_produces_pieces() {
        let split = Expr::Generator {
            typ: ExprType::make("split", Some(ScalarType::String), Some(false)),
            func: sluice_types::expr::GeneratorFn::Split,
            args: vec![
                Expr::const_value(ScalarValue::String("hello world".into())),
                Expr::const_value(ScalarValue::String(" ".into())),
            ],
        };
        let schema = TupleSchema::new();
        let params = HashMap::new();
        let env = env_less(&schema, &params);
        assert_eq!(
            eval_generator(&split, &env, None).unwrap(),
            vec![
                ScalarValue::String("hello".into()),
                ScalarValue::String("world".into()),
            ]
        );
    }

    #[test]
    fn comparison_widens_operands() {
        let cmp = Expr::Binary {
            typ: ExprType::make(">", Some(ScalarType::Bool), Some(false)),
            op: BinaryOp::Gt,
            left: Box::new(Expr::const_value(ScalarValue::U8(200))),
            right: Box::new(Expr::const_value(ScalarValue::I32(-1))),
        };
        assert_eq!(eval_const(&cmp).unwrap(), ScalarValue::Bool(true));
    }
}

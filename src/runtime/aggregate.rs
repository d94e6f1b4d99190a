//! The aggregate runtime: group map and window state machine.
//!
//! Per arriving tuple: WHERE gates it, KEY finds (or creates) its group,
//! the group's stateful slots fold it in, SELECT builds the candidate
//! OUT, and the COMMIT/FLUSH predicates decide what gets emitted and
//! what state survives. When the commit predicate relates the arriving
//! tuple to per-group state (it references `in`), it is also swept over
//! the other groups, which is what lets `COMMIT WHEN in.time >
//! previous.time + δ` close an old time bucket the moment a tuple for a
//! new bucket arrives.

use crate::error::Error;
use crate::eval::{eval, eval_generator, init_states, update_states, AggrState, Env};
use crate::wire::encode_key;
use crate::Tuple;
use indexmap::IndexMap;
use sluice_types::expr::Expr;
use sluice_types::operation::{FlushHow, Operation, SelectField, TopSpec};
use sluice_types::scalar::ScalarValue;
use sluice_types::schema::TupleSchema;
use std::collections::{HashMap, VecDeque};

pub struct AggregateRuntime {
    op: Operation,
    in_schema: TupleSchema,
    out_schema: TupleSchema,
    fields: Vec<SelectField>,
    where_: Option<Expr>,
    key: Vec<Expr>,
    top: Option<TopSpec>,
    commit_when: Option<Expr>,
    flush_when: Option<Expr>,
    flush_how: FlushHow,
    /// The commit predicate reads `in`, so other groups must be swept on
    /// every arrival.
    sweep_commit: bool,
    keep_contributors: bool,
    groups: IndexMap<Vec<u32>, Group>,
    node_count: u64,
    params: HashMap<String, ScalarValue>,
}

struct Group {
    states: Vec<AggrState>,
    /// The tuple last emitted for this group; empty until the first OUT.
    previous: Tuple,
    first: Tuple,
    last: Tuple,
    count: u64,
    /// The OUT candidate from this group's last processed tuple.
    last_out: Tuple,
    /// Contributing input tuples; retained only for re-folding flushes.
    contributors: VecDeque<Tuple>,
}

impl AggregateRuntime {
    pub fn new(
        op: &Operation,
        in_schema: &TupleSchema,
        out_schema: &TupleSchema,
        params: HashMap<String, ScalarValue>,
    ) -> Result<AggregateRuntime, Error> {
        let Operation::Aggregate {
            fields,
            where_,
            key,
            top,
            commit_when,
            flush_when,
            flush_how,
            ..
        } = op
        else {
            return Err(Error::fatal("not an aggregate operation"));
        };
        let sweep_commit = commit_when
            .as_ref()
            .map(|c| c.references(sluice_types::expr::TuplePrefix::In))
            .unwrap_or(false);
        Ok(AggregateRuntime {
            op: op.clone(),
            in_schema: in_schema.clone(),
            out_schema: out_schema.clone(),
            fields: fields.clone(),
            where_: where_.clone(),
            key: key.clone(),
            top: top.clone(),
            commit_when: commit_when.clone(),
            flush_when: flush_when.clone(),
            flush_how: flush_how.clone(),
            sweep_commit,
            keep_contributors: flush_how.needs_contributors(),
            groups: IndexMap::new(),
            node_count: 0,
            params,
        })
    }

    pub fn nb_groups(&self) -> usize {
        self.groups.len()
    }

    /// Feed one input tuple; returns the tuples to emit, in order.
    pub fn process(&mut self, input: Tuple) -> Result<Vec<Tuple>, Error> {
        // 1. WHERE gates the tuple (false and NULL both discard).
        if let Some(w) = &self.where_ {
            let env = stateless_env(
                &self.in_schema,
                &self.out_schema,
                Some(&input),
                self.node_count,
                &self.params,
            );
            if eval(w, &env, None)?.as_bool() != Some(true) {
                return Ok(Vec::new());
            }
        }
        self.node_count += 1;

        // 2. KEY.
        let key = {
            let env = stateless_env(
                &self.in_schema,
                &self.out_schema,
                Some(&input),
                self.node_count,
                &self.params,
            );
            let mut vals = Vec::with_capacity(self.key.len());
            for k in &self.key {
                vals.push(eval(k, &env, None)?);
            }
            encode_key(&vals)
        };

        // 3./4. The group folds the tuple in.
        let is_new = !self.groups.contains_key(&key);
        if is_new {
            self.groups.insert(
                key.clone(),
                Group {
                    states: init_states(&self.op)?,
                    previous: Vec::new(),
                    first: input.clone(),
                    last: input.clone(),
                    count: 0,
                    last_out: Vec::new(),
                    contributors: VecDeque::new(),
                },
            );
        }
        let g = self.groups.get_mut(&key).unwrap();
        g.count += 1;
        g.last = input.clone();
        if self.keep_contributors {
            g.contributors.push_back(input.clone());
        }
        {
            let env = Env {
                input: Some(&input),
                in_schema: &self.in_schema,
                out_schema: &self.out_schema,
                out: None,
                previous: if g.previous.is_empty() {
                    None
                } else {
                    Some(&g.previous)
                },
                group_first: Some(&g.first),
                group_last: Some(&g.last),
                group_count: g.count,
                node_count: self.node_count,
                params: &self.params,
            };
            update_states(&self.op, &env, &mut g.states)?;
        }

        // 5. Candidate OUT (with generator expansion).
        let outs = eval_select(
            &self.fields,
            &self.in_schema,
            &self.out_schema,
            &input,
            g,
            self.node_count,
            &self.params,
        )?;
        let out0 = outs.first().cloned().unwrap_or_default();
        if is_new {
            g.previous = out0.clone();
        }
        g.last_out = out0.clone();

        if self.top.is_some() {
            return self.process_top(&input, &key);
        }

        // 6. COMMIT / FLUSH for the tuple's own group.
        let mut emitted = Vec::new();
        let committed = match &self.commit_when {
            None => true,
            Some(c) => {
                let env = group_env(
                    &self.in_schema,
                    &self.out_schema,
                    Some(&input),
                    Some(&out0),
                    g,
                    self.node_count,
                    &self.params,
                );
                eval(c, &env, Some(&g.states))?.as_bool() == Some(true)
            }
        };
        if committed {
            emitted.extend(outs);
            g.previous = out0.clone();
            let flush = match &self.flush_when {
                None => true,
                Some(f) => {
                    let env = group_env(
                        &self.in_schema,
                        &self.out_schema,
                        Some(&input),
                        Some(&out0),
                        g,
                        self.node_count,
                        &self.params,
                    );
                    eval(f, &env, Some(&g.states))?.as_bool() == Some(true)
                }
            };
            if flush {
                self.flush_group(&key)?;
            }
        }

        // 7. Sweep the other groups when the commit predicate depends on
        // the arriving tuple.
        if self.sweep_commit {
            emitted.extend(self.sweep(&input, &key)?);
        }
        Ok(emitted)
    }

    /// TOP k BY e WHEN cond: when the condition fires, rank every group
    /// by the BY expression and emit the k best, then flush them all.
    fn process_top(&mut self, input: &Tuple, current_key: &[u32]) -> Result<Vec<Tuple>, Error> {
        let top = self.top.clone().unwrap();
        let fired = {
            let g = &self.groups[current_key];
            let cond = top.when.as_ref().or(self.commit_when.as_ref());
            match cond {
                None => true,
                Some(c) => {
                    let env = group_env(
                        &self.in_schema,
                        &self.out_schema,
                        Some(input),
                        Some(&g.last_out),
                        g,
                        self.node_count,
                        &self.params,
                    );
                    eval(c, &env, Some(&g.states))?.as_bool() == Some(true)
                }
            }
        };
        if !fired {
            return Ok(Vec::new());
        }
        let mut ranked: Vec<(Vec<u32>, ScalarValue)> = Vec::with_capacity(self.groups.len());
        for (key, g) in &self.groups {
            let env = group_env(
                &self.in_schema,
                &self.out_schema,
                Some(input),
                Some(&g.last_out),
                g,
                self.node_count,
                &self.params,
            );
            let by = eval(&top.by, &env, Some(&g.states))?;
            ranked.push((key.clone(), by));
        }
        ranked.sort_by(|a, b| {
            b.1.compare(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut emitted = Vec::new();
        for (key, _) in ranked.iter().take(top.k as usize) {
            let g = self.groups.get_mut(key).unwrap();
            emitted.push(g.last_out.clone());
            g.previous = g.last_out.clone();
        }
        // The emission consumed the window: flush every group.
        let keys: Vec<Vec<u32>> = self.groups.keys().cloned().collect();
        for key in keys {
            self.flush_group(&key)?;
        }
        Ok(emitted)
    }

    /// Re-evaluate the commit predicate for every other group against the
    /// tuple that just arrived.
    fn sweep(&mut self, input: &Tuple, current_key: &[u32]) -> Result<Vec<Tuple>, Error> {
        let Some(commit) = self.commit_when.clone() else {
            return Ok(Vec::new());
        };
        let mut emitted = Vec::new();
        let keys: Vec<Vec<u32>> = self
            .groups
            .keys()
            .filter(|k| k.as_slice() != current_key)
            .cloned()
            .collect();
        for key in keys {
            let (fire, flush) = {
                let g = &self.groups[&key];
                let env = group_env(
                    &self.in_schema,
                    &self.out_schema,
                    Some(input),
                    Some(&g.last_out),
                    g,
                    self.node_count,
                    &self.params,
                );
                let fire = eval(&commit, &env, Some(&g.states))?.as_bool() == Some(true);
                let flush = if !fire {
                    false
                } else {
                    match &self.flush_when {
                        None => true,
                        Some(f) => eval(f, &env, Some(&g.states))?.as_bool() == Some(true),
                    }
                };
                (fire, flush)
            };
            if fire {
                let g = self.groups.get_mut(&key).unwrap();
                emitted.push(g.last_out.clone());
                g.previous = g.last_out.clone();
                if flush {
                    self.flush_group(&key)?;
                }
            }
        }
        Ok(emitted)
    }

    /// Apply the FLUSH_HOW policy to one group.
    fn flush_group(&mut self, key: &[u32]) -> Result<(), Error> {
        match self.flush_how.clone() {
            FlushHow::Reset => {
                self.groups.shift_remove(key);
            }
            FlushHow::KeepAll => {}
            FlushHow::Slide(n) => {
                let g = self.groups.get_mut(key).unwrap();
                for _ in 0..n {
                    g.contributors.pop_front();
                }
                self.refold(key)?;
            }
            FlushHow::KeepOnly(pred) => {
                self.filter_contributors(key, &pred, true)?;
                self.refold(key)?;
            }
            FlushHow::RemoveAll(pred) => {
                self.filter_contributors(key, &pred, false)?;
                self.refold(key)?;
            }
        }
        Ok(())
    }

    fn filter_contributors(
        &mut self,
        key: &[u32],
        pred: &Expr,
        keep_matching: bool,
    ) -> Result<(), Error> {
        let g = self.groups.get_mut(key).unwrap();
        let contributors = std::mem::take(&mut g.contributors);
        let mut kept = VecDeque::with_capacity(contributors.len());
        for c in contributors {
            let env = stateless_env(
                &self.in_schema,
                &self.out_schema,
                Some(&c),
                self.node_count,
                &self.params,
            );
            let matches = eval(pred, &env, None)?.as_bool() == Some(true);
            if matches == keep_matching {
                kept.push_back(c);
            }
        }
        g.contributors = kept;
        Ok(())
    }

    /// Rebuild a slid group's running state from its remaining
    /// contributors.
    fn refold(&mut self, key: &[u32]) -> Result<(), Error> {
        let g = self.groups.get_mut(key).unwrap();
        if g.contributors.is_empty() {
            self.groups.shift_remove(key);
            return Ok(());
        }
        g.states = init_states(&self.op)?;
        g.count = 0;
        g.first = g.contributors.front().unwrap().clone();
        let contributors = std::mem::take(&mut g.contributors);
        for c in &contributors {
            g.count += 1;
            g.last = c.clone();
            let env = Env {
                input: Some(c),
                in_schema: &self.in_schema,
                out_schema: &self.out_schema,
                out: None,
                previous: if g.previous.is_empty() {
                    None
                } else {
                    Some(&g.previous)
                },
                group_first: Some(&g.first),
                group_last: Some(&g.last),
                group_count: g.count,
                node_count: self.node_count,
                params: &self.params,
            };
            update_states(&self.op, &env, &mut g.states)?;
        }
        g.contributors = contributors;
        Ok(())
    }
}

fn stateless_env<'a>(
    in_schema: &'a TupleSchema,
    out_schema: &'a TupleSchema,
    input: Option<&'a Tuple>,
    node_count: u64,
    params: &'a HashMap<String, ScalarValue>,
) -> Env<'a> {
    Env {
        input,
        in_schema,
        out_schema,
        out: None,
        previous: None,
        group_first: None,
        group_last: None,
        group_count: 0,
        node_count,
        params,
    }
}

fn group_env<'a>(
    in_schema: &'a TupleSchema,
    out_schema: &'a TupleSchema,
    input: Option<&'a Tuple>,
    out: Option<&'a Tuple>,
    g: &'a Group,
    node_count: u64,
    params: &'a HashMap<String, ScalarValue>,
) -> Env<'a> {
    Env {
        input,
        in_schema,
        out_schema,
        out: out.map(|t| t.as_slice()),
        previous: if g.previous.is_empty() {
            None
        } else {
            Some(&g.previous)
        },
        group_first: Some(&g.first),
        group_last: Some(&g.last),
        group_count: g.count,
        node_count,
        params,
    }
}

/// Evaluate the SELECT clause to the group's candidate OUT tuple(s).
/// Generator fields expand as a Cartesian product; `SELECT *` fields
/// (rank `None` in the schema) copy straight from the input.
fn eval_select(
    fields: &[SelectField],
    in_schema: &TupleSchema,
    out_schema: &TupleSchema,
    input: &Tuple,
    g: &Group,
    node_count: u64,
    params: &HashMap<String, ScalarValue>,
) -> Result<Vec<Tuple>, Error> {
    let mut base: Tuple = Vec::with_capacity(out_schema.len());
    let mut expansions: Vec<(usize, Vec<ScalarValue>)> = Vec::new();
    for (idx, (name, field)) in out_schema.iter().enumerate() {
        let value = match field.rank {
            Some(rank) => {
                let expr = &fields[rank].expr;
                let env = Env {
                    input: Some(input),
                    in_schema,
                    out_schema,
                    out: Some(&base),
                    previous: if g.previous.is_empty() {
                        None
                    } else {
                        Some(&g.previous)
                    },
                    group_first: Some(&g.first),
                    group_last: Some(&g.last),
                    group_count: g.count,
                    node_count,
                    params,
                };
                if matches!(expr, Expr::Generator { .. }) {
                    let values = eval_generator(expr, &env, Some(&g.states))?;
                    let first = values.first().cloned().unwrap_or(ScalarValue::Null);
                    expansions.push((idx, values));
                    first
                } else {
                    eval(expr, &env, Some(&g.states))?
                }
            }
            None => {
                // Inherited by `SELECT *`.
                let i = in_schema
                    .index_of(name)
                    .ok_or_else(|| Error::fatal(format!("no input field '{name}'")))?;
                input[i].clone()
            }
        };
        base.push(value);
    }
    if expansions.is_empty() {
        return Ok(vec![base]);
    }
    // Cartesian product over the generator fields. A generator that
    // produced nothing produces no tuples at all.
    if expansions.iter().any(|(_, vs)| vs.is_empty()) {
        return Ok(Vec::new());
    }
    let mut result = Vec::new();
    let mut indices = vec![0usize; expansions.len()];
    loop {
        let mut t = base.clone();
        for (e, (field_idx, values)) in expansions.iter().enumerate() {
            t[*field_idx] = values[indices[e]].clone();
        }
        result.push(t);
        // Odometer increment.
        let mut pos = expansions.len();
        loop {
            if pos == 0 {
                return Ok(result);
            }
            pos -= 1;
            indices[pos] += 1;
            if indices[pos] < expansions[pos].1.len() {
                break;
            }
            indices[pos] = 0;
        }
    }
}

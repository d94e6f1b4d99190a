//! Tuple retention for exported nodes, and the time-series slicer.
//!
//! A node flagged `EXPORT` forks its output into a dedicated ring
//! buffer; the control plane drains it into a [`RetainedTuples`] window
//! (bounded, sequence-numbered) that serves ad-hoc inspection
//! (`fold_tuples`) and time-series queries (`build_timeseries`).

use crate::error::Error;
use crate::Tuple;
use serde::{Deserialize, Serialize};
use sluice_types::operation::{EventDuration, EventTime};
use sluice_types::scalar::ScalarValue;
use sluice_types::schema::TupleSchema;
use std::collections::VecDeque;

/// Default bound on retained tuples per node.
pub const DEFAULT_RETENTION: usize = 10_000;

/// The last N tuples of one exported node.
pub struct RetainedTuples {
    pub schema: TupleSchema,
    pub event_time: Option<EventTime>,
    window: VecDeque<(u64, Tuple)>,
    next_seq: u64,
    max_retained: usize,
}

impl RetainedTuples {
    pub fn new(
        schema: TupleSchema,
        event_time: Option<EventTime>,
        max_retained: usize,
    ) -> RetainedTuples {
        RetainedTuples {
            schema,
            event_time,
            window: VecDeque::new(),
            next_seq: 0,
            max_retained,
        }
    }

    pub fn push(&mut self, tuple: Tuple) {
        if self.window.len() == self.max_retained {
            self.window.pop_front();
        }
        self.window.push_back((self.next_seq, tuple));
        self.next_seq += 1;
    }

    /// Sequence number the next tuple will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// The retained tuples with sequence number strictly greater than
    /// `since`, oldest first, at most `max_res` of them.
    pub fn fold_tuples(&self, since: Option<u64>, max_res: Option<usize>) -> Vec<(u64, Tuple)> {
        let it = self
            .window
            .iter()
            .filter(|(seq, _)| since.map_or(true, |s| *seq > s))
            .cloned();
        match max_res {
            None => it.collect(),
            Some(n) => it.take(n).collect(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consolidation {
    Min,
    Max,
    Avg,
}

/// Bucket the retained tuples of an exported node into `max_points`
/// uniform buckets covering `[from, to]`, consolidating `data_field`
/// per bucket. Empty buckets yield `None` (NULL).
///
/// A node without event-time info cannot be time-series queried.
pub fn build_timeseries(
    retained: &RetainedTuples,
    data_field: &str,
    from: f64,
    to: f64,
    max_points: usize,
    consolidation: Consolidation,
) -> Result<Vec<(f64, Option<f64>)>, Error> {
    let et = retained
        .event_time
        .as_ref()
        .ok_or_else(|| Error::InvalidCommand {
            message: "this node has no event-time information".into(),
        })?;
    if max_points == 0 || to <= from {
        return Err(Error::InvalidCommand {
            message: "need max_points > 0 and to > from".into(),
        });
    }
    let data_idx = retained
        .schema
        .index_of(data_field)
        .ok_or_else(|| Error::not_found(format!("field '{data_field}'")))?;
    let start_idx = retained
        .schema
        .index_of(&et.start_field)
        .ok_or_else(|| Error::not_found(format!("field '{}'", et.start_field)))?;
    let stop_idx = match &et.duration {
        EventDuration::StopField { field, .. } => Some(
            retained
                .schema
                .index_of(field)
                .ok_or_else(|| Error::not_found(format!("field '{field}'")))?,
        ),
        EventDuration::Const(_) => None,
    };

    let bucket_width = (to - from) / max_points as f64;
    let mut acc: Vec<Option<(f64, u64)>> = vec![None; max_points]; // (folded, count)
    for (_, tuple) in retained.window.iter() {
        let Some(start) = field_f64(tuple, start_idx) else {
            continue;
        };
        let start = start * et.start_scale;
        let stop = match (&et.duration, stop_idx) {
            (EventDuration::Const(d), _) => start + d,
            (EventDuration::StopField { scale, .. }, Some(idx)) => {
                match field_f64(tuple, idx) {
                    Some(v) => v * scale,
                    None => start,
                }
            }
            _ => start,
        };
        if stop < from || start > to {
            continue;
        }
        let Some(value) = field_f64(tuple, data_idx) else {
            continue; // NULL data points do not contribute
        };
        let bucket = (((start - from) / bucket_width).floor() as i64)
            .clamp(0, max_points as i64 - 1) as usize;
        acc[bucket] = Some(match acc[bucket] {
            None => (value, 1),
            Some((folded, count)) => (
                match consolidation {
                    Consolidation::Min => folded.min(value),
                    Consolidation::Max => folded.max(value),
                    Consolidation::Avg => folded + value,
                },
                count + 1,
            ),
        });
    }
    Ok(acc
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            let t = from + (i as f64 + 0.5) * bucket_width;
            let v = slot.map(|(folded, count)| match consolidation {
                Consolidation::Avg => folded / count as f64,
                _ => folded,
            });
            (t, v)
        })
        .collect())
}

fn field_f64(tuple: &Tuple, idx: usize) -> Option<f64> {
    match tuple.get(idx) {
        None | Some(ScalarValue::Null) => None,
        Some(v) => v.to_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::expr::ExprType;
    use sluice_types::scalar::ScalarType;
    use sluice_types::schema::Field;

    fn schema() -> TupleSchema {
        let mut s = TupleSchema::new();
        for (name, typ) in [("t", ScalarType::Float), ("v", ScalarType::Float)] {
            s.add(
                name,
                Field {
                    rank: None,
                    typ: ExprType::make(name, Some(typ), Some(true)),
                },
            )
            .unwrap();
        }
        s.finished = true;
        s
    }

    fn retained() -> RetainedTuples {
        RetainedTuples::new(
            schema(),
            Some(EventTime {
                start_field: "t".into(),
                start_scale: 1.0,
                duration: EventDuration::Const(0.0),
            }),
            DEFAULT_RETENTION,
        )
    }

    #[test]
    fn fold_tuples_gates_on_sequence_numbers() {
        let mut r = retained();
        for i in 0..5 {
            r.push(vec![
                ScalarValue::Float(i as f64),
                ScalarValue::Float(i as f64 * 10.0),
            ]);
        }
        assert_eq!(r.fold_tuples(None, None).len(), 5);
        assert_eq!(r.fold_tuples(Some(2), None).len(), 2);
        assert_eq!(r.fold_tuples(Some(2), Some(1)).len(), 1);
        assert_eq!(r.fold_tuples(Some(99), None).len(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let mut r = RetainedTuples::new(schema(), None, 3);
        for i in 0..10 {
            r.push(vec![ScalarValue::Float(i as f64), ScalarValue::Float(0.0)]);
        }
        let kept = r.fold_tuples(None, None);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].0, 7); // oldest retained seq
        assert_eq!(r.next_seq(), 10);
    }

    #[test]
    fn timeseries_consolidates_and_leaves_gaps_null() {
        let mut r = retained();
        for (t, v) in [(5.0, 10.0), (15.0, 20.0), (16.0, 40.0), (35.0, 5.0)] {
            r.push(vec![ScalarValue::Float(t), ScalarValue::Float(v)]);
        }
        // Buckets of width 10 over [0, 40): [0,10) [10,20) [20,30) [30,40).
        let avg = build_timeseries(&r, "v", 0.0, 40.0, 4, Consolidation::Avg).unwrap();
        assert_eq!(avg[0].1, Some(10.0));
        assert_eq!(avg[1].1, Some(30.0));
        assert_eq!(avg[2].1, None); // empty bucket
        assert_eq!(avg[3].1, Some(5.0));
        let max = build_timeseries(&r, "v", 0.0, 40.0, 4, Consolidation::Max).unwrap();
        assert_eq!(max[1].1, Some(40.0));
        let min = build_timeseries(&r, "v", 0.0, 40.0, 4, Consolidation::Min).unwrap();
        assert_eq!(min[1].1, Some(20.0));
    }

    #[test]
    fn nodes_without_event_time_cannot_be_queried() {
        let r = RetainedTuples::new(schema(), None, 10);
        match build_timeseries(&r, "v", 0.0, 1.0, 1, Consolidation::Avg) {
            Err(Error::InvalidCommand { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}

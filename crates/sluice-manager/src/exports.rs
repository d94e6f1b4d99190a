//! Export consumption: drain the export ring buffers of running nodes
//! into bounded in-memory retention windows, and answer `/export` and
//! `/timeseries` from them.

use sluice::error::Error as EngineError;
use sluice::export::{build_timeseries, Consolidation, RetainedTuples};
use sluice::ringbuf::RingBuf;
use sluice::wire::decode_tuple;
use sluice_types::graph::NodeRef;
use sluice_types::operation::EventTime;
use sluice_types::scalar::ScalarValue;
use sluice_types::schema::TupleSchema;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Retention windows for every node that ever exported while this
/// manager was up. Windows survive a layer stop so recent tuples stay
/// inspectable.
#[derive(Default)]
pub struct ExportStore {
    nodes: Mutex<HashMap<NodeRef, RetainedTuples>>,
}

impl ExportStore {
    pub async fn register(
        &self,
        node: NodeRef,
        schema: TupleSchema,
        event_time: Option<EventTime>,
        max_retained: usize,
    ) {
        self.nodes
            .lock()
            .await
            .entry(node)
            .or_insert_with(|| RetainedTuples::new(schema, event_time, max_retained));
    }

    pub async fn is_known(&self, node: &NodeRef) -> bool {
        self.nodes.lock().await.contains_key(node)
    }

    /// JSON rows (sequence number + named fields) for `/export`.
    pub async fn fold(
        &self,
        node: &NodeRef,
        since: Option<u64>,
        max_results: Option<usize>,
    ) -> Option<Vec<serde_json::Value>> {
        let nodes = self.nodes.lock().await;
        let retained = nodes.get(node)?;
        let rows = retained
            .fold_tuples(since, max_results)
            .into_iter()
            .map(|(seq, tuple)| {
                let mut obj = serde_json::Map::new();
                obj.insert("seq".into(), seq.into());
                for (i, (name, _)) in retained.schema.iter().enumerate() {
                    obj.insert(name.clone(), scalar_to_json(&tuple[i]));
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        Some(rows)
    }

    pub async fn timeseries(
        &self,
        node: &NodeRef,
        data_field: &str,
        from: f64,
        to: f64,
        max_points: usize,
        consolidation: Consolidation,
    ) -> Result<Vec<(f64, Option<f64>)>, EngineError> {
        let nodes = self.nodes.lock().await;
        let retained = nodes
            .get(node)
            .ok_or_else(|| EngineError::not_found(format!("exported node '{node}'")))?;
        build_timeseries(retained, data_field, from, to, max_points, consolidation)
    }
}

pub fn scalar_to_json(v: &ScalarValue) -> serde_json::Value {
    use serde_json::json;
    match v {
        ScalarValue::Null => serde_json::Value::Null,
        ScalarValue::Bool(b) => json!(b),
        ScalarValue::Float(f) => json!(f),
        ScalarValue::String(s) => json!(s),
        ScalarValue::U8(n) => json!(n),
        ScalarValue::U16(n) => json!(n),
        ScalarValue::U32(n) => json!(n),
        ScalarValue::U64(n) => json!(n),
        ScalarValue::U128(n) => json!(n.to_string()),
        ScalarValue::I8(n) => json!(n),
        ScalarValue::I16(n) => json!(n),
        ScalarValue::I32(n) => json!(n),
        ScalarValue::I64(n) => json!(n),
        ScalarValue::I128(n) => json!(n.to_string()),
        ScalarValue::Ip4(a) => json!(a.to_string()),
        ScalarValue::Ip6(a) => json!(a.to_string()),
        ScalarValue::Cidr4 { addr, prefix } => json!(format!("{addr}/{prefix}")),
        ScalarValue::Cidr6 { addr, prefix } => json!(format!("{addr}/{prefix}")),
    }
}

/// Drain one export ring buffer into the store until told to stop.
pub fn spawn_import(
    store: Arc<ExportStore>,
    node: NodeRef,
    ringbuf: RingBuf,
    schema: TupleSchema,
    stop: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        log::debug!("importing exports of {node}");
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let mut drained = 0;
            loop {
                match ringbuf.dequeue() {
                    Ok(Some(words)) => match decode_tuple(&schema, &words) {
                        Ok(tuple) => {
                            let mut nodes = store.nodes.lock().await;
                            if let Some(retained) = nodes.get_mut(&node) {
                                retained.push(tuple);
                            }
                            drained += 1;
                        }
                        Err(e) => log::warn!("bad exported tuple from {node}: {e}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("export ring buffer of {node} failed: {e}");
                        return;
                    }
                }
                if drained >= 4096 {
                    break; // yield to the executor now and then
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        log::debug!("stopped importing exports of {node}");
    });
}

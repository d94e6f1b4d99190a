//! The graph supervisor: owns the graph, enforces layer status
//! transitions, compiles, runs and stops workers, and sweeps timed-out
//! layers.

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::exports::{spawn_import, ExportStore};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sluice::error::Error as EngineError;
use sluice::lang::parse_operation;
use sluice::ringbuf::RingBuf;
use sluice::runtime::TypedProgram;
use sluice::signature::node_signature;
use sluice::typing::type_layer;
use sluice_types::graph::{Graph, Layer, LayerStatus, Node, NodeRef, Report};
use sluice_types::schema::TupleSchema;
use sluice_types::{ENV_DEBUG, ENV_INPUT_RINGBUF, ENV_OUTPUT_RINGBUFS_REF, ENV_REPORT_URL};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long a stopping worker gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One node definition as submitted over `PUT /graph`.
#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct NodeSpec {
    pub name: String,
    /// The operation source text (`SELECT …`, `YIELD …`, …).
    pub operation: String,
    /// Parents as `node` (same layer) or `layer/node`; merged with the
    /// operation's FROM clause.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// A layer definition as submitted over `PUT /graph`.
#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct LayerSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    /// Idle TTL in seconds; the layer is stopped and removed past it.
    pub timeout: Option<f64>,
}

pub struct Supervisor {
    config: Arc<ManagerConfig>,
    graph: Graph,
    exports: Arc<ExportStore>,
    children: HashMap<NodeRef, Child>,
    import_stops: HashMap<NodeRef, Arc<AtomicBool>>,
    /// Creation time per layer, for the idle TTL of never-started layers.
    created: HashMap<String, DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(config: Arc<ManagerConfig>, exports: Arc<ExportStore>) -> Result<Supervisor, ManagerError> {
        std::fs::create_dir_all(config.bin_dir())
            .map_err(|e| ManagerError::io_error("creating the data directory".into(), e))?;
        let graph_path = config.graph_path();
        let graph = if graph_path.exists() {
            let g = Graph::load(&graph_path)
                .map_err(|e| ManagerError::io_error("loading the graph".into(), e))?;
            log::info!("loaded {} layer(s) from {}", g.layers.len(), graph_path.display());
            g
        } else {
            Graph::new()
        };
        let created = graph
            .layers
            .keys()
            .map(|n| (n.clone(), Utc::now()))
            .collect();
        Ok(Supervisor {
            config,
            graph,
            exports,
            children: HashMap::new(),
            import_stops: HashMap::new(),
            created,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn save(&self) -> Result<(), ManagerError> {
        self.graph
            .save(&self.config.graph_path())
            .map_err(|e| ManagerError::io_error("saving the graph".into(), e))
    }

    fn layer(&self, name: &str) -> Result<&Layer, ManagerError> {
        self.graph
            .layers
            .get(name)
            .ok_or_else(|| ManagerError::UnknownLayer { name: name.into() })
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut Layer, ManagerError> {
        self.graph
            .layers
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownLayer { name: name.into() })
    }

    pub fn node(&self, nref: &NodeRef) -> Result<&Node, ManagerError> {
        self.graph
            .node(nref)
            .ok_or_else(|| ManagerError::UnknownNode {
                name: nref.to_string(),
            })
    }

    // ---- editing ----------------------------------------------------

    /// Create a layer from its submitted definition: parse every
    /// operation, merge FROM parents, check the structural invariants.
    pub fn put_layer(&mut self, spec: LayerSpec) -> Result<(), ManagerError> {
        let mut layer = Layer::new(&spec.name, spec.timeout);
        for ns in &spec.nodes {
            let (operation, from) = parse_operation(&format!("{}/{}", spec.name, ns.name), &ns.operation)?;
            let mut parents = Vec::new();
            for raw in ns.parents.iter().chain(from.iter()) {
                let nref = match raw.split_once('/') {
                    Some((l, n)) => NodeRef::new(l, n),
                    None => NodeRef::new(&spec.name, raw.clone()),
                };
                if !parents.contains(&nref) {
                    parents.push(nref);
                }
            }
            let node = Node::new(&ns.name, operation, parents);
            if layer.nodes.insert(node.name.clone(), node).is_some() {
                return Err(ManagerError::InvalidLayerSpec {
                    error: format!("duplicate node '{}'", ns.name),
                });
            }
        }
        self.graph
            .add_layer(layer)
            .map_err(|error| ManagerError::InvalidLayerSpec { error })?;
        self.created.insert(spec.name.clone(), Utc::now());
        log::info!("created layer '{}'", spec.name);
        self.save()
    }

    // ---- compilation ------------------------------------------------

    /// Compile one layer, or every layer still in Edition. The loop
    /// retries `MissingDependency` up to `|layers|` times; exceeding the
    /// bound means the inter-layer dependencies loop.
    pub fn compile(&mut self, layer: Option<&str>) -> Result<(), ManagerError> {
        match layer {
            Some(name) => self.compile_layer(name),
            None => {
                let all: Vec<String> = self.graph.layers.keys().cloned().collect();
                let bound = all.len().max(1);
                let mut remaining: Vec<String> = all
                    .iter()
                    .filter(|n| self.graph.layers[*n].status == LayerStatus::Edition)
                    .cloned()
                    .collect();
                for _ in 0..bound {
                    if remaining.is_empty() {
                        return Ok(());
                    }
                    let mut next = Vec::new();
                    for name in remaining {
                        match self.compile_layer(&name) {
                            Ok(()) => {}
                            Err(ManagerError::EngineError {
                                error: EngineError::MissingDependency { .. },
                            }) => next.push(name),
                            Err(e) => return Err(e),
                        }
                    }
                    remaining = next;
                }
                Err(EngineError::DependencyLoop { layers: remaining }.into())
            }
        }
    }

    fn compile_layer(&mut self, name: &str) -> Result<(), ManagerError> {
        match self.layer(name)?.status {
            LayerStatus::Edition | LayerStatus::Compiled => {}
            status => {
                return Err(EngineError::InvalidCommand {
                    message: format!("cannot compile layer '{name}' while {status:?}"),
                }
                .into())
            }
        }
        // Collect the finished output schemas of external parents first;
        // an uncompiled one is a MissingDependency the compile loop may
        // retry.
        let mut external: HashMap<NodeRef, TupleSchema> = HashMap::new();
        for node in self.layer(name)?.nodes.values() {
            for parent in &node.parents {
                if parent.layer == name {
                    continue;
                }
                let pnode = self.graph.node(parent).ok_or(ManagerError::UnknownNode {
                    name: parent.to_string(),
                })?;
                if !pnode.out_schema.finished {
                    return Err(EngineError::MissingDependency {
                        node: format!("{name}/{}", node.name),
                        parent: parent.to_string(),
                    }
                    .into());
                }
                external.insert(parent.clone(), pnode.out_schema.clone());
            }
        }
        let config = self.config.clone();
        let layer = self.layer_mut(name)?;
        layer.status = LayerStatus::Compiling;
        // Typing works on fresh schemas; recompiling re-derives them.
        for node in layer.nodes.values_mut() {
            node.in_schema = TupleSchema::new();
            node.out_schema = TupleSchema::new();
            node.signature = None;
        }
        match type_layer(name, &mut layer.nodes, &external) {
            Ok(()) => {}
            Err(e) => {
                layer.status = LayerStatus::Edition;
                return Err(e.into());
            }
        }
        // One artifact per unique signature; existing artifacts are
        // reused as-is.
        for node in layer.nodes.values_mut() {
            let signature =
                node_signature(&node.operation, &node.in_schema, &node.out_schema);
            let path = config.program_path(&signature);
            if !path.exists() {
                let program = TypedProgram {
                    node: NodeRef::new(name, &node.name),
                    operation: node.operation.clone(),
                    in_schema: node.in_schema.clone(),
                    out_schema: node.out_schema.clone(),
                    signature: signature.clone(),
                };
                program.save(&path)?;
                log::debug!("emitted program {}", path.display());
            } else {
                log::debug!("program cache hit for {}/{}", name, node.name);
            }
            node.signature = Some(signature);
        }
        let layer = self.layer_mut(name)?;
        layer.status = LayerStatus::Compiled;
        layer.last_error = None;
        log::info!("compiled layer '{name}'");
        self.save()
    }

    // ---- running ----------------------------------------------------

    /// Launch one worker per node of a Compiled layer: ring buffers
    /// first, then fan-out reference files (including the parents' in
    /// other running layers), then the processes.
    pub async fn run(&mut self, name: &str) -> Result<(), ManagerError> {
        match self.layer(name)?.status {
            LayerStatus::Running => return Ok(()), // idempotent start
            LayerStatus::Compiled => {}
            status => {
                return Err(EngineError::InvalidCommand {
                    message: format!("cannot run layer '{name}' while {status:?}"),
                }
                .into())
            }
        }
        struct RunInfo {
            name: String,
            sig: String,
            is_source: bool,
            exported: bool,
            out_schema: TupleSchema,
            event_time: Option<sluice_types::operation::EventTime>,
        }
        let infos: Vec<RunInfo> = self
            .layer(name)?
            .nodes
            .values()
            .map(|node| RunInfo {
                name: node.name.clone(),
                sig: node.signature.clone().unwrap_or_default(),
                is_source: node.operation.is_source(),
                exported: node.operation.export().is_some(),
                out_schema: node.out_schema.clone(),
                event_time: node.operation.event_time().cloned(),
            })
            .collect();
        // Ring buffers for every node of the layer.
        let mut input_bufs: HashMap<String, PathBuf> = HashMap::new();
        for info in &infos {
            let dir = self.config.node_dir(name, &info.name);
            std::fs::create_dir_all(&dir)
                .map_err(|e| ManagerError::io_error(format!("creating {}", dir.display()), e))?;
            if !info.is_source {
                let path = self.config.input_ringbuf_path(name, &info.name, &info.sig);
                RingBuf::create(&path, self.config.ringbuf_words)?;
                input_bufs.insert(info.name.clone(), path);
            }
            if info.exported {
                let path = self.config.export_ringbuf_path(name, &info.name, &info.sig);
                let rb = RingBuf::create(&path, self.config.ringbuf_words)?;
                let nref = NodeRef::new(name, &info.name);
                self.exports
                    .register(
                        nref.clone(),
                        info.out_schema.clone(),
                        info.event_time.clone(),
                        self.config.export_retention,
                    )
                    .await;
                let stop = Arc::new(AtomicBool::new(false));
                self.import_stops.insert(nref.clone(), stop.clone());
                spawn_import(
                    self.exports.clone(),
                    nref,
                    rb,
                    info.out_schema.clone(),
                    stop,
                );
            }
        }
        // Fan-out files for this layer's nodes, and refreshed ones for
        // external parents (their workers re-read on mtime change).
        for info in &infos {
            let nref = NodeRef::new(name, &info.name);
            self.write_out_ref(&nref, Some(name))?;
        }
        let mut external_parents: Vec<NodeRef> = Vec::new();
        for info in &infos {
            for parent in &self.layer(name)?.nodes[&info.name].parents {
                if parent.layer != name && !external_parents.contains(parent) {
                    external_parents.push(parent.clone());
                }
            }
        }
        for parent in external_parents {
            if self.graph.node(&parent).and_then(|n| n.pid).is_some() {
                self.write_out_ref(&parent, Some(name))?;
            }
        }
        // Fork the workers.
        for info in &infos {
            let nref = NodeRef::new(name, &info.name);
            let program = self.config.program_path(&info.sig);
            let mut cmd = Command::new(self.config.worker_exe());
            cmd.arg(&program)
                .env(
                    ENV_INPUT_RINGBUF,
                    input_bufs
                        .get(&info.name)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                )
                .env(
                    ENV_OUTPUT_RINGBUFS_REF,
                    self.config.out_ref_path(name, &info.name),
                )
                .env(ENV_REPORT_URL, self.config.report_url(name, &info.name))
                .env(ENV_DEBUG, if self.config.debug { "1" } else { "0" })
                .stdin(Stdio::null())
                .kill_on_drop(true);
            let child = cmd.spawn().map_err(|e| {
                ManagerError::io_error(format!("spawning the worker for {nref}"), e)
            })?;
            let pid = child.id();
            log::info!("spawned worker for {nref} (pid {pid:?})");
            if let Some(node) = self.graph.node_mut(&nref) {
                node.pid = pid;
            }
            self.children.insert(nref, child);
        }
        let layer = self.layer_mut(name)?;
        layer.status = LayerStatus::Running;
        layer.last_started = Some(Utc::now());
        layer.last_error = None;
        self.save()
    }

    /// The fan-out listing of one node: its running children's input
    /// buffers plus its own export buffer. `starting` names a layer
    /// whose workers are up even though its status is not Running yet.
    fn write_out_ref(&self, nref: &NodeRef, starting: Option<&str>) -> Result<(), ManagerError> {
        let node = self.node(nref)?;
        let sig = node.signature.clone().unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        for child in &node.children {
            let Some(cnode) = self.graph.node(child) else {
                continue;
            };
            let clayer = &self.graph.layers[&child.layer];
            let child_up = clayer.status == LayerStatus::Running
                || starting.is_some_and(|s| s == child.layer);
            if child_up && !cnode.operation.is_source() {
                let csig = cnode.signature.clone().unwrap_or_default();
                lines.push(
                    self.config
                        .input_ringbuf_path(&child.layer, &child.node, &csig)
                        .display()
                        .to_string(),
                );
            }
        }
        if node.operation.export().is_some() {
            lines.push(
                self.config
                    .export_ringbuf_path(&nref.layer, &nref.node, &sig)
                    .display()
                    .to_string(),
            );
        }
        let path = self.config.out_ref_path(&nref.layer, &nref.node);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ManagerError::io_error(format!("creating {}", dir.display()), e))?;
        }
        let mut listing = lines.join("\n");
        listing.push('\n');
        std::fs::write(&path, listing)
            .map_err(|e| ManagerError::io_error(format!("writing {}", path.display()), e))
    }

    /// Start every compiled layer, parents first. Layers still in
    /// edition are skipped (compile them first); running ones are left
    /// alone.
    pub async fn run_all(&mut self) -> Result<(), ManagerError> {
        let order = self
            .graph
            .layer_order()
            .unwrap_or_else(|| self.graph.layers.keys().cloned().collect());
        for name in order {
            match self.graph.layers[&name].status {
                LayerStatus::Compiled => self.run(&name).await?,
                status => log::debug!("not starting layer '{name}' ({status:?})"),
            }
        }
        Ok(())
    }

    /// Stop every running layer, children first.
    pub async fn stop_all(&mut self) -> Result<(), ManagerError> {
        let mut order = self
            .graph
            .layer_order()
            .unwrap_or_else(|| self.graph.layers.keys().cloned().collect());
        order.reverse();
        for name in order {
            if self.graph.layers[&name].status == LayerStatus::Running {
                self.stop(&name).await?;
            }
        }
        Ok(())
    }

    /// Stop a running layer: SIGTERM, bounded wait, SIGKILL, then ring
    /// buffer teardown.
    pub async fn stop(&mut self, name: &str) -> Result<(), ManagerError> {
        let has_children = self
            .children
            .keys()
            .any(|nref| nref.layer == name);
        match self.layer(name)?.status {
            LayerStatus::Running => {}
            _ if has_children => {} // a worker died, siblings still up
            LayerStatus::Compiled => return Ok(()), // idempotent stop
            status => {
                return Err(EngineError::InvalidCommand {
                    message: format!("cannot stop layer '{name}' while {status:?}"),
                }
                .into())
            }
        }
        let refs: Vec<NodeRef> = self
            .children
            .keys()
            .filter(|nref| nref.layer == name)
            .cloned()
            .collect();
        for nref in &refs {
            if let Some(child) = self.children.get(nref) {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }
        }
        for nref in &refs {
            if let Some(mut child) = self.children.remove(nref) {
                match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    Ok(status) => {
                        log::debug!("worker {nref} exited: {status:?}");
                    }
                    Err(_) => {
                        log::warn!("worker {nref} ignored SIGTERM, killing it");
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
            }
            if let Some(node) = self.graph.node_mut(nref) {
                node.pid = None;
            }
            // Cancel the import task and unlink the buffers.
            if let Some(stop) = self.import_stops.remove(nref) {
                stop.store(true, Ordering::Relaxed);
            }
            if let Ok(node) = self.node(nref) {
                let sig = node.signature.clone().unwrap_or_default();
                let input = self.config.input_ringbuf_path(&nref.layer, &nref.node, &sig);
                let export = self.config.export_ringbuf_path(&nref.layer, &nref.node, &sig);
                for p in [input, export] {
                    match std::fs::remove_file(&p) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => log::warn!("cannot unlink {}: {e}", p.display()),
                    }
                }
            }
        }
        let layer = self.layer_mut(name)?;
        layer.status = LayerStatus::Compiled;
        layer.last_stopped = Some(Utc::now());
        // External parents still running must stop fanning out to the
        // buffers that just went away.
        let mut parents: Vec<NodeRef> = Vec::new();
        for node in self.layer(name)?.nodes.values() {
            for parent in &node.parents {
                if parent.layer != name && !parents.contains(parent) {
                    parents.push(parent.clone());
                }
            }
        }
        for parent in parents {
            if self.graph.node(&parent).and_then(|n| n.pid).is_some() {
                if let Err(e) = self.write_out_ref(&parent, None) {
                    log::warn!("refreshing fan-out of {parent}: {e}");
                }
            }
        }
        log::info!("stopped layer '{name}'");
        self.save()
    }

    // ---- reports & sweeping -----------------------------------------

    pub fn report(&mut self, nref: &NodeRef, body: serde_json::Value) -> Result<(), ManagerError> {
        let node = self
            .graph
            .node_mut(nref)
            .ok_or_else(|| ManagerError::UnknownNode {
                name: nref.to_string(),
            })?;
        node.last_report = Some(Report {
            time: Utc::now(),
            body,
        });
        Ok(())
    }

    /// Periodic sweep: reap workers that died on their own, and stop +
    /// remove layers idle past their TTL.
    pub async fn sweep(&mut self) {
        // Reap exited children. The layer goes back to Compiled with the
        // error stored; surviving siblings keep running until a stop.
        let mut dead: Vec<(NodeRef, String)> = Vec::new();
        for (nref, child) in self.children.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                dead.push((nref.clone(), format!("worker exited with {status}")));
            }
        }
        for (nref, error) in dead {
            log::error!("{nref}: {error}");
            self.children.remove(&nref);
            if let Some(node) = self.graph.node_mut(&nref) {
                node.pid = None;
            }
            if let Some(layer) = self.graph.layers.get_mut(&nref.layer) {
                layer.status = LayerStatus::Compiled;
                layer.last_error = Some(error);
            }
        }
        // Idle TTLs.
        let now = Utc::now();
        let timed_out: Vec<String> = self
            .graph
            .layers
            .values()
            .filter_map(|layer| {
                let ttl = layer.timeout?;
                let mut activity = self.created.get(&layer.name).copied();
                for t in [layer.last_started, layer.last_stopped] {
                    activity = activity.max(t);
                }
                for node in layer.nodes.values() {
                    if let Some(r) = &node.last_report {
                        activity = activity.max(Some(r.time));
                    }
                }
                let idle = now - activity?;
                (idle.num_milliseconds() as f64 / 1e3 > ttl).then(|| layer.name.clone())
            })
            .collect();
        for name in timed_out {
            log::info!("layer '{name}' timed out, removing it");
            if let Err(e) = self.stop(&name).await {
                log::warn!("stopping timed-out layer '{name}': {e}");
            }
            self.graph.layers.shift_remove(&name);
            self.created.remove(&name);
            self.graph.rebuild_children();
            let _ = self.save();
        }
    }

    // ---- rendering & completion -------------------------------------

    pub fn to_dot(&self, only_layer: Option<&str>) -> String {
        let mut out = String::from("digraph sluice {\n  rankdir=LR;\n");
        for layer in self.graph.layers.values() {
            if only_layer.is_some_and(|l| l != layer.name) {
                continue;
            }
            out.push_str(&format!(
                "  subgraph \"cluster_{}\" {{\n    label=\"{}\";\n",
                layer.name, layer.name
            ));
            for node in layer.nodes.values() {
                out.push_str(&format!(
                    "    \"{}/{}\" [shape=box];\n",
                    layer.name, node.name
                ));
            }
            out.push_str("  }\n");
        }
        for layer in self.graph.layers.values() {
            for node in layer.nodes.values() {
                for parent in &node.parents {
                    if only_layer.is_some_and(|l| l != layer.name && l != parent.layer) {
                        continue;
                    }
                    out.push_str(&format!(
                        "  \"{parent}\" -> \"{}/{}\";\n",
                        layer.name, node.name
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn to_mermaid(&self, only_layer: Option<&str>) -> String {
        let mut out = String::from("flowchart LR\n");
        for layer in self.graph.layers.values() {
            if only_layer.is_some_and(|l| l != layer.name) {
                continue;
            }
            out.push_str(&format!("  subgraph {}\n", layer.name));
            for node in layer.nodes.values() {
                out.push_str(&format!("    {}_{}[{}]\n", layer.name, node.name, node.name));
            }
            out.push_str("  end\n");
        }
        for layer in self.graph.layers.values() {
            for node in layer.nodes.values() {
                for parent in &node.parents {
                    if only_layer.is_some_and(|l| l != layer.name && l != parent.layer) {
                        continue;
                    }
                    out.push_str(&format!(
                        "  {}_{} --> {}_{}\n",
                        parent.layer, parent.node, layer.name, node.name
                    ));
                }
            }
        }
        out
    }

    /// Fully qualified node names starting with the prefix.
    pub fn complete_nodes(&self, prefix: &str) -> Vec<String> {
        self.graph
            .node_refs()
            .iter()
            .map(|r| r.to_string())
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    /// Output fields of one node starting with the prefix.
    pub fn complete_fields(&self, nref: &NodeRef, prefix: &str) -> Result<Vec<String>, ManagerError> {
        let node = self.node(nref)?;
        Ok(node
            .out_schema
            .names()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        let config = Arc::new(ManagerConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            data_directory: dir.display().to_string(),
            worker_path: None,
            ringbuf_words: 1 << 10,
            export_retention: 100,
            sweep_seconds: 2,
            debug: false,
        });
        Supervisor::new(config, Arc::new(ExportStore::default())).unwrap()
    }

    fn metrics_layer() -> LayerSpec {
        LayerSpec {
            name: "metrics".into(),
            nodes: vec![
                NodeSpec {
                    name: "src".into(),
                    operation: r#"READ CSV FILE "/dev/null" (t float NOT NULL, v float NOT NULL)"#
                        .into(),
                    parents: vec![],
                },
                NodeSpec {
                    name: "sums".into(),
                    operation: "SELECT SUM v AS total FROM src COMMIT WHEN true".into(),
                    parents: vec![],
                },
            ],
            timeout: None,
        }
    }

    #[tokio::test]
    async fn put_compile_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        sup.put_layer(metrics_layer()).unwrap();
        sup.compile(None).unwrap();

        let layer = &sup.graph().layers["metrics"];
        assert_eq!(layer.status, LayerStatus::Compiled);
        let sig = layer.nodes["sums"].signature.clone().unwrap();
        assert!(sup.config.program_path(&sig).exists());

        // Recompiling is idempotent and hits the artifact cache.
        sup.compile(Some("metrics")).unwrap();
        assert_eq!(
            sup.graph().layers["metrics"].nodes["sums"].signature,
            Some(sig)
        );

        // The graph survived to disk, volatile fields aside.
        let reloaded = Graph::load(&sup.config.graph_path()).unwrap();
        assert_eq!(&reloaded, sup.graph());

        // Stop on a compiled layer is an idempotent no-op.
        sup.stop("metrics").await.unwrap();
    }

    #[tokio::test]
    async fn bad_layers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let mut spec = metrics_layer();
        spec.nodes[1].parents = vec!["nowhere/nothing".into()];
        match sup.put_layer(spec) {
            Err(ManagerError::InvalidLayerSpec { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }

        // Running before compiling is an invalid transition.
        sup.put_layer(metrics_layer()).unwrap();
        match sup.run("metrics").await {
            Err(ManagerError::EngineError {
                error: sluice::Error::InvalidCommand { .. },
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}

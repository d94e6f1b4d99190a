//! The operator graph: layers of nodes, wired parent → child.

use crate::operation::Operation;
use crate::schema::TupleSchema;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Fully qualified node name, `layer/node`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub layer: String,
    pub node: String,
}

impl NodeRef {
    pub fn new(layer: impl Into<String>, node: impl Into<String>) -> Self {
        NodeRef {
            layer: layer.into(),
            node: node.into(),
        }
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.layer, self.node)
    }
}

impl FromStr for NodeRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((layer, node)) if !layer.is_empty() && !node.is_empty() => {
                Ok(NodeRef::new(layer, node))
            }
            _ => Err(format!("'{s}' is not a layer/node name")),
        }
    }
}

/// Latest telemetry a worker PUT for its node. Volatile: not persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub time: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// One operator of the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub operation: Operation,
    pub parents: Vec<NodeRef>,
    pub children: Vec<NodeRef>,
    #[serde(default)]
    pub in_schema: TupleSchema,
    #[serde(default)]
    pub out_schema: TupleSchema,
    /// Content hash of the typed operation; set by compilation.
    pub signature: Option<String>,
    /// Present iff the layer is Running and the worker has been spawned.
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(skip)]
    pub last_report: Option<Report>,
}

impl Node {
    pub fn new(name: impl Into<String>, operation: Operation, parents: Vec<NodeRef>) -> Self {
        Node {
            name: name.into(),
            operation,
            parents,
            children: Vec::new(),
            in_schema: TupleSchema::new(),
            out_schema: TupleSchema::new(),
            signature: None,
            pid: None,
            last_report: None,
        }
    }
}

/// Layer lifecycle. Created in Edition; Compiling while the typer runs;
/// Compiled once artifacts exist; Running while workers are up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerStatus {
    Edition,
    Compiling,
    Compiled,
    Running,
}

/// A named set of nodes: the unit of compilation and lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub nodes: IndexMap<String, Node>,
    pub status: LayerStatus,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    /// Idle TTL in seconds; the layer is stopped and removed past it.
    pub timeout: Option<f64>,
    /// Last fatal error observed on this layer (worker abort, …).
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl Layer {
    pub fn new(name: impl Into<String>, timeout: Option<f64>) -> Self {
        Layer {
            name: name.into(),
            nodes: IndexMap::new(),
            status: LayerStatus::Edition,
            last_started: None,
            last_stopped: None,
            timeout,
            last_error: None,
        }
    }
}

/// The whole graph: layer name → layer. Layer names are globally unique,
/// node names unique within their layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub layers: IndexMap<String, Layer>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, r: &NodeRef) -> Option<&Node> {
        self.layers.get(&r.layer)?.nodes.get(&r.node)
    }

    pub fn node_mut(&mut self, r: &NodeRef) -> Option<&mut Node> {
        self.layers.get_mut(&r.layer)?.nodes.get_mut(&r.node)
    }

    /// All fully qualified node names, layer by layer.
    pub fn node_refs(&self) -> Vec<NodeRef> {
        self.layers
            .values()
            .flat_map(|l| l.nodes.keys().map(|n| NodeRef::new(&l.name, n)))
            .collect()
    }

    /// Add a layer, checking the structural invariants: the layer name is
    /// new, and every parent resolves to this layer or to one that
    /// already exists (links may not reach into the future).
    pub fn add_layer(&mut self, layer: Layer) -> Result<(), String> {
        if self.layers.contains_key(&layer.name) {
            return Err(format!("layer '{}' already exists", layer.name));
        }
        for node in layer.nodes.values() {
            for parent in &node.parents {
                if parent.layer == layer.name {
                    if !layer.nodes.contains_key(&parent.node) {
                        return Err(format!(
                            "node '{}/{}' has unknown parent '{parent}'",
                            layer.name, node.name
                        ));
                    }
                } else if self.node(parent).is_none() {
                    return Err(format!(
                        "node '{}/{}' has unknown parent '{parent}'",
                        layer.name, node.name
                    ));
                }
            }
        }
        let name = layer.name.clone();
        self.layers.insert(name.clone(), layer);
        self.rebuild_children();
        // The inter-layer relation must stay acyclic; cycles are only
        // allowed between nodes of a single layer.
        if self.layer_order().is_none() {
            self.layers.shift_remove(&name);
            self.rebuild_children();
            return Err(format!("layer '{name}' would create an inter-layer cycle"));
        }
        Ok(())
    }

    /// Recompute every node's `children` back-references from `parents`.
    pub fn rebuild_children(&mut self) {
        let mut edges: Vec<(NodeRef, NodeRef)> = Vec::new();
        for layer in self.layers.values_mut() {
            for node in layer.nodes.values_mut() {
                node.children.clear();
            }
        }
        for layer in self.layers.values() {
            for node in layer.nodes.values() {
                let child = NodeRef::new(&layer.name, &node.name);
                for parent in &node.parents {
                    edges.push((parent.clone(), child.clone()));
                }
            }
        }
        for (parent, child) in edges {
            if let Some(p) = self.node_mut(&parent) {
                p.children.push(child);
            }
        }
    }

    /// Layers in a topological order of their inter-layer dependencies,
    /// or `None` when the inter-layer relation has a cycle.
    pub fn layer_order(&self) -> Option<Vec<String>> {
        let mut deps: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for layer in self.layers.values() {
            let entry = deps.entry(layer.name.as_str()).or_default();
            for node in layer.nodes.values() {
                for parent in &node.parents {
                    if parent.layer != layer.name {
                        entry.push(parent.layer.as_str());
                    }
                }
            }
        }
        let mut order = Vec::new();
        let mut done: Vec<&str> = Vec::new();
        while order.len() < deps.len() {
            let mut progressed = false;
            for (name, parents) in &deps {
                if done.contains(name) {
                    continue;
                }
                if parents.iter().all(|p| done.contains(p)) {
                    done.push(name);
                    order.push(name.to_string());
                    progressed = true;
                }
            }
            if !progressed {
                return None;
            }
        }
        Some(order)
    }

    /// Serialize to disk. Volatile fields (`pid`, `last_report`,
    /// `last_error`) are skipped by construction.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn load(path: &std::path::Path) -> std::io::Result<Graph> {
        let json = std::fs::read_to_string(path)?;
        let mut graph: Graph = serde_json::from_str(&json)?;
        // A graph saved while running has no live workers anymore.
        for layer in graph.layers.values_mut() {
            if layer.status == LayerStatus::Running {
                layer.status = LayerStatus::Compiled;
            }
        }
        graph.rebuild_children();
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ListenProtocol, Operation};

    fn listen_node(name: &str, parents: Vec<NodeRef>) -> Node {
        Node::new(
            name,
            Operation::Listen {
                protocol: ListenProtocol::Collectd,
            },
            parents,
        )
    }

    fn layer_of(name: &str, nodes: Vec<Node>) -> Layer {
        let mut l = Layer::new(name, None);
        for n in nodes {
            l.nodes.insert(n.name.clone(), n);
        }
        l
    }

    #[test]
    fn parents_must_exist() {
        let mut g = Graph::new();
        let bad = layer_of(
            "l1",
            vec![listen_node("a", vec![NodeRef::new("nope", "x")])],
        );
        assert!(g.add_layer(bad).is_err());
        assert!(g.layers.is_empty());
    }

    #[test]
    fn children_backrefs_and_order() {
        let mut g = Graph::new();
        g.add_layer(layer_of("base", vec![listen_node("src", vec![])]))
            .unwrap();
        g.add_layer(layer_of(
            "derived",
            vec![listen_node("agg", vec![NodeRef::new("base", "src")])],
        ))
        .unwrap();
        let src = g.node(&NodeRef::new("base", "src")).unwrap();
        assert_eq!(src.children, vec![NodeRef::new("derived", "agg")]);
        assert_eq!(g.layer_order().unwrap(), vec!["base", "derived"]);
    }

    #[test]
    fn intra_layer_cycles_are_allowed() {
        let mut g = Graph::new();
        let l = layer_of(
            "loopy",
            vec![
                listen_node("a", vec![NodeRef::new("loopy", "b")]),
                listen_node("b", vec![NodeRef::new("loopy", "a")]),
            ],
        );
        assert!(g.add_layer(l).is_ok());
        assert!(g.layer_order().is_some());
    }

    #[test]
    fn save_load_round_trip() {
        let mut g = Graph::new();
        g.add_layer(layer_of("base", vec![listen_node("src", vec![])]))
            .unwrap();
        let dir = std::env::temp_dir().join("sluice-graph-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("graph.json");
        g.save(&path).unwrap();
        let g2 = Graph::load(&path).unwrap();
        assert_eq!(g, g2);
        std::fs::remove_file(&path).ok();
    }
}

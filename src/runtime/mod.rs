//! Per-node runtimes: the aggregate state machine and the sources.
//!
//! A worker process hosts exactly one runtime, picked by the typed
//! program it was handed. The program artifact is the unit the
//! supervisor caches per signature.

pub mod aggregate;
pub mod sources;
pub mod worker;

#[cfg(test)]
mod tests;

use crate::error::Error;
use serde::{Deserialize, Serialize};
use sluice_types::graph::NodeRef;
use sluice_types::operation::Operation;
use sluice_types::schema::TupleSchema;
use std::path::Path;

/// The compiled artifact a worker executes: a fully typed operation plus
/// its schemas, keyed on disk by `signature`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedProgram {
    pub node: NodeRef,
    pub operation: Operation,
    pub in_schema: TupleSchema,
    pub out_schema: TupleSchema,
    pub signature: String,
}

impl TypedProgram {
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::fatal(format!("serializing program: {e}")))?;
        std::fs::write(path, json).map_err(|e| Error::io(format!("writing {}", path.display()), e))
    }

    pub fn load(path: &Path) -> Result<TypedProgram, Error> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::fatal(format!("corrupt program {}: {e}", path.display())))
    }
}

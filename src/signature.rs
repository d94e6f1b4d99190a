//! Node signatures: content hashes of fully typed operations.
//!
//! Two nodes with the same signature run the same program, so compiled
//! artifacts are keyed (and reused) by it. The hash covers the canonical
//! printed operation, both schemas and the engine version tag, so any
//! semantic or representational change invalidates the cache.

use sha2::{Digest, Sha256};
use sluice_types::operation::Operation;
use sluice_types::schema::TupleSchema;
use sluice_types::ENGINE_VERSION;

pub fn node_signature(op: &Operation, in_schema: &TupleSchema, out_schema: &TupleSchema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ENGINE_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(op.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(in_schema.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(out_schema.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_operation;

    #[test]
    fn signatures_are_deterministic_and_discriminating() {
        let (op1, _) = parse_operation("n", "SELECT SUM 1 AS count, word GROUP BY word").unwrap();
        let (op2, _) = parse_operation("n", "SELECT SUM 1 AS count, word GROUP BY word").unwrap();
        let (op3, _) = parse_operation("n", "SELECT SUM 2 AS count, word GROUP BY word").unwrap();
        let s = TupleSchema::new();
        assert_eq!(node_signature(&op1, &s, &s), node_signature(&op2, &s, &s));
        assert_ne!(node_signature(&op1, &s, &s), node_signature(&op3, &s, &s));
        assert_eq!(node_signature(&op1, &s, &s).len(), 64);
    }
}

//! Tuple schemas: ordered, named, typed fields.

use crate::expr::ExprType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One field of a tuple schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Position among the explicitly selected output fields; `None` for
    /// inherited input fields and `SELECT *` expansions.
    pub rank: Option<usize>,
    pub typ: ExprType,
}

/// An ordered mapping from field name to type. Field names are unique;
/// insertion order is the tuple's wire order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TupleSchema {
    fields: IndexMap<String, Field>,
    /// Once set, the field set is frozen; only types already present may
    /// keep refining until the owning node completes.
    pub finished: bool,
}

impl TupleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }

    /// Position of a field in wire order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.get_index_of(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Add a field. Fails on duplicates and on finished schemas.
    pub fn add(&mut self, name: &str, field: Field) -> Result<(), String> {
        if self.finished {
            return Err(format!("schema is finished, cannot add field '{name}'"));
        }
        if self.fields.contains_key(name) {
            return Err(format!("duplicate field '{name}'"));
        }
        self.fields.insert(name.to_string(), field);
        Ok(())
    }

    /// All field types are complete.
    pub fn is_fully_typed(&self) -> bool {
        self.fields.values().all(|f| f.typ.is_complete())
    }
}

impl Display for TupleSchema {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name} ")?;
            match field.typ.scalar {
                Some(t) => write!(f, "{t}")?,
                None => f.write_str("?")?,
            }
            match field.typ.nullable {
                Some(true) => f.write_str(" null")?,
                Some(false) => f.write_str(" not null")?,
                None => f.write_str(" ?null")?,
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ScalarType;

    fn fld(t: ScalarType, nullable: bool) -> Field {
        Field {
            rank: None,
            typ: ExprType::make("f", Some(t), Some(nullable)),
        }
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut s = TupleSchema::new();
        s.add("b", fld(ScalarType::U8, false)).unwrap();
        s.add("a", fld(ScalarType::Float, true)).unwrap();
        let names: Vec<_> = s.names().cloned().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(s.index_of("a"), Some(1));
    }

    #[test]
    fn finished_schemas_are_frozen() {
        let mut s = TupleSchema::new();
        s.add("a", fld(ScalarType::U8, false)).unwrap();
        assert!(s.add("a", fld(ScalarType::U8, false)).is_err());
        s.finished = true;
        assert!(s.add("b", fld(ScalarType::U8, false)).is_err());
        assert!(s.is_fully_typed());
    }
}

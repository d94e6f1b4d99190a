//! Operator definitions: what a node *does*.

use crate::expr::Expr;
use crate::scalar::ScalarType;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One `expr AS name` of a SELECT or YIELD clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectField {
    pub expr: Expr,
    pub alias: String,
}

/// What happens to a group when it flushes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushHow {
    /// Drop the group entirely.
    Reset,
    /// `COMMIT AND KEEP ALL …` — never drop anything.
    KeepAll,
    /// Drop the n oldest contributing tuples and re-fold the rest.
    Slide(u32),
    /// Keep only the contributors matching the predicate.
    KeepOnly(Expr),
    /// Remove the contributors matching the predicate.
    RemoveAll(Expr),
}

impl FlushHow {
    /// Does this mode need the group to retain its contributing tuples?
    pub fn needs_contributors(&self) -> bool {
        matches!(self, Self::Slide(_) | Self::KeepOnly(_) | Self::RemoveAll(_))
    }
}

/// `TOP k BY e [WHEN cond]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopSpec {
    pub k: u32,
    pub by: Expr,
    pub when: Option<Expr>,
}

/// User-declared event-time attributes of an exported node's tuples.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventTime {
    pub start_field: String,
    pub start_scale: f64,
    pub duration: EventDuration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDuration {
    Const(f64),
    StopField { field: String, scale: f64 },
}

/// `EXPORT [EVENT STARTING AT …]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub event_time: Option<EventTime>,
}

/// A declared column of a CSV source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsvColumn {
    pub name: String,
    pub typ: ScalarType,
    pub nullable: bool,
}

/// Wire protocols a LISTEN node understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenProtocol {
    Collectd,
}

impl ListenProtocol {
    /// The fixed output schema implied by the protocol.
    pub fn columns(&self) -> Vec<CsvColumn> {
        match self {
            Self::Collectd => vec![
                CsvColumn {
                    name: "host".into(),
                    typ: ScalarType::String,
                    nullable: false,
                },
                CsvColumn {
                    name: "time".into(),
                    typ: ScalarType::Float,
                    nullable: false,
                },
                CsvColumn {
                    name: "plugin".into(),
                    typ: ScalarType::String,
                    nullable: true,
                },
                CsvColumn {
                    name: "plugin_instance".into(),
                    typ: ScalarType::String,
                    nullable: true,
                },
                CsvColumn {
                    name: "type_name".into(),
                    typ: ScalarType::String,
                    nullable: true,
                },
                CsvColumn {
                    name: "type_instance".into(),
                    typ: ScalarType::String,
                    nullable: true,
                },
                CsvColumn {
                    name: "value".into(),
                    typ: ScalarType::Float,
                    nullable: false,
                },
            ],
        }
    }
}

/// The operation a node performs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A source emitting computed tuples, optionally on a period.
    Yield {
        fields: Vec<SelectField>,
        /// Emission period in seconds.
        every: Option<f64>,
    },
    /// A source reading a CSV file with an explicitly declared schema.
    ReadCsv {
        fields: Vec<CsvColumn>,
        path: String,
        separator: char,
    },
    /// A source parsing a wire protocol.
    Listen { protocol: ListenProtocol },
    /// The workhorse: filter, group, aggregate, window.
    Aggregate {
        fields: Vec<SelectField>,
        /// `SELECT *`: inherit the remaining input fields.
        all_others: bool,
        where_: Option<Expr>,
        key: Vec<Expr>,
        top: Option<TopSpec>,
        commit_when: Option<Expr>,
        flush_when: Option<Expr>,
        flush_how: FlushHow,
        export: Option<ExportSpec>,
    },
}

impl Operation {
    pub fn is_source(&self) -> bool {
        !matches!(self, Self::Aggregate { .. })
    }

    pub fn export(&self) -> Option<&ExportSpec> {
        match self {
            Self::Aggregate { export, .. } => export.as_ref(),
            _ => None,
        }
    }

    pub fn event_time(&self) -> Option<&EventTime> {
        self.export().and_then(|e| e.event_time.as_ref())
    }

    /// Every expression of the operation, in a fixed clause order
    /// (WHERE, KEY, SELECT, TOP, COMMIT, FLUSH). The order is load-bearing:
    /// stateful slots and signatures both derive from it.
    pub fn exprs(&self) -> Vec<&Expr> {
        let mut v = Vec::new();
        match self {
            Self::Yield { fields, .. } => {
                v.extend(fields.iter().map(|f| &f.expr));
            }
            Self::ReadCsv { .. } | Self::Listen { .. } => {}
            Self::Aggregate {
                fields,
                where_,
                key,
                top,
                commit_when,
                flush_when,
                flush_how,
                ..
            } => {
                v.extend(where_.iter());
                v.extend(key.iter());
                v.extend(fields.iter().map(|f| &f.expr));
                if let Some(t) = top {
                    v.push(&t.by);
                    v.extend(t.when.iter());
                }
                v.extend(commit_when.iter());
                v.extend(flush_when.iter());
                match flush_how {
                    FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) => v.push(e),
                    _ => {}
                }
            }
        }
        v
    }
}

impl Operation {
    /// Mutable view of every expression, in the same order as
    /// [`Operation::exprs`].
    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut v = Vec::new();
        match self {
            Self::Yield { fields, .. } => {
                v.extend(fields.iter_mut().map(|f| &mut f.expr));
            }
            Self::ReadCsv { .. } | Self::Listen { .. } => {}
            Self::Aggregate {
                fields,
                where_,
                key,
                top,
                commit_when,
                flush_when,
                flush_how,
                ..
            } => {
                v.extend(where_.iter_mut());
                v.extend(key.iter_mut());
                v.extend(fields.iter_mut().map(|f| &mut f.expr));
                if let Some(t) = top {
                    v.push(&mut t.by);
                    v.extend(t.when.iter_mut());
                }
                v.extend(commit_when.iter_mut());
                v.extend(flush_when.iter_mut());
                match flush_how {
                    FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) => v.push(e),
                    _ => {}
                }
            }
        }
        v
    }
}

impl Display for Operation {
    /// Canonical printed form; input of the signature hash.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yield { fields, every } => {
                f.write_str("YIELD ")?;
                for (i, fld) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} AS {}", fld.expr, fld.alias)?;
                }
                if let Some(e) = every {
                    write!(f, " EVERY {e:?} SECONDS")?;
                }
                Ok(())
            }
            Self::ReadCsv {
                fields,
                path,
                separator,
            } => {
                write!(f, "READ CSV FILE {path:?} SEPARATOR {:?} (", separator.to_string())?;
                for (i, c) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(
                        f,
                        "{} {}{}",
                        c.name,
                        c.typ,
                        if c.nullable { " NULL" } else { " NOT NULL" }
                    )?;
                }
                f.write_str(")")
            }
            Self::Listen { protocol } => match protocol {
                ListenProtocol::Collectd => f.write_str("LISTEN FOR COLLECTD"),
            },
            Self::Aggregate {
                fields,
                all_others,
                where_,
                key,
                top,
                commit_when,
                flush_when,
                flush_how,
                export,
            } => {
                f.write_str("SELECT ")?;
                let mut first = true;
                for fld in fields {
                    if !first {
                        f.write_str(", ")?;
                    }
                    first = false;
                    write!(f, "{} AS {}", fld.expr, fld.alias)?;
                }
                if *all_others {
                    if !first {
                        f.write_str(", ")?;
                    }
                    f.write_str("*")?;
                }
                if let Some(w) = where_ {
                    write!(f, " WHERE {w}")?;
                }
                if !key.is_empty() {
                    f.write_str(" GROUP BY ")?;
                    for (i, k) in key.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{k}")?;
                    }
                }
                if let Some(t) = top {
                    write!(f, " TOP {} BY {}", t.k, t.by)?;
                    if let Some(w) = &t.when {
                        write!(f, " WHEN {w}")?;
                    }
                }
                if let Some(c) = commit_when {
                    f.write_str(" COMMIT")?;
                    match flush_how {
                        FlushHow::Reset => {}
                        FlushHow::KeepAll => f.write_str(" AND KEEP ALL")?,
                        FlushHow::Slide(n) => write!(f, " AND SLIDE {n}")?,
                        FlushHow::KeepOnly(e) => write!(f, " AND KEEP ({e})")?,
                        FlushHow::RemoveAll(e) => write!(f, " AND REMOVE ({e})")?,
                    }
                    write!(f, " WHEN {c}")?;
                }
                if let Some(fl) = flush_when {
                    write!(f, " FLUSH WHEN {fl}")?;
                }
                if let Some(ex) = export {
                    f.write_str(" EXPORT")?;
                    if let Some(et) = &ex.event_time {
                        write!(f, " EVENT STARTING AT {}", et.start_field)?;
                        if et.start_scale != 1.0 {
                            write!(f, " * {:?}", et.start_scale)?;
                        }
                        match &et.duration {
                            EventDuration::Const(d) => write!(f, " WITH DURATION {d:?}")?,
                            EventDuration::StopField { field, scale } => {
                                write!(f, " AND STOPPING AT {field}")?;
                                if *scale != 1.0 {
                                    write!(f, " * {scale:?}")?;
                                }
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

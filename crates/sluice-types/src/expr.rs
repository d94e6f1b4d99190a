//! Expression types and the expression AST.
//!
//! Every AST node owns an [`ExprType`], a record that starts (partially)
//! unknown and is filled in by the type inference pass. The `Display`
//! impl prints the canonical form: it is what gets hashed into node
//! signatures and what the parse-print-parse law is stated over.

use crate::scalar::{can_cast, larger_type, ScalarType, ScalarValue, TypeError};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The (possibly still unknown) type of one expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExprType {
    /// Diagnostic name: field name, operator name, "where clause", …
    pub name: String,
    pub scalar: Option<ScalarType>,
    pub nullable: Option<bool>,
}

impl ExprType {
    pub fn unknown(name: impl Into<String>) -> Self {
        ExprType {
            name: name.into(),
            scalar: None,
            nullable: None,
        }
    }

    pub fn make(
        name: impl Into<String>,
        scalar: Option<ScalarType>,
        nullable: Option<bool>,
    ) -> Self {
        ExprType {
            name: name.into(),
            scalar,
            nullable,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.scalar.is_some() && self.nullable.is_some()
    }

    /// Widen the scalar component toward `t`. Returns whether anything
    /// changed; fails when `t` and the current type are unordered.
    pub fn widen_scalar(&mut self, t: ScalarType) -> Result<bool, TypeError> {
        match self.scalar {
            None => {
                self.scalar = Some(t);
                Ok(true)
            }
            Some(cur) if cur == t => Ok(false),
            Some(cur) => {
                let lub = larger_type(cur, t)?;
                if lub == cur {
                    Ok(false)
                } else {
                    self.scalar = Some(lub);
                    Ok(true)
                }
            }
        }
    }

    /// Set nullability; setting the opposite of an already-known value is
    /// a conflict.
    pub fn set_nullable(&mut self, n: bool) -> Result<bool, TypeError> {
        match self.nullable {
            None => {
                self.nullable = Some(n);
                Ok(true)
            }
            Some(cur) if cur == n => Ok(false),
            Some(_) => Err(TypeError::NullabilityConflict(self.name.clone())),
        }
    }

    /// Can a value of this type be used where `other` is expected?
    pub fn can_cast_to(&self, other: &ExprType) -> bool {
        match (self.scalar, other.scalar) {
            (Some(a), Some(b)) => can_cast(a, b),
            _ => true,
        }
    }
}

/// Which tuple a field reference reads from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuplePrefix {
    /// The arriving tuple.
    In,
    /// The tentative output tuple (earlier SELECT fields only).
    Out,
    /// The tuple last emitted for this group.
    Previous,
    /// Virtual group fields (`group.#count`).
    Group,
    /// The first input tuple folded into this group.
    GroupFirst,
    /// The last input tuple folded into this group.
    GroupLast,
    /// Not yet resolved; the typer rewrites this to `In` or `Out`.
    Unqualified,
}

impl TuplePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Previous => "previous",
            Self::Group => "group",
            Self::GroupFirst => "group.first",
            Self::GroupLast => "group.last",
            Self::Unqualified => "",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    /// `IS NOT NULL`: true iff the operand is not NULL; never nullable.
    Defined,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Float division.
    Div,
    /// Integer (floored) division, `//`.
    IDiv,
    Mod,
    Pow,
    And,
    Or,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    /// String concatenation, `||`.
    Concat,
}

impl BinaryOp {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::IDiv => "//",
            Self::Mod => "%",
            Self::Pow => "^",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Concat => "||",
        }
    }
}

/// Functions returning many values per call (expanded as a Cartesian
/// product over the SELECT clause).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorFn {
    /// `SPLIT(s, sep)` — the pieces of `s` around `sep`.
    Split,
}

/// Stateful functions: classic running aggregates plus the windowed and
/// seasonal ones. Argument conventions (constant arguments first):
/// `PERCENTILE(p, e)`, `LAG(k, e)`, `MOVING_AVG(n, e)`, `LIN_REG(x, y)`,
/// `SMOOTH(alpha, e)`, `REMEMBER(time, duration, e)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatefulFn {
    AggrMin,
    AggrMax,
    AggrSum,
    AggrAvg,
    AggrAnd,
    AggrOr,
    AggrFirst,
    AggrLast,
    Percentile,
    Lag,
    MovingAvg,
    LinReg,
    Smooth,
    Remember,
}

impl StatefulFn {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AggrMin => "MIN",
            Self::AggrMax => "MAX",
            Self::AggrSum => "SUM",
            Self::AggrAvg => "AVG",
            Self::AggrAnd => "AND_ALL",
            Self::AggrOr => "OR_ALL",
            Self::AggrFirst => "FIRST",
            Self::AggrLast => "LAST",
            Self::Percentile => "PERCENTILE",
            Self::Lag => "LAG",
            Self::MovingAvg => "MOVING_AVG",
            Self::LinReg => "LIN_REG",
            Self::Smooth => "SMOOTH",
            Self::Remember => "REMEMBER",
        }
    }

    /// How many leading arguments must be constants.
    pub fn nb_const_args(&self) -> usize {
        match self {
            Self::Percentile | Self::Lag | Self::MovingAvg | Self::Smooth => 1,
            Self::Remember => 0, // duration is argument 1, checked separately
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub cond: Expr,
    pub then: Expr,
}

/// The expression AST. Every variant carries its own [`ExprType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const {
        typ: ExprType,
        value: ScalarValue,
    },
    /// A parametric hole, `$name`, bound at run time.
    Param {
        typ: ExprType,
        name: String,
    },
    Field {
        typ: ExprType,
        prefix: TuplePrefix,
        name: String,
    },
    Unary {
        typ: ExprType,
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        typ: ExprType,
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Case {
        typ: ExprType,
        whens: Vec<CaseWhen>,
        else_: Option<Box<Expr>>,
    },
    Coalesce {
        typ: ExprType,
        args: Vec<Expr>,
    },
    Generator {
        typ: ExprType,
        func: GeneratorFn,
        args: Vec<Expr>,
    },
    Stateful {
        typ: ExprType,
        /// Index into the per-group state vector, assigned by the typer.
        #[serde(default)]
        slot: usize,
        func: StatefulFn,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn const_value(value: ScalarValue) -> Expr {
        let (scalar, nullable) = match value.scalar_type() {
            Some(t) => (Some(t), Some(false)),
            None => (None, Some(true)),
        };
        Expr::Const {
            typ: ExprType::make("constant", scalar, nullable),
            value,
        }
    }

    /// An unsuffixed integer literal: abstract `Num`, widened by context.
    pub fn const_num(v: i128) -> Expr {
        Expr::Const {
            typ: ExprType::make("constant", Some(ScalarType::Num), Some(false)),
            value: ScalarValue::I128(v),
        }
    }

    pub fn typ(&self) -> &ExprType {
        match self {
            Expr::Const { typ, .. }
            | Expr::Param { typ, .. }
            | Expr::Field { typ, .. }
            | Expr::Unary { typ, .. }
            | Expr::Binary { typ, .. }
            | Expr::Case { typ, .. }
            | Expr::Coalesce { typ, .. }
            | Expr::Generator { typ, .. }
            | Expr::Stateful { typ, .. } => typ,
        }
    }

    pub fn typ_mut(&mut self) -> &mut ExprType {
        match self {
            Expr::Const { typ, .. }
            | Expr::Param { typ, .. }
            | Expr::Field { typ, .. }
            | Expr::Unary { typ, .. }
            | Expr::Binary { typ, .. }
            | Expr::Case { typ, .. }
            | Expr::Coalesce { typ, .. }
            | Expr::Generator { typ, .. }
            | Expr::Stateful { typ, .. } => typ,
        }
    }

    /// Immediate children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const { .. } | Expr::Param { .. } | Expr::Field { .. } => vec![],
            Expr::Unary { operand, .. } => vec![operand],
            Expr::Binary { left, right, .. } => vec![left, right],
            Expr::Case { whens, else_, .. } => {
                let mut v = Vec::new();
                for w in whens {
                    v.push(&w.cond);
                    v.push(&w.then);
                }
                if let Some(e) = else_ {
                    v.push(e);
                }
                v
            }
            Expr::Coalesce { args, .. }
            | Expr::Generator { args, .. }
            | Expr::Stateful { args, .. } => args.iter().collect(),
        }
    }

    /// Immediate children, mutably, in evaluation order.
    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Const { .. } | Expr::Param { .. } | Expr::Field { .. } => vec![],
            Expr::Unary { operand, .. } => vec![operand],
            Expr::Binary { left, right, .. } => vec![left, right],
            Expr::Case { whens, else_, .. } => {
                let mut v = Vec::new();
                for w in whens {
                    v.push(&mut w.cond);
                    v.push(&mut w.then);
                }
                if let Some(e) = else_ {
                    v.push(e);
                }
                v
            }
            Expr::Coalesce { args, .. }
            | Expr::Generator { args, .. }
            | Expr::Stateful { args, .. } => args.iter_mut().collect(),
        }
    }

    /// Post-order walk.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        for c in self.children() {
            c.visit(f);
        }
        f(self);
    }

    /// Post-order walk, mutably.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Expr)) {
        for c in self.children_mut() {
            c.visit_mut(f);
        }
        f(self);
    }

    /// True when the expression can be evaluated without any tuple:
    /// constants combined by pure operators.
    pub fn is_const(&self) -> bool {
        match self {
            Expr::Const { .. } => true,
            Expr::Param { .. }
            | Expr::Field { .. }
            | Expr::Stateful { .. }
            | Expr::Generator { .. } => false,
            Expr::Unary { operand, .. } => operand.is_const(),
            Expr::Binary { left, right, .. } => left.is_const() && right.is_const(),
            Expr::Case { whens, else_, .. } => {
                whens.iter().all(|w| w.cond.is_const() && w.then.is_const())
                    && else_.as_ref().map_or(true, |e| e.is_const())
            }
            Expr::Coalesce { args, .. } => args.iter().all(Expr::is_const),
        }
    }

    /// Does any sub-expression read from the given tuple prefix?
    pub fn references(&self, prefix: TuplePrefix) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Field { prefix: p, .. } = e {
                if *p == prefix {
                    found = true;
                }
            }
        });
        found
    }

    /// A reasonable output-field name for an unaliased SELECT expression.
    pub fn default_alias(&self) -> String {
        match self {
            Expr::Field { name, .. } => name.clone(),
            Expr::Stateful { args, func, .. } => args
                .last()
                .map(|a| a.default_alias())
                .unwrap_or_else(|| func.name().to_ascii_lowercase()),
            _ => "_".into(),
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const { typ, value } => {
                // Unsuffixed integer literals stay abstract `Num` until the
                // typer pins them; print them bare so they re-parse as such.
                if typ.scalar == Some(ScalarType::Num) {
                    if let Some(v) = value.to_i128() {
                        return write!(f, "{v}");
                    }
                }
                write!(f, "{value}")
            }
            Expr::Param { name, .. } => write!(f, "${name}"),
            Expr::Field { prefix, name, .. } => match prefix {
                TuplePrefix::Unqualified => f.write_str(name),
                p => write!(f, "{}.{}", p.as_str(), name),
            },
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Not => write!(f, "(NOT {operand})"),
                UnaryOp::Neg => write!(f, "(-{operand})"),
                UnaryOp::Defined => write!(f, "({operand} IS NOT NULL)"),
            },
            Expr::Binary {
                op, left, right, ..
            } => write!(f, "({left} {} {right})", op.token()),
            Expr::Case { whens, else_, .. } => {
                f.write_str("CASE")?;
                for w in whens {
                    write!(f, " WHEN {} THEN {}", w.cond, w.then)?;
                }
                if let Some(e) = else_ {
                    write!(f, " ELSE {e}")?;
                }
                f.write_str(" END")
            }
            Expr::Coalesce { args, .. } => {
                f.write_str("COALESCE(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Generator { func, args, .. } => {
                let name = match func {
                    GeneratorFn::Split => "SPLIT",
                };
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Stateful { func, args, .. } => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_scalar_is_monotone() {
        let mut t = ExprType::unknown("x");
        assert!(t.widen_scalar(ScalarType::U8).unwrap());
        assert!(!t.widen_scalar(ScalarType::U8).unwrap());
        assert!(t.widen_scalar(ScalarType::I16).unwrap());
        assert_eq!(t.scalar, Some(ScalarType::I32));
        // Widening toward something smaller is a no-op.
        assert!(!t.widen_scalar(ScalarType::U8).unwrap());
        assert_eq!(t.scalar, Some(ScalarType::I32));
        assert!(t.widen_scalar(ScalarType::String).is_err());
    }

    #[test]
    fn set_nullable_conflicts() {
        let mut t = ExprType::unknown("x");
        assert!(t.set_nullable(false).unwrap());
        assert!(!t.set_nullable(false).unwrap());
        assert!(t.set_nullable(true).is_err());
    }

    #[test]
    fn canonical_print() {
        let e = Expr::Binary {
            typ: ExprType::unknown("op"),
            op: BinaryOp::Gt,
            left: Box::new(Expr::Stateful {
                typ: ExprType::unknown("sum"),
                slot: 0,
                func: StatefulFn::AggrSum,
                args: vec![Expr::const_value(ScalarValue::I16(1))],
            }),
            right: Box::new(Expr::const_num(500)),
        };
        assert_eq!(e.to_string(), "(SUM(1i16) > 500)");
    }

    #[test]
    fn references_finds_prefixes() {
        let e = Expr::Binary {
            typ: ExprType::unknown("op"),
            op: BinaryOp::Gt,
            left: Box::new(Expr::Field {
                typ: ExprType::unknown("time"),
                prefix: TuplePrefix::In,
                name: "time".into(),
            }),
            right: Box::new(Expr::Field {
                typ: ExprType::unknown("time"),
                prefix: TuplePrefix::Previous,
                name: "time".into(),
            }),
        };
        assert!(e.references(TuplePrefix::In));
        assert!(e.references(TuplePrefix::Previous));
        assert!(!e.references(TuplePrefix::Out));
    }
}

//! Recursive-descent parser for operator definitions.
//!
//! One definition string describes one node: a `YIELD`, `READ CSV`,
//! `LISTEN` or `SELECT` operation. Expressions use precedence climbing;
//! `IF c THEN a ELSE b` desugars to `CASE`. The parser never touches
//! types beyond what literals pin down: everything else starts unknown
//! and is the typer's business.

use super::lexer::Token;
use crate::error::Error;
use logos::Logos;
use sluice_types::expr::{
    BinaryOp, CaseWhen, Expr, ExprType, GeneratorFn, StatefulFn, TuplePrefix, UnaryOp,
};
use sluice_types::operation::{
    CsvColumn, EventDuration, EventTime, ExportSpec, FlushHow, ListenProtocol, Operation,
    SelectField, TopSpec,
};
use sluice_types::scalar::{ScalarType, ScalarValue};

/// Parse one operator definition. Returns the untyped operation and the
/// parent names its FROM clause mentions (`node` or `layer/node`).
pub fn parse_operation(node: &str, src: &str) -> Result<(Operation, Vec<String>), Error> {
    let mut tokens = Vec::new();
    for (tok, span) in Token::lexer(src).spanned() {
        match tok {
            Ok(t) => tokens.push(t),
            Err(()) => {
                return Err(Error::syntax(
                    node,
                    format!("cannot lex '{}'", src.get(span).unwrap_or("?")),
                ))
            }
        }
    }
    let mut p = Parser {
        node: node.to_string(),
        tokens,
        pos: 0,
        from: Vec::new(),
    };
    let op = p.parse()?;
    if let Some(t) = p.peek() {
        return Err(p.err(format!("unexpected '{t:?}' after the operation")));
    }
    Ok((op, p.from))
}

struct Parser {
    node: String,
    tokens: Vec<Token>,
    pos: usize,
    from: Vec<String>,
}

/// Clause keywords that may never start an expression: seeing one in
/// expression position is a syntax error, not a field reference.
const RESERVED: &[&str] = &[
    "FROM", "WHERE", "GROUP", "TOP", "COMMIT", "FLUSH", "EXPORT", "AS", "WHEN", "THEN", "ELSE",
    "END", "BY", "EVERY", "SECONDS", "AND", "OR", "NOT", "IS",
];

impl Parser {
    fn err(&self, message: impl Into<String>) -> Error {
        Error::syntax(&self.node, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token) -> Result<(), Error> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(self.err(format!("expected {t:?}, got {:?}", self.peek())))
        }
    }

    /// Case-insensitive keyword lookahead.
    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), Error> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.err(format!("expected {kw}, got {:?}", self.peek())))
        }
    }

    fn ident(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(self.err(format!("expected a name, got {other:?}"))),
        }
    }

    fn number_f64(&mut self) -> Result<f64, Error> {
        match self.next() {
            Some(Token::Int(v)) => Ok(v as f64),
            Some(Token::Float(v)) => Ok(v),
            other => Err(self.err(format!("expected a number, got {other:?}"))),
        }
    }

    fn parse(&mut self) -> Result<Operation, Error> {
        if self.eat_kw("YIELD") {
            self.parse_yield()
        } else if self.eat_kw("READ") {
            self.parse_read_csv()
        } else if self.eat_kw("LISTEN") {
            self.parse_listen()
        } else if self.eat_kw("SELECT") {
            self.parse_select()
        } else {
            Err(self.err(format!(
                "an operation starts with YIELD, READ, LISTEN or SELECT, got {:?}",
                self.peek()
            )))
        }
    }

    fn parse_yield(&mut self) -> Result<Operation, Error> {
        let (fields, all_others) = self.parse_select_fields()?;
        if all_others {
            return Err(self.err("YIELD cannot use '*': it has no input"));
        }
        let every = if self.eat_kw("EVERY") {
            let period = self.number_f64()?;
            self.expect_kw("SECONDS")?;
            Some(period)
        } else {
            None
        };
        Ok(Operation::Yield { fields, every })
    }

    fn parse_read_csv(&mut self) -> Result<Operation, Error> {
        self.expect_kw("CSV")?;
        self.expect_kw("FILE")?;
        let path = match self.next() {
            Some(Token::Str(s)) => s,
            other => return Err(self.err(format!("expected a file path string, got {other:?}"))),
        };
        let separator = if self.eat_kw("SEPARATOR") {
            match self.next() {
                Some(Token::Str(s)) if s.chars().count() == 1 => s.chars().next().unwrap(),
                other => {
                    return Err(
                        self.err(format!("expected a one-character separator, got {other:?}"))
                    )
                }
            }
        } else {
            ','
        };
        self.expect(&Token::LParen)?;
        let mut fields = Vec::new();
        loop {
            let name = self.ident()?;
            let tname = self.ident()?;
            let typ: ScalarType = tname
                .parse()
                .map_err(|e: String| self.err(e))?;
            let nullable = if self.eat_kw("NOT") {
                self.expect_kw("NULL")?;
                false
            } else if self.eat_kw("NULL") {
                true
            } else {
                false
            };
            fields.push(CsvColumn {
                name,
                typ,
                nullable,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(Operation::ReadCsv {
            fields,
            path,
            separator,
        })
    }

    fn parse_listen(&mut self) -> Result<Operation, Error> {
        // FOR is decorative.
        self.eat_kw("FOR");
        if self.eat_kw("COLLECTD") {
            Ok(Operation::Listen {
                protocol: ListenProtocol::Collectd,
            })
        } else {
            Err(self.err(format!("unknown LISTEN protocol {:?}", self.peek())))
        }
    }

    /// Keeps the FROM names aside for the caller.
    fn parse_select(&mut self) -> Result<Operation, Error> {
        let (fields, all_others) = self.parse_select_fields()?;
        if self.eat_kw("FROM") {
            loop {
                let mut name = self.ident()?;
                if self.eat(&Token::Slash) {
                    name = format!("{name}/{}", self.ident()?);
                }
                self.from.push(name);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let where_ = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let mut key = Vec::new();
        if self.eat_kw("GROUP") {
            self.expect_kw("BY")?;
            loop {
                key.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let top = if self.eat_kw("TOP") {
            let k = match self.next() {
                Some(Token::Int(v)) if v > 0 => v as u32,
                other => return Err(self.err(format!("expected TOP count, got {other:?}"))),
            };
            self.expect_kw("BY")?;
            let by = self.parse_expr()?;
            let when = if self.eat_kw("WHEN") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            Some(TopSpec { k, by, when })
        } else {
            None
        };
        let mut flush_how = FlushHow::Reset;
        let commit_when = if self.eat_kw("COMMIT") {
            if self.eat_kw("AND") {
                if self.eat_kw("KEEP") {
                    if self.eat_kw("ALL") {
                        flush_how = FlushHow::KeepAll;
                    } else {
                        self.expect(&Token::LParen)?;
                        let e = self.parse_expr()?;
                        self.expect(&Token::RParen)?;
                        flush_how = FlushHow::KeepOnly(e);
                    }
                } else if self.eat_kw("SLIDE") {
                    match self.next() {
                        Some(Token::Int(v)) if v >= 0 => flush_how = FlushHow::Slide(v as u32),
                        other => {
                            return Err(self.err(format!("expected SLIDE count, got {other:?}")))
                        }
                    }
                } else if self.eat_kw("REMOVE") {
                    self.expect(&Token::LParen)?;
                    let e = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    flush_how = FlushHow::RemoveAll(e);
                } else {
                    return Err(self.err(format!(
                        "expected KEEP, SLIDE or REMOVE after COMMIT AND, got {:?}",
                        self.peek()
                    )));
                }
            }
            self.expect_kw("WHEN")?;
            Some(self.parse_expr()?)
        } else {
            None
        };
        let flush_when = if self.eat_kw("FLUSH") {
            self.expect_kw("WHEN")?;
            Some(self.parse_expr()?)
        } else {
            None
        };
        let export = if self.eat_kw("EXPORT") {
            let event_time = if self.eat_kw("EVENT") {
                self.expect_kw("STARTING")?;
                self.expect_kw("AT")?;
                let start_field = self.ident()?;
                let start_scale = if self.eat(&Token::Star) {
                    self.number_f64()?
                } else {
                    1.0
                };
                let duration = if self.eat_kw("WITH") {
                    self.expect_kw("DURATION")?;
                    EventDuration::Const(self.number_f64()?)
                } else if self.eat_kw("AND") {
                    self.expect_kw("STOPPING")?;
                    self.expect_kw("AT")?;
                    let field = self.ident()?;
                    let scale = if self.eat(&Token::Star) {
                        self.number_f64()?
                    } else {
                        1.0
                    };
                    EventDuration::StopField { field, scale }
                } else {
                    EventDuration::Const(0.0)
                };
                Some(EventTime {
                    start_field,
                    start_scale,
                    duration,
                })
            } else {
                None
            };
            Some(ExportSpec { event_time })
        } else {
            None
        };
        Ok(Operation::Aggregate {
            fields,
            all_others,
            where_,
            key,
            top,
            commit_when,
            flush_when,
            flush_how,
            export,
        })
    }

    /// `expr [AS name], …` with an optional `*` member.
    fn parse_select_fields(&mut self) -> Result<(Vec<SelectField>, bool), Error> {
        let mut fields: Vec<SelectField> = Vec::new();
        let mut all_others = false;
        loop {
            if self.eat(&Token::Star) {
                if all_others {
                    return Err(self.err("duplicate '*' in SELECT"));
                }
                all_others = true;
            } else {
                let expr = self.parse_expr()?;
                let alias = if self.eat_kw("AS") {
                    self.ident()?
                } else {
                    expr.default_alias()
                };
                if fields.iter().any(|f| f.alias == alias) {
                    return Err(self.err(format!("duplicate output field '{alias}'")));
                }
                fields.push(SelectField { expr, alias });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok((fields, all_others))
    }

    // ---- expressions -------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, Error> {
        self.parse_or()
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            typ: ExprType::unknown(op.token()),
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_and()?;
        while self.eat_kw("OR") {
            let right = self.parse_and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_not()?;
        while self.eat_kw("AND") {
            let right = self.parse_not()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, Error> {
        if self.eat_kw("NOT") {
            let operand = self.parse_not()?;
            Ok(Expr::Unary {
                typ: ExprType::unknown("not"),
                op: UnaryOp::Not,
                operand: Box::new(operand),
            })
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr, Error> {
        let left = self.parse_additive()?;
        if self.eat_kw("IS") {
            let negated = !self.eat_kw("NOT");
            self.expect_kw("NULL")?;
            let defined = Expr::Unary {
                typ: ExprType::make("is not null", Some(ScalarType::Bool), Some(false)),
                op: UnaryOp::Defined,
                operand: Box::new(left),
            };
            return Ok(if negated {
                Expr::Unary {
                    typ: ExprType::unknown("not"),
                    op: UnaryOp::Not,
                    operand: Box::new(defined),
                }
            } else {
                defined
            });
        }
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Self::binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Concat) => BinaryOp::Concat,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::SlashSlash) => BinaryOp::IDiv,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_pow()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_pow(&mut self) -> Result<Expr, Error> {
        let left = self.parse_unary()?;
        if self.eat(&Token::Caret) {
            let right = self.parse_pow()?;
            Ok(Self::binary(BinaryOp::Pow, left, right))
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            Ok(Expr::Unary {
                typ: ExprType::unknown("neg"),
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            })
        } else {
            self.parse_primary()
        }
    }

    fn stateful_of(name: &str) -> Option<StatefulFn> {
        Some(match name.to_ascii_uppercase().as_str() {
            "MIN" => StatefulFn::AggrMin,
            "MAX" => StatefulFn::AggrMax,
            "SUM" => StatefulFn::AggrSum,
            "AVG" => StatefulFn::AggrAvg,
            "AND_ALL" => StatefulFn::AggrAnd,
            "OR_ALL" => StatefulFn::AggrOr,
            "FIRST" => StatefulFn::AggrFirst,
            "LAST" => StatefulFn::AggrLast,
            "PERCENTILE" => StatefulFn::Percentile,
            "LAG" => StatefulFn::Lag,
            "MOVING_AVG" => StatefulFn::MovingAvg,
            "LIN_REG" => StatefulFn::LinReg,
            "SMOOTH" => StatefulFn::Smooth,
            "REMEMBER" => StatefulFn::Remember,
            _ => return None,
        })
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, Error> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let e = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::Int(v)) => {
                self.pos += 1;
                Ok(Expr::const_num(v))
            }
            Some(Token::TypedInt(s)) => {
                self.pos += 1;
                self.typed_int(&s)
            }
            Some(Token::Float(v)) => {
                self.pos += 1;
                Ok(Expr::const_value(ScalarValue::Float(v)))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Expr::const_value(ScalarValue::String(s)))
            }
            Some(Token::Param(name)) => {
                self.pos += 1;
                Ok(Expr::Param {
                    typ: ExprType::unknown(format!("${name}")),
                    name,
                })
            }
            Some(Token::HashIdent(name)) => {
                self.pos += 1;
                Ok(Expr::Field {
                    typ: ExprType::unknown(&name),
                    prefix: TuplePrefix::Unqualified,
                    name,
                })
            }
            Some(Token::Ident(word)) => {
                self.pos += 1;
                self.parse_word(word)
            }
            other => Err(self.err(format!("expected an expression, got {other:?}"))),
        }
    }

    fn typed_int(&mut self, s: &str) -> Result<Expr, Error> {
        let split = s
            .find(|c| c == 'i' || c == 'u')
            .expect("lexer guarantees a suffix");
        let digits = &s[..split];
        let typ: ScalarType = s[split..].parse().map_err(|e: String| self.err(e))?;
        let v: i128 = digits
            .parse()
            .map_err(|_| self.err(format!("integer '{digits}' out of range")))?;
        let value = ScalarValue::int_of(typ, v)
            .ok_or_else(|| self.err(format!("{v} does not fit in {typ}")))?;
        Ok(Expr::const_value(value))
    }

    /// An identifier in expression position: literal keyword, function
    /// call, aggregate, or (possibly qualified) field reference.
    fn parse_word(&mut self, word: String) -> Result<Expr, Error> {
        let upper = word.to_ascii_uppercase();
        if RESERVED.contains(&upper.as_str()) {
            return Err(self.err(format!("expected an expression, got {word}")));
        }
        match upper.as_str() {
            "TRUE" => return Ok(Expr::const_value(ScalarValue::Bool(true))),
            "FALSE" => return Ok(Expr::const_value(ScalarValue::Bool(false))),
            "NULL" => return Ok(Expr::const_value(ScalarValue::Null)),
            "CASE" => return self.parse_case(),
            "IF" => return self.parse_if(),
            "COALESCE" => {
                let args = self.parse_args()?;
                if args.is_empty() {
                    return Err(self.err("COALESCE requires at least one argument"));
                }
                return Ok(Expr::Coalesce {
                    typ: ExprType::unknown("coalesce"),
                    args,
                });
            }
            "SPLIT" => {
                let args = self.parse_args()?;
                if args.len() != 2 {
                    return Err(self.err("SPLIT takes (string, separator)"));
                }
                return Ok(Expr::Generator {
                    typ: ExprType::unknown("split"),
                    func: GeneratorFn::Split,
                    args,
                });
            }
            "IP4" | "IP6" | "CIDR4" | "CIDR6" => {
                if let Some(Token::Str(_)) = self.peek() {
                    return self.address_literal(&upper);
                }
                // Not a literal: fall through to a field named ip4 etc.
            }
            _ => {}
        }
        if let Some(func) = Self::stateful_of(&word) {
            let args = if self.peek() == Some(&Token::LParen) {
                self.parse_args()?
            } else {
                // Prefix form, `SUM x`: one argument, binding tightly.
                vec![self.parse_unary()?]
            };
            self.check_stateful_arity(func, &args)?;
            return Ok(Expr::Stateful {
                typ: ExprType::unknown(func.name().to_ascii_lowercase()),
                slot: 0,
                func,
                args,
            });
        }
        // A (possibly qualified) field reference.
        let mut segments = vec![word];
        while self.eat(&Token::Dot) {
            match self.next() {
                Some(Token::Ident(s)) | Some(Token::HashIdent(s)) => segments.push(s),
                other => return Err(self.err(format!("expected a field name, got {other:?}"))),
            }
        }
        let (prefix, name) = match segments.len() {
            1 => (TuplePrefix::Unqualified, segments.pop().unwrap()),
            2 => {
                let name = segments.pop().unwrap();
                let prefix = match segments[0].to_ascii_lowercase().as_str() {
                    "in" => TuplePrefix::In,
                    "out" => TuplePrefix::Out,
                    "previous" => TuplePrefix::Previous,
                    "group" if name == "#count" => TuplePrefix::Group,
                    other => {
                        return Err(self.err(format!("unknown tuple prefix '{other}.{name}'")))
                    }
                };
                (prefix, name)
            }
            3 if segments[0].eq_ignore_ascii_case("group") => {
                let name = segments.pop().unwrap();
                let prefix = match segments[1].to_ascii_lowercase().as_str() {
                    "first" => TuplePrefix::GroupFirst,
                    "last" => TuplePrefix::GroupLast,
                    other => return Err(self.err(format!("unknown tuple prefix 'group.{other}'"))),
                };
                (prefix, name)
            }
            _ => return Err(self.err(format!("cannot make sense of '{}'", segments.join(".")))),
        };
        Ok(Expr::Field {
            typ: ExprType::unknown(&name),
            prefix,
            name,
        })
    }

    fn check_stateful_arity(&self, func: StatefulFn, args: &[Expr]) -> Result<(), Error> {
        let expected = match func {
            StatefulFn::Percentile | StatefulFn::Lag | StatefulFn::MovingAvg
            | StatefulFn::LinReg | StatefulFn::Smooth => 2,
            StatefulFn::Remember => 3,
            _ => 1,
        };
        if args.len() != expected {
            return Err(self.err(format!(
                "{} takes {expected} argument(s), got {}",
                func.name(),
                args.len()
            )));
        }
        Ok(())
    }

    fn address_literal(&mut self, kind: &str) -> Result<Expr, Error> {
        let s = match self.next() {
            Some(Token::Str(s)) => s,
            _ => unreachable!("caller peeked a string"),
        };
        let value = match kind {
            "IP4" => s
                .parse()
                .map(ScalarValue::Ip4)
                .map_err(|_| self.err(format!("invalid IPv4 address {s:?}"))),
            "IP6" => s
                .parse()
                .map(ScalarValue::Ip6)
                .map_err(|_| self.err(format!("invalid IPv6 address {s:?}"))),
            "CIDR4" | "CIDR6" => {
                let (addr, prefix) = s
                    .split_once('/')
                    .ok_or_else(|| self.err(format!("invalid CIDR {s:?}")))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| self.err(format!("invalid CIDR prefix in {s:?}")))?;
                if kind == "CIDR4" {
                    addr.parse()
                        .map(|addr| ScalarValue::Cidr4 { addr, prefix })
                        .map_err(|_| self.err(format!("invalid CIDR {s:?}")))
                } else {
                    addr.parse()
                        .map(|addr| ScalarValue::Cidr6 { addr, prefix })
                        .map_err(|_| self.err(format!("invalid CIDR {s:?}")))
                }
            }
            _ => unreachable!(),
        }?;
        Ok(Expr::const_value(value))
    }

    fn parse_case(&mut self) -> Result<Expr, Error> {
        let mut whens = Vec::new();
        while self.eat_kw("WHEN") {
            let cond = self.parse_expr()?;
            self.expect_kw("THEN")?;
            let then = self.parse_expr()?;
            whens.push(CaseWhen { cond, then });
        }
        if whens.is_empty() {
            return Err(self.err("CASE requires at least one WHEN"));
        }
        let else_ = if self.eat_kw("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_kw("END")?;
        Ok(Expr::Case {
            typ: ExprType::unknown("case"),
            whens,
            else_,
        })
    }

    /// `IF c THEN a [ELSE b]`, sugar for a one-branch CASE.
    fn parse_if(&mut self) -> Result<Expr, Error> {
        let cond = self.parse_expr()?;
        self.expect_kw("THEN")?;
        let then = self.parse_expr()?;
        let else_ = if self.eat_kw("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::Case {
            typ: ExprType::unknown("case"),
            whens: vec![CaseWhen { cond, then }],
            else_,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Operation {
        parse_operation("test", src).unwrap().0
    }

    fn reparses(src: &str) {
        let (op1, _) = parse_operation("test", src).unwrap();
        let printed = op1.to_string();
        let (op2, _) = parse_operation("test", &printed)
            .unwrap_or_else(|e| panic!("cannot reparse {printed:?}: {e}"));
        assert_eq!(op1, op2, "print of {src:?} was {printed:?}");
    }

    #[test]
    fn word_count_counter() {
        let op = parse("SELECT SUM 1 AS count, word GROUP BY word COMMIT WHEN true FLUSH WHEN false");
        match op {
            Operation::Aggregate {
                fields,
                key,
                commit_when,
                flush_when,
                ..
            } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].alias, "count");
                assert_eq!(fields[1].alias, "word");
                assert_eq!(key.len(), 1);
                assert!(commit_when.is_some());
                assert!(flush_when.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn from_names_are_collected() {
        let (_, from) = parse_operation("test", "SELECT x FROM base/src, peer").unwrap();
        assert_eq!(from, vec!["base/src", "peer"]);
    }

    #[test]
    fn aggregate_prefix_binds_tighter_than_comparison() {
        let op = parse("SELECT sum 1i16 > 500 AS hot");
        if let Operation::Aggregate { fields, .. } = &op {
            assert_eq!(fields[0].expr.to_string(), "(SUM(1i16) > 500)");
        } else {
            panic!();
        }
    }

    #[test]
    fn print_parse_round_trips() {
        for src in [
            "YIELD 1 AS tick EVERY 0.5 SECONDS",
            "LISTEN FOR COLLECTD",
            r#"READ CSV FILE "/tmp/x.csv" SEPARATOR ";" (a u32 NOT NULL, b string NULL)"#,
            "SELECT SUM 1 AS count, word GROUP BY word COMMIT WHEN true FLUSH WHEN false",
            "SELECT AVG(CASE WHEN type_instance = \"free\" THEN value END) AS free, \
             MIN time AS time GROUP BY time // 30 \
             COMMIT WHEN in.time > previous.time + 30",
            "SELECT *, COALESCE(plugin = \"memory\", false) AS is_mem WHERE value >= 0",
            "SELECT account, SUM amount AS total TOP 3 BY SUM(amount) WHEN in.#count >= 10",
            "SELECT x AS a COMMIT AND SLIDE 2 WHEN out.a > 10",
            "SELECT x AS a COMMIT AND KEEP (in.time > previous.time) WHEN true",
            "SELECT v AS v, t AS t EXPORT EVENT STARTING AT t * 0.001 WITH DURATION 30",
            "SELECT SPLIT(line, \" \") AS word",
            "SELECT x AS y WHERE (x IS NOT NULL) AND NOT (x IS NULL)",
            "SELECT LAG(2, value) AS lagged, PERCENTILE(95, value) AS p95",
            "SELECT REMEMBER(time, 3600, name) AS seen",
            "SELECT ip4 \"192.168.0.1\" AS src, cidr4 \"10.0.0.0/8\" AS net",
        ] {
            reparses(src);
        }
    }

    #[test]
    fn nullable_where_still_parses() {
        // Typing rejects it later; the parser does not care.
        parse("SELECT value WHERE plugin = \"memory\"");
    }

    #[test]
    fn syntax_errors_name_the_node() {
        let err = parse_operation("scratch/x", "SELECT FROM").unwrap_err();
        match err {
            Error::Syntax { node, .. } => assert_eq!(node, "scratch/x"),
            other => panic!("unexpected {other:?}"),
        }
    }
}

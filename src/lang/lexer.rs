//! Tokenization of operator definitions.
//!
//! Keywords are not distinguished here: SQL keywords are
//! case-insensitive, so the parser classifies `Ident` tokens itself and
//! the token set stays small. Comments run from `--` to end of line
//! (`//` is integer division).

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"--[^\n]*")]
pub enum Token {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    /// Virtual field names such as `#count`.
    #[regex(r"#[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    HashIdent(String),

    /// `$name` parametric hole.
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    Param(String),

    /// Integer literal with an explicit width suffix, e.g. `1i16`.
    #[regex(r"[0-9]+[iu](8|16|32|64|128)", |lex| lex.slice().to_string())]
    TypedInt(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i128>().ok())]
    Int(i128),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    /// Double-quoted string with backslash escapes.
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("//")]
    SlashSlash,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("||")]
    Concat,
    #[token("=")]
    Eq,
    #[token("<>")]
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token("<")]
    Lt,
    #[token(">=")]
    Ge,
    #[token(">")]
    Gt,
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Token::lexer(src).map(|t| t.expect("lex error")).collect()
    }

    #[test]
    fn numbers_and_suffixes() {
        assert_eq!(
            lex("1 1i16 500u32 1.5 2e3"),
            vec![
                Token::Int(1),
                Token::TypedInt("1i16".into()),
                Token::TypedInt("500u32".into()),
                Token::Float(1.5),
                Token::Float(2000.0),
            ]
        );
    }

    #[test]
    fn idiv_is_not_a_comment() {
        assert_eq!(
            lex("a // 30 -- rest is comment"),
            vec![
                Token::Ident("a".into()),
                Token::SlashSlash,
                Token::Int(30),
            ]
        );
    }

    #[test]
    fn qualified_and_virtual_names() {
        assert_eq!(
            lex("group.#count"),
            vec![
                Token::Ident("group".into()),
                Token::Dot,
                Token::HashIdent("#count".into()),
            ]
        );
    }

    #[test]
    fn strings_unescape() {
        assert_eq!(
            lex(r#""hello \"w\"""#),
            vec![Token::Str("hello \"w\"".into())]
        );
    }
}

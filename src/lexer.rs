//! # Schema Lexer
//!
//! Token-level scanner for the schema language, a JSON-like notation
//! with single-quoted strings and `#` comments.
//!
//! ## Token Categories
//!
//! - **Structural**: `{` `}` `[` `]` `:` `,`
//! - **Literals**: single-quoted strings, `true`, `false`
//! - **Comments**: `#` to end of line; lines starting with `##` open or
//!   close documentation blocks and are surfaced as tokens, everything
//!   else is skipped
//!
//! Strings accept printable ASCII only and a single escape, `\\`. There
//! are no numbers: schema values that look numeric are written as
//! strings.
//!
//! ## Example
//!
//! ```rust
//! use ridl::lexer::{Lexer, Token};
//!
//! let mut lexer = Lexer::new("{ 'enum': 'Color' }");
//! lexer.accept(true).unwrap();
//! assert_eq!(lexer.tok, Some(Token::LBrace));
//! lexer.accept(true).unwrap();
//! assert_eq!(lexer.tok, Some(Token::Str("enum".into())));
//! ```

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::value,
    IResult,
};
use std::fmt;

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Colon,    // :
    Comma,    // ,
    /// Single-quoted string literal, unescaped.
    Str(String),
    /// `true` or `false`.
    Bool(bool),
    /// A comment line, complete with its leading `#`.
    Comment(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Colon => write!(f, ":"),
            Token::Comma => write!(f, ","),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Bool(b) => write!(f, "{}", b),
            Token::Comment(text) => write!(f, "{}", text),
        }
    }
}

/// Scanner failure, wrapped into a positioned parse error by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub msg: String,
}

impl LexError {
    fn new(msg: impl Into<String>) -> Self {
        LexError { msg: msg.into() }
    }
}

fn structural(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::LBrace, char('{')),
        value(Token::RBrace, char('}')),
        value(Token::LBracket, char('[')),
        value(Token::RBracket, char(']')),
        value(Token::Colon, char(':')),
        value(Token::Comma, char(',')),
    ))(input)
}

fn keyword(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::Bool(true), tag("true")),
        value(Token::Bool(false), tag("false")),
    ))(input)
}

/// Cursor over one schema file's text.
///
/// `accept()` advances to the next token; the current token and its
/// position stay exposed so the parser can report errors precisely.
pub struct Lexer {
    src: String,
    /// Byte offset of the next unread character.
    cursor: usize,
    /// Byte offset where the current token starts.
    pub pos: usize,
    /// 1-based line holding the current token.
    pub line: usize,
    /// Byte offset of the start of that line.
    line_pos: usize,
    /// Current token, `None` at end of input.
    pub tok: Option<Token>,
}

impl Lexer {
    pub fn new(src: &str) -> Self {
        let mut src = src.to_owned();
        if !src.ends_with('\n') {
            src.push('\n');
        }
        Lexer {
            src,
            cursor: 0,
            pos: 0,
            line: 1,
            line_pos: 0,
            tok: None,
        }
    }

    /// Column of the current token, 1-based, tabs expanding to the next
    /// multiple-of-8 stop.
    pub fn col(&self) -> usize {
        let mut col = 1;
        for ch in self.src[self.line_pos..self.pos].chars() {
            if ch == '\t' {
                col = (col + 7) / 8 * 8 + 1;
            } else {
                col += 1;
            }
        }
        col
    }

    /// Advance to the next token.
    ///
    /// With `skip_comment`, ordinary `#` comments are passed over;
    /// `##` lines come through as [`Token::Comment`] either way, which
    /// is how documentation blocks reach the parser.
    pub fn accept(&mut self, skip_comment: bool) -> Result<(), LexError> {
        let len = self.src.len();
        loop {
            if self.cursor >= len {
                self.tok = None;
                return Ok(());
            }
            let ch = self.src.as_bytes()[self.cursor];
            self.pos = self.cursor;
            self.cursor += 1;

            match ch {
                b'#' => {
                    let doc = self.src.as_bytes().get(self.cursor) == Some(&b'#');
                    let nl = self.src[self.cursor..]
                        .find('\n')
                        .map(|i| self.cursor + i)
                        .unwrap_or(len);
                    self.cursor = nl;
                    if doc || !skip_comment {
                        self.tok = Some(Token::Comment(self.src[self.pos..nl].to_owned()));
                        return Ok(());
                    }
                }
                b'\'' => {
                    let tok = self.scan_string()?;
                    self.tok = Some(tok);
                    return Ok(());
                }
                b'\n' => {
                    if self.cursor == len {
                        self.tok = None;
                        return Ok(());
                    }
                    self.line += 1;
                    self.line_pos = self.cursor;
                }
                b' ' | b'\t' | b'\r' | 0x0b | 0x0c => {}
                _ => {
                    let rest = &self.src[self.pos..];
                    if let Ok((remaining, tok)) = structural(rest) {
                        self.cursor = self.pos + (rest.len() - remaining.len());
                        self.tok = Some(tok);
                        return Ok(());
                    }
                    if let Ok((remaining, tok)) = keyword(rest) {
                        self.cursor = self.pos + (rest.len() - remaining.len());
                        self.tok = Some(tok);
                        return Ok(());
                    }
                    // Show the whole run up to the next structural,
                    // whitespace or quote character.
                    let run: String = rest
                        .chars()
                        .take_while(|c| !c.is_whitespace() && !"[]{}:,'\"".contains(*c))
                        .collect();
                    return Err(LexError::new(format!("stray '{}'", run)));
                }
            }
        }
    }

    // The opening quote is already consumed.
    fn scan_string(&mut self) -> Result<Token, LexError> {
        let bytes = self.src.as_bytes();
        let mut string = String::new();
        let mut esc = false;
        loop {
            let ch = bytes[self.cursor];
            self.cursor += 1;
            if ch == b'\n' {
                return Err(LexError::new("missing terminating \"'\""));
            }
            if esc {
                if ch != b'\\' {
                    return Err(LexError::new(format!("unknown escape \\{}", ch as char)));
                }
                esc = false;
            } else if ch == b'\\' {
                esc = true;
                continue;
            } else if ch == b'\'' {
                return Ok(Token::Str(string));
            }
            if !(0x20..0x7f).contains(&ch) {
                return Err(LexError::new("funny character in string"));
            }
            string.push(ch as char);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Result<Vec<Token>, LexError> {
        let mut lexer = Lexer::new(src);
        let mut toks = Vec::new();
        loop {
            lexer.accept(true)?;
            match lexer.tok.take() {
                Some(tok) => toks.push(tok),
                None => return Ok(toks),
            }
        }
    }

    #[test]
    fn test_structural_tokens() {
        assert_eq!(
            lex_all("{ 'a': ['b', true] }").unwrap(),
            vec![
                Token::LBrace,
                Token::Str("a".into()),
                Token::Colon,
                Token::LBracket,
                Token::Str("b".into()),
                Token::Comma,
                Token::Bool(true),
                Token::RBracket,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_false_literal() {
        assert_eq!(lex_all("false").unwrap(), vec![Token::Bool(false)]);
    }

    #[test]
    fn test_comments_skipped_doc_kept() {
        assert_eq!(
            lex_all("# plain comment\n## doc\n{ }").unwrap(),
            vec![Token::Comment("## doc".into()), Token::LBrace, Token::RBrace]
        );
    }

    #[test]
    fn test_string_backslash_escape() {
        assert_eq!(lex_all(r"'a\\b'").unwrap(), vec![Token::Str(r"a\b".into())]);
    }

    #[test]
    fn test_unknown_escape() {
        let err = lex_all(r"'a\nb'").unwrap_err();
        assert_eq!(err.msg, "unknown escape \\n");
    }

    #[test]
    fn test_unterminated_string() {
        let err = lex_all("'abc\n'").unwrap_err();
        assert_eq!(err.msg, "missing terminating \"'\"");
    }

    #[test]
    fn test_funny_character_in_string() {
        let err = lex_all("'a\tb'").unwrap_err();
        assert_eq!(err.msg, "funny character in string");
    }

    #[test]
    fn test_stray_token() {
        let err = lex_all("{ 42 }").unwrap_err();
        assert_eq!(err.msg, "stray '42'");
        let err = lex_all("nil").unwrap_err();
        assert_eq!(err.msg, "stray 'nil'");
    }

    #[test]
    fn test_line_and_column_tracking() {
        let mut lexer = Lexer::new("{\n\t'a': 1 }");
        lexer.accept(true).unwrap();
        assert_eq!((lexer.line, lexer.col()), (1, 1));
        lexer.accept(true).unwrap();
        assert_eq!(lexer.tok, Some(Token::Str("a".into())));
        // the tab before the string expands to column 9
        assert_eq!((lexer.line, lexer.col()), (2, 9));
    }

    #[test]
    fn test_no_trailing_newline() {
        assert_eq!(lex_all("{ }").unwrap(), vec![Token::LBrace, Token::RBrace]);
    }
}

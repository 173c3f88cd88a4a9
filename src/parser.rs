//! # Schema Parser
//!
//! Reads a schema file and everything it includes into a flat list of
//! expression trees plus the documentation blocks found along the way.
//!
//! The grammar is small: a schema file is a sequence of `{...}`
//! mappings. Three kinds are special cased here rather than handed to
//! the expression checker. `include` pulls in another file relative to
//! the including one, exactly once per distinct path, with inclusion
//! cycles detected along the [`SourceInfo`] parent chain. `pragma`
//! adjusts parsing toggles for the rest of the current file and for
//! files it includes afterwards; an included file's pragmas never leak
//! back into the including file. Everything else is a definition and
//! is recorded together with the preceding documentation block, if
//! any.
//!
//! ## Example
//!
//! ```rust
//! use ridl::parser::parse_schema;
//! use std::io::Write;
//!
//! let mut file = tempfile::NamedTempFile::new().unwrap();
//! write!(file, "{{ 'struct': 'Point', 'data': {{ 'x': 'int', 'y': 'int' }} }}").unwrap();
//!
//! let parsed = parse_schema(file.path()).unwrap();
//! assert_eq!(parsed.exprs.len(), 1);
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::common::absolutize;
use crate::doc::Doc;
use crate::error::{ParseError, RidlError, SemanticError};
use crate::expr::{Expr, ExprEntry};
use crate::lexer::{Lexer, Token};
use crate::source::{Pragma, SourceInfo};

/// Everything read from one schema file and its includes, in source
/// order. `exprs` reference `docs` by index.
#[derive(Debug, Default)]
pub struct Parsed {
    pub exprs: Vec<ExprEntry>,
    pub docs: Vec<Doc>,
}

/// Parse the schema rooted at `path`, following includes.
pub fn parse_schema(path: &Path) -> Result<Parsed, RidlError> {
    let mut parsed = Parsed::default();
    let mut previously_included = HashSet::new();
    previously_included.insert(absolutize(path));
    parse_file(path, None, &mut previously_included, &mut parsed)?;
    Ok(parsed)
}

fn parse_file(
    fname: &Path,
    incl_info: Option<&SourceInfo>,
    previously_included: &mut HashSet<PathBuf>,
    out: &mut Parsed,
) -> Result<(), RidlError> {
    let src = match fs::read_to_string(fname) {
        Ok(src) => src,
        Err(e) => {
            let what = if incl_info.is_some() { "include" } else { "schema" };
            let msg = format!("can't read {} file '{}': {}", what, fname.display(), e);
            let err = match incl_info {
                Some(info) => SemanticError::new(info, msg),
                None => {
                    let info =
                        SourceInfo::new(fname.to_owned(), 0, None, Arc::new(Pragma::default()));
                    SemanticError::new(&info, msg)
                }
            };
            return Err(err.into());
        }
    };

    let mut parser = Parser {
        lexer: Lexer::new(&src),
        fname,
        parent: incl_info.map(|info| Arc::new(info.clone())),
        pragma: incl_info
            .map(|info| info.pragma.clone())
            .unwrap_or_default(),
    };
    parser.accept(true)?;

    let mut cur_doc: Option<usize> = None;
    while parser.lexer.tok.is_some() {
        let info = parser.info();
        if let Some(Token::Comment(val)) = parser.lexer.tok.clone() {
            reject_expr_doc(cur_doc, &out.docs)?;
            parser.get_doc(&val, info, &mut out.docs)?;
            cur_doc = Some(out.docs.len() - 1);
            continue;
        }

        let expr = parser.get_toplevel()?;
        if expr.contains_key("include") {
            reject_expr_doc(cur_doc, &out.docs)?;
            if expr.len() != 1 {
                return Err(SemanticError::new(&info, "invalid 'include' directive").into());
            }
            let include = expr["include"].as_str().ok_or_else(|| {
                SemanticError::new(&info, "value of 'include' must be a string")
            })?;
            let incl_fname = fname.parent().unwrap_or_else(|| Path::new("")).join(include);
            out.exprs.push(ExprEntry {
                expr: std::iter::once((
                    "include".to_owned(),
                    Expr::Str(incl_fname.to_string_lossy().into_owned()),
                ))
                .collect(),
                info: info.clone(),
                doc: None,
            });

            let incl_abs = absolutize(&incl_fname);
            for site in info.chain() {
                if incl_abs == absolutize(&site.fname) {
                    return Err(SemanticError::new(
                        &info,
                        format!("inclusion loop for {}", include),
                    )
                    .into());
                }
            }
            if previously_included.insert(incl_abs) {
                parse_file(&incl_fname, Some(&info), previously_included, out)?;
            }
        } else if expr.contains_key("pragma") {
            reject_expr_doc(cur_doc, &out.docs)?;
            if expr.len() != 1 {
                return Err(SemanticError::new(&info, "invalid 'pragma' directive").into());
            }
            match expr["pragma"].as_map() {
                Some(pragma) => {
                    for (name, value) in pragma {
                        parser.apply_pragma(name, value, &info)?;
                    }
                }
                None => {
                    return Err(
                        SemanticError::new(&info, "value of 'pragma' must be an object").into()
                    );
                }
            }
        } else {
            let doc = match cur_doc {
                Some(di) if out.docs[di].symbol.is_none() => {
                    return Err(SemanticError::new(
                        &out.docs[di].info,
                        "definition documentation required",
                    )
                    .into());
                }
                other => other,
            };
            out.exprs.push(ExprEntry { expr, info, doc });
        }
        cur_doc = None;
    }
    reject_expr_doc(cur_doc, &out.docs)?;
    Ok(())
}

/// A documentation block not followed by the definition it names is
/// an orphan. Free form blocks may float anywhere.
fn reject_expr_doc(cur_doc: Option<usize>, docs: &[Doc]) -> Result<(), SemanticError> {
    if let Some(di) = cur_doc {
        let doc = &docs[di];
        if let Some(symbol) = &doc.symbol {
            return Err(SemanticError::new(
                &doc.info,
                format!(
                    "documentation for '{}' is not followed by the definition",
                    symbol
                ),
            ));
        }
    }
    Ok(())
}

struct Parser<'a> {
    lexer: Lexer,
    fname: &'a Path,
    parent: Option<Arc<SourceInfo>>,
    /// Current pragma snapshot. Replaced wholesale by a pragma
    /// directive, so earlier [`SourceInfo`]s keep what they saw.
    pragma: Arc<Pragma>,
}

impl Parser<'_> {
    fn info(&self) -> SourceInfo {
        SourceInfo::new(
            self.fname.to_owned(),
            self.lexer.line,
            self.parent.clone(),
            self.pragma.clone(),
        )
    }

    fn parse_err(&self, msg: impl Into<String>) -> ParseError {
        ParseError::new(self.info(), self.lexer.col(), msg)
    }

    fn accept(&mut self, skip_comment: bool) -> Result<(), ParseError> {
        self.lexer
            .accept(skip_comment)
            .map_err(|e| self.parse_err(e.msg))
    }

    /// Parse one top level expression, which must be a mapping.
    fn get_toplevel(&mut self) -> Result<IndexMap<String, Expr>, ParseError> {
        if !matches!(self.lexer.tok, Some(Token::LBrace)) {
            return Err(self.parse_err("expected '{'"));
        }
        self.accept(true)?;
        self.get_members()
    }

    fn get_expr(&mut self) -> Result<Expr, ParseError> {
        match self.lexer.tok.clone() {
            Some(Token::LBrace) => {
                self.accept(true)?;
                Ok(Expr::Map(self.get_members()?))
            }
            Some(Token::LBracket) => {
                self.accept(true)?;
                Ok(Expr::List(self.get_values()?))
            }
            Some(Token::Str(s)) => {
                self.accept(true)?;
                Ok(Expr::Str(s))
            }
            Some(Token::Bool(b)) => {
                self.accept(true)?;
                Ok(Expr::Bool(b))
            }
            _ => Err(self.parse_err("expected '{', '[', string, or boolean")),
        }
    }

    fn get_members(&mut self) -> Result<IndexMap<String, Expr>, ParseError> {
        let mut expr = IndexMap::new();
        if matches!(self.lexer.tok, Some(Token::RBrace)) {
            self.accept(true)?;
            return Ok(expr);
        }
        let mut key = match &self.lexer.tok {
            Some(Token::Str(s)) => s.clone(),
            _ => return Err(self.parse_err("expected string or '}'")),
        };
        loop {
            self.accept(true)?;
            if !matches!(self.lexer.tok, Some(Token::Colon)) {
                return Err(self.parse_err("expected ':'"));
            }
            self.accept(true)?;
            if expr.contains_key(&key) {
                return Err(self.parse_err(format!("duplicate key '{}'", key)));
            }
            let value = self.get_expr()?;
            expr.insert(key, value);
            match self.lexer.tok {
                Some(Token::RBrace) => {
                    self.accept(true)?;
                    return Ok(expr);
                }
                Some(Token::Comma) => {}
                _ => return Err(self.parse_err("expected ',' or '}'")),
            }
            self.accept(true)?;
            key = match &self.lexer.tok {
                Some(Token::Str(s)) => s.clone(),
                _ => return Err(self.parse_err("expected string")),
            };
        }
    }

    fn get_values(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut expr = Vec::new();
        if matches!(self.lexer.tok, Some(Token::RBracket)) {
            self.accept(true)?;
            return Ok(expr);
        }
        if !matches!(
            self.lexer.tok,
            Some(Token::LBrace | Token::LBracket | Token::Str(_) | Token::Bool(_))
        ) {
            return Err(self.parse_err("expected '{', '[', ']', string, or boolean"));
        }
        loop {
            expr.push(self.get_expr()?);
            match self.lexer.tok {
                Some(Token::RBracket) => {
                    self.accept(true)?;
                    return Ok(expr);
                }
                Some(Token::Comma) => {}
                _ => return Err(self.parse_err("expected ',' or ']'")),
            }
            self.accept(true)?;
        }
    }

    /// Consume one `##` delimited comment run, possibly split into
    /// several blocks by `# =` headings.
    fn get_doc(
        &mut self,
        first: &str,
        info: SourceInfo,
        docs: &mut Vec<Doc>,
    ) -> Result<(), ParseError> {
        if first != "##" {
            return Err(self.parse_err("junk after '##' at start of documentation comment"));
        }

        let mut cur_doc = Doc::new(info.clone());
        self.accept(false)?;
        while let Some(Token::Comment(val)) = self.lexer.tok.clone() {
            if val.starts_with("##") {
                if val != "##" {
                    return Err(
                        self.parse_err("junk after '##' at end of documentation comment")
                    );
                }
                cur_doc.end_comment().map_err(|msg| self.parse_err(msg))?;
                docs.push(cur_doc);
                self.accept(true)?;
                return Ok(());
            }
            if val.starts_with("# =") {
                if cur_doc.symbol.is_some() {
                    return Err(
                        self.parse_err("unexpected '=' markup in definition documentation")
                    );
                }
                if !cur_doc.body.text.is_empty() {
                    // A new heading starts a new free form block.
                    cur_doc.end_comment().map_err(|msg| self.parse_err(msg))?;
                    docs.push(cur_doc);
                    cur_doc = Doc::new(info.clone());
                }
            }
            cur_doc.append(&val).map_err(|msg| self.parse_err(msg))?;
            self.accept(false)?;
        }
        Err(self.parse_err("documentation comment must end with '##'"))
    }

    fn apply_pragma(
        &mut self,
        name: &str,
        value: &Expr,
        info: &SourceInfo,
    ) -> Result<(), SemanticError> {
        let mut pragma = (*self.pragma).clone();
        match name {
            "doc-required" => match value {
                Expr::Bool(b) => pragma.doc_required = *b,
                _ => {
                    return Err(SemanticError::new(
                        info,
                        "pragma 'doc-required' must be boolean",
                    ));
                }
            },
            "command-name-exceptions" => {
                pragma.command_name_exceptions = pragma_list_of_str(name, value, info)?;
            }
            "command-returns-exceptions" => {
                pragma.command_returns_exceptions = pragma_list_of_str(name, value, info)?;
            }
            "member-name-exceptions" => {
                pragma.member_name_exceptions = pragma_list_of_str(name, value, info)?;
            }
            _ => {
                return Err(SemanticError::new(
                    info,
                    format!("unknown pragma '{}'", name),
                ));
            }
        }
        self.pragma = Arc::new(pragma);
        Ok(())
    }
}

fn pragma_list_of_str(
    name: &str,
    value: &Expr,
    info: &SourceInfo,
) -> Result<Vec<String>, SemanticError> {
    let bad = || SemanticError::new(info, format!("pragma {} must be a list of strings", name));
    let list = value.as_list().ok_or_else(bad)?;
    list.iter()
        .map(|elt| elt.as_str().map(str::to_owned).ok_or_else(bad))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse_str(src: &str) -> Result<Parsed, RidlError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(src.as_bytes()).unwrap();
        parse_schema(file.path())
    }

    fn msg_of(err: RidlError) -> String {
        err.to_string()
    }

    #[test]
    fn test_single_definition() {
        let parsed = parse_str("{ 'struct': 'Point', 'data': { 'x': 'int' } }").unwrap();
        assert_eq!(parsed.exprs.len(), 1);
        assert_eq!(parsed.exprs[0].expr["struct"], Expr::Str("Point".to_owned()));
        assert_eq!(parsed.exprs[0].info.line, 1);
    }

    #[test]
    fn test_nested_values() {
        let parsed = parse_str(
            "{ 'enum': 'Mode', 'data': ['a', 'b'], 'extra': { 'deep': [true, false] } }",
        )
        .unwrap();
        let expr = &parsed.exprs[0].expr;
        assert_eq!(
            expr["data"],
            Expr::List(vec![Expr::Str("a".into()), Expr::Str("b".into())])
        );
        assert_eq!(
            expr["extra"].as_map().unwrap()["deep"],
            Expr::List(vec![Expr::Bool(true), Expr::Bool(false)])
        );
    }

    #[test]
    fn test_expected_brace_at_top_level() {
        let err = msg_of(parse_str("'loose'").unwrap_err());
        assert!(err.ends_with(":1:1: expected '{'"), "{}", err);
    }

    #[test]
    fn test_member_grammar_errors() {
        let err = msg_of(parse_str("{ 'a' 'b' }").unwrap_err());
        assert!(err.ends_with("expected ':'"), "{}", err);
        let err = msg_of(parse_str("{ 'a': 'b' 'c': 'd' }").unwrap_err());
        assert!(err.ends_with("expected ',' or '}'"), "{}", err);
        let err = msg_of(parse_str("{ 'a': 'b', }").unwrap_err());
        assert!(err.ends_with("expected string"), "{}", err);
        let err = msg_of(parse_str("{ true: 'b' }").unwrap_err());
        assert!(err.ends_with("expected string or '}'"), "{}", err);
    }

    #[test]
    fn test_duplicate_key() {
        let err = msg_of(parse_str("{ 'a': 'b', 'a': 'c' }").unwrap_err());
        assert!(err.ends_with("duplicate key 'a'"), "{}", err);
    }

    #[test]
    fn test_list_grammar_errors() {
        let err = msg_of(parse_str("{ 'a': [: ] }").unwrap_err());
        assert!(
            err.ends_with("expected '{', '[', ']', string, or boolean"),
            "{}",
            err
        );
        let err = msg_of(parse_str("{ 'a': ['x' 'y'] }").unwrap_err());
        assert!(err.ends_with("expected ',' or ']'"), "{}", err);
    }

    #[test]
    fn test_error_location() {
        let err = msg_of(parse_str("{ 'a': 'b' }\n{ 'c': }\n").unwrap_err());
        assert!(
            err.ends_with(":2:8: expected '{', '[', string, or boolean"),
            "{}",
            err
        );
    }

    #[test]
    fn test_doc_comment_attaches_to_definition() {
        let parsed = parse_str(
            "##\n# @do-it:\n#\n# Does the thing.\n##\n{ 'command': 'do-it' }\n",
        )
        .unwrap();
        assert_eq!(parsed.docs.len(), 1);
        assert_eq!(parsed.docs[0].symbol.as_deref(), Some("do-it"));
        assert_eq!(parsed.exprs[0].doc, Some(0));
    }

    #[test]
    fn test_doc_not_followed_by_definition() {
        let err = msg_of(parse_str("##\n# @ghost:\n##\n").unwrap_err());
        assert!(
            err.contains("documentation for 'ghost' is not followed by the definition"),
            "{}",
            err
        );
    }

    #[test]
    fn test_free_form_doc_floats() {
        let parsed = parse_str(
            "##\n# Just prose.\n##\n##\n# @do-it:\n##\n{ 'command': 'do-it' }\n",
        )
        .unwrap();
        assert_eq!(parsed.docs.len(), 2);
        assert!(parsed.docs[0].symbol.is_none());
        assert_eq!(parsed.docs[1].symbol.as_deref(), Some("do-it"));
        assert_eq!(parsed.exprs[0].doc, Some(1));
    }

    #[test]
    fn test_prose_doc_directly_before_definition() {
        let err = msg_of(parse_str("##\n# Just prose.\n##\n{ 'command': 'do-it' }\n").unwrap_err());
        assert!(err.contains("definition documentation required"), "{}", err);
    }

    #[test]
    fn test_heading_splits_doc_blocks() {
        let parsed = parse_str(
            "##\n# = Section one\n#\n# Intro.\n#\n# = Section two\n#\n# More.\n##\n",
        )
        .unwrap();
        assert_eq!(parsed.docs.len(), 2);
        assert!(parsed.docs[0].body.text.starts_with("= Section one"));
        assert!(parsed.docs[1].body.text.starts_with("= Section two"));
    }

    #[test]
    fn test_heading_in_definition_doc_rejected() {
        let err = msg_of(parse_str("##\n# @cmd:\n#\n# = Heading\n##\n").unwrap_err());
        assert!(
            err.contains("unexpected '=' markup in definition documentation"),
            "{}",
            err
        );
    }

    #[test]
    fn test_doc_junk_markers() {
        let err = msg_of(parse_str("## junk\n# text\n##\n").unwrap_err());
        assert!(
            err.contains("junk after '##' at start of documentation comment"),
            "{}",
            err
        );
        let err = msg_of(parse_str("##\n# text\n## junk\n").unwrap_err());
        assert!(
            err.contains("junk after '##' at end of documentation comment"),
            "{}",
            err
        );
        let err = msg_of(parse_str("##\n# text\n").unwrap_err());
        assert!(
            err.contains("documentation comment must end with '##'"),
            "{}",
            err
        );
    }

    #[test]
    fn test_pragma_directive() {
        let parsed = parse_str(
            "{ 'pragma': { 'doc-required': false } }\n{ 'command': 'do-it' }\n",
        )
        .unwrap();
        assert_eq!(parsed.exprs.len(), 1);
        assert!(!parsed.exprs[0].info.pragma.doc_required);
    }

    #[test]
    fn test_pragma_takes_effect_for_later_lines() {
        let mut parsed =
            parse_str("{ 'pragma': { 'doc-required': true } }\n{ 'command': 'do-it' }\n").unwrap();
        let err = crate::expr::check_exprs(&mut parsed.exprs, &parsed.docs).unwrap_err();
        assert!(
            err.to_string().contains("documentation comment required"),
            "{}",
            err
        );
    }

    #[test]
    fn test_pragma_errors() {
        let err = msg_of(parse_str("{ 'pragma': { 'doc-required': 'yes' } }").unwrap_err());
        assert!(err.contains("pragma 'doc-required' must be boolean"), "{}", err);
        let err = msg_of(parse_str("{ 'pragma': { 'whatever': true } }").unwrap_err());
        assert!(err.contains("unknown pragma 'whatever'"), "{}", err);
        let err = msg_of(
            parse_str("{ 'pragma': { 'member-name-exceptions': 'NotAList' } }").unwrap_err(),
        );
        assert!(
            err.contains("pragma member-name-exceptions must be a list of strings"),
            "{}",
            err
        );
        let err = msg_of(parse_str("{ 'pragma': 'bad' }").unwrap_err());
        assert!(err.contains("value of 'pragma' must be an object"), "{}", err);
        let err = msg_of(parse_str("{ 'pragma': {}, 'extra': true }").unwrap_err());
        assert!(err.contains("invalid 'pragma' directive"), "{}", err);
    }

    #[test]
    fn test_include_value_must_be_string() {
        let err = msg_of(parse_str("{ 'include': true }").unwrap_err());
        assert!(err.contains("value of 'include' must be a string"), "{}", err);
        let err = msg_of(parse_str("{ 'include': 'a', 'extra': true }").unwrap_err());
        assert!(err.contains("invalid 'include' directive"), "{}", err);
    }

    #[test]
    fn test_unreadable_schema() {
        let err = msg_of(parse_schema(Path::new("no-such-schema.json")).unwrap_err());
        assert!(err.starts_with("no-such-schema.json: can't read schema file"), "{}", err);
    }

    #[test]
    fn test_include_chain() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.json"),
            "{ 'include': 'sub.json' }\n{ 'struct': 'Top', 'data': {} }\n",
        )
        .unwrap();
        fs::write(dir.path().join("sub.json"), "{ 'struct': 'Nested', 'data': {} }\n").unwrap();

        let parsed = parse_schema(&dir.path().join("main.json")).unwrap();
        // include entry, included definition, then the rest of main
        assert_eq!(parsed.exprs.len(), 3);
        assert!(parsed.exprs[0].expr.contains_key("include"));
        assert_eq!(
            parsed.exprs[1].expr["struct"],
            Expr::Str("Nested".to_owned())
        );
        assert!(parsed.exprs[1].info.parent.is_some());
        assert_eq!(parsed.exprs[2].expr["struct"], Expr::Str("Top".to_owned()));
    }

    #[test]
    fn test_inclusion_loop() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), "{ 'include': 'b.json' }\n").unwrap();
        fs::write(dir.path().join("b.json"), "{ 'include': 'a.json' }\n").unwrap();

        let err = msg_of(parse_schema(&dir.path().join("a.json")).unwrap_err());
        assert!(err.contains("inclusion loop for a.json"), "{}", err);
        assert!(err.contains("In file included from"), "{}", err);
    }

    #[test]
    fn test_repeated_include_parsed_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.json"),
            "{ 'include': 'sub.json' }\n{ 'include': 'sub.json' }\n",
        )
        .unwrap();
        fs::write(dir.path().join("sub.json"), "{ 'struct': 'Once', 'data': {} }\n").unwrap();

        let parsed = parse_schema(&dir.path().join("main.json")).unwrap();
        let structs = parsed
            .exprs
            .iter()
            .filter(|e| e.expr.contains_key("struct"))
            .count();
        assert_eq!(structs, 1);
        let includes = parsed
            .exprs
            .iter()
            .filter(|e| e.expr.contains_key("include"))
            .count();
        assert_eq!(includes, 2);
    }

    #[test]
    fn test_pragma_does_not_leak_out_of_include() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.json"),
            "{ 'include': 'strict.json' }\n{ 'command': 'plain' }\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("strict.json"),
            "{ 'pragma': { 'doc-required': true } }\n",
        )
        .unwrap();

        let parsed = parse_schema(&dir.path().join("main.json")).unwrap();
        let cmd = parsed
            .exprs
            .iter()
            .find(|e| e.expr.contains_key("command"))
            .unwrap();
        assert!(!cmd.info.pragma.doc_required);
    }

    #[test]
    fn test_pragma_inherited_by_include() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.json"),
            "{ 'pragma': { 'doc-required': true } }\n{ 'include': 'sub.json' }\n",
        )
        .unwrap();
        fs::write(dir.path().join("sub.json"), "{ 'command': 'plain' }\n").unwrap();

        let parsed = parse_schema(&dir.path().join("main.json")).unwrap();
        let cmd = parsed
            .exprs
            .iter()
            .find(|e| e.expr.contains_key("command"))
            .unwrap();
        assert!(cmd.info.pragma.doc_required);
    }
}

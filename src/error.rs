//! Fatal schema diagnostics.
//!
//! Two categories exist: parse errors (lexical/structural, with a
//! column) and semantic errors (everything after parsing, including
//! filesystem trouble while resolving includes). Both render as the
//! single- or multi-line text the command line prints verbatim.

use std::fmt;

use thiserror::Error;

use crate::source::SourceInfo;

/// Lexical or structural error, positioned to the column.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub info: SourceInfo,
    pub col: usize,
    pub msg: String,
}

impl ParseError {
    pub fn new(info: SourceInfo, col: usize, msg: impl Into<String>) -> Self {
        ParseError {
            info,
            col,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}: {}",
            self.info.include_path(),
            self.info.fname.display(),
            self.info.line,
            self.col,
            self.msg
        )
    }
}

impl std::error::Error for ParseError {}

/// Violation of schema semantics, positioned to the line.
#[derive(Debug, Clone)]
pub struct SemanticError {
    pub info: SourceInfo,
    pub msg: String,
}

impl SemanticError {
    pub fn new(info: &SourceInfo, msg: impl Into<String>) -> Self {
        SemanticError {
            info: info.clone(),
            msg: msg.into(),
        }
    }
}

impl fmt::Display for SemanticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}: {}",
            self.info.include_path(),
            self.info.in_defn(),
            self.info.loc(),
            self.msg
        )
    }
}

impl std::error::Error for SemanticError {}

/// Any fatal schema error.
#[derive(Debug, Error)]
pub enum RidlError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Semantic(#[from] SemanticError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Pragma;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn info(fname: &str, line: usize, parent: Option<Arc<SourceInfo>>) -> SourceInfo {
        SourceInfo::new(PathBuf::from(fname), line, parent, Arc::new(Pragma::default()))
    }

    #[test]
    fn test_parse_error_format() {
        let err = ParseError::new(info("schema.json", 4, None), 11, "stray \"%\"");
        assert_eq!(err.to_string(), "schema.json:4:11: stray \"%\"");
    }

    #[test]
    fn test_parse_error_include_chain() {
        let outer = Arc::new(info("schema.json", 2, None));
        let err = ParseError::new(info("sub.json", 1, Some(outer)), 3, "expected '{'");
        assert_eq!(
            err.to_string(),
            "In file included from schema.json:2:\nsub.json:1:3: expected '{'"
        );
    }

    #[test]
    fn test_semantic_error_format() {
        let i = info("schema.json", 9, None).with_defn("struct", "Point");
        let err = SemanticError::new(&i, "member 'x' uses reserved name");
        assert_eq!(
            err.to_string(),
            "schema.json: In struct 'Point':\nschema.json:9: member 'x' uses reserved name"
        );
    }

    #[test]
    fn test_ridl_error_passthrough() {
        let err: RidlError =
            SemanticError::new(&info("s.json", 1, None), "'data' must be an object").into();
        assert_eq!(err.to_string(), "s.json:1: 'data' must be an object");
    }
}

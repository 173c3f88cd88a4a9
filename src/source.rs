//! Source positions and per-file pragma state.
//!
//! A `SourceInfo` pins a schema line: file, line number, the include
//! chain that led there, and the pragma state in effect. Pragma state is
//! an immutable snapshot; a `pragma` directive swaps in a fresh snapshot
//! for subsequent lines, so included files inherit the state at their
//! inclusion point and nothing leaks back into the including file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-schema toggles set by `pragma` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pragma {
    /// Definitions without a documentation comment are rejected.
    pub doc_required: bool,
    /// Command names allowed to contain `_`.
    pub command_name_exceptions: Vec<String>,
    /// Commands allowed to return something other than an object type.
    pub command_returns_exceptions: Vec<String>,
    /// Types whose member names may use upper case and `_`.
    pub member_name_exceptions: Vec<String>,
}

/// Location of a schema expression or token.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub fname: PathBuf,
    pub line: usize,
    /// Inclusion site, if this file was pulled in by an `include`.
    pub parent: Option<Arc<SourceInfo>>,
    pub pragma: Arc<Pragma>,
    defn: Option<(&'static str, String)>,
}

impl SourceInfo {
    pub fn new(
        fname: PathBuf,
        line: usize,
        parent: Option<Arc<SourceInfo>>,
        pragma: Arc<Pragma>,
    ) -> Self {
        SourceInfo {
            fname,
            line,
            parent,
            pragma,
            defn: None,
        }
    }

    /// Attach the enclosing definition, for `In <meta> '<name>':` context.
    pub fn with_defn(&self, meta: &'static str, name: &str) -> Self {
        let mut info = self.clone();
        info.defn = Some((meta, name.to_owned()));
        info
    }

    pub fn defn_meta(&self) -> Option<&'static str> {
        self.defn.as_ref().map(|(meta, _)| *meta)
    }

    pub fn defn_name(&self) -> Option<&str> {
        self.defn.as_ref().map(|(_, name)| name.as_str())
    }

    pub fn loc(&self) -> String {
        // line 0 marks a file level condition, such as an unreadable
        // main schema file
        if self.line == 0 {
            return self.fname.display().to_string();
        }
        format!("{}:{}", self.fname.display(), self.line)
    }

    /// The `In <meta> '<name>':` line, when definition context is known.
    pub fn in_defn(&self) -> String {
        match &self.defn {
            Some((meta, name)) => {
                format!("{}: In {} '{}':\n", self.fname.display(), meta, name)
            }
            None => String::new(),
        }
    }

    /// The chain of `In file included from ...:` lines, outermost first.
    pub fn include_path(&self) -> String {
        let mut ret = String::new();
        let mut parent = self.parent.as_deref();
        while let Some(info) = parent {
            ret = format!("In file included from {}:\n{}", info.loc(), ret);
            parent = info.parent.as_deref();
        }
        ret
    }

    /// Walk this info and its ancestors, innermost first.
    pub fn chain(&self) -> impl Iterator<Item = &SourceInfo> {
        std::iter::successors(Some(self), |info| info.parent.as_deref())
    }

    /// File of the outermost ancestor, i.e. the main schema file.
    pub fn main_file(&self) -> &Path {
        let mut info = self;
        while let Some(parent) = info.parent.as_deref() {
            info = parent;
        }
        &info.fname
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.include_path(), self.in_defn(), self.loc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(fname: &str, line: usize, parent: Option<Arc<SourceInfo>>) -> SourceInfo {
        SourceInfo::new(PathBuf::from(fname), line, parent, Arc::new(Pragma::default()))
    }

    #[test]
    fn test_loc() {
        assert_eq!(info("schema.json", 3, None).loc(), "schema.json:3");
    }

    #[test]
    fn test_include_path() {
        let outer = Arc::new(info("outer.json", 1, None));
        let mid = Arc::new(info("mid.json", 2, Some(outer)));
        let inner = info("inner.json", 5, Some(mid));
        assert_eq!(
            inner.to_string(),
            "In file included from outer.json:1:\n\
             In file included from mid.json:2:\n\
             inner.json:5"
        );
    }

    #[test]
    fn test_in_defn() {
        let i = info("schema.json", 7, None).with_defn("enum", "Color");
        assert_eq!(i.to_string(), "schema.json: In enum 'Color':\nschema.json:7");
        assert_eq!(i.defn_name(), Some("Color"));
    }

    #[test]
    fn test_main_file() {
        let outer = Arc::new(info("outer.json", 1, None));
        let inner = info("inner.json", 5, Some(outer));
        assert_eq!(inner.main_file(), Path::new("outer.json"));
    }
}

//! Schema compiler for the RIDL interface definition language.
//!
//! A RIDL schema is a sequence of JSON-like expressions defining enums,
//! structs, unions, alternates, commands, and events, plus `include`
//! and `pragma` directives and `##` documentation blocks. [`Schema::load`]
//! parses and checks a schema into a resolved semantic model; the
//! backend modules consume that model through [`schema::SchemaVisitor`]
//! and emit the C representation.

pub mod commands;
pub mod common;
pub mod doc;
pub mod error;
pub mod events;
pub mod expr;
pub mod gen;
pub mod introspect;
pub mod lexer;
pub mod parser;
pub mod schema;
pub mod source;
pub mod types;
pub mod visit;

use std::path::Path;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

pub use error::{ParseError, RidlError, SemanticError};
pub use parser::{parse_schema, Parsed};
pub use schema::Schema;

static VALID_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_.-][A-Za-z0-9_.-]*)?").unwrap());

/// The first character of `prefix` that the symbol prefix grammar
/// rejects, if any.
pub fn invalid_prefix_char(prefix: &str) -> Option<char> {
    let end = match VALID_PREFIX.find(prefix) {
        Some(m) => m.end(),
        None => 0,
    };
    prefix[end..].chars().next()
}

/// Generate C code for the given schema into the target directory.
///
/// `prefix` is prepended to the generated file names and to global
/// symbols; it must already satisfy [`invalid_prefix_char`]. `unmask`
/// exposes non-ABI type names through introspection, `builtins` also
/// writes the shareable built-in module.
pub fn generate(
    schema_file: &Path,
    output_dir: &Path,
    prefix: &str,
    unmask: bool,
    builtins: bool,
) -> Result<()> {
    assert!(invalid_prefix_char(prefix).is_none());

    let schema = Schema::load(schema_file)?;
    types::gen_types(&schema, output_dir, prefix, builtins)?;
    visit::gen_visit(&schema, output_dir, prefix, builtins)?;
    commands::gen_commands(&schema, output_dir, prefix)?;
    events::gen_events(&schema, output_dir, prefix)?;
    introspect::gen_introspect(&schema, output_dir, prefix, unmask)?;
    Ok(())
}

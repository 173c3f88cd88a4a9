//! Expression Validation
//!
//! The parser produces raw expression trees. Before the schema model
//! is built from them, [`check_exprs`] normalizes each top level
//! expression in place and rejects anything structurally wrong:
//! unknown or missing keys, malformed names, bad `if` conditionals,
//! misshapen member lists. Everything here is context free; resolving
//! type names against the global table is the schema's job.
//!
//! Normalization rewrites shorthand into canonical form, so later
//! passes only ever see one shape:
//!
//! - a bare member type `'member': 'int'` becomes `'member': {'type': 'int'}`
//! - a bare enum value or feature `'foo'` becomes `{'name': 'foo'}`

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::common::c_name;
use crate::doc::Doc;
use crate::error::SemanticError;
use crate::source::SourceInfo;

/// One value in a schema expression tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Expr {
    Bool(bool),
    Str(String),
    List(Vec<Expr>),
    Map(IndexMap<String, Expr>),
}

impl Expr {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Expr>> {
        match self {
            Expr::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// A top level expression together with where it came from and the
/// documentation block attached to it, as an index into the parse
/// result's doc table.
#[derive(Debug, Clone)]
pub struct ExprEntry {
    pub expr: IndexMap<String, Expr>,
    pub info: SourceInfo,
    pub doc: Option<usize>,
}

/// Build configuration condition tree, from a validated `if` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Ident(String),
    Not(Box<Cond>),
    All(Vec<Cond>),
    Any(Vec<Cond>),
}

impl Cond {
    fn from_expr(expr: &Expr) -> Cond {
        match expr {
            Expr::Str(s) => Cond::Ident(s.clone()),
            Expr::Map(m) => {
                if let Some(sub) = m.get("not") {
                    Cond::Not(Box::new(Cond::from_expr(sub)))
                } else if let Some(Expr::List(l)) = m.get("all") {
                    Cond::All(l.iter().map(Cond::from_expr).collect())
                } else if let Some(Expr::List(l)) = m.get("any") {
                    Cond::Any(l.iter().map(Cond::from_expr).collect())
                } else {
                    unreachable!("condition was validated by check_if")
                }
            }
            _ => unreachable!("condition was validated by check_if"),
        }
    }

    fn cgen(&self) -> String {
        match self {
            Cond::Ident(name) => format!("defined({})", name),
            Cond::Not(sub) => match sub.as_ref() {
                Cond::Ident(_) => format!("!{}", sub.cgen()),
                _ => format!("!({})", sub.cgen()),
            },
            Cond::All(subs) => infix(subs, " && "),
            Cond::Any(subs) => infix(subs, " || "),
        }
    }
}

fn infix(operands: &[Cond], oper: &str) -> String {
    let rendered: Vec<String> = operands.iter().map(|c| format!("({})", c.cgen())).collect();
    rendered.join(oper)
}

/// Optional build configuration condition attached to an entity,
/// member or branch. Absent means unconditional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfCond(pub Option<Cond>);

impl IfCond {
    pub fn none() -> IfCond {
        IfCond(None)
    }

    /// Lift the validated `if` value of `map`, if any.
    pub fn from_map(map: &IndexMap<String, Expr>) -> IfCond {
        IfCond(map.get("if").map(Cond::from_expr))
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    /// C preprocessor expression, empty when unconditional.
    pub fn cgen(&self) -> String {
        self.0.as_ref().map(Cond::cgen).unwrap_or_default()
    }

    pub fn gen_if(&self) -> String {
        match &self.0 {
            None => String::new(),
            Some(c) => format!("#if {}\n", c.cgen()),
        }
    }

    pub fn gen_endif(&self) -> String {
        match &self.0 {
            None => String::new(),
            Some(c) => format!("#endif /* {} */\n", c.cgen()),
        }
    }
}

// Names consist of letters, digits, -, and _, starting with a letter.
// An experimental name is prefixed with x-. A name of a downstream
// extension is prefixed with __RFQDN_. The latter prefix goes first.
static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(__[a-z0-9.-]+_)?(x-)?([a-z][a-z0-9_-]*)$").unwrap());

static CAMEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*[a-z][A-Za-z0-9]*$").unwrap());

static COND_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());

fn check_name_is_str<'e>(
    value: &'e Expr,
    info: &SourceInfo,
    source: &str,
) -> Result<&'e str, SemanticError> {
    value
        .as_str()
        .ok_or_else(|| SemanticError::new(info, format!("{} requires a string name", source)))
}

/// Validate the name grammar and return the stem, with any `__RFQDN_`
/// and `x-` prefixes stripped. The whole `q_` namespace is reserved
/// for generated identifiers.
fn check_name_str(name: &str, info: &SourceInfo, source: &str) -> Result<String, SemanticError> {
    let stem = VALID_NAME
        .captures(name)
        .and_then(|caps| caps.get(3))
        .map(|m| m.as_str().to_owned());
    match stem {
        Some(stem) if !c_name(name, false).starts_with("q_") => Ok(stem),
        _ => Err(SemanticError::new(
            info,
            format!("{} has an invalid name", source),
        )),
    }
}

fn check_name_upper(name: &str, info: &SourceInfo, source: &str) -> Result<(), SemanticError> {
    let stem = check_name_str(name, info, source)?;
    if stem.chars().any(|c| c.is_ascii_lowercase() || c == '-') {
        return Err(SemanticError::new(
            info,
            format!("name of {} must not use lowercase or '-'", source),
        ));
    }
    Ok(())
}

fn check_name_lower(
    name: &str,
    info: &SourceInfo,
    source: &str,
    permit_upper: bool,
    permit_underscore: bool,
) -> Result<(), SemanticError> {
    let stem = check_name_str(name, info, source)?;
    if (!permit_upper && stem.chars().any(|c| c.is_ascii_uppercase()))
        || (!permit_underscore && stem.contains('_'))
    {
        return Err(SemanticError::new(
            info,
            format!("name of {} must not use uppercase or '_'", source),
        ));
    }
    Ok(())
}

fn check_name_camel(name: &str, info: &SourceInfo, source: &str) -> Result<(), SemanticError> {
    let stem = check_name_str(name, info, source)?;
    if !CAMEL_NAME.is_match(&stem) {
        return Err(SemanticError::new(
            info,
            format!("name of {} must use CamelCase", source),
        ));
    }
    Ok(())
}

fn check_defn_name_str(name: &str, info: &SourceInfo, meta: &str) -> Result<(), SemanticError> {
    match meta {
        "event" => check_name_upper(name, info, meta)?,
        "command" => {
            let permit = info.pragma.command_name_exceptions.iter().any(|n| n == name);
            check_name_lower(name, info, meta, false, permit)?;
        }
        _ => check_name_camel(name, info, meta)?,
    }
    if name.ends_with("Kind") || name.ends_with("List") {
        return Err(SemanticError::new(
            info,
            format!(
                "{} name should not end in '{}'",
                meta,
                &name[name.len() - 4..]
            ),
        ));
    }
    Ok(())
}

fn pprint(mut elems: Vec<&str>) -> String {
    elems.sort_unstable();
    elems
        .iter()
        .map(|e| format!("'{}'", e))
        .collect::<Vec<_>>()
        .join(", ")
}

fn check_keys(
    value: &IndexMap<String, Expr>,
    info: &SourceInfo,
    source: &str,
    required: &[&str],
    optional: &[&str],
) -> Result<(), SemanticError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| !value.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(SemanticError::new(
            info,
            format!(
                "{} misses key{} {}",
                source,
                if missing.len() > 1 { "s" } else { "" },
                pprint(missing)
            ),
        ));
    }
    let unknown: Vec<&str> = value
        .keys()
        .map(String::as_str)
        .filter(|k| !required.contains(k) && !optional.contains(k))
        .collect();
    if !unknown.is_empty() {
        let allowed: Vec<&str> = required.iter().chain(optional.iter()).copied().collect();
        return Err(SemanticError::new(
            info,
            format!(
                "{} has unknown key{} {}\nValid keys are {}.",
                source,
                if unknown.len() > 1 { "s" } else { "" },
                pprint(unknown),
                pprint(allowed)
            ),
        ));
    }
    Ok(())
}

fn check_flags(expr: &IndexMap<String, Expr>, info: &SourceInfo) -> Result<(), SemanticError> {
    for key in ["gen", "success-response"] {
        if let Some(value) = expr.get(key) {
            if *value != Expr::Bool(false) {
                return Err(SemanticError::new(
                    info,
                    format!("flag '{}' may only use false value", key),
                ));
            }
        }
    }
    for key in ["boxed", "allow-oob", "allow-preconfig", "coroutine"] {
        if let Some(value) = expr.get(key) {
            if *value != Expr::Bool(true) {
                return Err(SemanticError::new(
                    info,
                    format!("flag '{}' may only use true value", key),
                ));
            }
        }
    }
    if expr.contains_key("allow-oob") && expr.contains_key("coroutine") {
        // Not a fundamental incompatibility, but the combination is
        // untested, so keep it off the table for now.
        return Err(SemanticError::new(
            info,
            "flags 'allow-oob' and 'coroutine' are incompatible",
        ));
    }
    Ok(())
}

fn check_if(
    expr: &IndexMap<String, Expr>,
    info: &SourceInfo,
    source: &str,
) -> Result<(), SemanticError> {
    fn check_cond(
        cond: &Expr,
        info: &SourceInfo,
        source: &str,
    ) -> Result<(), SemanticError> {
        let map = match cond {
            Expr::Map(map) => map,
            _ => {
                let ident = cond.as_str().ok_or_else(|| {
                    SemanticError::new(
                        info,
                        format!("'if' condition of {} must be a string or an object", source),
                    )
                })?;
                if !COND_IDENT.is_match(ident) {
                    return Err(SemanticError::new(
                        info,
                        format!(
                            "'if' condition '{}' of {} is not a valid identifier",
                            ident, source
                        ),
                    ));
                }
                return Ok(());
            }
        };
        check_keys(
            map,
            info,
            &format!("'if' condition of {}", source),
            &[],
            &["all", "any", "not"],
        )?;
        if map.len() != 1 {
            return Err(SemanticError::new(
                info,
                format!("'if' condition of {} has conflicting keys", source),
            ));
        }
        if let Some(sub) = map.get("not") {
            return check_cond(sub, info, source);
        }
        for (oper, operands) in map {
            let operands = operands.as_list().ok_or_else(|| {
                SemanticError::new(
                    info,
                    format!("'{}' condition of {} must be an array", oper, source),
                )
            })?;
            if operands.is_empty() {
                return Err(SemanticError::new(
                    info,
                    format!("'{}' condition of {} must not be empty", oper, source),
                ));
            }
            for operand in operands {
                check_cond(operand, info, source)?;
            }
        }
        Ok(())
    }

    match expr.get("if") {
        None => Ok(()),
        Some(cond) => check_cond(cond, info, source),
    }
}

/// Rewrite a bare member/feature value into its one key mapping form,
/// and hand back the mapping. Already canonical values pass through.
fn wrap_bare<'e>(elem: &'e mut Expr, key: &str) -> &'e mut IndexMap<String, Expr> {
    if !matches!(elem, Expr::Map(_)) {
        let bare = std::mem::replace(elem, Expr::Map(IndexMap::new()));
        if let Expr::Map(map) = elem {
            map.insert(key.to_owned(), bare);
        }
    }
    match elem {
        Expr::Map(map) => map,
        _ => unreachable!("just wrapped"),
    }
}

// Python style truthiness, for the handful of places where presence
// alone is not what is being asked.
fn truthy(value: Option<&Expr>) -> bool {
    match value {
        None => false,
        Some(Expr::Bool(b)) => *b,
        Some(Expr::Str(s)) => !s.is_empty(),
        Some(Expr::List(l)) => !l.is_empty(),
        Some(Expr::Map(m)) => !m.is_empty(),
    }
}

/// Whether an anonymous member dict is accepted in a type position,
/// and which definition name member name exceptions apply under.
#[derive(Clone, Copy)]
enum AllowDict<'n> {
    No,
    Unnamed,
    Named(&'n str),
}

fn check_type(
    value: Option<&mut Expr>,
    info: &SourceInfo,
    source: &str,
    allow_array: bool,
    allow_dict: AllowDict,
) -> Result<(), SemanticError> {
    let value = match value {
        None => return Ok(()),
        Some(value) => value,
    };

    match value {
        Expr::List(elts) => {
            if !allow_array {
                return Err(SemanticError::new(
                    info,
                    format!("{} cannot be an array", source),
                ));
            }
            if elts.len() != 1 || !matches!(elts[0], Expr::Str(_)) {
                return Err(SemanticError::new(
                    info,
                    format!("{}: array type must contain single type name", source),
                ));
            }
            Ok(())
        }
        Expr::Str(_) => Ok(()),
        Expr::Bool(_) => {
            if matches!(allow_dict, AllowDict::No) {
                return Err(SemanticError::new(
                    info,
                    format!("{} should be a type name", source),
                ));
            }
            Err(SemanticError::new(
                info,
                format!("{} should be an object or type name", source),
            ))
        }
        Expr::Map(members) => {
            let permissive = match allow_dict {
                AllowDict::No => {
                    return Err(SemanticError::new(
                        info,
                        format!("{} should be a type name", source),
                    ));
                }
                AllowDict::Unnamed => false,
                AllowDict::Named(name) => {
                    info.pragma.member_name_exceptions.iter().any(|n| n == name)
                }
            };
            for (key, arg) in members.iter_mut() {
                let key_source = format!("{} member '{}'", source, key);
                let raw = key.strip_prefix('*').unwrap_or(key);
                check_name_lower(raw, info, &key_source, permissive, permissive)?;
                let mangled = c_name(raw, false);
                if mangled == "u" || mangled.starts_with("has_") {
                    return Err(SemanticError::new(
                        info,
                        format!("{} uses reserved name", key_source),
                    ));
                }
                let arg = wrap_bare(arg, "type");
                check_keys(arg, info, &key_source, &["type"], &["if", "features"])?;
                check_if(arg, info, &key_source)?;
                check_features(arg.get_mut("features"), info)?;
                check_type(arg.get_mut("type"), info, &key_source, true, AllowDict::No)?;
            }
            Ok(())
        }
    }
}

fn check_features(
    features: Option<&mut Expr>,
    info: &SourceInfo,
) -> Result<(), SemanticError> {
    let features = match features {
        None => return Ok(()),
        Some(features) => features,
    };
    let list = match features {
        Expr::List(list) => list,
        _ => return Err(SemanticError::new(info, "'features' must be an array")),
    };
    for feature in list.iter_mut() {
        let feature = wrap_bare(feature, "name");
        let source = "'features' member";
        check_keys(feature, info, source, &["name"], &["if"])?;
        let name = check_name_is_str(&feature["name"], info, source)?.to_owned();
        let source = format!("{} '{}'", source, name);
        check_name_lower(&name, info, &source, false, false)?;
        check_if(feature, info, &source)?;
    }
    Ok(())
}

fn check_enum(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
    name: &str,
) -> Result<(), SemanticError> {
    match expr.get("prefix") {
        None | Some(Expr::Str(_)) => (),
        Some(_) => return Err(SemanticError::new(info, "'prefix' must be a string")),
    }
    let permissive = info.pragma.member_name_exceptions.iter().any(|n| n == name);
    let members = match expr.get_mut("data") {
        Some(Expr::List(members)) => members,
        _ => return Err(SemanticError::new(info, "'data' must be an array")),
    };
    for member in members.iter_mut() {
        let member = wrap_bare(member, "name");
        let source = "'data' member";
        check_keys(member, info, source, &["name"], &["if"])?;
        let member_name = check_name_is_str(&member["name"], info, source)?.to_owned();
        let source = format!("{} '{}'", source, member_name);
        // Enum members may start with a digit; hide it from the name
        // grammar, which will see it again after the 'd'.
        let checked = if member_name.starts_with(|c: char| c.is_ascii_digit()) {
            format!("d{}", member_name)
        } else {
            member_name
        };
        check_name_lower(&checked, info, &source, permissive, permissive)?;
        check_if(member, info, &source)?;
    }
    Ok(())
}

fn check_struct(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
    name: &str,
) -> Result<(), SemanticError> {
    check_type(
        expr.get_mut("data"),
        info,
        "'data'",
        false,
        AllowDict::Named(name),
    )?;
    check_type(expr.get_mut("base"), info, "'base'", false, AllowDict::No)
}

fn check_union(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
    name: &str,
) -> Result<(), SemanticError> {
    let discriminator = expr.get("discriminator").cloned();
    let base_truthy = truthy(expr.get("base"));

    match &discriminator {
        // simple union: the tag enum is made up from the branch names
        None => {
            if expr.contains_key("base") {
                return Err(SemanticError::new(info, "'base' requires 'discriminator'"));
            }
        }
        // flat union: the tag is a member of the base
        Some(discriminator) => {
            check_type(
                expr.get_mut("base"),
                info,
                "'base'",
                false,
                AllowDict::Named(name),
            )?;
            if !base_truthy {
                return Err(SemanticError::new(info, "'discriminator' requires 'base'"));
            }
            check_name_is_str(discriminator, info, "'discriminator'")?;
        }
    }

    let allow_array = !base_truthy;
    let members = match expr.get_mut("data") {
        Some(Expr::Map(members)) => members,
        _ => return Err(SemanticError::new(info, "'data' must be an object")),
    };
    for (key, value) in members.iter_mut() {
        let source = format!("'data' member '{}'", key);
        if discriminator.is_none() {
            check_name_lower(key, info, &source, false, false)?;
        }
        // else: the branch name is a value of the discriminator enum,
        // which is checked when the union type is
        let value = wrap_bare(value, "type");
        check_keys(value, info, &source, &["type"], &["if"])?;
        check_if(value, info, &source)?;
        check_type(value.get_mut("type"), info, &source, allow_array, AllowDict::No)?;
    }
    Ok(())
}

fn check_alternate(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
) -> Result<(), SemanticError> {
    let members = match expr.get_mut("data") {
        Some(Expr::Map(members)) => members,
        _ => return Err(SemanticError::new(info, "'data' must be an object")),
    };
    if members.is_empty() {
        return Err(SemanticError::new(info, "'data' must not be empty"));
    }
    for (key, value) in members.iter_mut() {
        let source = format!("'data' member '{}'", key);
        check_name_lower(key, info, &source, false, false)?;
        let value = wrap_bare(value, "type");
        check_keys(value, info, &source, &["type"], &["if"])?;
        check_if(value, info, &source)?;
        check_type(value.get_mut("type"), info, &source, false, AllowDict::No)?;
    }
    Ok(())
}

fn check_command(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
) -> Result<(), SemanticError> {
    let boxed = truthy(expr.get("boxed"));
    if boxed && !expr.contains_key("data") {
        return Err(SemanticError::new(info, "'boxed': true requires 'data'"));
    }
    let allow_dict = if boxed { AllowDict::No } else { AllowDict::Unnamed };
    check_type(expr.get_mut("data"), info, "'data'", false, allow_dict)?;
    check_type(expr.get_mut("returns"), info, "'returns'", true, AllowDict::No)
}

fn check_event(
    expr: &mut IndexMap<String, Expr>,
    info: &SourceInfo,
) -> Result<(), SemanticError> {
    let boxed = truthy(expr.get("boxed"));
    if boxed && !expr.contains_key("data") {
        return Err(SemanticError::new(info, "'boxed': true requires 'data'"));
    }
    let allow_dict = if boxed { AllowDict::No } else { AllowDict::Unnamed };
    check_type(expr.get_mut("data"), info, "'data'", false, allow_dict)
}

const METAS: [&str; 6] = ["enum", "union", "alternate", "struct", "command", "event"];

/// Normalize and validate every parsed expression in place.
///
/// `include` entries pass through untouched. On success, each
/// definition's [`SourceInfo`] carries its definition context for
/// later error messages.
pub fn check_exprs(exprs: &mut [ExprEntry], docs: &[Doc]) -> Result<(), SemanticError> {
    for entry in exprs.iter_mut() {
        if entry.expr.contains_key("include") {
            continue;
        }

        let meta = METAS
            .iter()
            .copied()
            .find(|m| entry.expr.contains_key(*m))
            .ok_or_else(|| SemanticError::new(&entry.info, "expression is missing metatype"))?;

        let name =
            check_name_is_str(&entry.expr[meta], &entry.info, &format!("'{}'", meta))?.to_owned();
        entry.info = entry.info.with_defn(meta, &name);
        let info = entry.info.clone();
        check_defn_name_str(&name, &info, meta)?;

        if let Some(di) = entry.doc {
            let doc = &docs[di];
            if doc.symbol.as_deref() != Some(name.as_str()) {
                return Err(SemanticError::new(
                    &info,
                    format!(
                        "documentation comment is for '{}'",
                        doc.symbol.as_deref().unwrap_or_default()
                    ),
                ));
            }
            doc.check_expr(meta == "command")?;
        } else if info.pragma.doc_required {
            return Err(SemanticError::new(&info, "documentation comment required"));
        }

        match meta {
            "enum" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["enum", "data"],
                    &["if", "features", "prefix"],
                )?;
                check_enum(&mut entry.expr, &info, &name)?;
            }
            "union" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["union", "data"],
                    &["base", "discriminator", "if", "features"],
                )?;
                check_union(&mut entry.expr, &info, &name)?;
            }
            "alternate" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["alternate", "data"],
                    &["if", "features"],
                )?;
                check_alternate(&mut entry.expr, &info)?;
            }
            "struct" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["struct", "data"],
                    &["base", "if", "features"],
                )?;
                check_struct(&mut entry.expr, &info, &name)?;
            }
            "command" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["command"],
                    &[
                        "data",
                        "returns",
                        "boxed",
                        "if",
                        "features",
                        "gen",
                        "success-response",
                        "allow-oob",
                        "allow-preconfig",
                        "coroutine",
                    ],
                )?;
                check_command(&mut entry.expr, &info)?;
            }
            "event" => {
                check_keys(
                    &entry.expr,
                    &info,
                    meta,
                    &["event"],
                    &["data", "boxed", "if", "features"],
                )?;
                check_event(&mut entry.expr, &info)?;
            }
            _ => unreachable!("metatype detected above"),
        }

        check_if(&entry.expr, &info, meta)?;
        check_features(entry.expr.get_mut("features"), &info)?;
        check_flags(&entry.expr, &info)?;
    }
    Ok(())
}

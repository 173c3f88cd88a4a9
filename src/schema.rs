//! # Schema Model
//!
//! The semantic core. [`Schema::load`] drives the whole front half of
//! the pipeline: parse, normalize, then build a graph of typed
//! entities out of the expression trees and cross-check it.
//!
//! ## Two-phase construction
//!
//! Definitions may refer to types in any order, so building happens in
//! two phases. The builder records *raw* entities whose type references
//! are still plain names; `check()` then resolves every reference to an
//! [`EntityId`], validates the graph, and produces the final [`Schema`]
//! of checked [`Entity`] values. Raw and checked entities are distinct
//! types, so nothing downstream can observe a half-built model.
//!
//! ## Implicit entities
//!
//! Besides what the schema spells out, the model contains synthesized
//! entities: built-in types and their arrays, the empty object type
//! `q_empty`, the `RType` runtime category enum, array types for
//! `['T']` references, `q_obj_NAME-arg` argument types for commands and
//! events with inline arguments, `q_obj_NAME-base` types for inline
//! union bases, and per-branch `q_obj_T-wrapper` types plus a
//! `NAMEKind` tag enum for simple unions.
//!
//! ## Example
//!
//! ```rust
//! use std::io::Write;
//!
//! let mut file = tempfile::NamedTempFile::new().unwrap();
//! write!(file, "{}", r#"
//! ###
//! ## = Demo
//! ###
//!
//! ###
//! ## @Status:
//! ###
//! { 'enum': 'Status', 'data': [ 'idle', 'busy' ] }
//! "#).unwrap();
//!
//! let schema = ridl::schema::Schema::load(file.path()).unwrap();
//! let id = schema.lookup_type("Status").unwrap();
//! assert_eq!(schema[id].name(), "Status");
//! ```

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::common::{c_name, relative_to};
use crate::doc::Doc;
use crate::error::{RidlError, SemanticError};
use crate::expr::{check_exprs, Expr, ExprEntry, IfCond};
use crate::parser::parse_schema;
use crate::source::SourceInfo;

/// Handle to an entity in a [`Schema`]. Only meaningful for the schema
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(usize);

/// The JSON value category a type maps to on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Int,
    Boolean,
    Null,
    Value,
    Array,
    Object,
}

impl JsonType {
    pub fn as_str(self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Int => "int",
            JsonType::Boolean => "boolean",
            JsonType::Null => "null",
            JsonType::Value => "value",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

/// A named feature flag on an entity or member.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub name: String,
    pub ifcond: IfCond,
    pub defined_in: String,
}

/// One value of an enum type.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumMember {
    pub name: String,
    pub ifcond: IfCond,
    pub defined_in: String,
}

/// Whether a [`Member`] is an ordinary object member or a union or
/// alternate branch. Affects diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Member,
    Branch,
}

/// A member of an object type, or a branch of a union or alternate.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub info: SourceInfo,
    pub ty: EntityId,
    pub optional: bool,
    pub ifcond: IfCond,
    pub features: Vec<Feature>,
    pub role: MemberRole,
    pub defined_in: String,
}

/// The branches of a union or alternate, together with the member that
/// discriminates them.
///
/// `tag_name` is set exactly for flat unions, where the discriminator
/// is a member of the base; it stays a reliable witness of that after
/// checking. Simple unions and alternates carry a synthesized tag
/// member instead.
#[derive(Debug, Clone)]
pub struct Variants {
    pub tag_name: Option<String>,
    pub tag_member: Member,
    pub variants: Vec<Member>,
}

/// Per-member view used by clash checking and diagnostics.
trait NamedMember: Clone {
    fn name(&self) -> &str;
    fn role(&self) -> &'static str;
    fn defined_in(&self) -> &str;

    fn describe(&self, info: &SourceInfo) -> String {
        describe_member(self.role(), self.name(), self.defined_in(), info)
    }
}

impl NamedMember for Feature {
    fn name(&self) -> &str {
        &self.name
    }
    fn role(&self) -> &'static str {
        "feature"
    }
    fn defined_in(&self) -> &str {
        &self.defined_in
    }
}

impl NamedMember for EnumMember {
    fn name(&self) -> &str {
        &self.name
    }
    fn role(&self) -> &'static str {
        "value"
    }
    fn defined_in(&self) -> &str {
        &self.defined_in
    }
}

impl NamedMember for Member {
    fn name(&self) -> &str {
        &self.name
    }
    fn role(&self) -> &'static str {
        match self.role {
            MemberRole::Member => "member",
            MemberRole::Branch => "branch",
        }
    }
    fn defined_in(&self) -> &str {
        &self.defined_in
    }
}

// Human description of a member, reversing the implicit type naming so
// messages speak of the definition the user wrote.
fn describe_member(role: &str, name: &str, defined_in: &str, info: &SourceInfo) -> String {
    let mut role = role.to_owned();
    if let Some(short) = defined_in.strip_prefix("q_obj_") {
        if short.ends_with("-arg") {
            // Implicit type holding a command's or event's inline arguments
            role = "parameter".to_owned();
        } else if short.ends_with("-base") {
            // Implicit type holding a flat union's inline base
            role = format!("base {}", role);
        }
        // '-wrapper' members cannot clash; fall through to the short form
    } else if defined_in.ends_with("Kind") {
        // Implicit enum made from a simple union's branch names
        role = "branch".to_owned();
    } else if info.defn_name() != Some(defined_in) {
        return format!("{} '{}' of type '{}'", role, name, defined_in);
    }
    format!("{} '{}'", role, name)
}

// Reject duplicate JSON names, tracking everything seen so far under
// its mangled C name. Errors are reported on behalf of `info`, which
// is not necessarily where the member was defined.
fn member_clash<M: NamedMember>(
    member: &M,
    info: &SourceInfo,
    seen: &mut IndexMap<String, M>,
) -> Result<(), SemanticError> {
    let cname = c_name(member.name(), true);
    if let Some(prev) = seen.get(&cname) {
        return Err(SemanticError::new(
            info,
            format!(
                "{} collides with {}",
                member.describe(info),
                prev.describe(info)
            ),
        ));
    }
    seen.insert(cname, member.clone());
    Ok(())
}

/// A checked schema entity.
///
/// For explicitly defined entities, `info` points to the definition.
/// For predefined ones it is `None`; for implicitly defined ones it
/// points to a place that triggered the definition.
#[derive(Debug, Clone)]
pub struct Entity {
    name: Option<String>,
    pub info: Option<SourceInfo>,
    pub doc: Option<usize>,
    pub ifcond: IfCond,
    pub features: Vec<Feature>,
    pub kind: EntityKind,
}

#[derive(Debug, Clone)]
pub enum EntityKind {
    Builtin(BuiltinType),
    Enum(EnumType),
    Array(ArrayType),
    Object(ObjectType),
    Alternate(AlternateType),
    Command(Command),
    Event(Event),
    Include(Include),
}

#[derive(Debug, Clone)]
pub struct BuiltinType {
    pub json_type: JsonType,
    pub c_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct EnumType {
    pub members: Vec<EnumMember>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArrayType {
    pub element: EntityId,
    pub element_name: String,
}

/// An object type: a struct, or a union when `variants` is set.
///
/// `members` is the flattened view (base members first, then local
/// ones); branch members are never part of it.
#[derive(Debug, Clone)]
pub struct ObjectType {
    pub base: Option<EntityId>,
    pub local_members: Vec<Member>,
    pub members: Vec<Member>,
    pub variants: Option<Variants>,
    pub is_union: bool,
}

#[derive(Debug, Clone)]
pub struct AlternateType {
    pub variants: Variants,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub arg_type: Option<EntityId>,
    pub ret_type: Option<EntityId>,
    pub gen: bool,
    pub success_response: bool,
    pub boxed: bool,
    pub allow_oob: bool,
    pub allow_preconfig: bool,
    pub coroutine: bool,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub arg_type: Option<EntityId>,
    pub boxed: bool,
}

/// Marker entity recording an `include` directive; belongs to the
/// including file's module.
#[derive(Debug, Clone)]
pub struct Include {
    pub sub_module: String,
}

impl Entity {
    pub fn name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => unreachable!("include entities are nameless"),
        }
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Builtin(_)
                | EntityKind::Enum(_)
                | EntityKind::Array(_)
                | EntityKind::Object(_)
                | EntityKind::Alternate(_)
        )
    }

    pub fn is_implicit(&self) -> bool {
        match &self.kind {
            EntityKind::Builtin(_) | EntityKind::Array(_) => true,
            EntityKind::Enum(_) => {
                self.name().ends_with("Kind") || self.name() == "RType"
            }
            EntityKind::Object(_) => self.name().starts_with("q_"),
            _ => self.info.is_none(),
        }
    }

    /// Whether the type contributes neither members nor branches.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            EntityKind::Object(obj) => obj.members.is_empty() && obj.variants.is_none(),
            // alternates always have at least one branch
            EntityKind::Alternate(_) => false,
            _ => unreachable!("only object-like types can be empty"),
        }
    }

    pub fn c_name(&self) -> String {
        match &self.kind {
            EntityKind::Builtin(_) => self.name().to_owned(),
            EntityKind::Object(_) => {
                assert!(self.name() != "q_empty");
                c_name(self.name(), true)
            }
            _ => c_name(self.name(), true),
        }
    }

    /// The C type for common use. For the types we commonly box, this
    /// is a pointer type.
    pub fn c_type(&self) -> String {
        match &self.kind {
            EntityKind::Builtin(b) => b.c_type.to_owned(),
            EntityKind::Enum(_) => c_name(self.name(), true),
            EntityKind::Array(_) | EntityKind::Alternate(_) => {
                format!("{} *", c_name(self.name(), true))
            }
            EntityKind::Object(_) => {
                assert!(!self.is_implicit());
                format!("{} *", c_name(self.name(), true))
            }
            _ => unreachable!("commands and events have no C type"),
        }
    }

    /// The C type to be used in a parameter list.
    pub fn c_param_type(&self) -> String {
        match &self.kind {
            EntityKind::Builtin(b) if self.name() == "str" => format!("const {}", b.c_type),
            _ => self.c_type(),
        }
    }

    /// The C type to be used where boxing is suppressed.
    pub fn c_unboxed_type(&self) -> String {
        match &self.kind {
            EntityKind::Object(_) => c_name(self.name(), true),
            _ => self.c_type(),
        }
    }

    pub fn json_type(&self) -> JsonType {
        match &self.kind {
            EntityKind::Builtin(b) => b.json_type,
            EntityKind::Enum(_) => JsonType::String,
            EntityKind::Array(_) => JsonType::Array,
            EntityKind::Object(_) => JsonType::Object,
            EntityKind::Alternate(_) => JsonType::Value,
            _ => unreachable!("commands and events have no JSON type"),
        }
    }

    /// The runtime category an alternate branch of this type claims,
    /// or `None` if the type cannot be a branch.
    pub fn alternate_rtype(&self) -> Option<&'static str> {
        match self.json_type() {
            JsonType::Null => Some("RTYPE_RNULL"),
            JsonType::String => Some("RTYPE_RSTRING"),
            JsonType::Number | JsonType::Int => Some("RTYPE_RNUM"),
            JsonType::Boolean => Some("RTYPE_RBOOL"),
            JsonType::Object => Some("RTYPE_RDICT"),
            JsonType::Array | JsonType::Value => None,
        }
    }
}

/// Receiver for a walk over a checked schema.
///
/// [`Schema::visit`] calls `visit_begin`, then `visit_module` per
/// module with every entity of that module dispatched to its callback
/// (gated by `visit_needed`), then `visit_end`. Object types get two
/// calls: `visit_object_type` with the inheritance view and
/// `visit_object_type_flat` with base members flattened in.
pub trait SchemaVisitor {
    fn visit_begin(&mut self, _schema: &Schema) {}
    fn visit_end(&mut self, _schema: &Schema) {}
    fn visit_module(&mut self, _schema: &Schema, _name: &str) {}
    fn visit_needed(&mut self, _schema: &Schema, _entity: &Entity) -> bool {
        true
    }
    fn visit_include(&mut self, _schema: &Schema, _sub_module: &str, _info: &SourceInfo) {}
    fn visit_builtin_type(&mut self, _schema: &Schema, _entity: &Entity, _builtin: &BuiltinType) {}
    fn visit_enum_type(&mut self, _schema: &Schema, _entity: &Entity, _enum_type: &EnumType) {}
    fn visit_array_type(&mut self, _schema: &Schema, _entity: &Entity, _array: &ArrayType) {}
    fn visit_object_type(&mut self, _schema: &Schema, _entity: &Entity, _object: &ObjectType) {}
    fn visit_object_type_flat(&mut self, _schema: &Schema, _entity: &Entity, _object: &ObjectType) {
    }
    fn visit_alternate_type(
        &mut self,
        _schema: &Schema,
        _entity: &Entity,
        _alternate: &AlternateType,
    ) {
    }
    fn visit_command(&mut self, _schema: &Schema, _entity: &Entity, _command: &Command) {}
    fn visit_event(&mut self, _schema: &Schema, _entity: &Entity, _event: &Event) {}
}

/// Entities grouped by the source file that defined them.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    entities: Vec<EntityId>,
}

impl Module {
    pub const BUILTIN_MODULE_NAME: &'static str = "./builtin";

    /// System modules are internally defined; their names start with
    /// `./`.
    pub fn is_system_name(name: &str) -> bool {
        name.starts_with("./")
    }

    /// User modules are the schema files the user wrote.
    pub fn is_user_name(name: &str) -> bool {
        !Self::is_system_name(name)
    }

    pub fn is_builtin_name(name: &str) -> bool {
        name == Self::BUILTIN_MODULE_NAME
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }
}

/// A fully checked schema.
#[derive(Debug)]
pub struct Schema {
    pub fname: PathBuf,
    entities: Vec<Entity>,
    by_name: IndexMap<String, EntityId>,
    modules: IndexMap<String, Module>,
    pub docs: Vec<Doc>,
    the_empty_object_type: EntityId,
}

impl std::ops::Index<EntityId> for Schema {
    type Output = Entity;

    fn index(&self, id: EntityId) -> &Entity {
        &self.entities[id.0]
    }
}

impl Schema {
    /// Parse `path` and build the checked model from it.
    pub fn load(path: &Path) -> Result<Schema, RidlError> {
        let mut parsed = parse_schema(path)?;
        check_exprs(&mut parsed.exprs, &parsed.docs)?;
        let mut builder = SchemaBuilder::new(path);
        builder.def_predefineds()?;
        builder.def_exprs(parsed.exprs)?;
        Ok(builder.check(parsed.docs)?)
    }

    pub fn lookup_entity(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied()
    }

    /// Like [`Schema::lookup_entity`], but only for type entities.
    pub fn lookup_type(&self, name: &str) -> Option<EntityId> {
        self.lookup_entity(name)
            .filter(|&id| self[id].is_type())
    }

    pub fn the_empty_object_type(&self) -> EntityId {
        self.the_empty_object_type
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| (EntityId(i), e))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Walk the whole schema in module order.
    pub fn visit<V: SchemaVisitor + ?Sized>(&self, visitor: &mut V) {
        visitor.visit_begin(self);
        for module in self.modules.values() {
            visitor.visit_module(self, &module.name);
            for &id in &module.entities {
                if visitor.visit_needed(self, &self[id]) {
                    self.visit_entity(id, visitor);
                }
            }
        }
        visitor.visit_end(self);
    }

    /// Dispatch a single entity to the visitor, bypassing
    /// `visit_needed`. Lets a visitor revisit entities it skipped
    /// during the main walk.
    pub fn visit_entity<V: SchemaVisitor + ?Sized>(&self, id: EntityId, visitor: &mut V) {
        let entity = &self[id];
        match &entity.kind {
            EntityKind::Builtin(b) => visitor.visit_builtin_type(self, entity, b),
            EntityKind::Enum(e) => visitor.visit_enum_type(self, entity, e),
            EntityKind::Array(a) => visitor.visit_array_type(self, entity, a),
            EntityKind::Object(o) => {
                visitor.visit_object_type(self, entity, o);
                visitor.visit_object_type_flat(self, entity, o);
            }
            EntityKind::Alternate(a) => visitor.visit_alternate_type(self, entity, a),
            EntityKind::Command(c) => visitor.visit_command(self, entity, c),
            EntityKind::Event(e) => visitor.visit_event(self, entity, e),
            EntityKind::Include(inc) => {
                let info = match &entity.info {
                    Some(info) => info,
                    None => unreachable!("include directives always have a location"),
                };
                visitor.visit_include(self, &inc.sub_module, info);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Unchecked model
// ---------------------------------------------------------------------

/// An entity condition before resolution. Implicit wrapper types
/// inherit the wrapped type's condition rather than stating their own.
#[derive(Debug, Clone, PartialEq)]
enum IfCondSpec {
    Explicit(IfCond),
    OfType(EntityId),
}

#[derive(Debug, Clone)]
struct RawMember {
    name: String,
    info: SourceInfo,
    type_name: String,
    optional: bool,
    ifcond: IfCond,
    features: Vec<Feature>,
    defined_in: String,
}

#[derive(Debug, Clone)]
struct RawVariants {
    tag_name: Option<String>,
    tag_member: Option<RawMember>,
    variants: Vec<RawMember>,
    info: SourceInfo,
}

#[derive(Debug, Clone)]
enum RawKind {
    Builtin {
        json_type: JsonType,
        c_type: &'static str,
    },
    Enum {
        members: Vec<EnumMember>,
        prefix: Option<String>,
    },
    Array {
        element_name: String,
    },
    Object {
        base_name: Option<String>,
        local_members: Vec<RawMember>,
        variants: Option<RawVariants>,
    },
    Alternate {
        variants: RawVariants,
    },
    Command {
        arg_type_name: Option<String>,
        ret_type_name: Option<String>,
        gen: bool,
        success_response: bool,
        boxed: bool,
        allow_oob: bool,
        allow_preconfig: bool,
        coroutine: bool,
    },
    Event {
        arg_type_name: Option<String>,
        boxed: bool,
    },
    Include {
        sub_module: String,
    },
}

#[derive(Debug, Clone)]
struct RawEntity {
    name: Option<String>,
    info: Option<SourceInfo>,
    doc: Option<usize>,
    ifcond: IfCondSpec,
    features: Vec<Feature>,
    kind: RawKind,
}

fn entity_info(info: Option<&SourceInfo>) -> &SourceInfo {
    match info {
        Some(info) => info,
        None => unreachable!("predefined entities never fail semantic checks"),
    }
}

struct SchemaBuilder {
    fname: PathBuf,
    schema_dir: PathBuf,
    raws: Vec<RawEntity>,
    by_name: IndexMap<String, EntityId>,
    modules: IndexMap<String, Module>,
    predefining: bool,
    the_empty_object_type: EntityId,
}

impl SchemaBuilder {
    fn new(fname: &Path) -> SchemaBuilder {
        let mut builder = SchemaBuilder {
            fname: fname.to_owned(),
            schema_dir: fname.parent().unwrap_or_else(|| Path::new("")).to_owned(),
            raws: Vec::new(),
            by_name: IndexMap::new(),
            modules: IndexMap::new(),
            predefining: false,
            the_empty_object_type: EntityId(0),
        };
        builder.make_module(Module::BUILTIN_MODULE_NAME.to_owned());
        let main = builder.module_name(fname);
        builder.make_module(main);
        builder
    }

    fn module_name(&self, fname: &Path) -> String {
        let as_str = fname.display().to_string();
        if Module::is_system_name(&as_str) {
            return as_str;
        }
        relative_to(fname, &self.schema_dir).display().to_string()
    }

    fn make_module(&mut self, name: String) -> String {
        self.modules.entry(name.clone()).or_insert_with(|| Module {
            name: name.clone(),
            entities: Vec::new(),
        });
        name
    }

    fn def_entity(&mut self, raw: RawEntity) -> Result<EntityId, SemanticError> {
        // Only the predefined entities are allowed to have no info
        assert!(raw.info.is_some() || self.predefining);
        let id = EntityId(self.raws.len());
        self.raws.push(raw);
        let raw = &self.raws[id.0];
        let name = match &raw.name {
            Some(name) => name.clone(),
            None => return Ok(id),
        };
        // TODO reject names that differ only in '_' vs '.' vs '-',
        // because they are liable to clash in generated C
        if let Some(&other) = self.by_name.get(&name) {
            let other_raw = &self.raws[other.0];
            if let Some(other_info) = &other_raw.info {
                let prev = SemanticError::new(other_info, "previous definition");
                return Err(SemanticError::new(
                    entity_info(raw.info.as_ref()),
                    format!("'{}' is already defined\n{}", name, prev),
                ));
            }
            return Err(SemanticError::new(
                entity_info(raw.info.as_ref()),
                format!("{} is already defined", self.raw_describe(other)),
            ));
        }
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn lookup_entity(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied()
    }

    fn lookup_type(&self, name: &str) -> Option<EntityId> {
        self.lookup_entity(name).filter(|&id| {
            matches!(
                self.raws[id.0].kind,
                RawKind::Builtin { .. }
                    | RawKind::Enum { .. }
                    | RawKind::Array { .. }
                    | RawKind::Object { .. }
                    | RawKind::Alternate { .. }
            )
        })
    }

    fn raw_name(&self, id: EntityId) -> &str {
        match &self.raws[id.0].name {
            Some(name) => name,
            None => unreachable!("include entities are nameless"),
        }
    }

    fn raw_is_implicit(&self, id: EntityId) -> bool {
        let raw = &self.raws[id.0];
        match &raw.kind {
            RawKind::Builtin { .. } | RawKind::Array { .. } => true,
            RawKind::Enum { .. } => {
                self.raw_name(id).ends_with("Kind") || self.raw_name(id) == "RType"
            }
            RawKind::Object { .. } => self.raw_name(id).starts_with("q_"),
            _ => raw.info.is_none(),
        }
    }

    fn raw_describe(&self, id: EntityId) -> String {
        let raw = &self.raws[id.0];
        match &raw.kind {
            RawKind::Builtin { .. } => format!("built-in type '{}'", self.raw_name(id)),
            RawKind::Enum { .. } => format!("enum type '{}'", self.raw_name(id)),
            RawKind::Array { element_name } => format!("array type ['{}']", element_name),
            RawKind::Object { variants, .. } => {
                let meta = if variants.is_some() { "union" } else { "struct" };
                format!("{} type '{}'", meta, self.raw_name(id))
            }
            RawKind::Alternate { .. } => format!("alternate type '{}'", self.raw_name(id)),
            RawKind::Command { .. } => format!("command '{}'", self.raw_name(id)),
            RawKind::Event { .. } => format!("event '{}'", self.raw_name(id)),
            RawKind::Include { .. } => unreachable!("include entities are never described"),
        }
    }

    fn raw_json_type(&self, id: EntityId) -> JsonType {
        match &self.raws[id.0].kind {
            RawKind::Builtin { json_type, .. } => *json_type,
            RawKind::Enum { .. } => JsonType::String,
            RawKind::Array { .. } => JsonType::Array,
            RawKind::Object { .. } => JsonType::Object,
            RawKind::Alternate { .. } => JsonType::Value,
            _ => unreachable!("commands and events have no JSON type"),
        }
    }

    fn raw_alternate_rtype(&self, id: EntityId) -> Option<&'static str> {
        match self.raw_json_type(id) {
            JsonType::Null => Some("RTYPE_RNULL"),
            JsonType::String => Some("RTYPE_RSTRING"),
            JsonType::Number | JsonType::Int => Some("RTYPE_RNUM"),
            JsonType::Boolean => Some("RTYPE_RBOOL"),
            JsonType::Object => Some("RTYPE_RDICT"),
            JsonType::Array | JsonType::Value => None,
        }
    }

    /// The resolved condition of a raw entity. Arrays share their
    /// element's condition, wrappers the wrapped type's.
    fn raw_ifcond(&self, id: EntityId) -> IfCond {
        if let RawKind::Array { element_name } = &self.raws[id.0].kind {
            let element = match self.lookup_type(element_name) {
                Some(element) => element,
                None => unreachable!("array conditions are read after the element resolved"),
            };
            return self.raw_ifcond(element);
        }
        match &self.raws[id.0].ifcond {
            IfCondSpec::Explicit(cond) => cond.clone(),
            IfCondSpec::OfType(wrapped) => self.raw_ifcond(*wrapped),
        }
    }

    // ---- predefined entities ----

    fn def_predefineds(&mut self) -> Result<(), SemanticError> {
        self.predefining = true;
        for (name, json_type, c_type) in [
            ("str", JsonType::String, "char *"),
            ("number", JsonType::Number, "double"),
            ("int", JsonType::Int, "int64_t"),
            ("int8", JsonType::Int, "int8_t"),
            ("int16", JsonType::Int, "int16_t"),
            ("int32", JsonType::Int, "int32_t"),
            ("int64", JsonType::Int, "int64_t"),
            ("uint8", JsonType::Int, "uint8_t"),
            ("uint16", JsonType::Int, "uint16_t"),
            ("uint32", JsonType::Int, "uint32_t"),
            ("uint64", JsonType::Int, "uint64_t"),
            ("size", JsonType::Int, "uint64_t"),
            ("bool", JsonType::Boolean, "bool"),
            ("any", JsonType::Value, "RObjectRef"),
            ("null", JsonType::Null, "RNullRef"),
        ] {
            self.def_entity(RawEntity {
                name: Some(name.to_owned()),
                info: None,
                doc: None,
                ifcond: IfCondSpec::Explicit(IfCond::none()),
                features: Vec::new(),
                kind: RawKind::Builtin { json_type, c_type },
            })?;
            // Instantiating only the arrays that are actually used
            // would be nice, but the generated built-in code may be
            // shared by other schemas.
            self.make_array_type(name, None)?;
        }

        self.the_empty_object_type = self.def_entity(RawEntity {
            name: Some("q_empty".to_owned()),
            info: None,
            doc: None,
            ifcond: IfCondSpec::Explicit(IfCond::none()),
            features: Vec::new(),
            kind: RawKind::Object {
                base_name: None,
                local_members: Vec::new(),
                variants: None,
            },
        })?;

        let rtypes = ["none", "rnull", "rnum", "rstring", "rdict", "rlist", "rbool"];
        self.def_entity(RawEntity {
            name: Some("RType".to_owned()),
            info: None,
            doc: None,
            ifcond: IfCondSpec::Explicit(IfCond::none()),
            features: Vec::new(),
            kind: RawKind::Enum {
                members: rtypes
                    .iter()
                    .map(|name| EnumMember {
                        name: (*name).to_owned(),
                        ifcond: IfCond::none(),
                        defined_in: "RType".to_owned(),
                    })
                    .collect(),
                prefix: Some("RTYPE".to_owned()),
            },
        })?;
        self.predefining = false;
        Ok(())
    }

    // ---- definition helpers ----

    fn make_features(map: &IndexMap<String, Expr>, owner: &str) -> Vec<Feature> {
        let list = match map.get("features").and_then(Expr::as_list) {
            Some(list) => list,
            None => return Vec::new(),
        };
        list.iter()
            .filter_map(Expr::as_map)
            .map(|f| Feature {
                name: required_str(f, "name"),
                ifcond: IfCond::from_map(f),
                defined_in: owner.to_owned(),
            })
            .collect()
    }

    fn make_enum_members(list: &[Expr], defined_in: &str) -> Vec<EnumMember> {
        list.iter()
            .filter_map(Expr::as_map)
            .map(|m| EnumMember {
                name: required_str(m, "name"),
                ifcond: IfCond::from_map(m),
                defined_in: defined_in.to_owned(),
            })
            .collect()
    }

    fn make_array_type(
        &mut self,
        element: &str,
        info: Option<&SourceInfo>,
    ) -> Result<String, SemanticError> {
        // the List suffix is reserved for this by the name checks
        let name = format!("{}List", element);
        if self.lookup_type(&name).is_none() {
            self.def_entity(RawEntity {
                name: Some(name.clone()),
                info: info.cloned(),
                doc: None,
                ifcond: IfCondSpec::Explicit(IfCond::none()),
                features: Vec::new(),
                kind: RawKind::Array {
                    element_name: element.to_owned(),
                },
            })?;
        }
        Ok(name)
    }

    fn make_member(
        &mut self,
        name: &str,
        value: &IndexMap<String, Expr>,
        info: &SourceInfo,
    ) -> Result<RawMember, SemanticError> {
        let (name, optional) = match name.strip_prefix('*') {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        let type_name = match &value["type"] {
            Expr::Str(type_name) => type_name.clone(),
            Expr::List(elements) => {
                let element = elements[0].as_str().unwrap_or_default();
                self.make_array_type(element, Some(info))?
            }
            _ => unreachable!("member types were validated"),
        };
        Ok(RawMember {
            name: name.to_owned(),
            info: info.clone(),
            type_name,
            optional,
            ifcond: IfCond::from_map(value),
            features: Self::make_features(value, name),
            defined_in: String::new(),
        })
    }

    fn make_members(
        &mut self,
        data: &IndexMap<String, Expr>,
        info: &SourceInfo,
    ) -> Result<Vec<RawMember>, SemanticError> {
        data.iter()
            .map(|(name, value)| {
                let value = value.as_map().unwrap_or_else(|| {
                    unreachable!("member shorthand was normalized")
                });
                self.make_member(name, value, info)
            })
            .collect()
    }

    fn make_implicit_enum_type(
        &mut self,
        name: &str,
        info: &SourceInfo,
        ifcond: IfCond,
        values: Vec<EnumMember>,
    ) -> Result<String, SemanticError> {
        // the Kind suffix is reserved for this by the name checks
        let name = format!("{}Kind", name);
        let values = values
            .into_iter()
            .map(|mut m| {
                m.defined_in = name.clone();
                m
            })
            .collect();
        self.def_entity(RawEntity {
            name: Some(name.clone()),
            info: Some(info.clone()),
            doc: None,
            ifcond: IfCondSpec::Explicit(ifcond),
            features: Vec::new(),
            kind: RawKind::Enum {
                members: values,
                prefix: None,
            },
        })?;
        Ok(name)
    }

    fn make_implicit_object_type(
        &mut self,
        name: &str,
        info: &SourceInfo,
        ifcond: IfCondSpec,
        role: &str,
        members: Vec<RawMember>,
    ) -> Result<Option<String>, SemanticError> {
        if members.is_empty() {
            return Ok(None);
        }
        let name = format!("q_obj_{}-{}", name, role);
        if let Some(id) = self.lookup_type(&name) {
            // Only simple unions' wrapper types have multiple users.
            // Each use must agree on the wrapped type's condition, or
            // the wrapper could not compile for all of them.
            // TODO widen to the disjunction of the users' conditions
            assert_eq!(self.raws[id.0].ifcond, ifcond);
        } else {
            let members = members
                .into_iter()
                .map(|mut m| {
                    m.defined_in = name.clone();
                    m
                })
                .collect();
            self.def_entity(RawEntity {
                name: Some(name.clone()),
                info: Some(info.clone()),
                doc: None,
                ifcond,
                features: Vec::new(),
                kind: RawKind::Object {
                    base_name: None,
                    local_members: members,
                    variants: None,
                },
            })?;
        }
        Ok(Some(name))
    }

    // ---- one definition per expression ----

    fn def_exprs(&mut self, exprs: Vec<ExprEntry>) -> Result<(), SemanticError> {
        for entry in exprs {
            if entry.expr.contains_key("enum") {
                self.def_enum_type(entry)?;
            } else if entry.expr.contains_key("struct") {
                self.def_struct_type(entry)?;
            } else if entry.expr.contains_key("union") {
                self.def_union_type(entry)?;
            } else if entry.expr.contains_key("alternate") {
                self.def_alternate_type(entry)?;
            } else if entry.expr.contains_key("command") {
                self.def_command(entry)?;
            } else if entry.expr.contains_key("event") {
                self.def_event(entry)?;
            } else if entry.expr.contains_key("include") {
                self.def_include(entry)?;
            } else {
                unreachable!("expression metatype was validated");
            }
        }
        Ok(())
    }

    fn def_enum_type(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "enum");
        let data = entry.expr.get("data").and_then(Expr::as_list).unwrap_or(&[]);
        let members = Self::make_enum_members(data, &name);
        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(IfCond::from_map(&entry.expr)),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Enum {
                members,
                prefix: entry.expr.get("prefix").and_then(Expr::as_str).map(str::to_owned),
            },
            name: Some(name),
            info: Some(entry.info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn def_struct_type(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "struct");
        let data = entry.expr.get("data").and_then(Expr::as_map);
        let mut local_members = match data {
            Some(data) => self.make_members(data, &entry.info)?,
            None => Vec::new(),
        };
        set_defined_in(&mut local_members, &name);
        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(IfCond::from_map(&entry.expr)),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Object {
                base_name: entry.expr.get("base").and_then(Expr::as_str).map(str::to_owned),
                local_members,
                variants: None,
            },
            name: Some(name),
            info: Some(entry.info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn def_union_type(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "union");
        let info = entry.info.clone();
        let ifcond = IfCond::from_map(&entry.expr);
        let tag_name = entry
            .expr
            .get("discriminator")
            .and_then(Expr::as_str)
            .map(str::to_owned);

        let base_name = match entry.expr.get("base") {
            Some(Expr::Str(base)) => Some(base.clone()),
            Some(Expr::Map(base)) => {
                let members = self.make_members(base, &info)?;
                self.make_implicit_object_type(
                    &name,
                    &info,
                    IfCondSpec::Explicit(ifcond.clone()),
                    "base",
                    members,
                )?
            }
            _ => None,
        };

        let data = match entry.expr.get("data").and_then(Expr::as_map) {
            Some(data) => data.clone(),
            None => unreachable!("union branches were validated"),
        };
        let mut tag_member = None;
        let mut local_members = Vec::new();
        let mut variants = Vec::new();
        if tag_name.is_some() {
            for (case, value) in &data {
                let value = value.as_map().unwrap_or_else(|| {
                    unreachable!("branch shorthand was normalized")
                });
                variants.push(self.make_variant(case, value, &info)?);
            }
        } else {
            for (case, value) in &data {
                let value = value.as_map().unwrap_or_else(|| {
                    unreachable!("branch shorthand was normalized")
                });
                variants.push(self.make_simple_variant(case, value, &info)?);
            }
            let values = variants
                .iter()
                .map(|v| EnumMember {
                    name: v.name.clone(),
                    ifcond: v.ifcond.clone(),
                    defined_in: String::new(),
                })
                .collect();
            let enum_name = self.make_implicit_enum_type(&name, &info, ifcond.clone(), values)?;
            let tag = RawMember {
                name: "type".to_owned(),
                info: info.clone(),
                type_name: enum_name,
                optional: false,
                ifcond: IfCond::none(),
                features: Vec::new(),
                defined_in: name.clone(),
            };
            local_members.push(tag.clone());
            tag_member = Some(tag);
        }
        set_defined_in(&mut variants, &name);

        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(ifcond),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Object {
                base_name,
                local_members,
                variants: Some(RawVariants {
                    tag_name,
                    tag_member,
                    variants,
                    info: info.clone(),
                }),
            },
            name: Some(name),
            info: Some(info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn make_variant(
        &mut self,
        case: &str,
        value: &IndexMap<String, Expr>,
        info: &SourceInfo,
    ) -> Result<RawMember, SemanticError> {
        self.make_member(case, value, info)
    }

    fn make_simple_variant(
        &mut self,
        case: &str,
        value: &IndexMap<String, Expr>,
        info: &SourceInfo,
    ) -> Result<RawMember, SemanticError> {
        let type_name = match &value["type"] {
            Expr::Str(type_name) => type_name.clone(),
            Expr::List(elements) => {
                let element = elements[0].as_str().unwrap_or_default();
                self.make_array_type(element, Some(info))?
            }
            _ => unreachable!("branch types were validated"),
        };
        // The wrapper takes the wrapped type's condition; if the type
        // is not defined yet, there is nothing to inherit.
        let wrapper_ifcond = match self.lookup_type(&type_name) {
            Some(id) => IfCondSpec::OfType(id),
            None => IfCondSpec::Explicit(IfCond::none()),
        };
        let wrapped = vec![RawMember {
            name: "data".to_owned(),
            info: info.clone(),
            type_name: type_name.clone(),
            optional: false,
            ifcond: IfCond::none(),
            features: Vec::new(),
            defined_in: String::new(),
        }];
        let wrapper = self
            .make_implicit_object_type(&type_name, info, wrapper_ifcond, "wrapper", wrapped)?
            .unwrap_or_else(|| unreachable!("wrappers always have a member"));
        Ok(RawMember {
            name: case.to_owned(),
            info: info.clone(),
            type_name: wrapper,
            optional: false,
            ifcond: IfCond::from_map(value),
            features: Vec::new(),
            defined_in: String::new(),
        })
    }

    fn def_alternate_type(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "alternate");
        let info = entry.info.clone();
        let data = match entry.expr.get("data").and_then(Expr::as_map) {
            Some(data) => data.clone(),
            None => unreachable!("alternate branches were validated"),
        };
        let mut variants = Vec::new();
        for (case, value) in &data {
            let value = value.as_map().unwrap_or_else(|| {
                unreachable!("branch shorthand was normalized")
            });
            variants.push(self.make_variant(case, value, &info)?);
        }
        set_defined_in(&mut variants, &name);
        let tag_member = RawMember {
            name: "type".to_owned(),
            info: info.clone(),
            type_name: "RType".to_owned(),
            optional: false,
            ifcond: IfCond::none(),
            features: Vec::new(),
            defined_in: name.clone(),
        };
        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(IfCond::from_map(&entry.expr)),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Alternate {
                variants: RawVariants {
                    tag_name: None,
                    tag_member: Some(tag_member),
                    variants,
                    info: info.clone(),
                },
            },
            name: Some(name),
            info: Some(info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn def_command(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "command");
        let info = entry.info.clone();
        let ifcond = IfCond::from_map(&entry.expr);
        let arg_type_name = match entry.expr.get("data") {
            Some(Expr::Str(arg)) => Some(arg.clone()),
            Some(Expr::Map(data)) => {
                let members = self.make_members(data, &info)?;
                self.make_implicit_object_type(
                    &name,
                    &info,
                    IfCondSpec::Explicit(ifcond.clone()),
                    "arg",
                    members,
                )?
            }
            _ => None,
        };
        let ret_type_name = match entry.expr.get("returns") {
            Some(Expr::Str(ret)) => Some(ret.clone()),
            Some(Expr::List(elements)) => {
                let element = elements[0].as_str().unwrap_or_default();
                Some(self.make_array_type(element, Some(&info))?)
            }
            _ => None,
        };
        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(ifcond),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Command {
                arg_type_name,
                ret_type_name,
                gen: bool_value(&entry.expr, "gen", true),
                success_response: bool_value(&entry.expr, "success-response", true),
                boxed: bool_value(&entry.expr, "boxed", false),
                allow_oob: bool_value(&entry.expr, "allow-oob", false),
                allow_preconfig: bool_value(&entry.expr, "allow-preconfig", false),
                coroutine: bool_value(&entry.expr, "coroutine", false),
            },
            name: Some(name),
            info: Some(info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn def_event(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let name = required_str(&entry.expr, "event");
        let info = entry.info.clone();
        let ifcond = IfCond::from_map(&entry.expr);
        let arg_type_name = match entry.expr.get("data") {
            Some(Expr::Str(arg)) => Some(arg.clone()),
            Some(Expr::Map(data)) => {
                let members = self.make_members(data, &info)?;
                self.make_implicit_object_type(
                    &name,
                    &info,
                    IfCondSpec::Explicit(ifcond.clone()),
                    "arg",
                    members,
                )?
            }
            _ => None,
        };
        self.def_entity(RawEntity {
            ifcond: IfCondSpec::Explicit(ifcond),
            features: Self::make_features(&entry.expr, &name),
            kind: RawKind::Event {
                arg_type_name,
                boxed: bool_value(&entry.expr, "boxed", false),
            },
            name: Some(name),
            info: Some(info),
            doc: entry.doc,
        })?;
        Ok(())
    }

    fn def_include(&mut self, entry: ExprEntry) -> Result<(), SemanticError> {
        let path = entry
            .expr
            .get("include")
            .and_then(Expr::as_str)
            .map(str::to_owned)
            .unwrap_or_default();
        let sub_module = self.module_name(Path::new(&path));
        let sub_module = self.make_module(sub_module);
        self.def_entity(RawEntity {
            name: None,
            info: Some(entry.info),
            doc: None,
            ifcond: IfCondSpec::Explicit(IfCond::none()),
            features: Vec::new(),
            kind: RawKind::Include { sub_module },
        })?;
        Ok(())
    }

    fn check(self, docs: Vec<Doc>) -> Result<Schema, SemanticError> {
        Checker::run(self, docs)
    }
}

fn set_defined_in(members: &mut [RawMember], name: &str) {
    for m in members {
        m.defined_in = name.to_owned();
    }
}

fn required_str(map: &IndexMap<String, Expr>, key: &str) -> String {
    match map.get(key).and_then(Expr::as_str) {
        Some(value) => value.to_owned(),
        None => unreachable!("'{}' was validated as a string", key),
    }
}

fn bool_value(map: &IndexMap<String, Expr>, key: &str, default: bool) -> bool {
    match map.get(key) {
        Some(Expr::Bool(b)) => *b,
        _ => default,
    }
}

// ---------------------------------------------------------------------
// Checking
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum CheckState {
    Unchecked,
    Checking,
    Checked,
}

struct Checker {
    b: SchemaBuilder,
    states: Vec<CheckState>,
    done: Vec<Option<Entity>>,
}

impl Checker {
    fn run(builder: SchemaBuilder, mut docs: Vec<Doc>) -> Result<Schema, SemanticError> {
        let n = builder.raws.len();
        let mut checker = Checker {
            b: builder,
            states: vec![CheckState::Unchecked; n],
            done: vec![None; n],
        };
        for i in 0..n {
            let id = EntityId(i);
            checker.check_entity(id)?;
            checker.connect_doc(id, &mut docs);
            checker.check_doc(id, &docs)?;
        }

        let mut modules = checker.b.modules.clone();
        for i in 0..n {
            let id = EntityId(i);
            let module = checker.module_of(id);
            match modules.get_mut(&module) {
                Some(module) => module.entities.push(id),
                None => unreachable!("modules are created when their files are read"),
            }
        }

        let entities = checker
            .done
            .into_iter()
            .map(|e| e.unwrap_or_else(|| unreachable!("the check loop completed")))
            .collect();
        Ok(Schema {
            fname: checker.b.fname,
            entities,
            by_name: checker.b.by_name,
            modules,
            docs,
            the_empty_object_type: checker.b.the_empty_object_type,
        })
    }

    fn resolve_type<F>(
        &self,
        name: &str,
        info: Option<&SourceInfo>,
        what: F,
    ) -> Result<EntityId, SemanticError>
    where
        F: FnOnce() -> String,
    {
        match self.b.lookup_type(name) {
            Some(id) => Ok(id),
            None => Err(SemanticError::new(
                entity_info(info),
                format!("{} uses unknown type '{}'", what(), name),
            )),
        }
    }

    fn check_features(
        &self,
        features: &[Feature],
        info: Option<&SourceInfo>,
    ) -> Result<(), SemanticError> {
        let mut seen = IndexMap::new();
        for f in features {
            member_clash(f, entity_info(info), &mut seen)?;
        }
        Ok(())
    }

    fn reject_deprecated(
        &self,
        features: &[Feature],
        info: Option<&SourceInfo>,
    ) -> Result<(), SemanticError> {
        if features.iter().any(|f| f.name == "deprecated") {
            return Err(SemanticError::new(
                entity_info(info),
                "feature 'deprecated' is not supported for types",
            ));
        }
        Ok(())
    }

    fn check_member(&self, raw: &RawMember, role: MemberRole) -> Result<Member, SemanticError> {
        let describe = {
            let role = match role {
                MemberRole::Member => "member",
                MemberRole::Branch => "branch",
            };
            let (name, defined_in, info) =
                (raw.name.clone(), raw.defined_in.clone(), raw.info.clone());
            move || describe_member(role, &name, &defined_in, &info)
        };
        let ty = self.resolve_type(&raw.type_name, Some(&raw.info), describe)?;
        let mut seen = IndexMap::new();
        for f in &raw.features {
            member_clash(f, &raw.info, &mut seen)?;
        }
        Ok(Member {
            name: raw.name.clone(),
            info: raw.info.clone(),
            ty,
            optional: raw.optional,
            ifcond: raw.ifcond.clone(),
            features: raw.features.clone(),
            role,
            defined_in: raw.defined_in.clone(),
        })
    }

    fn raw_enum_members(&self, id: EntityId) -> &[EnumMember] {
        match &self.b.raws[id.0].kind {
            RawKind::Enum { members, .. } => members,
            _ => unreachable!("the tag type was verified to be an enum"),
        }
    }

    fn check_variants(
        &mut self,
        rv: &RawVariants,
        union_seen: Option<&IndexMap<String, Member>>,
    ) -> Result<Variants, SemanticError> {
        let info = &rv.info;
        let mut raw_variants = rv.variants.clone();
        let tag_member;
        if let Some(tag_name) = &rv.tag_name {
            // flat union: the tag is a member of the base
            let seen = match union_seen {
                Some(seen) => seen,
                None => unreachable!("flat unions are checked with their members"),
            };
            let found = seen.get(&c_name(tag_name, true));
            match found {
                Some(m) if m.name == *tag_name => tag_member = m.clone(),
                _ => {
                    return Err(SemanticError::new(
                        info,
                        format!("discriminator '{}' is not a member of 'base'", tag_name),
                    ));
                }
            }
            let base_id = match self.b.lookup_type(&tag_member.defined_in) {
                Some(id) => id,
                None => unreachable!("the tag member's type was defined"),
            };
            let base = if self.b.raw_is_implicit(base_id) {
                "'base'".to_owned()
            } else {
                format!("base type '{}'", tag_member.defined_in)
            };
            if !matches!(self.b.raws[tag_member.ty.0].kind, RawKind::Enum { .. }) {
                return Err(SemanticError::new(
                    info,
                    format!(
                        "discriminator member '{}' of {} must be of enum type",
                        tag_name, base
                    ),
                ));
            }
            if tag_member.optional {
                return Err(SemanticError::new(
                    info,
                    format!(
                        "discriminator member '{}' of {} must not be optional",
                        tag_name, base
                    ),
                ));
            }
            if tag_member.ifcond.is_present() {
                return Err(SemanticError::new(
                    info,
                    format!(
                        "discriminator member '{}' of {} must not be conditional",
                        tag_name, base
                    ),
                ));
            }
            // branches that are not explicitly covered get an empty type
            let cases: Vec<String> = raw_variants.iter().map(|v| v.name.clone()).collect();
            for em in self.raw_enum_members(tag_member.ty).to_vec() {
                if !cases.iter().any(|c| c == &em.name) {
                    raw_variants.push(RawMember {
                        name: em.name,
                        info: info.clone(),
                        type_name: "q_empty".to_owned(),
                        optional: false,
                        ifcond: em.ifcond,
                        features: Vec::new(),
                        defined_in: tag_member.defined_in.clone(),
                    });
                }
            }
        } else {
            // simple union or alternate: the tag member is synthesized
            let raw_tag = match &rv.tag_member {
                Some(raw_tag) => raw_tag.clone(),
                None => unreachable!("either the tag name or the tag member is set"),
            };
            tag_member = self.check_member(&raw_tag, MemberRole::Member)?;
            debug_assert!(matches!(
                self.b.raws[tag_member.ty.0].kind,
                RawKind::Enum { .. }
            ));
            debug_assert!(!tag_member.optional && !tag_member.ifcond.is_present());
        }

        if raw_variants.is_empty() {
            return Err(SemanticError::new(info, "union has no branches"));
        }

        let mut variants = Vec::new();
        for raw_variant in &raw_variants {
            let v = self.check_member(raw_variant, MemberRole::Branch)?;
            // Union branch names must match the tag enum's values;
            // alternate branch names are checked separately.
            if union_seen.is_some() {
                let names = self.raw_enum_members(tag_member.ty);
                if !names.iter().any(|m| m.name == v.name) {
                    return Err(SemanticError::new(
                        info,
                        format!(
                            "branch '{}' is not a value of {}",
                            v.name,
                            self.b.raw_describe(tag_member.ty)
                        ),
                    ));
                }
                let plain_object = matches!(
                    self.b.raws[v.ty.0].kind,
                    RawKind::Object { variants: None, .. }
                );
                if !plain_object {
                    return Err(SemanticError::new(
                        info,
                        format!(
                            "{} cannot use {}",
                            v.describe(info),
                            self.b.raw_describe(v.ty)
                        ),
                    ));
                }
                self.check_object(v.ty)?;
            }
            variants.push(v);
        }
        Ok(Variants {
            tag_name: rv.tag_name.clone(),
            tag_member,
            variants,
        })
    }

    fn checked_object(&self, id: EntityId) -> &ObjectType {
        match self.done[id.0].as_ref().map(|e| &e.kind) {
            Some(EntityKind::Object(obj)) => obj,
            _ => unreachable!("the object was just checked"),
        }
    }

    // An object's check recurses into another type exactly when the
    // emitted C struct embeds that type's struct; pointers don't count.
    fn check_object(&mut self, id: EntityId) -> Result<(), SemanticError> {
        match self.states[id.0] {
            // a previous check completed
            CheckState::Checked => return Ok(()),
            // recursed: the C struct would contain itself
            CheckState::Checking => {
                let raw = &self.b.raws[id.0];
                return Err(SemanticError::new(
                    entity_info(raw.info.as_ref()),
                    format!("object {} contains itself", self.b.raw_name(id)),
                ));
            }
            CheckState::Unchecked => {}
        }
        self.states[id.0] = CheckState::Checking;

        let raw = &self.b.raws[id.0];
        let (base_name, local_raw, variants_raw) = match &raw.kind {
            RawKind::Object {
                base_name,
                local_members,
                variants,
            } => (base_name.clone(), local_members.clone(), variants.clone()),
            _ => unreachable!("dispatched on object entities"),
        };
        let info = raw.info.clone();
        let name = self.b.raw_name(id).to_owned();
        let doc = raw.doc;
        let features = raw.features.clone();

        self.check_features(&features, info.as_ref())?;
        self.reject_deprecated(&features, info.as_ref())?;

        let mut seen: IndexMap<String, Member> = IndexMap::new();
        let mut base = None;
        if let Some(base_name) = &base_name {
            let base_id = self.resolve_type(base_name, info.as_ref(), || "'base'".to_owned())?;
            let plain_object = matches!(
                self.b.raws[base_id.0].kind,
                RawKind::Object { variants: None, .. }
            );
            if !plain_object {
                return Err(SemanticError::new(
                    entity_info(info.as_ref()),
                    format!(
                        "'base' requires a struct type, {} isn't",
                        self.b.raw_describe(base_id)
                    ),
                ));
            }
            self.check_object(base_id)?;
            for m in self.checked_object(base_id).members.clone() {
                member_clash(&m, entity_info(info.as_ref()), &mut seen)?;
            }
            base = Some(base_id);
        }

        let mut local_members = Vec::new();
        for raw_member in &local_raw {
            let m = self.check_member(raw_member, MemberRole::Member)?;
            member_clash(&m, entity_info(info.as_ref()), &mut seen)?;
            local_members.push(m);
        }
        let members: Vec<Member> = seen.values().cloned().collect();

        let is_union = variants_raw.is_some();
        let variants = match &variants_raw {
            None => None,
            Some(rv) => {
                let v = self.check_variants(rv, Some(&seen))?;
                // A branch type's members must not clash with the
                // union's own; names from one branch do not affect
                // another, so each branch starts from a fresh copy.
                for variant in &v.variants {
                    let mut branch_seen = seen.clone();
                    for m in self.checked_object(variant.ty).members.clone() {
                        member_clash(&m, entity_info(info.as_ref()), &mut branch_seen)?;
                    }
                }
                Some(v)
            }
        };

        self.done[id.0] = Some(Entity {
            name: Some(name),
            info,
            doc,
            ifcond: self.b.raw_ifcond(id),
            features,
            kind: EntityKind::Object(ObjectType {
                base,
                local_members,
                members,
                variants,
                is_union,
            }),
        });
        self.states[id.0] = CheckState::Checked;
        Ok(())
    }

    fn check_alternate(&mut self, id: EntityId) -> Result<(), SemanticError> {
        let raw = &self.b.raws[id.0];
        let rv = match &raw.kind {
            RawKind::Alternate { variants } => variants.clone(),
            _ => unreachable!("dispatched on alternate entities"),
        };
        let info = raw.info.clone();
        let name = self.b.raw_name(id).to_owned();
        let doc = raw.doc;
        let features = raw.features.clone();

        self.check_features(&features, info.as_ref())?;
        self.reject_deprecated(&features, info.as_ref())?;

        let variants = self.check_variants(&rv, None)?;

        // Alternate branch names have no relation to the tag enum's
        // values, so clashes are checked here. Each branch must also
        // claim a distinct runtime category, or input could not be
        // told apart.
        let at = entity_info(info.as_ref());
        let mut seen: IndexMap<String, Member> = IndexMap::new();
        let mut types_seen: IndexMap<&'static str, String> = IndexMap::new();
        for v in &variants.variants {
            member_clash(v, at, &mut seen)?;
            let rtype = match self.b.raw_alternate_rtype(v.ty) {
                Some(rtype) => rtype,
                None => {
                    return Err(SemanticError::new(
                        at,
                        format!("{} cannot use {}", v.describe(at), self.b.raw_describe(v.ty)),
                    ));
                }
            };
            let mut conflicting = vec![rtype];
            if rtype == "RTYPE_RSTRING" {
                if let RawKind::Enum { members, .. } = &self.b.raws[v.ty.0].kind {
                    for m in members {
                        if (m.name == "on" || m.name == "off")
                            && !conflicting.contains(&"RTYPE_RBOOL")
                        {
                            conflicting.push("RTYPE_RBOOL");
                        }
                        // lazy, could be tightened
                        if m.name
                            .starts_with(|c: char| c.is_ascii_digit() || "-+.".contains(c))
                            && !conflicting.contains(&"RTYPE_RNUM")
                        {
                            conflicting.push("RTYPE_RNUM");
                        }
                    }
                } else {
                    conflicting.push("RTYPE_RNUM");
                    conflicting.push("RTYPE_RBOOL");
                }
            }
            for rt in conflicting {
                if let Some(prev) = types_seen.get(rt) {
                    return Err(SemanticError::new(
                        at,
                        format!("{} can't be distinguished from '{}'", v.describe(at), prev),
                    ));
                }
                types_seen.insert(rt, v.name.clone());
            }
        }

        self.done[id.0] = Some(Entity {
            name: Some(name),
            info,
            doc,
            ifcond: self.b.raw_ifcond(id),
            features,
            kind: EntityKind::Alternate(AlternateType { variants }),
        });
        Ok(())
    }

    fn check_entity(&mut self, id: EntityId) -> Result<(), SemanticError> {
        if self.done[id.0].is_some() {
            return Ok(());
        }
        match &self.b.raws[id.0].kind {
            RawKind::Object { .. } => return self.check_object(id),
            RawKind::Alternate { .. } => return self.check_alternate(id),
            _ => {}
        }

        let raw = self.b.raws[id.0].clone();
        let info = raw.info.clone();
        self.check_features(&raw.features, info.as_ref())?;

        let kind = match &raw.kind {
            RawKind::Builtin { json_type, c_type } => EntityKind::Builtin(BuiltinType {
                json_type: *json_type,
                c_type,
            }),
            RawKind::Enum { members, prefix } => {
                self.reject_deprecated(&raw.features, info.as_ref())?;
                let mut seen = IndexMap::new();
                for m in members {
                    member_clash(m, entity_info(info.as_ref()), &mut seen)?;
                }
                EntityKind::Enum(EnumType {
                    members: members.clone(),
                    prefix: prefix.clone(),
                })
            }
            RawKind::Array { element_name } => {
                self.reject_deprecated(&raw.features, info.as_ref())?;
                let element = self.resolve_type(element_name, info.as_ref(), || {
                    info.as_ref()
                        .and_then(|i| i.defn_meta())
                        .unwrap_or_default()
                        .to_owned()
                })?;
                // an array's element is never itself an array
                assert!(!matches!(
                    self.b.raws[element.0].kind,
                    RawKind::Array { .. }
                ));
                EntityKind::Array(ArrayType {
                    element,
                    element_name: element_name.clone(),
                })
            }
            RawKind::Command {
                arg_type_name,
                ret_type_name,
                gen,
                success_response,
                boxed,
                allow_oob,
                allow_preconfig,
                coroutine,
            } => {
                let arg_type = match arg_type_name {
                    Some(arg_name) => Some(self.check_arg_type(
                        arg_name,
                        info.as_ref(),
                        *boxed,
                        "command's 'data'",
                    )?),
                    None => None,
                };
                let ret_type = match ret_type_name {
                    Some(ret_name) => {
                        let ret = self.resolve_type(ret_name, info.as_ref(), || {
                            "command's 'returns'".to_owned()
                        })?;
                        let name = self.b.raw_name(id);
                        let excepted = entity_info(info.as_ref())
                            .pragma
                            .command_returns_exceptions
                            .iter()
                            .any(|n| n == name);
                        if !excepted {
                            let inner = match &self.b.raws[ret.0].kind {
                                RawKind::Array { element_name } => self.resolve_type(
                                    element_name,
                                    info.as_ref(),
                                    || "command's 'returns'".to_owned(),
                                )?,
                                _ => ret,
                            };
                            if !matches!(self.b.raws[inner.0].kind, RawKind::Object { .. }) {
                                return Err(SemanticError::new(
                                    entity_info(info.as_ref()),
                                    format!(
                                        "command's 'returns' cannot take {}",
                                        self.b.raw_describe(ret)
                                    ),
                                ));
                            }
                        }
                        Some(ret)
                    }
                    None => None,
                };
                EntityKind::Command(Command {
                    arg_type,
                    ret_type,
                    gen: *gen,
                    success_response: *success_response,
                    boxed: *boxed,
                    allow_oob: *allow_oob,
                    allow_preconfig: *allow_preconfig,
                    coroutine: *coroutine,
                })
            }
            RawKind::Event {
                arg_type_name,
                boxed,
            } => {
                let arg_type = match arg_type_name {
                    Some(arg_name) => Some(self.check_arg_type(
                        arg_name,
                        info.as_ref(),
                        *boxed,
                        "event's 'data'",
                    )?),
                    None => None,
                };
                EntityKind::Event(Event {
                    arg_type,
                    boxed: *boxed,
                })
            }
            RawKind::Include { sub_module } => EntityKind::Include(Include {
                sub_module: sub_module.clone(),
            }),
            RawKind::Object { .. } | RawKind::Alternate { .. } => {
                unreachable!("handled above")
            }
        };

        self.done[id.0] = Some(Entity {
            name: raw.name.clone(),
            info,
            doc: raw.doc,
            ifcond: self.b.raw_ifcond(id),
            features: raw.features.clone(),
            kind,
        });
        Ok(())
    }

    // Arguments are spelled out as parameters unless boxed; types with
    // branches only marshal behind a single pointer, so they require
    // boxing.
    fn check_arg_type(
        &self,
        arg_name: &str,
        info: Option<&SourceInfo>,
        boxed: bool,
        what: &str,
    ) -> Result<EntityId, SemanticError> {
        let arg = self.resolve_type(arg_name, info, || what.to_owned())?;
        let has_variants = match &self.b.raws[arg.0].kind {
            RawKind::Object { variants, .. } => variants.is_some(),
            RawKind::Alternate { .. } => true,
            _ => {
                return Err(SemanticError::new(
                    entity_info(info),
                    format!("{} cannot take {}", what, self.b.raw_describe(arg)),
                ));
            }
        };
        if has_variants && !boxed {
            return Err(SemanticError::new(
                entity_info(info),
                format!(
                    "{} can take {} only with 'boxed': true",
                    what,
                    self.b.raw_describe(arg)
                ),
            ));
        }
        Ok(arg)
    }

    // ---- documentation wiring ----

    fn connect_doc(&self, id: EntityId, docs: &mut [Doc]) {
        let entity = match self.done[id.0].as_ref() {
            Some(entity) => entity,
            None => unreachable!("entities are checked before their docs connect"),
        };
        let di = match entity.doc {
            Some(di) => di,
            None => return,
        };
        for f in &entity.features {
            docs[di].connect_feature(&f.name);
        }
        match &entity.kind {
            EntityKind::Enum(e) => {
                for m in &e.members {
                    docs[di].connect_member(&m.name);
                }
            }
            EntityKind::Object(obj) => {
                if let Some(base) = obj.base {
                    let base_entity = self.done[base.0].as_ref();
                    if base_entity.map(Entity::is_implicit).unwrap_or(false) {
                        self.connect_members_of(base, di, docs);
                    }
                }
                for m in &obj.local_members {
                    Self::connect_member_doc(m, di, docs);
                }
                if let Some(variants) = &obj.variants {
                    for v in &variants.variants {
                        docs[di].connect_member(&v.name);
                    }
                }
            }
            EntityKind::Alternate(alt) => {
                for v in &alt.variants.variants {
                    Self::connect_member_doc(v, di, docs);
                }
            }
            EntityKind::Command(Command {
                arg_type: Some(arg),
                ..
            })
            | EntityKind::Event(Event {
                arg_type: Some(arg),
                ..
            }) => {
                let arg_entity = self.done[arg.0].as_ref();
                if arg_entity.map(Entity::is_implicit).unwrap_or(false) {
                    self.connect_members_of(*arg, di, docs);
                }
            }
            _ => {}
        }
    }

    fn connect_members_of(&self, id: EntityId, di: usize, docs: &mut [Doc]) {
        if let Some(EntityKind::Object(obj)) = self.done[id.0].as_ref().map(|e| &e.kind) {
            for m in &obj.local_members {
                Self::connect_member_doc(m, di, docs);
            }
        }
    }

    fn connect_member_doc(member: &Member, di: usize, docs: &mut [Doc]) {
        docs[di].connect_member(&member.name);
        for f in &member.features {
            docs[di].connect_feature(&f.name);
        }
    }

    fn check_doc(&self, id: EntityId, docs: &[Doc]) -> Result<(), SemanticError> {
        let entity = match self.done[id.0].as_ref() {
            Some(entity) => entity,
            None => unreachable!("entities are checked before their docs"),
        };
        match entity.doc {
            Some(di) => docs[di].check(),
            None => Ok(()),
        }
    }

    // ---- module assignment ----

    fn module_of(&self, id: EntityId) -> String {
        let entity = match self.done[id.0].as_ref() {
            Some(entity) => entity,
            None => unreachable!("entities are checked before module assignment"),
        };
        // arrays live wherever their element does
        let info = match &entity.kind {
            EntityKind::Array(a) => self.b.raws[a.element.0].info.as_ref(),
            _ => entity.info.as_ref(),
        };
        match info {
            Some(info) => self.b.module_name(&info.fname),
            None => Module::BUILTIN_MODULE_NAME.to_owned(),
        }
    }
}

//! # Introspection Backend
//!
//! Emits the wire-level schema description as a literal `RLitObject`
//! tree: one entry per command, event, and every type reachable from
//! them. Types are skipped on the main walk (`visit_needed`) and
//! collected as a work queue while commands and events are visited;
//! `visit_end` then walks the queue, which keeps growing as member
//! types get referenced.
//!
//! Type names are masked as small integers unless `unmask` is set, so
//! clients key on commands and events rather than type names. A
//! comment next to each masked entry maps it back to the source.

use std::path::Path;

use anyhow::Result;
use indexmap::IndexMap;

use crate::common::c_name;
use crate::expr::IfCond;
use crate::gen::MonolithicGen;
use crate::schema::{
    AlternateType, ArrayType, BuiltinType, Command, Entity, EntityId, EntityKind, EnumType, Event,
    Feature, JsonType, Member, ObjectType, Schema, SchemaVisitor,
};

enum Lit {
    Null,
    Str(String),
    Bool(bool),
    List(Vec<Node>),
    Dict(Vec<(String, Node)>),
}

/// A literal tree node with its render decorations.
struct Node {
    lit: Lit,
    ifcond: IfCond,
    comment: Option<String>,
}

impl Node {
    fn new(lit: Lit) -> Node {
        Node {
            lit,
            ifcond: IfCond::none(),
            comment: None,
        }
    }

    fn str(s: impl Into<String>) -> Node {
        Node::new(Lit::Str(s.into()))
    }
}

fn make_tree(lit: Lit, ifcond: &IfCond, features: &[Feature], comment: Option<String>) -> Node {
    let mut lit = lit;
    if !features.is_empty() {
        let feats = features
            .iter()
            .map(|f| {
                let mut node = Node::str(&f.name);
                node.ifcond = f.ifcond.clone();
                node
            })
            .collect();
        match &mut lit {
            Lit::Dict(entries) => entries.push(("features".to_owned(), Node::new(Lit::List(feats)))),
            _ => unreachable!("features only decorate dict trees"),
        }
    }
    Node {
        lit,
        ifcond: ifcond.clone(),
        comment,
    }
}

fn to_c_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn indent(level: usize) -> String {
    " ".repeat(level * 4)
}

fn tree_to_rlit(node: &Node, level: usize, suppress_first_indent: bool) -> String {
    let mut ret = String::new();
    if let Some(comment) = &node.comment {
        ret.push_str(&format!("{}/* {} */\n", indent(level), comment));
    }
    ret.push_str(&node.ifcond.gen_if());

    if !suppress_first_indent {
        ret.push_str(&indent(level));
    }
    match &node.lit {
        Lit::Null => ret.push_str("RLIT_RNULL"),
        Lit::Str(s) => ret.push_str(&format!("RLIT_RSTR({})", to_c_string(s))),
        Lit::Bool(b) => ret.push_str(&format!("RLIT_RBOOL({})", b)),
        Lit::List(elts) => {
            ret.push_str("RLIT_RLIST(((RLitObject[]) {\n");
            for elt in elts {
                ret.push_str(tree_to_rlit(elt, level + 1, false).trim_matches('\n'));
                ret.push('\n');
            }
            ret.push_str(&format!("{}{{}}\n", indent(level + 1)));
            ret.push_str(&format!("{}}}))", indent(level)));
        }
        Lit::Dict(entries) => {
            let mut sorted: Vec<&(String, Node)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            ret.push_str("RLIT_RDICT(((RLitDictEntry[]) {\n");
            for (key, value) in sorted {
                ret.push_str(&format!(
                    "{}{{ {}, {} }},\n",
                    indent(level + 1),
                    to_c_string(key),
                    tree_to_rlit(value, level + 1, true)
                ));
            }
            ret.push_str(&format!("{}{{}}\n", indent(level + 1)));
            ret.push_str(&format!("{}}}))", indent(level)));
        }
    }
    if level > 0 {
        ret.push(',');
    }

    if node.ifcond.is_present() {
        ret.push('\n');
        ret.push_str(&node.ifcond.gen_endif());
    }
    ret
}

struct IntrospectVisitor {
    gen: MonolithicGen,
    prefix: String,
    unmask: bool,
    trees: Vec<Node>,
    used_types: Vec<EntityId>,
    name_map: IndexMap<String, String>,
}

impl IntrospectVisitor {
    fn new(prefix: &str, unmask: bool) -> IntrospectVisitor {
        let mut gen = MonolithicGen::new(
            prefix,
            "ridl-introspect",
            " * RIDL/RPC schema introspection",
        );
        gen.genc.preamble_add(format!(
            "#include \"ridl-compat.h\"\n#include \"{}ridl-introspect.h\"\n",
            prefix
        ));
        IntrospectVisitor {
            gen,
            prefix: prefix.to_owned(),
            unmask,
            trees: vec![],
            used_types: vec![],
            name_map: IndexMap::new(),
        }
    }

    fn mask(&mut self, name: &str) -> String {
        if self.unmask {
            return name.to_owned();
        }
        let next = format!("{}", self.name_map.len());
        self.name_map
            .entry(name.to_owned())
            .or_insert(next)
            .clone()
    }

    fn use_type(&mut self, schema: &Schema, id: EntityId) -> String {
        // the integer flavors all collapse to plain int on the wire
        let mut id = id;
        if schema[id].json_type() == JsonType::Int {
            id = match schema.lookup_type("int") {
                Some(id) => id,
                None => unreachable!("int is predefined"),
            };
        } else if let EntityKind::Array(array) = &schema[id].kind {
            if schema[array.element].json_type() == JsonType::Int {
                id = match schema.lookup_type("intList") {
                    Some(id) => id,
                    None => unreachable!("intList is predefined"),
                };
            }
        }
        if !self.used_types.contains(&id) {
            self.used_types.push(id);
        }
        match &schema[id].kind {
            EntityKind::Builtin(_) => schema[id].name().to_owned(),
            EntityKind::Array(array) => format!("[{}]", self.use_type(schema, array.element)),
            _ => self.mask(schema[id].name()),
        }
    }

    fn gen_tree(
        &mut self,
        name: &str,
        mtype: &str,
        mut entries: Vec<(String, Node)>,
        ifcond: &IfCond,
        features: &[Feature],
    ) {
        let mut comment = None;
        let mut name = name.to_owned();
        if !matches!(mtype, "command" | "event" | "builtin" | "array") {
            let masked = self.mask(&name);
            if !self.unmask {
                // map the masked name back to the source when reading
                // the generated output
                comment = Some(format!("\"{}\" = {}", masked, name));
            }
            name = masked;
        }
        entries.push(("name".to_owned(), Node::str(name)));
        entries.push(("meta-type".to_owned(), Node::str(mtype)));
        self.trees
            .push(make_tree(Lit::Dict(entries), ifcond, features, comment));
    }

    fn gen_member(&mut self, schema: &Schema, member: &Member) -> Node {
        let mut entries = vec![
            ("name".to_owned(), Node::str(&member.name)),
            ("type".to_owned(), Node::str(self.use_type(schema, member.ty))),
        ];
        if member.optional {
            entries.push(("default".to_owned(), Node::new(Lit::Null)));
        }
        make_tree(Lit::Dict(entries), &member.ifcond, &member.features, None)
    }

    fn gen_variant(&mut self, schema: &Schema, variant: &Member) -> Node {
        let entries = vec![
            ("case".to_owned(), Node::str(&variant.name)),
            (
                "type".to_owned(),
                Node::str(self.use_type(schema, variant.ty)),
            ),
        ];
        make_tree(Lit::Dict(entries), &variant.ifcond, &[], None)
    }
}

impl SchemaVisitor for IntrospectVisitor {
    fn visit_needed(&mut self, _schema: &Schema, entity: &Entity) -> bool {
        // types wait for the second pass over the work queue
        !entity.is_type()
    }

    fn visit_end(&mut self, schema: &Schema) {
        let mut i = 0;
        while i < self.used_types.len() {
            let id = self.used_types[i];
            schema.visit_entity(id, self);
            i += 1;
        }

        let name = format!("{}ridl_schema_rlit", c_name(&self.prefix, false));
        self.gen.genh.add(format!(
            "\n#include \"rlit.h\"\n\nextern const RLitObject {};\n",
            name
        ));
        let root = Node::new(Lit::List(std::mem::take(&mut self.trees)));
        self.gen.genc.add(format!(
            "\nconst RLitObject {} = {};\n",
            name,
            tree_to_rlit(&root, 0, false)
        ));
    }

    fn visit_builtin_type(&mut self, _schema: &Schema, entity: &Entity, builtin: &BuiltinType) {
        let name = entity.name().to_owned();
        let entries = vec![(
            "json-type".to_owned(),
            Node::str(builtin.json_type.as_str()),
        )];
        self.gen_tree(&name, "builtin", entries, &IfCond::none(), &[]);
    }

    fn visit_enum_type(&mut self, _schema: &Schema, entity: &Entity, enum_type: &EnumType) {
        let name = entity.name().to_owned();
        let ifcond = entity.ifcond.clone();
        let features = entity.features.clone();
        let values = enum_type
            .members
            .iter()
            .map(|m| {
                let mut node = Node::str(&m.name);
                node.ifcond = m.ifcond.clone();
                node
            })
            .collect();
        let entries = vec![("values".to_owned(), Node::new(Lit::List(values)))];
        self.gen_tree(&name, "enum", entries, &ifcond, &features);
    }

    fn visit_array_type(&mut self, schema: &Schema, entity: &Entity, array: &ArrayType) {
        let ifcond = entity.ifcond.clone();
        let element = self.use_type(schema, array.element);
        let entries = vec![("element-type".to_owned(), Node::str(&element))];
        self.gen_tree(&format!("[{}]", element), "array", entries, &ifcond, &[]);
    }

    fn visit_object_type_flat(&mut self, schema: &Schema, entity: &Entity, object: &ObjectType) {
        let name = entity.name().to_owned();
        let ifcond = entity.ifcond.clone();
        let features = entity.features.clone();
        let members = object
            .members
            .iter()
            .map(|m| self.gen_member(schema, m))
            .collect();
        let mut entries = vec![("members".to_owned(), Node::new(Lit::List(members)))];
        if let Some(variants) = &object.variants {
            entries.push((
                "tag".to_owned(),
                Node::str(&variants.tag_member.name),
            ));
            let cases = variants
                .variants
                .iter()
                .map(|v| self.gen_variant(schema, v))
                .collect();
            entries.push(("variants".to_owned(), Node::new(Lit::List(cases))));
        }
        self.gen_tree(&name, "object", entries, &ifcond, &features);
    }

    fn visit_alternate_type(&mut self, schema: &Schema, entity: &Entity, alternate: &AlternateType) {
        let name = entity.name().to_owned();
        let ifcond = entity.ifcond.clone();
        let features = entity.features.clone();
        let members = alternate
            .variants
            .variants
            .iter()
            .map(|v| {
                let entries = vec![(
                    "type".to_owned(),
                    Node::str(self.use_type(schema, v.ty)),
                )];
                make_tree(Lit::Dict(entries), &v.ifcond, &[], None)
            })
            .collect();
        let entries = vec![("members".to_owned(), Node::new(Lit::List(members)))];
        self.gen_tree(&name, "alternate", entries, &ifcond, &features);
    }

    fn visit_command(&mut self, schema: &Schema, entity: &Entity, command: &Command) {
        let name = entity.name().to_owned();
        let ifcond = entity.ifcond.clone();
        let features = entity.features.clone();
        let arg_type = command.arg_type.unwrap_or(schema.the_empty_object_type());
        let ret_type = command.ret_type.unwrap_or(schema.the_empty_object_type());
        let mut entries = vec![
            ("arg-type".to_owned(), Node::str(self.use_type(schema, arg_type))),
            ("ret-type".to_owned(), Node::str(self.use_type(schema, ret_type))),
        ];
        if command.allow_oob {
            entries.push(("allow-oob".to_owned(), Node::new(Lit::Bool(true))));
        }
        self.gen_tree(&name, "command", entries, &ifcond, &features);
    }

    fn visit_event(&mut self, schema: &Schema, entity: &Entity, event: &Event) {
        let name = entity.name().to_owned();
        let ifcond = entity.ifcond.clone();
        let features = entity.features.clone();
        let arg_type = event.arg_type.unwrap_or(schema.the_empty_object_type());
        let entries = vec![(
            "arg-type".to_owned(),
            Node::str(self.use_type(schema, arg_type)),
        )];
        self.gen_tree(&name, "event", entries, &ifcond, &features);
    }
}

/// Run the introspection backend over `schema`.
pub fn gen_introspect(
    schema: &Schema,
    output_dir: &Path,
    prefix: &str,
    opt_unmask: bool,
) -> Result<()> {
    let mut vis = IntrospectVisitor::new(prefix, opt_unmask);
    schema.visit(&mut vis);
    vis.gen.write(output_dir)
}

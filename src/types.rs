//! # C Type Declaration Backend
//!
//! Emits the C representation of every schema type: enum typedefs with
//! their string lookup tables, struct declarations (base members
//! inherited in place, variants as a tagged `u` union), array list
//! structs, upcast helpers, and the `ridl_free_T()` cleanup functions.
//!
//! Output goes to one `<prefix>ridl-types` C/H pair per schema module.
//! Variant types must be declared before the union that embeds them,
//! so object emission recurses into branch types first, tracking what
//! has already been written.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::common::{c_enum_const, c_name, c_param};
use crate::gen::{ModularGen, ModuleKind};
use crate::schema::{
    AlternateType, ArrayType, Entity, EntityId, EntityKind, EnumMember, EnumType, Member,
    ObjectType, Schema, SchemaVisitor, Variants,
};
use crate::source::SourceInfo;

pub(crate) fn gen_enum_lookup(name: &str, members: &[EnumMember], prefix: Option<&str>) -> String {
    let mut ret = format!(
        "\nconst REnumLookup {}_lookup = {{\n    .array = (const char *const[]) {{\n",
        c_name(name, true)
    );
    for memb in members {
        ret.push_str(&memb.ifcond.gen_if());
        let index = c_enum_const(name, &memb.name, prefix);
        ret.push_str(&format!("        [{}] = \"{}\",\n", index, memb.name));
        ret.push_str(&memb.ifcond.gen_endif());
    }
    ret.push_str(&format!(
        "    }},\n    .size = {}\n}};\n",
        c_enum_const(name, "_MAX", prefix)
    ));
    ret
}

pub(crate) fn gen_enum(name: &str, members: &[EnumMember], prefix: Option<&str>) -> String {
    let mut ret = format!("\ntypedef enum {} {{\n", c_name(name, true));
    for memb in members {
        ret.push_str(&memb.ifcond.gen_if());
        ret.push_str(&format!(
            "    {},\n",
            c_enum_const(name, &memb.name, prefix)
        ));
        ret.push_str(&memb.ifcond.gen_endif());
    }
    // automatically generated _MAX value closes the enumeration
    ret.push_str(&format!("    {},\n", c_enum_const(name, "_MAX", prefix)));
    ret.push_str(&format!("}} {};\n", c_name(name, true)));
    ret.push_str(&format!(
        "\n#define {0}_str(val) \\\n    ridl_enum_lookup(&{0}_lookup, (val))\n\nextern const REnumLookup {0}_lookup;\n",
        c_name(name, true)
    ));
    ret
}

fn gen_fwd_object_or_array(name: &str) -> String {
    format!("\ntypedef struct {0} {0};\n", c_name(name, true))
}

fn gen_array(name: &str, schema: &Schema, element: EntityId) -> String {
    format!(
        "\nstruct {0} {{\n    {0} *next;\n    {1};\n}};\n",
        c_name(name, true),
        c_param(&schema[element].c_type(), "value")
    )
}

fn gen_struct_members(schema: &Schema, members: &[Member]) -> String {
    let mut ret = String::new();
    for memb in members {
        ret.push_str(&memb.ifcond.gen_if());
        if memb.optional {
            ret.push_str(&format!("    bool has_{};\n", c_name(&memb.name, true)));
        }
        ret.push_str(&format!(
            "    {};\n",
            c_param(&schema[memb.ty].c_type(), &c_name(&memb.name, true))
        ));
        ret.push_str(&memb.ifcond.gen_endif());
    }
    ret
}

fn gen_variants(schema: &Schema, variants: &Variants) -> String {
    let mut ret = format!(
        "    union {{ /* union tag is @{} */\n",
        c_name(&variants.tag_member.name, true)
    );
    for var in &variants.variants {
        if schema[var.ty].name() == "q_empty" {
            continue;
        }
        ret.push_str(&var.ifcond.gen_if());
        ret.push_str(&format!(
            "        {};\n",
            c_param(&schema[var.ty].c_unboxed_type(), &c_name(&var.name, true))
        ));
        ret.push_str(&var.ifcond.gen_endif());
    }
    ret.push_str("    } u;\n");
    ret
}

fn gen_upcast(name: &str, base: &Entity) -> String {
    // C makes const-correctness ugly. Cast away const so the helper
    // works for both const and non-const obj.
    format!(
        "\nstatic inline {1} *ridl_{0}_base(const {0} *obj)\n{{\n    return ({1} *)obj;\n}}\n",
        c_name(name, true),
        base.c_name()
    )
}

fn gen_type_cleanup_decl(name: &str) -> String {
    format!("\nvoid ridl_free_{0}({0} *obj);\n", c_name(name, true))
}

fn gen_type_cleanup(name: &str) -> String {
    format!(
        "\nvoid ridl_free_{0}({0} *obj)\n\
         {{\n\
         \x20   Visitor *v;\n\
         \n\
         \x20   if (!obj) {{\n\
         \x20       return;\n\
         \x20   }}\n\
         \n\
         \x20   v = ridl_dealloc_visitor_new();\n\
         \x20   visit_type_{0}(v, NULL, &obj, NULL);\n\
         \x20   visit_free(v);\n\
         }}\n",
        c_name(name, true)
    )
}

struct TypesVisitor {
    gen: ModularGen,
    objects_seen: HashSet<String>,
}

impl TypesVisitor {
    fn new(prefix: &str) -> TypesVisitor {
        TypesVisitor {
            gen: ModularGen::new(
                prefix,
                "ridl-types",
                " * Schema-defined RIDL types",
                Some(" * Built-in RIDL types"),
            ),
            objects_seen: HashSet::new(),
        }
    }

    fn begin_builtin_module(&mut self) {
        self.gen.genc().preamble_add(
            "#include \"ridl-compat.h\"\n\
             #include \"ridl-dealloc-visitor.h\"\n\
             #include \"ridl-builtin-types.h\"\n\
             #include \"ridl-builtin-visit.h\"\n",
        );
        self.gen.genh().preamble_add("#include \"util.h\"\n");
    }

    fn begin_user_module(&mut self, name: &str) {
        let types = self.gen.module_basename("ridl-types", name);
        let visit = self.gen.module_basename("ridl-visit", name);
        self.gen.genc().preamble_add(format!(
            "#include \"ridl-compat.h\"\n\
             #include \"ridl-dealloc-visitor.h\"\n\
             #include \"{}.h\"\n\
             #include \"{}.h\"\n",
            types, visit
        ));
        self.gen
            .genh()
            .preamble_add("#include \"ridl-builtin-types.h\"\n");
    }

    fn gen_type_cleanup(&mut self, name: &str) {
        self.gen.genh().add(gen_type_cleanup_decl(name));
        self.gen.genc().add(gen_type_cleanup(name));
    }

    // Emit the struct declaration, branch types first. Anything
    // already declared in this run is skipped.
    fn gen_object(
        &mut self,
        schema: &Schema,
        name: &str,
        ifcond: &crate::expr::IfCond,
        base: Option<EntityId>,
        members: &[Member],
        variants: Option<&Variants>,
    ) -> String {
        if !self.objects_seen.insert(name.to_owned()) {
            return String::new();
        }
        let mut ret = String::new();
        if let Some(variants) = variants {
            for var in &variants.variants {
                let ent = &schema[var.ty];
                if let EntityKind::Object(obj) = &ent.kind {
                    let name = ent.name().to_owned();
                    let ifcond = ent.ifcond.clone();
                    let (base, local, vars) =
                        (obj.base, obj.local_members.clone(), obj.variants.clone());
                    ret.push_str(&self.gen_object(
                        schema,
                        &name,
                        &ifcond,
                        base,
                        &local,
                        vars.as_ref(),
                    ));
                }
            }
        }

        ret.push('\n');
        ret.push_str(&ifcond.gen_if());
        ret.push_str(&format!("struct {} {{\n", c_name(name, true)));

        if let Some(base_id) = base {
            let base_ent = &schema[base_id];
            let base_obj = match &base_ent.kind {
                EntityKind::Object(obj) => obj,
                _ => unreachable!("base types are object types"),
            };
            if !base_ent.is_implicit() {
                ret.push_str(&format!(
                    "    /* Members inherited from {}: */\n",
                    base_ent.c_name()
                ));
            }
            ret.push_str(&gen_struct_members(schema, &base_obj.members));
            if !base_ent.is_implicit() {
                ret.push_str("    /* Own members: */\n");
            }
        }
        ret.push_str(&gen_struct_members(schema, members));
        if let Some(variants) = variants {
            ret.push_str(&gen_variants(schema, variants));
        }

        // Make sure that all structs have at least one member; this
        // avoids mallocing space for zero-length structs in C, and an
        // empty struct is size 1 in C++.
        let base_empty = base.map(|b| schema[b].is_empty()).unwrap_or(true);
        if base_empty && members.is_empty() && variants.is_none() {
            ret.push_str("    char ridl_dummy_for_empty_struct;\n");
        }

        ret.push_str("};\n");
        ret.push_str(&ifcond.gen_endif());
        ret
    }
}

impl SchemaVisitor for TypesVisitor {
    fn visit_begin(&mut self, schema: &Schema) {
        // object emission is recursive, keep it off the empty type
        self.objects_seen
            .insert(schema[schema.the_empty_object_type()].name().to_owned());
    }

    fn visit_module(&mut self, _schema: &Schema, name: &str) {
        match self.gen.enter_module(name) {
            ModuleKind::Builtin => self.begin_builtin_module(),
            ModuleKind::User => self.begin_user_module(name),
            ModuleKind::Skipped => {}
        }
    }

    fn visit_include(&mut self, _schema: &Schema, sub_module: &str, _info: &SourceInfo) {
        self.gen.include_sub_module(sub_module);
    }

    fn visit_enum_type(&mut self, _schema: &Schema, entity: &Entity, enum_type: &EnumType) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().preamble_add(gen_enum(
            &name,
            &enum_type.members,
            enum_type.prefix.as_deref(),
        ));
        self.gen.genc().add(gen_enum_lookup(
            &name,
            &enum_type.members,
            enum_type.prefix.as_deref(),
        ));
        self.gen.end_if();
    }

    fn visit_array_type(&mut self, schema: &Schema, entity: &Entity, array: &ArrayType) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().preamble_add(gen_fwd_object_or_array(&name));
        self.gen.genh().add(gen_array(&name, schema, array.element));
        self.gen_type_cleanup(&name);
        self.gen.end_if();
    }

    fn visit_object_type(&mut self, schema: &Schema, entity: &Entity, object: &ObjectType) {
        let name = entity.name().to_owned();
        // nothing to do for the special empty builtin
        if name == "q_empty" {
            return;
        }
        self.gen.genh().start_if(&entity.ifcond);
        self.gen.genh().preamble_add(gen_fwd_object_or_array(&name));
        self.gen.genh().end_if();

        let decl = self.gen_object(
            schema,
            &name,
            &entity.ifcond,
            object.base,
            &object.local_members,
            object.variants.as_ref(),
        );
        self.gen.genh().add(decl);

        self.gen.start_if(&entity.ifcond);
        if let Some(base_id) = object.base {
            if !schema[base_id].is_implicit() {
                self.gen.genh().add(gen_upcast(&name, &schema[base_id]));
            }
        }
        self.gen_type_cleanup(&name);
        self.gen.end_if();
    }

    fn visit_alternate_type(&mut self, schema: &Schema, entity: &Entity, alternate: &AlternateType) {
        let name = entity.name().to_owned();
        self.gen.genh().start_if(&entity.ifcond);
        self.gen.genh().preamble_add(gen_fwd_object_or_array(&name));
        self.gen.genh().end_if();

        let tag = vec![alternate.variants.tag_member.clone()];
        let decl = self.gen_object(
            schema,
            &name,
            &entity.ifcond,
            None,
            &tag,
            Some(&alternate.variants),
        );
        self.gen.genh().add(decl);

        self.gen.start_if(&entity.ifcond);
        self.gen_type_cleanup(&name);
        self.gen.end_if();
    }
}

/// Run the type declaration backend over `schema`.
pub fn gen_types(schema: &Schema, output_dir: &Path, prefix: &str, opt_builtins: bool) -> Result<()> {
    let mut vis = TypesVisitor::new(prefix);
    schema.visit(&mut vis);
    vis.gen.write(output_dir, opt_builtins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    fn generate(text: &str, builtins: bool) -> tempfile::TempDir {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{}", text).unwrap();
        let schema = Schema::load(file.path()).unwrap();
        let dir = tempdir().unwrap();
        gen_types(&schema, dir.path(), "test-", builtins).unwrap();
        dir
    }

    fn read(dir: &tempfile::TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_enum_output() {
        let dir = generate("{ 'enum': 'Color', 'data': [ 'red', 'dark-red' ] }\n", false);
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("typedef enum Color {"), "{}", h);
        assert!(h.contains("    COLOR_RED,\n    COLOR_DARK_RED,\n    COLOR__MAX,\n"), "{}", h);
        assert!(h.contains("extern const REnumLookup Color_lookup;"), "{}", h);
        let c = read(&dir, "test-ridl-types.c");
        assert!(c.contains("[COLOR_DARK_RED] = \"dark-red\","), "{}", c);
        assert!(c.contains(".size = COLOR__MAX"), "{}", c);
    }

    #[test]
    fn test_struct_output() {
        let dir = generate(
            "{ 'enum': 'Color', 'data': [ 'red' ] }\n\
             { 'struct': 'Point', 'data': { 'x': 'int', 'y': 'int', '*label': 'Color' } }\n",
            false,
        );
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("typedef struct Point Point;"), "{}", h);
        assert!(h.contains("struct Point {\n    int64_t x;\n    int64_t y;\n    bool has_label;\n    Color label;\n};"), "{}", h);
        assert!(h.contains("void ridl_free_Point(Point *obj);"), "{}", h);
        let c = read(&dir, "test-ridl-types.c");
        assert!(c.contains("v = ridl_dealloc_visitor_new();"), "{}", c);
    }

    #[test]
    fn test_base_and_upcast() {
        let dir = generate(
            "{ 'struct': 'Base', 'data': { 'a': 'int' } }\n\
             { 'struct': 'Sub', 'base': 'Base', 'data': { 'b': 'str' } }\n",
            false,
        );
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("    /* Members inherited from Base: */\n    int64_t a;\n    /* Own members: */\n    char *b;\n"), "{}", h);
        assert!(h.contains("static inline Base *ridl_Sub_base(const Sub *obj)"), "{}", h);
    }

    #[test]
    fn test_union_variants_after_branches() {
        let dir = generate(
            "{ 'struct': 'One', 'data': { 'x': 'int' } }\n\
             { 'enum': 'Tag', 'data': [ 'one', 'other' ] }\n\
             { 'union': 'Choice', 'base': { 'tag': 'Tag' }, 'discriminator': 'tag',\n\
               'data': { 'one': 'One' } }\n",
            false,
        );
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("union { /* union tag is @tag */\n        One one;\n    } u;"), "{}", h);
        // the q_empty branch for 'other' is not part of the union
        assert!(!h.contains("q_empty other"), "{}", h);
        // the implicit base struct is declared before the union uses it
        let base = h.find("struct q_obj_Choice_base {").unwrap();
        let union_decl = h.find("struct Choice {").unwrap();
        assert!(base < union_decl);
    }

    #[test]
    fn test_empty_struct_dummy_member() {
        let dir = generate("{ 'struct': 'Nothing', 'data': {} }\n", false);
        let h = read(&dir, "test-ridl-types.h");
        assert!(
            h.contains("struct Nothing {\n    char ridl_dummy_for_empty_struct;\n};"),
            "{}",
            h
        );
    }

    #[test]
    fn test_conditional_type_wrapped() {
        let dir = generate(
            "{ 'struct': 'Gadget', 'data': {}, 'if': 'HAVE_GADGET' }\n",
            false,
        );
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("#if defined(HAVE_GADGET)\nstruct Gadget {"), "{}", h);
        assert!(h.contains("#endif /* defined(HAVE_GADGET) */"), "{}", h);
    }

    #[test]
    fn test_builtins_only_on_request() {
        let dir = generate("{ 'struct': 'Stats', 'data': { 'm': 'int' } }\n", false);
        assert!(!dir.path().join("ridl-builtin-types.h").exists());
        let dir = generate("{ 'struct': 'Stats', 'data': { 'm': 'int' } }\n", true);
        let h = read(&dir, "ridl-builtin-types.h");
        assert!(h.contains("struct strList {"), "{}", h);
        assert!(h.contains("typedef enum RType {"), "{}", h);
    }

    #[test]
    fn test_alternate_output() {
        let dir = generate(
            "{ 'alternate': 'IntOrStr', 'data': { 'i': 'int', 's': 'str' } }\n",
            false,
        );
        let h = read(&dir, "test-ridl-types.h");
        assert!(h.contains("struct IntOrStr {\n    RType type;\n    union { /* union tag is @type */\n        int64_t i;\n        char *s;\n    } u;\n};"), "{}", h);
    }
}

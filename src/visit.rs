//! # Visit Function Backend
//!
//! Emits the `visit_type_T()` functions that walk a C value of each
//! schema type through a `Visitor`. Objects additionally get a
//! `visit_type_T_members()` helper that visits the members without
//! allocating, which the marshaling code and flat union branches call
//! directly. Implicit `q_` object types only get the members helper.

use std::path::Path;

use anyhow::Result;

use crate::common::{c_enum_const, c_name};
use crate::gen::{ModularGen, ModuleKind};
use crate::schema::{
    AlternateType, ArrayType, Entity, EntityKind, EnumType, Member, ObjectType, Schema,
    SchemaVisitor, Variants,
};
use crate::source::SourceInfo;

fn gen_visit_decl(name: &str, scalar: bool) -> String {
    let stars = if scalar { "*" } else { "**" };
    format!(
        "void visit_type_{0}(Visitor *v, const char *name, {0} {1}obj, Error **errp);\n",
        c_name(name, true),
        stars
    )
}

fn gen_visit_members_decl(name: &str) -> String {
    format!(
        "\nvoid visit_type_{0}_members(Visitor *v, {0} *obj, Error **errp);\n",
        c_name(name, true)
    )
}

fn gen_visit_object_members(
    schema: &Schema,
    name: &str,
    base: Option<&Entity>,
    members: &[Member],
    variants: Option<&Variants>,
) -> String {
    let mut ret = format!(
        "\nvoid visit_type_{0}_members(Visitor *v, {0} *obj, Error **errp)\n\
         {{\n\
         \x20   Error *err = NULL;\n\n",
        c_name(name, true)
    );

    if let Some(base) = base {
        ret.push_str(&format!(
            "    visit_type_{0}_members(v, ({0} *)obj, &err);\n\
             \x20   if (err) {{\n\
             \x20       goto out;\n\
             \x20   }}\n",
            base.c_name()
        ));
    }

    for memb in members {
        ret.push_str(&memb.ifcond.gen_if());
        let indent = if memb.optional {
            ret.push_str(&format!(
                "    if (visit_optional(v, \"{}\", &obj->has_{})) {{\n",
                memb.name,
                c_name(&memb.name, true)
            ));
            "    "
        } else {
            ""
        };
        ret.push_str(&format!(
            "{1}    visit_type_{0}(v, \"{2}\", &obj->{3}, &err);\n\
             {1}    if (err) {{\n\
             {1}        goto out;\n\
             {1}    }}\n",
            schema[memb.ty].c_name(),
            indent,
            memb.name,
            c_name(&memb.name, true)
        ));
        if memb.optional {
            ret.push_str("    }\n");
        }
        ret.push_str(&memb.ifcond.gen_endif());
    }

    if let Some(variants) = variants {
        ret.push_str(&format!(
            "    switch (obj->{}) {{\n",
            c_name(&variants.tag_member.name, true)
        ));
        let tag_enum = &schema[variants.tag_member.ty];
        let tag_prefix = match &tag_enum.kind {
            EntityKind::Enum(e) => e.prefix.as_deref(),
            _ => unreachable!("union tags are enum typed"),
        };
        for var in &variants.variants {
            let case = c_enum_const(tag_enum.name(), &var.name, tag_prefix);
            ret.push_str(&var.ifcond.gen_if());
            if schema[var.ty].name() == "q_empty" {
                // valid variant and nothing to do
                ret.push_str(&format!("    case {}:\n        break;\n", case));
            } else {
                ret.push_str(&format!(
                    "    case {}:\n\
                     \x20       visit_type_{}_members(v, &obj->u.{}, &err);\n\
                     \x20       break;\n",
                    case,
                    schema[var.ty].c_name(),
                    c_name(&var.name, true)
                ));
            }
            ret.push_str(&var.ifcond.gen_endif());
        }
        ret.push_str("    default:\n        abort();\n    }\n");
    }

    if base.is_some() || !members.is_empty() || variants.is_some() {
        ret.push_str("\nout:\n");
    }
    ret.push_str("    error_propagate(errp, err);\n}\n");
    ret
}

fn gen_visit_list(name: &str, element: &Entity) -> String {
    format!(
        "\nvoid visit_type_{0}(Visitor *v, const char *name, {0} **obj, Error **errp)\n\
         {{\n\
         \x20   Error *err = NULL;\n\
         \x20   {0} *tail;\n\
         \x20   size_t size = sizeof(**obj);\n\
         \n\
         \x20   visit_start_list(v, name, (GenericList **)obj, size, &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         \n\
         \x20   for (tail = *obj; tail;\n\
         \x20        tail = ({0} *)visit_next_list(v, (GenericList *)tail, size)) {{\n\
         \x20       visit_type_{1}(v, NULL, &tail->value, &err);\n\
         \x20       if (err) {{\n\
         \x20           break;\n\
         \x20       }}\n\
         \x20   }}\n\
         \n\
         \x20   if (!err) {{\n\
         \x20       visit_check_list(v, &err);\n\
         \x20   }}\n\
         \x20   visit_end_list(v, (void **)obj);\n\
         \x20   if (err && visit_is_input(v)) {{\n\
         \x20       ridl_free_{0}(*obj);\n\
         \x20       *obj = NULL;\n\
         \x20   }}\n\
         out:\n\
         \x20   error_propagate(errp, err);\n\
         }}\n",
        c_name(name, true),
        element.c_name()
    )
}

fn gen_visit_enum(name: &str) -> String {
    format!(
        "\nvoid visit_type_{0}(Visitor *v, const char *name, {0} *obj, Error **errp)\n\
         {{\n\
         \x20   int value = *obj;\n\
         \x20   visit_type_enum(v, name, &value, &{0}_lookup, errp);\n\
         \x20   *obj = value;\n\
         }}\n",
        c_name(name, true)
    )
}

fn gen_visit_alternate(schema: &Schema, name: &str, variants: &Variants) -> String {
    let mut ret = format!(
        "\nvoid visit_type_{0}(Visitor *v, const char *name, {0} **obj, Error **errp)\n\
         {{\n\
         \x20   Error *err = NULL;\n\
         \n\
         \x20   visit_start_alternate(v, name, (GenericAlternate **)obj, sizeof(**obj),\n\
         \x20                         &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         \x20   if (!*obj) {{\n\
         \x20       goto out_obj;\n\
         \x20   }}\n\
         \x20   switch ((*obj)->type) {{\n",
        c_name(name, true)
    );

    for var in &variants.variants {
        let var_type = &schema[var.ty];
        let rtype = match var_type.alternate_rtype() {
            Some(rtype) => rtype,
            None => unreachable!("alternate branches map to a runtime type"),
        };
        ret.push_str(&var.ifcond.gen_if());
        ret.push_str(&format!("    case {}:\n", rtype));
        if matches!(var_type.kind, EntityKind::Object(_)) {
            ret.push_str(&format!(
                "        visit_start_struct(v, name, NULL, 0, &err);\n\
                 \x20       if (err) {{\n\
                 \x20           break;\n\
                 \x20       }}\n\
                 \x20       visit_type_{}_members(v, &(*obj)->u.{}, &err);\n\
                 \x20       if (!err) {{\n\
                 \x20           visit_check_struct(v, &err);\n\
                 \x20       }}\n\
                 \x20       visit_end_struct(v, NULL);\n",
                var_type.c_name(),
                c_name(&var.name, true)
            ));
        } else {
            ret.push_str(&format!(
                "        visit_type_{}(v, name, &(*obj)->u.{}, &err);\n",
                var_type.c_name(),
                c_name(&var.name, true)
            ));
        }
        ret.push_str("        break;\n");
        ret.push_str(&var.ifcond.gen_endif());
    }

    ret.push_str(&format!(
        "    case RTYPE_NONE:\n\
         \x20       abort();\n\
         \x20   default:\n\
         \x20       error_setg(&err, QERR_INVALID_PARAMETER_TYPE, name ? name : \"null\",\n\
         \x20                  \"{1}\");\n\
         \x20   }}\n\
         out_obj:\n\
         \x20   visit_end_alternate(v, (void **)obj);\n\
         \x20   if (err && visit_is_input(v)) {{\n\
         \x20       ridl_free_{0}(*obj);\n\
         \x20       *obj = NULL;\n\
         \x20   }}\n\
         out:\n\
         \x20   error_propagate(errp, err);\n\
         }}\n",
        c_name(name, true),
        name
    ));
    ret
}

fn gen_visit_object(name: &str) -> String {
    format!(
        "\nvoid visit_type_{0}(Visitor *v, const char *name, {0} **obj, Error **errp)\n\
         {{\n\
         \x20   Error *err = NULL;\n\
         \n\
         \x20   visit_start_struct(v, name, (void **)obj, sizeof({0}), &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         \x20   if (!*obj) {{\n\
         \x20       goto out_obj;\n\
         \x20   }}\n\
         \x20   visit_type_{0}_members(v, *obj, &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out_obj;\n\
         \x20   }}\n\
         \x20   visit_check_struct(v, &err);\n\
         out_obj:\n\
         \x20   visit_end_struct(v, (void **)obj);\n\
         \x20   if (err && visit_is_input(v)) {{\n\
         \x20       ridl_free_{0}(*obj);\n\
         \x20       *obj = NULL;\n\
         \x20   }}\n\
         out:\n\
         \x20   error_propagate(errp, err);\n\
         }}\n",
        c_name(name, true)
    )
}

struct VisitVisitor {
    gen: ModularGen,
}

impl VisitVisitor {
    fn new(prefix: &str) -> VisitVisitor {
        VisitVisitor {
            gen: ModularGen::new(
                prefix,
                "ridl-visit",
                " * Schema-defined RIDL visitors",
                Some(" * Built-in RIDL visitors"),
            ),
        }
    }

    fn begin_builtin_module(&mut self) {
        self.gen.genc().preamble_add(
            "#include \"ridl-compat.h\"\n\
             #include \"error.h\"\n\
             #include \"ridl-builtin-visit.h\"\n",
        );
        self.gen.genh().preamble_add(
            "#include \"visitor.h\"\n\
             #include \"ridl-builtin-types.h\"\n",
        );
    }

    fn begin_user_module(&mut self, name: &str) {
        let types = self.gen.module_basename("ridl-types", name);
        let visit = self.gen.module_basename("ridl-visit", name);
        self.gen.genc().preamble_add(format!(
            "#include \"ridl-compat.h\"\n\
             #include \"error.h\"\n\
             #include \"qerror.h\"\n\
             #include \"{}.h\"\n",
            visit
        ));
        self.gen.genh().preamble_add(format!(
            "#include \"ridl-builtin-visit.h\"\n\
             #include \"{}.h\"\n",
            types
        ));
    }
}

impl SchemaVisitor for VisitVisitor {
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

    fn visit_enum_type(&mut self, _schema: &Schema, entity: &Entity, _enum_type: &EnumType) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().add(gen_visit_decl(&name, true));
        self.gen.genc().add(gen_visit_enum(&name));
        self.gen.end_if();
    }

    fn visit_array_type(&mut self, schema: &Schema, entity: &Entity, array: &ArrayType) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().add(gen_visit_decl(&name, false));
        self.gen
            .genc()
            .add(gen_visit_list(&name, &schema[array.element]));
        self.gen.end_if();
    }

    fn visit_object_type(&mut self, schema: &Schema, entity: &Entity, object: &ObjectType) {
        let name = entity.name().to_owned();
        // nothing to do for the special empty builtin
        if name == "q_empty" {
            return;
        }
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().add(gen_visit_members_decl(&name));
        self.gen.genc().add(gen_visit_object_members(
            schema,
            &name,
            object.base.map(|id| &schema[id]),
            &object.local_members,
            object.variants.as_ref(),
        ));
        // only explicit types get an allocating visit
        if !name.starts_with("q_") {
            self.gen.genh().add(gen_visit_decl(&name, false));
            self.gen.genc().add(gen_visit_object(&name));
        }
        self.gen.end_if();
    }

    fn visit_alternate_type(&mut self, schema: &Schema, entity: &Entity, alternate: &AlternateType) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().add(gen_visit_decl(&name, false));
        self.gen
            .genc()
            .add(gen_visit_alternate(schema, &name, &alternate.variants));
        self.gen.end_if();
    }
}

/// Run the visit function backend over `schema`.
pub fn gen_visit(schema: &Schema, output_dir: &Path, prefix: &str, opt_builtins: bool) -> Result<()> {
    let mut vis = VisitVisitor::new(prefix);
    schema.visit(&mut vis);
    vis.gen.write(output_dir, opt_builtins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    fn generate(text: &str) -> tempfile::TempDir {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{}", text).unwrap();
        let schema = Schema::load(file.path()).unwrap();
        let dir = tempdir().unwrap();
        gen_visit(&schema, dir.path(), "test-", true).unwrap();
        dir
    }

    fn read(dir: &tempfile::TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_struct_members_and_allocating_visit() {
        let dir = generate(
            "{ 'struct': 'Point', 'data': { 'x': 'int', '*label': 'str' } }\n",
        );
        let h = read(&dir, "test-ridl-visit.h");
        assert!(h.contains("void visit_type_Point_members(Visitor *v, Point *obj, Error **errp);"), "{}", h);
        assert!(h.contains("void visit_type_Point(Visitor *v, const char *name, Point **obj, Error **errp);"), "{}", h);
        let c = read(&dir, "test-ridl-visit.c");
        assert!(c.contains("visit_type_int(v, \"x\", &obj->x, &err);"), "{}", c);
        assert!(c.contains("if (visit_optional(v, \"label\", &obj->has_label)) {"), "{}", c);
        assert!(c.contains("        visit_type_str(v, \"label\", &obj->label, &err);"), "{}", c);
        assert!(c.contains("ridl_free_Point(*obj);"), "{}", c);
    }

    #[test]
    fn test_implicit_type_has_no_allocating_visit() {
        let dir = generate("{ 'command': 'go', 'data': { 'speed': 'int' } }\n");
        let h = read(&dir, "test-ridl-visit.h");
        assert!(h.contains("void visit_type_q_obj_go_arg_members(Visitor *v, q_obj_go_arg *obj, Error **errp);"), "{}", h);
        assert!(!h.contains("visit_type_q_obj_go_arg(Visitor"), "{}", h);
    }

    #[test]
    fn test_union_tag_switch() {
        let dir = generate(
            "{ 'struct': 'One', 'data': { 'x': 'int' } }\n\
             { 'enum': 'Tag', 'data': [ 'one', 'other' ] }\n\
             { 'union': 'Choice', 'base': { 'tag': 'Tag' }, 'discriminator': 'tag',\n\
               'data': { 'one': 'One' } }\n",
        );
        let c = read(&dir, "test-ridl-visit.c");
        assert!(c.contains("switch (obj->tag) {"), "{}", c);
        assert!(c.contains("case TAG_ONE:\n        visit_type_One_members(v, &obj->u.one, &err);\n        break;"), "{}", c);
        assert!(c.contains("case TAG_OTHER:\n        break;"), "{}", c);
        assert!(c.contains("default:\n        abort();"), "{}", c);
        // the implicit base visits before the branch switch
        assert!(c.contains("visit_type_q_obj_Choice_base_members(v, (q_obj_Choice_base *)obj, &err);"), "{}", c);
    }

    #[test]
    fn test_alternate_switch_on_runtime_type() {
        let dir = generate(
            "{ 'struct': 'Obj', 'data': { 'x': 'int' } }\n\
             { 'alternate': 'Alt', 'data': { 'i': 'int', 'o': 'Obj' } }\n",
        );
        let c = read(&dir, "test-ridl-visit.c");
        assert!(c.contains("switch ((*obj)->type) {"), "{}", c);
        assert!(c.contains("case RTYPE_RNUM:\n        visit_type_int(v, name, &(*obj)->u.i, &err);"), "{}", c);
        assert!(c.contains("case RTYPE_RDICT:\n        visit_start_struct(v, name, NULL, 0, &err);"), "{}", c);
        assert!(c.contains("visit_type_Obj_members(v, &(*obj)->u.o, &err);"), "{}", c);
        assert!(c.contains("case RTYPE_NONE:\n        abort();"), "{}", c);
        assert!(c.contains("error_setg(&err, QERR_INVALID_PARAMETER_TYPE, name ? name : \"null\","), "{}", c);
        assert!(c.contains("\"Alt\");"), "{}", c);
    }

    #[test]
    fn test_list_visit() {
        let dir = generate("{ 'struct': 'P', 'data': { 'v': ['P'] } }\n");
        let c = read(&dir, "test-ridl-visit.c");
        assert!(c.contains("void visit_type_PList(Visitor *v, const char *name, PList **obj, Error **errp)"), "{}", c);
        assert!(c.contains("visit_start_list(v, name, (GenericList **)obj, size, &err);"), "{}", c);
        assert!(c.contains("visit_type_P(v, NULL, &tail->value, &err);"), "{}", c);
        // predefined builtin lists land in the shared builtin pair
        let b = read(&dir, "ridl-builtin-visit.c");
        assert!(b.contains("visit_type_int(v, NULL, &tail->value, &err);"), "{}", b);
    }

    #[test]
    fn test_enum_visit_in_scalar_form() {
        let dir = generate("{ 'enum': 'Color', 'data': [ 'red' ] }\n");
        let h = read(&dir, "test-ridl-visit.h");
        assert!(h.contains("void visit_type_Color(Visitor *v, const char *name, Color *obj, Error **errp);"), "{}", h);
        let c = read(&dir, "test-ridl-visit.c");
        assert!(c.contains("visit_type_enum(v, name, &value, &Color_lookup, errp);"), "{}", c);
    }
}

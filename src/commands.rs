//! # Command Marshal Backend
//!
//! Emits one `rpc_NAME()` stub per command: the arguments are packed
//! into a wire dictionary through the output visitor, the call goes
//! out via `ridl_rpc_call()`, and for commands with a return type a
//! shared `rpc_marshal_T()` helper unpacks the `"return"` member
//! through the input visitor. A registry function in the main module
//! registers every stub with its dispatch options.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::common::{c_name, c_param};
use crate::gen::{build_params, CodeBuf, ModularGen, ModuleKind};
use crate::schema::{Command, Entity, EntityId, EntityKind, Schema, SchemaVisitor};
use crate::source::SourceInfo;

fn gen_command_decl(
    schema: &Schema,
    name: &str,
    arg_type: Option<EntityId>,
    boxed: bool,
    ret_type: Option<EntityId>,
    proto: bool,
) -> String {
    let ret_c_type = ret_type
        .map(|id| schema[id].c_type())
        .unwrap_or_else(|| "void".to_owned());
    format!(
        "\n{}({}){}\n",
        c_param(&ret_c_type, &format!("rpc_{}", c_name(name, true))),
        build_params(schema, arg_type, boxed, "Error **errp, void *ctx"),
        if proto { ";" } else { "" }
    )
}

fn gen_marshal_rpc(ret_type: &Entity) -> String {
    format!(
        "\nstatic {1}(RDictRef args, Error **errp, void *ctx)\n\
         {{\n\
         \x20   Error *err = NULL;\n\
         \x20   Visitor *v;\n\
         \x20   RDictRef rret;\n\
         \x20   {2} = {{0}};\n\
         \n\
         \x20   ridl_rpc_call(args, &rret, &err, ctx);\n\
         \x20   if (err) {{\n\
         \x20       error_propagate(errp, err);\n\
         \x20       return ret;\n\
         \x20   }}\n\
         \x20   v = ridl_input_visitor_new(rret);\n\
         \x20   visit_start_struct(v, \"command\", NULL, 0, &err);\n\
         \x20   if (err) {{\n\
         \x20       error_propagate(errp, err);\n\
         \x20       return ret;\n\
         \x20   }}\n\
         \x20   visit_type_{0}(v, \"return\", &ret, &err);\n\
         \x20   error_propagate(errp, err);\n\
         \x20   visit_end_struct(v, NULL);\n\
         \x20   visit_free(v);\n\
         \x20   ridl_release(rret);\n\
         \x20   return ret;\n\
         }}\n",
        ret_type.c_name(),
        c_param(
            &ret_type.c_type(),
            &format!("rpc_marshal_{}", ret_type.c_name())
        ),
        c_param(&ret_type.c_type(), "ret")
    )
}

fn gen_rpc_call(
    schema: &Schema,
    name: &str,
    arg_type: Option<EntityId>,
    boxed: bool,
    ret_type: Option<EntityId>,
) -> String {
    let have_args = boxed
        || arg_type
            .map(|id| !schema[id].is_empty())
            .unwrap_or(false);

    let mut ret = format!(
        "\n{}{{\n\
         \x20   const char *cmdname = \"{}\";\n\
         \x20   RDictRef rargs;\n\
         \x20   Error *err = NULL;\n\
         \x20   Visitor *v = NULL;\n",
        gen_command_decl(schema, name, arg_type, boxed, ret_type, false),
        name
    );

    if let Some(id) = ret_type {
        ret.push_str(&format!(
            "    {} = {{0}};\n",
            c_param(&schema[id].c_type(), "ret")
        ));
    }

    let mut visit_type = String::new();
    if have_args {
        let arg = &schema[arg_type.unwrap()];
        visit_type = format!(
            "visit_type_{}(v, \"arguments\", &argp, &err);",
            arg.c_name()
        );
        if boxed {
            ret.push_str(&format!("    {} *argp = arg;\n", arg.c_name()));
        } else {
            let obj = match &arg.kind {
                EntityKind::Object(obj) => obj,
                _ => unreachable!("unboxed arguments are plain objects"),
            };
            assert!(obj.variants.is_none());
            ret.push_str(&format!("    {} _arg = {{\n", arg.c_name()));
            for memb in &obj.members {
                let c_memb = c_name(&memb.name, true);
                if memb.optional {
                    ret.push_str(&format!("        .has_{0} = has_{0},\n", c_memb));
                }
                // cast away const added by build_params()
                let cast = if schema[memb.ty].name() == "str" {
                    "(char *)"
                } else {
                    ""
                };
                ret.push_str(&format!("        .{0} = {1}{0},\n", c_memb, cast));
            }
            ret.push_str(&format!(
                "    }};\n    {} *argp = &_arg;\n",
                arg.c_name()
            ));
        }
    }

    ret.push_str(&format!(
        "\n\
         \x20   v = ridl_output_visitor_new((RObjectRef *)&rargs);\n\
         \x20   visit_start_struct(v, \"command\", NULL, 0, &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         \x20   visit_type_str(v, \"execute\", (char **)&cmdname, &err);\n\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         {}\
         \x20   if (err) {{\n\
         \x20       goto out;\n\
         \x20   }}\n\
         \x20   visit_end_struct(v, NULL);\n\
         \x20   visit_complete(v, &rargs);\n",
        if visit_type.is_empty() {
            String::new()
        } else {
            format!("    {}\n", visit_type)
        }
    ));

    match ret_type {
        Some(id) => ret.push_str(&format!(
            "    ret = rpc_marshal_{}(rargs, &err, ctx);\n",
            schema[id].c_name()
        )),
        None => ret.push_str("    ridl_rpc_call(rargs, NULL, &err, ctx);\n"),
    }

    ret.push_str(
        "    ridl_release(rargs);\n\
         \n\
         out:\n\
         \x20   error_propagate(errp, err);\n\
         \x20   visit_free(v);\n",
    );
    if ret_type.is_some() {
        ret.push_str("    return ret;\n");
    }
    ret.push_str("}\n");
    ret
}

fn gen_register_command(name: &str, command: &Command) -> String {
    let mut options = vec![];
    if !command.success_response {
        options.push("RCO_NO_SUCCESS_RESP");
    }
    if command.allow_oob {
        options.push("RCO_ALLOW_OOB");
    }
    if command.allow_preconfig {
        options.push("RCO_ALLOW_PRECONFIG");
    }
    if command.coroutine {
        options.push("RCO_COROUTINE");
    }
    if options.is_empty() {
        options.push("RCO_NO_OPTIONS");
    }
    format!(
        "    ridl_register_command(cmds, \"{}\",\n\
         \x20                         rpc_{}, {});\n",
        name,
        c_name(name, true),
        options.join(" | ")
    )
}

fn gen_registry(registry: &str, prefix: &str) -> String {
    format!(
        "\nvoid {}ridl_rpc_init(RidlCommandList *cmds)\n\
         {{\n\
         \x20   RTAILQ_INIT(cmds);\n\
         \n\
         {}\
         }}\n",
        c_name(prefix, false),
        registry
    )
}

struct CommandVisitor {
    gen: ModularGen,
    prefix: String,
    regy: CodeBuf,
    // per-module, the helper is shared between same-typed commands
    visited_ret_types: HashSet<EntityId>,
}

impl CommandVisitor {
    fn new(prefix: &str) -> CommandVisitor {
        CommandVisitor {
            gen: ModularGen::new(
                prefix,
                "ridl-commands",
                " * Schema-defined RIDL/RPC commands",
                None,
            ),
            prefix: prefix.to_owned(),
            regy: CodeBuf::new(),
            visited_ret_types: HashSet::new(),
        }
    }

    fn begin_user_module(&mut self, name: &str) {
        self.visited_ret_types.clear();
        let commands = self.gen.module_basename("ridl-commands", name);
        let types = self.gen.module_basename("ridl-types", name);
        let visit = self.gen.module_basename("ridl-visit", name);
        self.gen.genc().preamble_add(format!(
            "#include \"ridl-compat.h\"\n\
             #include \"ridl-output-visitor.h\"\n\
             #include \"ridl-input-visitor.h\"\n\
             #include \"ridl-dealloc-visitor.h\"\n\
             #include \"error.h\"\n\
             #include \"{}.h\"\n\
             #include \"{}.h\"\n",
            visit, commands
        ));
        self.gen.genh().preamble_add(format!(
            "#include \"{}.h\"\n\
             #include \"ridl-rpc.h\"\n",
            types
        ));
    }
}

impl SchemaVisitor for CommandVisitor {
    fn visit_module(&mut self, _schema: &Schema, name: &str) {
        match self.gen.enter_module(name) {
            ModuleKind::User => self.begin_user_module(name),
            ModuleKind::Builtin | ModuleKind::Skipped => {}
        }
    }

    fn visit_include(&mut self, _schema: &Schema, sub_module: &str, _info: &SourceInfo) {
        self.gen.include_sub_module(sub_module);
    }

    fn visit_end(&mut self, _schema: &Schema) {
        let main_module = match self.gen.main_module() {
            Some(main) => main.to_owned(),
            None => return,
        };
        let decl = format!(
            "\nvoid {}ridl_rpc_init(RidlCommandList *cmds);\n",
            c_name(&self.prefix, false)
        );
        let body = gen_registry(self.regy.get_content(), &self.prefix);
        self.gen.with_module(&main_module, |gen| {
            gen.genh().add(decl);
            gen.genc().add(body);
        });
    }

    fn visit_command(&mut self, schema: &Schema, entity: &Entity, command: &Command) {
        if !command.gen {
            return;
        }
        let name = entity.name().to_owned();
        // The unmarshal helper for a user-defined return type T is
        // emitted under T's condition; the commands' conditions must
        // imply it for the result to compile.
        if let Some(ret_id) = command.ret_type {
            if self.visited_ret_types.insert(ret_id) {
                let ret_ifcond = schema[ret_id].ifcond.clone();
                self.gen.genc().start_if(&ret_ifcond);
                self.gen.genc().add(gen_marshal_rpc(&schema[ret_id]));
                self.gen.genc().end_if();
            }
        }
        self.gen.start_if(&entity.ifcond);
        self.regy.start_if(&entity.ifcond);
        self.gen.genh().add(gen_command_decl(
            schema,
            &name,
            command.arg_type,
            command.boxed,
            command.ret_type,
            true,
        ));
        self.gen.genc().add(gen_rpc_call(
            schema,
            &name,
            command.arg_type,
            command.boxed,
            command.ret_type,
        ));
        self.regy.add(gen_register_command(&name, command));
        self.regy.end_if();
        self.gen.end_if();
    }
}

/// Run the command marshal backend over `schema`.
pub fn gen_commands(schema: &Schema, output_dir: &Path, prefix: &str) -> Result<()> {
    let mut vis = CommandVisitor::new(prefix);
    schema.visit(&mut vis);
    vis.gen.write(output_dir, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    fn generate(text: &str, prefix: &str) -> tempfile::TempDir {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{}", text).unwrap();
        let schema = Schema::load(file.path()).unwrap();
        let dir = tempdir().unwrap();
        gen_commands(&schema, dir.path(), prefix).unwrap();
        dir
    }

    fn read(dir: &tempfile::TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_exploded_arguments() {
        let dir = generate(
            "{ 'command': 'probe', 'data': { 'name': 'str', '*depth': 'int' } }\n",
            "",
        );
        let h = read(&dir, "ridl-commands.h");
        assert!(h.contains("void rpc_probe(const char *name, bool has_depth, int64_t depth, Error **errp, void *ctx);"), "{}", h);
        let c = read(&dir, "ridl-commands.c");
        assert!(c.contains("const char *cmdname = \"probe\";"), "{}", c);
        assert!(c.contains("        .name = (char *)name,\n"), "{}", c);
        assert!(c.contains("        .has_depth = has_depth,\n        .depth = depth,\n"), "{}", c);
        assert!(c.contains("q_obj_probe_arg *argp = &_arg;"), "{}", c);
        assert!(c.contains("visit_type_str(v, \"execute\", (char **)&cmdname, &err);"), "{}", c);
        assert!(c.contains("visit_type_q_obj_probe_arg(v, \"arguments\", &argp, &err);"), "{}", c);
        assert!(c.contains("ridl_rpc_call(rargs, NULL, &err, ctx);"), "{}", c);
    }

    #[test]
    fn test_return_unmarshal_helper_shared() {
        let dir = generate(
            "{ 'struct': 'Info', 'data': { 'x': 'int' } }\n\
             { 'command': 'query-a', 'returns': 'Info' }\n\
             { 'command': 'query-b', 'returns': 'Info' }\n",
            "",
        );
        let c = read(&dir, "ridl-commands.c");
        assert_eq!(
            c.matches("static Info *rpc_marshal_Info(RDictRef args, Error **errp, void *ctx)").count(),
            1,
            "{}",
            c
        );
        assert!(c.contains("visit_type_Info(v, \"return\", &ret, &err);"), "{}", c);
        assert!(c.contains("ret = rpc_marshal_Info(rargs, &err, ctx);"), "{}", c);
        assert!(c.contains("    return ret;\n}"), "{}", c);
    }

    #[test]
    fn test_boxed_arguments() {
        let dir = generate(
            "{ 'struct': 'Opts', 'data': { 'v': 'int' } }\n\
             { 'command': 'go', 'boxed': true, 'data': 'Opts' }\n",
            "",
        );
        let c = read(&dir, "ridl-commands.c");
        assert!(c.contains("void rpc_go(Opts *arg, Error **errp, void *ctx)"), "{}", c);
        assert!(c.contains("Opts *argp = arg;"), "{}", c);
        assert!(c.contains("visit_type_Opts(v, \"arguments\", &argp, &err);"), "{}", c);
    }

    #[test]
    fn test_registry_in_main_module() {
        let dir = generate(
            "{ 'command': 'one' }\n\
             { 'command': 'two', 'success-response': false, 'allow-oob': true }\n\
             { 'command': 'skipped', 'gen': false }\n",
            "demo-",
        );
        let h = read(&dir, "demo-ridl-commands.h");
        assert!(h.contains("void demo_ridl_rpc_init(RidlCommandList *cmds);"), "{}", h);
        let c = read(&dir, "demo-ridl-commands.c");
        assert!(c.contains("void demo_ridl_rpc_init(RidlCommandList *cmds)\n{\n    RTAILQ_INIT(cmds);"), "{}", c);
        assert!(c.contains("ridl_register_command(cmds, \"one\","), "{}", c);
        assert!(c.contains("rpc_one, RCO_NO_OPTIONS);"), "{}", c);
        assert!(c.contains("rpc_two, RCO_NO_SUCCESS_RESP | RCO_ALLOW_OOB);"), "{}", c);
        assert!(!c.contains("rpc_skipped"), "{}", c);
    }

    #[test]
    fn test_conditional_command() {
        let dir = generate(
            "{ 'command': 'maybe', 'if': 'HAVE_MAYBE' }\n",
            "",
        );
        let c = read(&dir, "ridl-commands.c");
        assert!(c.contains("#if defined(HAVE_MAYBE)"), "{}", c);
        let regy = c.find("ridl_rpc_init").unwrap();
        let guarded = &c[regy..];
        assert!(guarded.contains("#if defined(HAVE_MAYBE)"), "{}", c);
    }

    #[test]
    fn test_no_arguments_no_locals() {
        let dir = generate("{ 'command': 'ping' }\n", "");
        let c = read(&dir, "ridl-commands.c");
        assert!(c.contains("void rpc_ping(Error **errp, void *ctx)"), "{}", c);
        assert!(!c.contains("_arg"), "{}", c);
    }
}

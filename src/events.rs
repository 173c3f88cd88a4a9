//! # Event Dispatch Backend
//!
//! Each event gets a handler typedef and a `ridl_event_dispatch_NAME()`
//! function that unpacks the wire payload through the input visitor and
//! calls the handler with exploded (or boxed) arguments. A `dispatch`
//! system module collects the event name enum, a registry struct with
//! one handler slot per event, and the string-keyed dispatcher that
//! routes an incoming event to its registered handler.

use std::path::Path;

use anyhow::Result;

use crate::common::{c_enum_const, c_name};
use crate::expr::IfCond;
use crate::gen::{build_params, ModularGen, ModuleKind};
use crate::schema::{Entity, EntityId, EntityKind, EnumMember, Event, Schema, SchemaVisitor};
use crate::source::SourceInfo;
use crate::types::{gen_enum, gen_enum_lookup};

fn build_handler_name(name: &str) -> String {
    format!("ridl_{}_handler", name.to_lowercase())
}

fn build_event_handler_proto(
    schema: &Schema,
    name: &str,
    arg_type: Option<EntityId>,
    boxed: bool,
) -> String {
    format!(
        "typedef void (*{})({})",
        build_handler_name(name),
        build_params(schema, arg_type, boxed, "")
    )
}

fn gen_event_dispatch_decl(
    schema: &Schema,
    name: &str,
    arg_type: Option<EntityId>,
    boxed: bool,
) -> String {
    format!(
        "\n{};\nvoid ridl_event_dispatch_{}({} handler, RDictRef data);\n",
        build_event_handler_proto(schema, name, arg_type, boxed),
        name,
        build_handler_name(name)
    )
}

// The handler call's argument list, mirroring build_params()
fn gen_call_handler(schema: &Schema, arg_type: Option<EntityId>) -> String {
    let mut ret = String::new();
    let mut sep = "";
    if let Some(id) = arg_type {
        let obj = match &schema[id].kind {
            EntityKind::Object(obj) => obj,
            _ => unreachable!("unboxed arguments are plain objects"),
        };
        assert!(obj.variants.is_none());
        for memb in &obj.members {
            ret.push_str(sep);
            sep = ", ";
            if memb.optional {
                ret.push_str(&format!("arg->has_{}{}", c_name(&memb.name, true), sep));
            }
            ret.push_str(&format!("arg->{}", c_name(&memb.name, true)));
        }
    }
    ret
}

fn gen_event_dispatch(
    schema: &Schema,
    name: &str,
    arg_type: Option<EntityId>,
    boxed: bool,
) -> String {
    let have_args = arg_type
        .map(|id| !schema[id].is_empty())
        .unwrap_or(false);
    assert!(have_args || !boxed);

    let mut ret = format!(
        "\nvoid ridl_event_dispatch_{}({} handler, RDictRef data)\n{{\n",
        name,
        build_handler_name(name)
    );

    if have_args {
        let arg = &schema[arg_type.unwrap()];
        ret.push_str(&format!("    {} *arg;\n    Visitor *v;\n", arg.c_name()));
        ret.push_str("    v = ridl_input_visitor_new(data);\n");
        ret.push_str(&format!(
            "    visit_type_{}(v, \"data\", &arg, &error_abort);\n",
            arg.c_name()
        ));
    }

    ret.push_str(&format!(
        "    handler({});\n\n",
        if boxed {
            "arg".to_owned()
        } else {
            gen_call_handler(schema, arg_type)
        }
    ));

    if have_args {
        let arg = &schema[arg_type.unwrap()];
        ret.push_str(&format!(
            "    visit_free(v);\n\
             \x20   v = ridl_dealloc_visitor_new();\n\
             \x20   visit_type_{}(v, \"unused\", &arg, NULL);\n\
             \x20   visit_free(v);\n",
            arg.c_name()
        ));
    }
    ret.push_str("}\n");
    ret
}

struct RegisteredEvent {
    ifcond: IfCond,
    enum_const: String,
    dispatch_fn: String,
    handler_name: String,
}

fn gen_registry(events: &[RegisteredEvent]) -> String {
    let mut ret = String::from("\ntypedef struct {\n");
    for event in events {
        ret.push_str(&event.ifcond.gen_if());
        ret.push_str(&format!("    {0} {0};\n", event.handler_name));
        ret.push_str(&event.ifcond.gen_endif());
    }
    ret.push_str(
        "} ridl_event_handler_registry;\n\
         \n\
         extern ridl_event_handler_registry ridl_event_handler_registry_data;\n",
    );
    ret
}

fn gen_dispatcher(name: &str, event_enum_name: &str, events: &[RegisteredEvent]) -> String {
    let mut ret = format!(
        "\nvoid {0}(const char *event, RDictRef data)\n\
         {{\n\
         \x20   {1} num;\n\
         \n\
         \x20   num = ({1})ridl_enum_parse(&{1}_lookup, event, 0, &error_abort);\n\
         \x20   switch (num) {{\n\
         \x20       default:\n\
         \x20           assert(0);\n\
         \x20           break;\n",
        name, event_enum_name
    );

    for event in events {
        ret.push_str(&event.ifcond.gen_if());
        ret.push_str(&format!(
            "        case {}:\n\
             \x20           if (ridl_event_handler_registry_data.{1}) {{\n\
             \x20               {2}(ridl_event_handler_registry_data.{1}, data);\n\
             \x20           }}\n\
             \x20           break;\n",
            event.enum_const, event.handler_name, event.dispatch_fn
        ));
        ret.push_str(&event.ifcond.gen_endif());
    }

    ret.push_str("    }\n}\n");
    ret
}

struct EventVisitor {
    gen: ModularGen,
    event_enum_name: String,
    event_dispatch_name: String,
    event_registry: Vec<RegisteredEvent>,
    event_enum_members: Vec<EnumMember>,
}

impl EventVisitor {
    fn new(prefix: &str) -> EventVisitor {
        EventVisitor {
            gen: ModularGen::new(
                prefix,
                "ridl-events",
                " * Schema-defined RIDL/RPC events",
                None,
            ),
            event_enum_name: c_name(&format!("{}RidlEvent", prefix), false),
            event_dispatch_name: c_name(&format!("{}ridl_event_dispatch", prefix), true),
            event_registry: vec![],
            event_enum_members: vec![],
        }
    }

    fn begin_user_module(&mut self, name: &str) {
        let events = self.gen.module_basename("ridl-events", name);
        let types = self.gen.module_basename("ridl-types", name);
        let visit = self.gen.module_basename("ridl-visit", name);
        let dispatch = self.gen.module_basename("ridl-events", "./dispatch");
        self.gen.genc().preamble_add(format!(
            "#include \"ridl-compat.h\"\n\
             #include \"{}.h\"\n\
             #include \"{}.h\"\n\
             #include \"{}.h\"\n\
             #include \"error.h\"\n\
             #include \"ridl-input-visitor.h\"\n\
             #include \"ridl-dealloc-visitor.h\"\n",
            dispatch, events, visit
        ));
        self.gen.genh().preamble_add(format!(
            "#include \"util.h\"\n#include \"{}.h\"\n",
            types
        ));
    }
}

impl SchemaVisitor for EventVisitor {
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
        let dispatch = self.gen.module_basename("ridl-events", "./dispatch");
        let events = self.gen.module_basename("ridl-events", &main_module);
        self.gen
            .add_system_module("dispatch", " * RIDL event dispatch");
        self.gen.genc().preamble_add(format!(
            "#include \"ridl-compat.h\"\n\
             #include \"{}.h\"\n\
             #include \"error.h\"\n",
            dispatch
        ));
        self.gen.genh().preamble_add(format!(
            "#include \"{}.h\"\n#include \"util.h\"\n",
            events
        ));
        self.gen.genh().add(gen_enum(
            &self.event_enum_name,
            &self.event_enum_members,
            None,
        ));
        self.gen.genc().add(gen_enum_lookup(
            &self.event_enum_name,
            &self.event_enum_members,
            None,
        ));
        self.gen.genh().add(gen_registry(&self.event_registry));
        self.gen.genc().add(gen_dispatcher(
            &self.event_dispatch_name,
            &self.event_enum_name,
            &self.event_registry,
        ));
    }

    fn visit_event(&mut self, schema: &Schema, entity: &Entity, event: &Event) {
        let name = entity.name().to_owned();
        self.gen.start_if(&entity.ifcond);
        self.gen.genh().add(gen_event_dispatch_decl(
            schema,
            &name,
            event.arg_type,
            event.boxed,
        ));
        self.gen.genc().add(gen_event_dispatch(
            schema,
            &name,
            event.arg_type,
            event.boxed,
        ));
        self.gen.end_if();
        self.event_registry.push(RegisteredEvent {
            ifcond: entity.ifcond.clone(),
            enum_const: c_enum_const(&self.event_enum_name, &name, None),
            dispatch_fn: format!("ridl_event_dispatch_{}", name),
            handler_name: build_handler_name(&name),
        });
        // the enum member is generated regardless of the condition, to
        // keep the enumeration layout stable
        self.event_enum_members.push(EnumMember {
            name,
            ifcond: IfCond::none(),
            defined_in: self.event_enum_name.clone(),
        });
    }
}

/// Run the event dispatch backend over `schema`.
pub fn gen_events(schema: &Schema, output_dir: &Path, prefix: &str) -> Result<()> {
    let mut vis = EventVisitor::new(prefix);
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
        gen_events(&schema, dir.path(), prefix).unwrap();
        dir
    }

    fn read(dir: &tempfile::TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_handler_and_dispatch() {
        let dir = generate(
            "{ 'event': 'JOB_DONE', 'data': { 'id': 'str', '*code': 'int' } }\n",
            "",
        );
        let h = read(&dir, "ridl-events.h");
        assert!(h.contains("typedef void (*ridl_job_done_handler)(const char *id, bool has_code, int64_t code);"), "{}", h);
        assert!(h.contains("void ridl_event_dispatch_JOB_DONE(ridl_job_done_handler handler, RDictRef data);"), "{}", h);
        let c = read(&dir, "ridl-events.c");
        assert!(c.contains("q_obj_JOB_DONE_arg *arg;"), "{}", c);
        assert!(c.contains("visit_type_q_obj_JOB_DONE_arg(v, \"data\", &arg, &error_abort);"), "{}", c);
        assert!(c.contains("handler(arg->id, arg->has_code, arg->code);"), "{}", c);
        assert!(c.contains("v = ridl_dealloc_visitor_new();"), "{}", c);
    }

    #[test]
    fn test_dataless_event() {
        let dir = generate("{ 'event': 'TICK' }\n", "");
        let h = read(&dir, "ridl-events.h");
        assert!(h.contains("typedef void (*ridl_tick_handler)(void);"), "{}", h);
        let c = read(&dir, "ridl-events.c");
        assert!(c.contains("void ridl_event_dispatch_TICK(ridl_tick_handler handler, RDictRef data)\n{\n    handler();"), "{}", c);
        assert!(!c.contains("visit_free"), "{}", c);
    }

    #[test]
    fn test_dispatch_module() {
        let dir = generate(
            "{ 'event': 'A' }\n{ 'event': 'B', 'if': 'HAVE_B' }\n",
            "demo-",
        );
        let h = read(&dir, "demo-ridl-dispatch-events.h");
        assert!(h.contains("typedef enum demo_RidlEvent {"), "{}", h);
        assert!(h.contains("    DEMO_RIDL_EVENT_A,\n    DEMO_RIDL_EVENT_B,\n    DEMO_RIDL_EVENT__MAX,\n"), "{}", h);
        assert!(h.contains("#if defined(HAVE_B)\n    ridl_b_handler ridl_b_handler;\n#endif /* defined(HAVE_B) */"), "{}", h);
        assert!(h.contains("extern ridl_event_handler_registry ridl_event_handler_registry_data;"), "{}", h);
        let c = read(&dir, "demo-ridl-dispatch-events.c");
        assert!(c.contains("void demo_ridl_event_dispatch(const char *event, RDictRef data)"), "{}", c);
        assert!(c.contains("ridl_enum_parse(&demo_RidlEvent_lookup, event, 0, &error_abort);"), "{}", c);
        assert!(c.contains("case DEMO_RIDL_EVENT_A:\n            if (ridl_event_handler_registry_data.ridl_a_handler) {"), "{}", c);
        assert!(c.contains("ridl_event_dispatch_B(ridl_event_handler_registry_data.ridl_b_handler, data);"), "{}", c);
    }

    #[test]
    fn test_boxed_event() {
        let dir = generate(
            "{ 'struct': 'Payload', 'data': { 'x': 'int' } }\n\
             { 'event': 'GOT', 'boxed': true, 'data': 'Payload' }\n",
            "",
        );
        let h = read(&dir, "ridl-events.h");
        assert!(h.contains("typedef void (*ridl_got_handler)(Payload *arg);"), "{}", h);
        let c = read(&dir, "ridl-events.c");
        assert!(c.contains("visit_type_Payload(v, \"data\", &arg, &error_abort);"), "{}", c);
        assert!(c.contains("handler(arg);"), "{}", c);
    }
}

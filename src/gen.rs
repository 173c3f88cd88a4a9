//! # Generator Backbone
//!
//! Accumulators for generated C source and header files, plus the
//! modular scaffolding shared by the backends.
//!
//! A [`GenFile`] collects a preamble (includes, forward declarations)
//! and a body, and frames them on output: C files get the generated
//! banner and a dummy symbol that keeps empty objects linkable,
//! headers add inclusion guards. Output is only rewritten when the
//! content changed, so downstream build dependencies stay quiet.
//!
//! [`ModularGen`] maintains one C/H pair per schema module and maps
//! module names to file names: the main schema file becomes
//! `<prefix><what>.c/.h`, an included `sub.json` becomes
//! `<prefix><what>-sub.c/.h`, and internal modules splice their name
//! into `what` (`./builtin` turns `ridl-types` into
//! `ridl-builtin-types`, without the prefix).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::common::{c_fname, c_name, c_param, relative_to};
use crate::expr::IfCond;
use crate::schema::{EntityId, EntityKind, Module, Schema};

#[derive(Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Source,
    Header,
}

/// One generated file being accumulated.
pub struct GenFile {
    fname: String,
    blurb: String,
    kind: FileKind,
    preamble: String,
    body: String,
    start_if: Option<(IfCond, usize, usize)>,
}

impl GenFile {
    pub fn c(fname: impl Into<String>, blurb: &str) -> GenFile {
        GenFile::new(fname.into(), blurb, FileKind::Source)
    }

    pub fn h(fname: impl Into<String>, blurb: &str) -> GenFile {
        GenFile::new(fname.into(), blurb, FileKind::Header)
    }

    fn new(fname: String, blurb: &str, kind: FileKind) -> GenFile {
        GenFile {
            fname,
            blurb: blurb.to_owned(),
            kind,
            preamble: String::new(),
            body: String::new(),
            start_if: None,
        }
    }

    pub fn fname(&self) -> &str {
        &self.fname
    }

    pub fn add(&mut self, text: impl AsRef<str>) {
        self.body.push_str(text.as_ref());
    }

    pub fn preamble_add(&mut self, text: impl AsRef<str>) {
        self.preamble.push_str(text.as_ref());
    }

    /// Open a conditional section. Everything added before the
    /// matching [`GenFile::end_if`] goes inside `#if`/`#endif`.
    pub fn start_if(&mut self, ifcond: &IfCond) {
        assert!(self.start_if.is_none());
        self.start_if = Some((ifcond.clone(), self.body.len(), self.preamble.len()));
    }

    pub fn end_if(&mut self) {
        let (ifcond, body_mark, preamble_mark) = match self.start_if.take() {
            Some(marks) => marks,
            None => unreachable!("end_if without start_if"),
        };
        self.body = wrap_ifcond(&ifcond, std::mem::take(&mut self.body), body_mark);
        self.preamble = wrap_ifcond(&ifcond, std::mem::take(&mut self.preamble), preamble_mark);
    }

    pub fn get_content(&self) -> String {
        format!("{}{}{}{}", self.top(), self.preamble, self.body, self.bottom())
    }

    fn top(&self) -> String {
        let mut top = String::from("/* AUTOMATICALLY GENERATED, DO NOT MODIFY */\n\n/*\n");
        top.push_str(self.blurb.trim_matches('\n'));
        top.push_str("\n */\n\n");
        if self.kind == FileKind::Header {
            let guard = c_fname(&self.fname).to_uppercase();
            top.push_str(&format!("#ifndef {}\n#define {}\n\n", guard, guard));
        }
        top
    }

    fn bottom(&self) -> String {
        match self.kind {
            FileKind::Source => format!(
                "\n/* Dummy declaration to prevent empty .o file */\nchar ridl_dummy_{};\n",
                c_fname(&self.fname)
            ),
            FileKind::Header => {
                format!("\n#endif /* {} */\n", c_fname(&self.fname).to_uppercase())
            }
        }
    }

    /// Write the file under `output_dir`, creating directories as
    /// needed. An unchanged file is left alone.
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        if self.fname.starts_with("../") {
            return Ok(());
        }
        let pathname = output_dir.join(&self.fname);
        if let Some(dir) = pathname.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("can't create directory {}", dir.display()))?;
            }
        }
        let text = self.get_content();
        if let Ok(old) = fs::read_to_string(&pathname) {
            if old == text {
                return Ok(());
            }
        }
        fs::write(&pathname, &text)
            .with_context(|| format!("can't write {}", pathname.display()))?;
        Ok(())
    }
}

// Wrap everything past `mark` in #if/#endif. An empty section is
// suppressed entirely, and a leading blank line stays outside so the
// output keeps its chunk spacing.
fn wrap_ifcond(ifcond: &IfCond, text: String, mark: usize) -> String {
    if text.len() == mark {
        return text;
    }
    let (before, added) = text.split_at(mark);
    let mut out = String::with_capacity(text.len() + 64);
    out.push_str(before);
    let added = match added.strip_prefix('\n') {
        Some(rest) => {
            out.push('\n');
            rest
        }
        None => added,
    };
    out.push_str(&ifcond.gen_if());
    out.push_str(added);
    out.push_str(&ifcond.gen_endif());
    out
}

/// Build a C parameter list for a command or event with the given
/// argument type. Boxed arguments collapse into a single `arg`
/// parameter; otherwise each member becomes a parameter, optional ones
/// preceded by their `has_` flag.
pub fn build_params(
    schema: &Schema,
    arg_type: Option<EntityId>,
    boxed: bool,
    extra: &str,
) -> String {
    let mut params = String::new();
    let mut sep = "";
    if boxed {
        let arg = match arg_type {
            Some(id) => &schema[id],
            None => unreachable!("boxed requires an argument type"),
        };
        params.push_str(&c_param(&arg.c_param_type(), "arg"));
        sep = ", ";
    } else if let Some(id) = arg_type {
        let obj = match &schema[id].kind {
            EntityKind::Object(obj) => obj,
            _ => unreachable!("unboxed arguments are plain objects"),
        };
        assert!(obj.variants.is_none());
        for memb in &obj.members {
            params.push_str(sep);
            sep = ", ";
            if memb.optional {
                params.push_str(&format!("bool has_{}, ", c_name(&memb.name, true)));
            }
            params.push_str(&c_param(
                &schema[memb.ty].c_param_type(),
                &c_name(&memb.name, true),
            ));
        }
    }
    if !extra.is_empty() {
        params.push_str(sep);
        params.push_str(extra);
    }
    if params.is_empty() {
        "void".to_owned()
    } else {
        params
    }
}

/// Bare code accumulator, for text that later lands inside another
/// file, such as the command registry collected across modules.
#[derive(Default)]
pub struct CodeBuf {
    text: String,
    start_if: Option<(IfCond, usize)>,
}

impl CodeBuf {
    pub fn new() -> CodeBuf {
        CodeBuf::default()
    }

    pub fn add(&mut self, text: impl AsRef<str>) {
        self.text.push_str(text.as_ref());
    }

    pub fn start_if(&mut self, ifcond: &IfCond) {
        assert!(self.start_if.is_none());
        self.start_if = Some((ifcond.clone(), self.text.len()));
    }

    pub fn end_if(&mut self) {
        let (ifcond, mark) = match self.start_if.take() {
            Some(marks) => marks,
            None => unreachable!("end_if without start_if"),
        };
        self.text = wrap_ifcond(&ifcond, std::mem::take(&mut self.text), mark);
    }

    pub fn get_content(&self) -> &str {
        &self.text
    }
}

/// What [`ModularGen::enter_module`] decided about a module, so the
/// backend can run its begin hook.
pub enum ModuleKind {
    Builtin,
    User,
    Skipped,
}

pub struct GenPair {
    pub c: GenFile,
    pub h: GenFile,
}

/// One C/H pair per schema module, named after the module.
pub struct ModularGen {
    prefix: String,
    what: String,
    user_blurb: String,
    builtin_blurb: Option<String>,
    main_module: Option<String>,
    current: Option<String>,
    modules: IndexMap<String, GenPair>,
}

impl ModularGen {
    pub fn new(
        prefix: &str,
        what: &str,
        user_blurb: &str,
        builtin_blurb: Option<&str>,
    ) -> ModularGen {
        ModularGen {
            prefix: prefix.to_owned(),
            what: what.to_owned(),
            user_blurb: user_blurb.to_owned(),
            builtin_blurb: builtin_blurb.map(str::to_owned),
            main_module: None,
            current: None,
            modules: IndexMap::new(),
        }
    }

    /// The first user module entered, i.e. the root schema file.
    pub fn main_module(&self) -> Option<&str> {
        self.main_module.as_deref()
    }

    pub fn genc(&mut self) -> &mut GenFile {
        let current = match &self.current {
            Some(current) => current,
            None => unreachable!("no current module"),
        };
        &mut self.modules[current].c
    }

    pub fn genh(&mut self) -> &mut GenFile {
        let current = match &self.current {
            Some(current) => current,
            None => unreachable!("no current module"),
        };
        &mut self.modules[current].h
    }

    /// `start_if` on both files of the current module.
    pub fn start_if(&mut self, ifcond: &IfCond) {
        self.genh().start_if(ifcond);
        self.genc().start_if(ifcond);
    }

    pub fn end_if(&mut self) {
        self.genh().end_if();
        self.genc().end_if();
    }

    fn module_dirname(name: &str) -> String {
        if Module::is_user_name(name) {
            if let Some(dir) = Path::new(name).parent() {
                return dir.display().to_string();
            }
        }
        String::new()
    }

    /// The file stem generated output of kind `what` uses for module
    /// `name`. Backends use this to include their sibling outputs.
    pub fn module_basename(&self, what: &str, name: &str) -> String {
        let mut ret = if Module::is_builtin_name(name) {
            String::new()
        } else {
            self.prefix.clone()
        };
        if Module::is_user_name(name) {
            ret.push_str(what);
            if self.main_module.as_deref() != Some(name) {
                let stem = Path::new(name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ret.push('-');
                ret.push_str(&stem);
            }
        } else {
            debug_assert!(Module::is_system_name(name));
            ret.push_str(&what.replace('-', &format!("-{}-", &name[2..])));
        }
        ret
    }

    fn module_filename(&self, what: &str, name: &str) -> String {
        let dir = Self::module_dirname(name);
        if dir.is_empty() {
            self.module_basename(what, name)
        } else {
            format!("{}/{}", dir, self.module_basename(what, name))
        }
    }

    pub fn add_module(&mut self, name: &str, blurb: &str) {
        let basename = self.module_filename(&self.what, name);
        let pair = GenPair {
            c: GenFile::c(format!("{}.c", basename), blurb),
            h: GenFile::h(format!("{}.h", basename), blurb),
        };
        self.modules.insert(name.to_owned(), pair);
        self.current = Some(name.to_owned());
    }

    pub fn add_system_module(&mut self, name: &str, blurb: &str) {
        self.add_module(&format!("./{}", name), blurb);
    }

    /// Switch to `name` for the duration of `body`, then switch back.
    pub fn with_module<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce(&mut Self),
    {
        let old = self.current.replace(name.to_owned());
        body(self);
        self.current = old;
    }

    /// Shared part of the backends' `visit_module`. The caller runs
    /// its begin hook according to the returned kind.
    pub fn enter_module(&mut self, name: &str) -> ModuleKind {
        if Module::is_builtin_name(name) {
            match self.builtin_blurb.clone() {
                Some(blurb) => {
                    self.add_module(name, &blurb);
                    ModuleKind::Builtin
                }
                None => {
                    // The built-in module was not created. No code may
                    // be generated for it.
                    self.current = None;
                    ModuleKind::Skipped
                }
            }
        } else {
            debug_assert!(Module::is_user_name(name));
            if self.main_module.is_none() {
                self.main_module = Some(name.to_owned());
            }
            let blurb = self.user_blurb.clone();
            self.add_module(name, &blurb);
            ModuleKind::User
        }
    }

    /// Shared part of the backends' `visit_include`: make the module's
    /// header pull in the included module's header.
    pub fn include_sub_module(&mut self, sub_module: &str) {
        let target = self.module_filename(&self.what.clone(), sub_module);
        let genh = self.genh();
        let here = Path::new(genh.fname())
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_owned();
        let relname = relative_to(Path::new(&target), &here).display().to_string();
        genh.preamble_add(format!("#include \"{}.h\"\n", relname));
    }

    /// Write every module's pair. The built-in module is shareable
    /// between schemas and only written on request.
    pub fn write(&self, output_dir: &Path, opt_builtins: bool) -> Result<()> {
        for (name, pair) in &self.modules {
            if Module::is_builtin_name(name) && !opt_builtins {
                continue;
            }
            pair.c.write(output_dir)?;
            pair.h.write(output_dir)?;
        }
        Ok(())
    }
}

/// A single C/H pair for output that does not split by module.
pub struct MonolithicGen {
    pub genc: GenFile,
    pub genh: GenFile,
}

impl MonolithicGen {
    pub fn new(prefix: &str, what: &str, blurb: &str) -> MonolithicGen {
        MonolithicGen {
            genc: GenFile::c(format!("{}{}.c", prefix, what), blurb),
            genh: GenFile::h(format!("{}{}.h", prefix, what), blurb),
        }
    }

    pub fn write(&self, output_dir: &Path) -> Result<()> {
        self.genc.write(output_dir)?;
        self.genh.write(output_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    use crate::expr::Cond;

    fn cond(ident: &str) -> IfCond {
        IfCond(Some(Cond::Ident(ident.to_owned())))
    }

    #[test]
    fn test_c_file_framing() {
        let mut genc = GenFile::c("demo-types.c", " * Schema-defined demo types");
        genc.add("int x;\n");
        let content = genc.get_content();
        assert!(content.starts_with("/* AUTOMATICALLY GENERATED, DO NOT MODIFY */\n"));
        assert!(content.contains(" * Schema-defined demo types\n"));
        assert!(content.contains("int x;\n"));
        assert!(content.ends_with("char ridl_dummy_demo_types_c;\n"));
    }

    #[test]
    fn test_h_file_guards() {
        let genh = GenFile::h("demo-types.h", " * blurb");
        let content = genh.get_content();
        assert!(content.contains("#ifndef DEMO_TYPES_H\n#define DEMO_TYPES_H\n"));
        assert!(content.ends_with("\n#endif /* DEMO_TYPES_H */\n"));
    }

    #[test]
    fn test_ifcond_wrapping() {
        let mut gen = GenFile::c("t.c", "");
        gen.add("before\n");
        gen.start_if(&cond("HAVE_IT"));
        gen.add("\nguarded\n");
        gen.end_if();
        let content = gen.get_content();
        // the leading blank line stays outside the conditional
        assert!(
            content.contains("before\n\n#if defined(HAVE_IT)\nguarded\n#endif /* defined(HAVE_IT) */\n"),
            "{}",
            content
        );
    }

    #[test]
    fn test_empty_ifcond_section_suppressed() {
        let mut gen = GenFile::c("t.c", "");
        gen.add("only\n");
        gen.start_if(&cond("NOPE"));
        gen.end_if();
        assert!(!gen.get_content().contains("#if"));
    }

    #[test]
    fn test_preamble_wrapped_independently() {
        let mut gen = GenFile::c("t.c", "");
        gen.start_if(&cond("COND"));
        gen.preamble_add("#include \"x.h\"\n");
        gen.end_if();
        let content = gen.get_content();
        assert!(content.contains("#if defined(COND)\n#include \"x.h\"\n#endif"));
    }

    #[test]
    fn test_write_creates_and_skips_unchanged() {
        let dir = tempdir().unwrap();
        let mut gen = GenFile::c("out/demo.c", "");
        gen.add("int x;\n");
        gen.write(dir.path()).unwrap();
        let path = dir.path().join("out/demo.c");
        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(first, gen.get_content());

        // an unchanged file is not rewritten: make it read-only and
        // write again
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms.clone()).unwrap();
        gen.write(dir.path()).unwrap();
        perms.set_readonly(false);
        fs::set_permissions(&path, perms).unwrap();

        // a stale file is replaced
        fs::write(&path, "stale").unwrap();
        gen.write(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_module_file_names() {
        let mut gen = ModularGen::new("demo-", "ridl-types", " * user", Some(" * builtin"));
        gen.enter_module("./builtin");
        assert_eq!(gen.genc().fname(), "ridl-builtin-types.c");
        gen.enter_module("main.json");
        assert_eq!(gen.genc().fname(), "demo-ridl-types.c");
        gen.enter_module("sub.json");
        assert_eq!(gen.genh().fname(), "demo-ridl-types-sub.h");
    }

    #[test]
    fn test_builtin_module_needs_blurb() {
        let mut gen = ModularGen::new("", "ridl-commands", " * user", None);
        assert!(matches!(gen.enter_module("./builtin"), ModuleKind::Skipped));
        assert!(matches!(gen.enter_module("main.json"), ModuleKind::User));
    }

    #[test]
    fn test_include_sub_module() {
        let mut gen = ModularGen::new("", "ridl-types", " * user", None);
        gen.enter_module("main.json");
        gen.enter_module("sub.json");
        let mut content = String::new();
        gen.with_module("main.json", |gen| {
            gen.include_sub_module("sub.json");
            content = gen.genh().get_content();
        });
        assert!(
            content.contains("#include \"ridl-types-sub.h\"\n"),
            "{}",
            content
        );
    }

    #[test]
    fn test_system_module_write_skips_builtin() {
        let dir = tempdir().unwrap();
        let mut gen = ModularGen::new("", "ridl-types", " * user", Some(" * builtin"));
        gen.enter_module("./builtin");
        gen.enter_module("main.json");
        gen.write(dir.path(), false).unwrap();
        assert!(!dir.path().join("ridl-builtin-types.c").exists());
        assert!(dir.path().join("ridl-types.c").exists());
        gen.write(dir.path(), true).unwrap();
        assert!(dir.path().join("ridl-builtin-types.c").exists());
    }

    fn schema_of(text: &str) -> Schema {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", text).unwrap();
        Schema::load(file.path()).unwrap()
    }

    #[test]
    fn test_build_params() {
        let schema = schema_of(
            "{ 'struct': 'Opts', 'data': { 'name': 'str', '*depth': 'int' } }\n\
             { 'command': 'probe', 'data': { 'name': 'str', '*depth': 'int' } }\n\
             { 'command': 'boxed-probe', 'boxed': true, 'data': 'Opts' }\n",
        );
        let arg = schema.lookup_entity("q_obj_probe-arg");
        assert_eq!(
            build_params(&schema, arg, false, "Error **errp"),
            "const char *name, bool has_depth, int64_t depth, Error **errp"
        );
        let opts = schema.lookup_entity("Opts");
        assert_eq!(
            build_params(&schema, opts, true, "Error **errp"),
            "Opts *arg, Error **errp"
        );
        assert_eq!(build_params(&schema, None, false, ""), "void");
        assert_eq!(build_params(&schema, None, false, "void *ctx"), "void *ctx");
    }
}

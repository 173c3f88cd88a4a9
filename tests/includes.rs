//! Include resolution across files: deduplication, loops, pragma
//! scoping, and module-split output.

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use ridl::schema::{EntityKind, Schema};
use ridl::RidlError;

fn write(dir: &Path, name: &str, text: &str) {
    fs::write(dir.join(name), text).unwrap();
}

#[test]
fn diamond_include_contributes_once() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "main.json",
        "{ 'include': 'left.json' }\n{ 'include': 'right.json' }\n",
    );
    write(dir.path(), "left.json", "{ 'include': 'shared.json' }\n");
    write(dir.path(), "right.json", "{ 'include': 'shared.json' }\n");
    write(dir.path(), "shared.json", "{ 'struct': 'Common', 'data': { 'x': 'int' } }\n");

    let schema = Schema::load(&dir.path().join("main.json")).unwrap();
    let commons = schema
        .entities()
        .filter(|(_, e)| matches!(e.kind, EntityKind::Object(_)))
        .filter(|(_, e)| e.name() == "Common")
        .count();
    assert_eq!(commons, 1);
}

#[test]
fn include_loop_rejected() {
    let dir = tempdir().unwrap();
    write(dir.path(), "a.json", "{ 'include': 'b.json' }\n");
    write(dir.path(), "b.json", "{ 'include': 'a.json' }\n");

    let err = Schema::load(&dir.path().join("a.json")).unwrap_err();
    assert!(
        err.to_string().contains("inclusion loop for a.json"),
        "{}",
        err
    );
}

#[test]
fn unreadable_include_reported_at_directive() {
    let dir = tempdir().unwrap();
    write(dir.path(), "main.json", "{ 'include': 'missing.json' }\n");

    let err = Schema::load(&dir.path().join("main.json")).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("can't read include file"), "{}", msg);
    assert!(msg.contains("main.json:1"), "{}", msg);
}

#[test]
fn pragma_applies_to_included_file_not_back() {
    let dir = tempdir().unwrap();
    // doc-required set inside the include must not leak back out
    write(
        dir.path(),
        "main.json",
        "{ 'include': 'strict.json' }\n{ 'struct': 'Loose', 'data': {} }\n",
    );
    write(
        dir.path(),
        "strict.json",
        "{ 'pragma': { 'doc-required': true } }\n\
         ##\n\
         # @Strict:\n\
         ##\n\
         { 'struct': 'Strict', 'data': {} }\n",
    );
    Schema::load(&dir.path().join("main.json")).unwrap();

    // and an undocumented definition inside the strict file must fail
    write(
        dir.path(),
        "strict.json",
        "{ 'pragma': { 'doc-required': true } }\n{ 'struct': 'Strict', 'data': {} }\n",
    );
    let err = Schema::load(&dir.path().join("main.json")).unwrap_err();
    assert!(matches!(err, RidlError::Semantic(_)), "{}", err);
    assert!(
        err.to_string().contains("documentation comment required"),
        "{}",
        err
    );
    assert!(err.to_string().contains("In struct 'Strict':"), "{}", err);
}

#[test]
fn sub_modules_get_their_own_files() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "main.json",
        "{ 'include': 'extra.json' }\n{ 'struct': 'Main', 'data': { 'x': 'int' } }\n",
    );
    write(
        dir.path(),
        "extra.json",
        "{ 'struct': 'Extra', 'data': { 'y': 'int' } }\n",
    );
    let out = tempdir().unwrap();
    ridl::generate(&dir.path().join("main.json"), out.path(), "demo-", false, false).unwrap();

    let main_h = fs::read_to_string(out.path().join("demo-ridl-types.h")).unwrap();
    let extra_h = fs::read_to_string(out.path().join("demo-ridl-types-extra.h")).unwrap();
    assert!(main_h.contains("struct Main {"), "{}", main_h);
    assert!(!main_h.contains("struct Extra {"), "{}", main_h);
    assert!(extra_h.contains("struct Extra {"), "{}", extra_h);
    // the including module's header pulls in the included one
    assert!(
        main_h.contains("#include \"demo-ridl-types-extra.h\""),
        "{}",
        main_h
    );
}

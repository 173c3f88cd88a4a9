//! # Common Helpers
//!
//! Name mangling from schema identifiers to C identifiers, plus the
//! path arithmetic shared by the include resolver and the module graph.
//!
//! Schema names may contain `-` and `.`; C names may not. `c_name()`
//! maps both to `_` and shields the result from C keywords by prefixing
//! `q_`, which is why the whole `q_` namespace is reserved in schemas.

use std::collections::HashSet;
use std::env;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;

static C_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut words = HashSet::new();
    // ANSI X3J11/88-090, 3.1.1
    words.extend([
        "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
        "enum", "extern", "float", "for", "goto", "if", "int", "long", "register", "return",
        "short", "signed", "sizeof", "static", "struct", "switch", "typedef", "union", "unsigned",
        "void", "volatile", "while",
    ]);
    // ISO/IEC 9899:1999, 6.4.1
    words.extend(["inline", "restrict", "_Bool", "_Complex", "_Imaginary"]);
    // ISO/IEC 9899:2011, 6.4.1
    words.extend([
        "_Alignas",
        "_Alignof",
        "_Atomic",
        "_Generic",
        "_Noreturn",
        "_Static_assert",
        "_Thread_local",
    ]);
    // GCC extensions, excluding _.*
    words.extend(["asm", "typeof"]);
    // C++ ISO/IEC 14882:2003 2.11
    words.extend([
        "bool",
        "catch",
        "class",
        "const_cast",
        "delete",
        "dynamic_cast",
        "explicit",
        "false",
        "friend",
        "mutable",
        "namespace",
        "new",
        "operator",
        "private",
        "protected",
        "public",
        "reinterpret_cast",
        "static_cast",
        "template",
        "this",
        "throw",
        "true",
        "try",
        "typeid",
        "typename",
        "using",
        "virtual",
        "wchar_t",
        // alternative representations
        "and",
        "and_eq",
        "bitand",
        "bitor",
        "compl",
        "not",
        "not_eq",
        "or",
        "or_eq",
        "xor",
        "xor_eq",
    ]);
    // namespace pollution
    words.extend(["unix", "errno", "mips", "sparc", "i386"]);
    words
});

/// Map a schema name to a C identifier.
///
/// `.` and `-` become `_`. With `protect`, names that would collide with
/// a C/C++ keyword or a commonly polluted identifier get a `q_` prefix.
pub fn c_name(name: &str, protect: bool) -> String {
    let mangled: String = name
        .chars()
        .map(|ch| if ch == '.' || ch == '-' { '_' } else { ch })
        .collect();
    if protect && C_KEYWORDS.contains(mangled.as_str()) {
        return format!("q_{}", mangled);
    }
    mangled
}

/// Turn `some-name` or `some_name` into `SomeName`.
pub fn camel_case(name: &str) -> String {
    let mut new_name = String::new();
    let mut first = true;
    for ch in name.chars() {
        if ch == '_' || ch == '-' {
            first = true;
        } else if first {
            new_name.extend(ch.to_uppercase());
            first = false;
        } else {
            new_name.extend(ch.to_lowercase());
        }
    }
    new_name
}

// Mirrors Python str.isupper(): at least one cased character, none lowercase.
fn is_all_upper(value: &str) -> bool {
    let mut cased = false;
    for ch in value.chars() {
        if ch.is_lowercase() {
            return false;
        }
        if ch.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Turn `CamelCase` into `CAMEL_CASE`, keeping existing separators.
///
/// A `_` is inserted where an upper-case letter follows a lower-case one
/// or starts a new word before a lower-case one, so `VncACL` becomes
/// `VNC_ACL` and `InetSocketAddress` becomes `INET_SOCKET_ADDRESS`.
pub fn camel_to_upper(value: &str) -> String {
    let c_fun_str = c_name(value, false);
    if is_all_upper(value) {
        return c_fun_str;
    }

    let chars: Vec<char> = c_fun_str.chars().collect();
    let mut new_name = String::new();
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 && chars[i - 1] != '_' {
            let next_lower = i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase();
            if next_lower || chars[i - 1].is_ascii_lowercase() {
                new_name.push('_');
            }
        }
        new_name.push(ch);
    }
    new_name.to_ascii_uppercase()
}

/// Build the C constant name for an enum member, e.g. `COLOR_DARK_RED`.
/// An explicit `prefix` replaces the mangled type name.
pub fn c_enum_const(type_name: &str, const_name: &str, prefix: Option<&str>) -> String {
    let stem = match prefix {
        Some(p) => camel_to_upper(p),
        None => camel_to_upper(type_name),
    };
    format!("{}_{}", stem, c_name(const_name, false).to_ascii_uppercase())
}

/// Mangle a file name into something usable inside a C identifier,
/// for include guards and per-file dummy symbols.
pub fn c_fname(filename: &str) -> String {
    filename
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Render a C declarator for `name` of type `ty`.
///
/// Pointer types already end in `*` and take no separating space, so
/// `char *` + `value` gives `char *value`.
pub fn c_param(ty: &str, name: &str) -> String {
    if ty.ends_with('*') {
        format!("{}{}", ty, name)
    } else {
        format!("{} {}", ty, name)
    }
}

/// Absolutize `path` against the current directory and normalize `.`
/// and `..` components lexically, without touching the filesystem.
pub fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap_or_else(|_| PathBuf::from("/")).join(path)
    };
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Express `path` relative to `base` (both taken as directories-or-files
/// rooted wherever the process runs), the way the include graph and the
/// module names want it.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path = absolutize(path);
    let base = absolutize(base);
    let mut path_comps = path.components().peekable();
    let mut base_comps = base.components().peekable();
    while let (Some(p), Some(b)) = (path_comps.peek(), base_comps.peek()) {
        if p != b {
            break;
        }
        path_comps.next();
        base_comps.next();
    }
    let mut out = PathBuf::new();
    for _ in base_comps {
        out.push("..");
    }
    for comp in path_comps {
        out.push(comp.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    #[test]
    fn test_c_name_plain() {
        assert_eq!(c_name("foo", true), "foo");
        assert_eq!(c_name("x-foo", true), "x_foo");
        assert_eq!(c_name("a.b-c", false), "a_b_c");
    }

    #[test]
    fn test_c_name_keywords() {
        assert_eq!(c_name("if", true), "q_if");
        assert_eq!(c_name("unix", true), "q_unix");
        assert_eq!(c_name("default", true), "q_default");
        // protection off leaves keywords alone
        assert_eq!(c_name("if", false), "if");
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("dark-red"), "DarkRed");
        assert_eq!(camel_case("my_struct"), "MyStruct");
        assert_eq!(camel_case("ALREADY"), "Already");
    }

    #[test]
    fn test_camel_to_upper() {
        assert_eq!(camel_to_upper("Point"), "POINT");
        assert_eq!(camel_to_upper("InetSocketAddress"), "INET_SOCKET_ADDRESS");
        assert_eq!(camel_to_upper("VncACL"), "VNC_ACL");
        assert_eq!(camel_to_upper("ALL_CAPS"), "ALL_CAPS");
    }

    #[test]
    fn test_c_enum_const() {
        assert_eq!(c_enum_const("Color", "dark-red", None), "COLOR_DARK_RED");
        assert_eq!(c_enum_const("QType", "qstring", Some("QTYPE")), "QTYPE_QSTRING");
    }

    #[test]
    fn test_c_fname() {
        assert_eq!(c_fname("ridl-types.h"), "ridl_types_h");
        assert_eq!(c_fname("sub/mod.json"), "sub_mod_json");
    }

    #[test]
    fn test_c_param() {
        assert_eq!(c_param("char *", "value"), "char *value");
        assert_eq!(c_param("int64_t", "value"), "int64_t value");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/a/b/sub/x.json"), Path::new("/a/b")),
            PathBuf::from("sub/x.json")
        );
        assert_eq!(
            relative_to(Path::new("/a/other/x.json"), Path::new("/a/b")),
            PathBuf::from("../other/x.json")
        );
        assert_eq!(relative_to(Path::new("/a/b"), Path::new("/a/b")), PathBuf::from("."));
    }

    // Random strings over the schema-name alphabet.
    #[derive(Clone, Debug)]
    struct NameChars(String);

    impl Arbitrary for NameChars {
        fn arbitrary(g: &mut Gen) -> Self {
            let alphabet: Vec<char> = "abcdefXYZ0189-_.".chars().collect();
            let len = usize::arbitrary(g) % 12 + 1;
            let mut s = String::new();
            for _ in 0..len {
                s.push(*g.choose(&alphabet).unwrap());
            }
            NameChars(s)
        }
    }

    fn prop_c_name_is_c_identifier_body(name: NameChars) -> bool {
        c_name(&name.0, true)
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    }

    fn prop_camel_to_upper_idempotent(name: NameChars) -> bool {
        let once = camel_to_upper(&name.0);
        camel_to_upper(&once) == once
    }

    #[test]
    fn test_c_name_output_alphabet() {
        QuickCheck::new()
            .tests(200)
            .quickcheck(prop_c_name_is_c_identifier_body as fn(NameChars) -> bool);
    }

    #[test]
    fn test_camel_to_upper_idempotent() {
        QuickCheck::new()
            .tests(200)
            .quickcheck(prop_camel_to_upper_idempotent as fn(NameChars) -> bool);
    }
}

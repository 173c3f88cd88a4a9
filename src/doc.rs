//! Documentation comment blocks.
//!
//! A `##`-delimited comment is parsed line by line into a [`Doc`]: an
//! optional symbol (`@name:` on the first line), a free-form body,
//! `@argument:` sections, feature sections behind a literal `Features:`
//! line, and tagged sections (`Returns:`, `Since:`, `Note:`/`Notes:`,
//! `Example:`/`Examples:`, `TODO:`).
//!
//! Line handling runs a small state machine mirroring where in the
//! block we are. Argument and feature descriptions keep their relative
//! indentation; de-indenting below the marker column is an error.
//! Parse-phase methods report bare message strings so the parser can
//! attach its own position, which is also why doc errors point at the
//! line being read rather than the section start.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SemanticError;
use crate::source::SourceInfo;

static ARG_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^@\S*:\s*").unwrap());
static TAG_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\S*:\s*").unwrap());
static FREEFORM_ARG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(@\S+:)").unwrap());

const SECTION_TAGS: &[&str] = &[
    "Returns:", "Since:",
    // those are often singular or plural
    "Note:", "Notes:", "Example:", "Examples:", "TODO:",
];

fn is_section_tag(name: &str) -> bool {
    SECTION_TAGS.contains(&name)
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|c| c.is_whitespace()).count()
}

/// One stretch of documentation text.
#[derive(Debug, Clone)]
pub struct Section {
    /// Tag name for tagged sections, argument name for argument
    /// sections, `None` for the body and anonymous sections.
    pub name: Option<String>,
    pub text: String,
    indent: usize,
}

impl Section {
    fn new(name: Option<String>, indent: usize) -> Self {
        Section {
            name,
            text: String::new(),
            indent,
        }
    }

    fn append(&mut self, line: &str) -> Result<(), String> {
        let line = line.trim_end();
        let mut stripped = String::new();
        if !line.is_empty() {
            let indent = leading_spaces(line);
            if indent < self.indent {
                return Err(format!(
                    "unexpected de-indent (expected at least {} spaces)",
                    self.indent
                ));
            }
            stripped = line.chars().skip(self.indent).collect();
        }
        self.text.push_str(&stripped);
        self.text.push('\n');
        Ok(())
    }
}

/// Description of one argument or feature.
#[derive(Debug, Clone)]
pub struct ArgSection {
    pub section: Section,
    connected: bool,
}

impl ArgSection {
    fn new(name: String, indent: usize) -> Self {
        ArgSection {
            section: Section::new(Some(name), indent),
            connected: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.section.text
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineMode {
    Body,
    Args,
    Features,
    Various,
}

#[derive(Debug, Clone, PartialEq)]
enum Current {
    Body,
    Arg(String),
    Feature(String),
    Tagged,
}

/// One parsed documentation block.
#[derive(Debug, Clone)]
pub struct Doc {
    pub info: SourceInfo,
    /// `@name:` of the documented definition, `None` for free-form blocks.
    pub symbol: Option<String>,
    pub body: Section,
    pub args: IndexMap<String, ArgSection>,
    pub features: IndexMap<String, ArgSection>,
    pub sections: Vec<Section>,
    mode: LineMode,
    current: Current,
}

impl Doc {
    pub fn new(info: SourceInfo) -> Self {
        Doc {
            info,
            symbol: None,
            body: Section::new(None, 0),
            args: IndexMap::new(),
            features: IndexMap::new(),
            sections: Vec::new(),
            mode: LineMode::Body,
            current: Current::Body,
        }
    }

    fn cur_section_mut(&mut self) -> &mut Section {
        match &self.current {
            Current::Body => &mut self.body,
            Current::Arg(name) => &mut self.args[name.as_str()].section,
            Current::Feature(name) => &mut self.features[name.as_str()].section,
            Current::Tagged => self.sections.last_mut().expect("tagged section exists"),
        }
    }

    fn cur_text(&self) -> &str {
        match &self.current {
            Current::Body => &self.body.text,
            Current::Arg(name) => &self.args[name.as_str()].section.text,
            Current::Feature(name) => &self.features[name.as_str()].section.text,
            Current::Tagged => &self.sections.last().expect("tagged section exists").text,
        }
    }

    /// Feed one `#` comment line, leading `#` included.
    pub fn append(&mut self, line: &str) -> Result<(), String> {
        let line = &line[1..];
        if line.is_empty() {
            return self.append_freeform(line);
        }
        if !line.starts_with(' ') {
            return Err("missing space after #".to_owned());
        }
        let line = &line[1..];
        match self.mode {
            LineMode::Body => self.append_body_line(line),
            LineMode::Args => self.append_args_line(line),
            LineMode::Features => self.append_features_line(line),
            LineMode::Various => self.append_various_line(line),
        }
    }

    /// Close the block at the terminating `##`.
    pub fn end_comment(&mut self) -> Result<(), String> {
        self.end_section()
    }

    fn append_body_line(&mut self, line: &str) -> Result<(), String> {
        let name = line.split(' ').next().unwrap_or("");
        if self.symbol.is_none() && self.body.text.is_empty() && line.starts_with('@') {
            if !line.ends_with(':') {
                return Err("line should end with ':'".to_owned());
            }
            let symbol = &line[1..line.len() - 1];
            if symbol.is_empty() {
                return Err("name required after '@'".to_owned());
            }
            // The name is not validated here; it must match the
            // definition that follows, which is checked later.
            self.symbol = Some(symbol.to_owned());
            Ok(())
        } else if self.symbol.is_some() {
            if name.starts_with('@') && name.ends_with(':') {
                self.mode = LineMode::Args;
                self.append_args_line(line)
            } else if line == "Features:" {
                self.mode = LineMode::Features;
                Ok(())
            } else if is_section_tag(name) {
                self.mode = LineMode::Various;
                self.append_various_line(line)
            } else {
                self.append_freeform(line)
            }
        } else {
            self.append_freeform(line)
        }
    }

    fn append_args_line(&mut self, line: &str) -> Result<(), String> {
        let name = line.split(' ').next().unwrap_or("");
        if name.starts_with('@') && name.ends_with(':') {
            // For "@arg:   first line", the column of 'f' is the indent
            // expected of any continuation line. Re-pad the first line
            // to that column so Section::append treats them alike.
            let (line, indent) = split_marker(&ARG_MARKER, line);
            self.start_args_section(name[1..name.len() - 1].to_owned(), indent)?;
            self.append_freeform(&line)
        } else if is_section_tag(name) {
            self.mode = LineMode::Various;
            self.append_various_line(line)
        } else if self.cur_text().ends_with("\n\n")
            && !line.is_empty()
            && !line.starts_with(|c: char| c.is_whitespace())
        {
            if line == "Features:" {
                self.mode = LineMode::Features;
                return Ok(());
            }
            self.start_section(None, 0)?;
            self.mode = LineMode::Various;
            self.append_various_line(line)
        } else {
            self.append_freeform(line)
        }
    }

    fn append_features_line(&mut self, line: &str) -> Result<(), String> {
        let name = line.split(' ').next().unwrap_or("");
        if name.starts_with('@') && name.ends_with(':') {
            let (line, indent) = split_marker(&ARG_MARKER, line);
            self.start_features_section(name[1..name.len() - 1].to_owned(), indent)?;
            self.append_freeform(&line)
        } else if is_section_tag(name) {
            self.mode = LineMode::Various;
            self.append_various_line(line)
        } else if self.cur_text().ends_with("\n\n")
            && !line.is_empty()
            && !line.starts_with(|c: char| c.is_whitespace())
        {
            self.start_section(None, 0)?;
            self.mode = LineMode::Various;
            self.append_various_line(line)
        } else {
            self.append_freeform(line)
        }
    }

    fn append_various_line(&mut self, line: &str) -> Result<(), String> {
        let name = line.split(' ').next().unwrap_or("");
        if name.starts_with('@') && name.ends_with(':') {
            return Err(format!(
                "'{}' can't follow '{}' section",
                name,
                self.sections[0].name.as_deref().unwrap_or("None")
            ));
        }
        if is_section_tag(name) {
            let (line, indent) = split_marker(&TAG_MARKER, line);
            self.start_section(Some(name[..name.len() - 1].to_owned()), indent)?;
            return self.append_freeform(&line);
        }
        self.append_freeform(line)
    }

    fn start_args_section(&mut self, name: String, indent: usize) -> Result<(), String> {
        if name.is_empty() {
            return Err("invalid parameter name".to_owned());
        }
        if self.args.contains_key(&name) {
            return Err(format!("'{}' parameter name duplicated", name));
        }
        debug_assert!(self.sections.is_empty());
        self.end_section()?;
        self.args.insert(name.clone(), ArgSection::new(name.clone(), indent));
        self.current = Current::Arg(name);
        Ok(())
    }

    fn start_features_section(&mut self, name: String, indent: usize) -> Result<(), String> {
        if name.is_empty() {
            return Err("invalid parameter name".to_owned());
        }
        if self.features.contains_key(&name) {
            return Err(format!("'{}' parameter name duplicated", name));
        }
        debug_assert!(self.sections.is_empty());
        self.end_section()?;
        self.features
            .insert(name.clone(), ArgSection::new(name.clone(), indent));
        self.current = Current::Feature(name);
        Ok(())
    }

    fn start_section(&mut self, name: Option<String>, indent: usize) -> Result<(), String> {
        if let Some(n) = name.as_deref() {
            if (n == "Returns" || n == "Since") && self.has_section(n) {
                return Err(format!("duplicated '{}' section", n));
            }
        }
        self.end_section()?;
        self.sections.push(Section::new(name, indent));
        self.current = Current::Tagged;
        Ok(())
    }

    fn end_section(&mut self) -> Result<(), String> {
        let is_body = self.current == Current::Body;
        let section = self.cur_section_mut();
        section.text = section.text.trim().to_owned();
        // Only the body may end up empty; every other section,
        // anonymous ones included, must have text.
        if !is_body && section.text.is_empty() {
            return Err(format!(
                "empty doc section '{}'",
                section.name.as_deref().unwrap_or("None")
            ));
        }
        Ok(())
    }

    fn append_freeform(&mut self, line: &str) -> Result<(), String> {
        if let Some(caps) = FREEFORM_ARG.captures(line) {
            return Err(format!(
                "'{}' not allowed in free-form documentation",
                &caps[1]
            ));
        }
        self.cur_section_mut().append(line)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name.as_deref() == Some(name))
    }

    /// Mark `name` as a real member, creating an empty section for
    /// members the block left undocumented.
    pub fn connect_member(&mut self, name: &str) {
        self.args
            .entry(name.to_owned())
            .or_insert_with(|| ArgSection::new(name.to_owned(), 0))
            .connected = true;
    }

    /// Same as [`Doc::connect_member`], for features.
    pub fn connect_feature(&mut self, name: &str) {
        self.features
            .entry(name.to_owned())
            .or_insert_with(|| ArgSection::new(name.to_owned(), 0))
            .connected = true;
    }

    /// Cross-checks against the documented expression's kind.
    pub fn check_expr(&self, is_command: bool) -> Result<(), SemanticError> {
        if self.has_section("Returns") && !is_command {
            return Err(SemanticError::new(
                &self.info,
                "'Returns:' is only valid for commands",
            ));
        }
        Ok(())
    }

    /// After all members and features connected: every documented name
    /// must correspond to something real.
    pub fn check(&self) -> Result<(), SemanticError> {
        self.check_connected(&self.args, "member")?;
        self.check_connected(&self.features, "feature")
    }

    fn check_connected(
        &self,
        args: &IndexMap<String, ArgSection>,
        what: &str,
    ) -> Result<(), SemanticError> {
        let bogus: Vec<&str> = args
            .iter()
            .filter(|(_, section)| !section.connected)
            .map(|(name, _)| name.as_str())
            .collect();
        if !bogus.is_empty() {
            return Err(SemanticError::new(
                &self.info,
                format!(
                    "documented {}{} '{}' {} not exist",
                    what,
                    if bogus.len() > 1 { "s" } else { "" },
                    bogus.join("', '"),
                    if bogus.len() > 1 { "do" } else { "does" }
                ),
            ));
        }
        Ok(())
    }
}

// Strip a `@arg:`/`Tag:` marker, returning the re-padded remainder and
// the indent continuation lines must meet.
fn split_marker(marker: &Regex, line: &str) -> (String, usize) {
    let end = marker.find(line).map(|m| m.end()).unwrap_or(0);
    let indent = line[..end].chars().count();
    let rest = &line[end..];
    if rest.is_empty() {
        // Just the header; following lines are not indented.
        (String::new(), 0)
    } else {
        (format!("{}{}", " ".repeat(indent), rest), indent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Pragma;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn doc() -> Doc {
        Doc::new(SourceInfo::new(
            PathBuf::from("schema.json"),
            1,
            None,
            Arc::new(Pragma::default()),
        ))
    }

    fn feed(lines: &[&str]) -> Result<Doc, String> {
        let mut d = doc();
        for line in lines {
            d.append(line)?;
        }
        d.end_comment()?;
        Ok(d)
    }

    #[test]
    fn test_freeform_body() {
        let d = feed(&["# Just some prose.", "#", "# Over two paragraphs."]).unwrap();
        assert_eq!(d.symbol, None);
        assert_eq!(d.body.text, "Just some prose.\n\nOver two paragraphs.");
    }

    #[test]
    fn test_symbol_and_args() {
        let d = feed(&[
            "# @set-color:",
            "#",
            "# Change the painting color.",
            "#",
            "# @color: the new color",
            "#         to apply",
        ])
        .unwrap();
        assert_eq!(d.symbol.as_deref(), Some("set-color"));
        assert_eq!(d.body.text, "Change the painting color.");
        assert_eq!(d.args["color"].text(), "the new color\nto apply");
    }

    #[test]
    fn test_arg_header_without_text() {
        // header-only marker resets the indent requirement
        let d = feed(&["# @cmd:", "#", "# @arg:", "# described below", "# second line"]).unwrap();
        assert_eq!(d.args["arg"].text(), "described below\nsecond line");
    }

    #[test]
    fn test_features_mode() {
        let d = feed(&[
            "# @thing:",
            "#",
            "# Features:",
            "# @fast: does it quickly",
        ])
        .unwrap();
        assert_eq!(d.features["fast"].text(), "does it quickly");
        assert!(d.args.is_empty());
    }

    #[test]
    fn test_tagged_sections() {
        let d = feed(&[
            "# @query-it:",
            "#",
            "# Returns: the answer",
            "#",
            "# Since: 1.1",
        ])
        .unwrap();
        assert!(d.has_section("Returns"));
        let since = d.sections.iter().find(|s| s.name.as_deref() == Some("Since")).unwrap();
        assert_eq!(since.text, "1.1");
    }

    #[test]
    fn test_duplicated_since() {
        let err = feed(&["# @x:", "#", "# Since: 1.0", "#", "# Since: 2.0"]).unwrap_err();
        assert_eq!(err, "duplicated 'Since' section");
    }

    #[test]
    fn test_missing_space_after_hash() {
        let mut d = doc();
        assert_eq!(d.append("#bad").unwrap_err(), "missing space after #");
    }

    #[test]
    fn test_de_indent_rejected() {
        let err = feed(&["# @cmd:", "#", "# @arg:   first line", "#   too shallow"]).unwrap_err();
        assert_eq!(err, "unexpected de-indent (expected at least 8 spaces)");
    }

    #[test]
    fn test_at_name_in_freeform() {
        let err = feed(&["# some text", "# @oops: not here"]).unwrap_err();
        assert_eq!(err, "'@oops:' not allowed in free-form documentation");
    }

    #[test]
    fn test_arg_after_tagged_section() {
        let err = feed(&["# @x:", "#", "# Note: beware", "# @late: nope"]).unwrap_err();
        assert_eq!(err, "'@late:' can't follow 'Note' section");
    }

    #[test]
    fn test_empty_arg_section() {
        let err = feed(&["# @x:", "#", "# @arg:"]).unwrap_err();
        assert_eq!(err, "empty doc section 'arg'");
    }

    #[test]
    fn test_blank_line_opens_anonymous_section() {
        let d = feed(&[
            "# @x:",
            "#",
            "# @arg: stuff",
            "#",
            "# Trailing prose paragraph.",
        ])
        .unwrap();
        assert_eq!(d.sections.len(), 1);
        assert_eq!(d.sections[0].name, None);
        assert_eq!(d.sections[0].text, "Trailing prose paragraph.");
    }

    #[test]
    fn test_connect_and_check() {
        let mut d = feed(&["# @x:", "#", "# @a: documented", "# @b: also documented"]).unwrap();
        d.connect_member("a");
        let err = d.check().unwrap_err();
        assert!(err.to_string().contains("documented member 'b' does not exist"));
        d.connect_member("b");
        d.connect_member("c"); // undocumented member is tolerated
        assert!(d.check().is_ok());
        assert_eq!(d.args["c"].text(), "");
    }

    #[test]
    fn test_returns_only_for_commands() {
        let d = feed(&["# @x:", "#", "# Returns: something"]).unwrap();
        assert!(d.check_expr(true).is_ok());
        let err = d.check_expr(false).unwrap_err();
        assert!(err.to_string().contains("'Returns:' is only valid for commands"));
    }
}

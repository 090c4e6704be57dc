//! Lightweight declaration index over manifest files.
//!
//! Recognises top-level classes, interfaces, type aliases, enums, functions
//! and constants together with their export status, plus the members of
//! classes and interfaces. Parsing is line based and tolerant: anything it
//! does not understand is ignored.

use regex::Regex;
use std::collections::HashMap;

use crate::manifest::Manifest;
use crate::workspace::ProjectTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Class,
    Interface,
    Type,
    Enum,
    Function,
    Const,
}

impl DeclKind {
    /// Whether declarations of this kind carry members.
    #[must_use]
    pub const fn has_members(&self) -> bool {
        matches!(self, Self::Class | Self::Interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Property,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
    pub line: u32,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    pub path: String,
    /// 1-indexed line of the declaration.
    pub line: u32,
    pub exported: bool,
    pub default_export: bool,
    pub members: Vec<Member>,
    /// Line of the closing brace of a class or interface body.
    pub end_line: Option<u32>,
    /// Indentation used by members.
    pub member_indent: String,
}

impl Declaration {
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.kind == MemberKind::Method)
    }
}

/// Declarations across the project, searchable by name and file.
#[derive(Debug, Clone, Default)]
pub struct SymbolIndex {
    decls: Vec<Declaration>,
    by_name: HashMap<String, Vec<usize>>,
    default_exports: HashMap<String, String>,
}

struct Patterns {
    decl: Regex,
    default_ident: Regex,
    method: Regex,
    property: Regex,
}

impl Patterns {
    fn new() -> Option<Self> {
        Some(Self {
            decl: Regex::new(
                r"^(export\s+)?(default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(class|interface|type|enum|function\*?|const|let|var)\s+([A-Za-z_$][\w$]*)",
            )
            .ok()?,
            default_ident: Regex::new(r"^export\s+default\s+([A-Za-z_$][\w$]*)\s*;?\s*$").ok()?,
            method: Regex::new(
                r"^\s*(?:(?:public|private|protected|static|async|readonly|abstract|override|get|set)\s+)*\*?([A-Za-z_$][\w$]*)\s*\??\s*(?:<[^>]*>)?\s*\(",
            )
            .ok()?,
            property: Regex::new(
                r"^\s*(?:(?:public|private|protected|static|readonly|declare)\s+)*([A-Za-z_$][\w$]*)\s*[?!]?\s*[:=]",
            )
            .ok()?,
        })
    }
}

const NOT_MEMBERS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "constructor", "super", "function", "new",
];

impl SymbolIndex {
    /// Index every manifest file currently present in the tree.
    #[must_use]
    pub fn build(manifest: &Manifest, tree: &ProjectTree) -> Self {
        Self::from_sources(
            manifest
                .entries()
                .filter_map(|entry| tree.read_optional(&entry.path).map(|c| (entry.path.clone(), c))),
        )
    }

    /// Index `(path, content)` pairs.
    pub fn from_sources<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut index = Self::default();
        let Some(patterns) = Patterns::new() else {
            return index;
        };
        for (path, content) in sources {
            index.add_file(&patterns, &path, &content);
        }
        index
    }

    fn add_file(&mut self, patterns: &Patterns, path: &str, content: &str) {
        let lines: Vec<&str> = content.lines().collect();
        let mut idx = 0;
        while idx < lines.len() {
            let line = lines[idx];
            let trimmed = line.trim_start();

            if let Some(caps) = patterns.default_ident.captures(trimmed) {
                self.default_exports
                    .insert(path.to_string(), caps[1].to_string());
            }

            // Only top-level declarations.
            if line.starts_with(char::is_whitespace) {
                idx += 1;
                continue;
            }
            let Some(caps) = patterns.decl.captures(trimmed) else {
                idx += 1;
                continue;
            };

            let kind = match caps[3].trim_end_matches('*') {
                "class" => DeclKind::Class,
                "interface" => DeclKind::Interface,
                "type" => DeclKind::Type,
                "enum" => DeclKind::Enum,
                "function" => DeclKind::Function,
                _ => DeclKind::Const,
            };
            let mut decl = Declaration {
                name: caps[4].to_string(),
                kind,
                path: path.to_string(),
                line: line_no(idx),
                exported: caps.get(1).is_some(),
                default_export: caps.get(2).is_some(),
                members: Vec::new(),
                end_line: None,
                member_indent: "  ".to_string(),
            };

            if kind.has_members() {
                let end = scan_body(patterns, &lines, idx, &mut decl);
                decl.end_line = end.map(line_no);
                idx = end.map_or(idx + 1, |e| e + 1);
            } else {
                idx += 1;
            }

            if decl.default_export {
                self.default_exports
                    .insert(path.to_string(), decl.name.clone());
            }
            self.by_name
                .entry(decl.name.clone())
                .or_default()
                .push(self.decls.len());
            self.decls.push(decl);
        }
    }

    /// Preferred declaration for a type or value name: classes and
    /// interfaces first.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        let ids = self.by_name.get(name)?;
        ids.iter()
            .map(|&i| &self.decls[i])
            .find(|d| d.kind.has_members())
            .or_else(|| ids.first().map(|&i| &self.decls[i]))
    }

    /// Declarations of one file.
    pub fn declarations_in<'a, 'p>(
        &'a self,
        path: &'p str,
    ) -> impl Iterator<Item = &'a Declaration> + use<'a, 'p> {
        self.decls.iter().filter(move |d| d.path == path)
    }

    /// Names a file exports by name.
    #[must_use]
    pub fn named_exports(&self, path: &str) -> Vec<&str> {
        self.declarations_in(path)
            .filter(|d| d.exported && !d.default_export)
            .map(|d| d.name.as_str())
            .collect()
    }

    /// Name of a file's default export, if any.
    #[must_use]
    pub fn default_export(&self, path: &str) -> Option<&str> {
        self.default_exports.get(path).map(String::as_str)
    }

    /// Whether a file was indexed at all.
    #[must_use]
    pub fn has_file(&self, path: &str) -> bool {
        self.decls.iter().any(|d| d.path == path) || self.default_exports.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }
}

fn line_no(idx: usize) -> u32 {
    u32::try_from(idx + 1).unwrap_or(u32::MAX)
}

/// Collect members of the body opening at `start` and return the index of
/// its closing line.
fn scan_body(patterns: &Patterns, lines: &[&str], start: usize, decl: &mut Declaration) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut opened = false;
    let mut indent_seen = false;

    for (idx, line) in lines.iter().enumerate().skip(start) {
        let depth_before = depth;
        for ch in strip_strings(line).chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }

        if idx > start && opened && depth_before == 1 {
            let member = patterns
                .method
                .captures(line)
                .map(|c| (c[1].to_string(), MemberKind::Method))
                .or_else(|| {
                    patterns
                        .property
                        .captures(line)
                        .map(|c| (c[1].to_string(), MemberKind::Property))
                });
            if let Some((name, kind)) = member {
                if !NOT_MEMBERS.contains(&name.as_str()) {
                    if !indent_seen {
                        decl.member_indent = line
                            .chars()
                            .take_while(|c| c.is_whitespace())
                            .collect();
                        indent_seen = true;
                    }
                    decl.members.push(Member {
                        name,
                        kind,
                        line: line_no(idx),
                    });
                }
            }
        }

        if opened && depth <= 0 {
            return Some(idx);
        }
    }
    None
}

/// Blank out string literal contents and drop line comments so braces
/// inside them are not counted. Byte offsets before a comment are kept.
pub(crate) fn strip_strings(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                    out.push(ch);
                    continue;
                }
                out.extend(std::iter::repeat_n(' ', ch.len_utf8()));
            }
            None => {
                if ch == '/' && chars.peek() == Some(&'/') {
                    break;
                }
                if matches!(ch, '\'' | '"' | '`') {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

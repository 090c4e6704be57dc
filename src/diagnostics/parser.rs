//! Pass-specific parsing of raw tool output into [`BuildError`]s.
//!
//! # Supported formats
//!
//! - **type-check**: `file(line,col): error TS2322: message` and the pretty
//!   form `file:line:col - error TS2322: message`
//! - **lint**: ESLint unix format `file:line:col: message [Error/rule]`
//! - **build**: type-check lines, `file:line:col: message`, and bundler
//!   `ERROR in ./path` blocks
//! - **test**: jest `FAIL path` lines and `● Suite › test` headers
//! - **install**: `npm ERR!` / `error` lines, always file-less
//!
//! Errors still lacking a file after their pass parser ran go through
//! [`locate_in_message`], which recognises file references embedded in the
//! message body.

use regex::Regex;

use super::{BuildError, ErrorKind, RawDiagnostic, Severity};
use crate::validation::ValidationPass;

/// Source extensions recognised in free-form message bodies.
const SOURCE_EXTENSIONS: &str = r"(?:tsx?|jsx?|mjs|cjs|mts|cts|vue|svelte|json)";

// ============================================================================
// Line Format Configuration
// ============================================================================

/// Configuration for parsing `file:line:col: message` style lines.
#[derive(Debug, Clone)]
pub struct LineFormat {
    /// Separator between file, line, column (usually ":")
    pub separator: String,
    /// Severity when none can be extracted from the message
    pub default_severity: Severity,
    /// Only parse lines whose file ends with one of these
    pub file_extensions: Vec<String>,
    /// Whether to extract severity from the message text
    pub severity_in_message: bool,
    /// Whether the format includes a column number
    pub has_column: bool,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            separator: ":".to_string(),
            default_severity: Severity::Error,
            file_extensions: Vec::new(),
            severity_in_message: false,
            has_column: true,
        }
    }
}

impl LineFormat {
    /// Create a new line format with the given separator.
    #[must_use]
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            ..Default::default()
        }
    }

    /// Set the default severity for parsed errors.
    #[must_use]
    pub fn with_default_severity(mut self, severity: Severity) -> Self {
        self.default_severity = severity;
        self
    }

    /// Restrict parsing to files with the given extensions.
    #[must_use]
    pub fn with_file_extensions(mut self, exts: &[&str]) -> Self {
        self.file_extensions = exts.iter().map(|e| (*e).to_string()).collect();
        self
    }

    /// Extract severity from the message text.
    #[must_use]
    pub fn with_severity_in_message(mut self) -> Self {
        self.severity_in_message = true;
        self
    }

    /// The format has no column number.
    #[must_use]
    pub fn without_column(mut self) -> Self {
        self.has_column = false;
        self
    }
}

/// Parse a line in the common `file:line:col: message` format.
#[must_use]
pub fn parse_colon_separated_line(
    line: &str,
    format: &LineFormat,
    kind: ErrorKind,
) -> Option<BuildError> {
    let sep = format.separator.as_str();
    let parts: Vec<&str> = line.splitn(4, sep).collect();
    if parts.len() < 3 {
        return None;
    }

    let file = parts[0].trim();
    if !looks_like_path(file) {
        return None;
    }
    if !format.file_extensions.is_empty()
        && !format.file_extensions.iter().any(|ext| file.ends_with(ext.as_str()))
    {
        return None;
    }

    let line_num: u32 = parts[1].trim().parse().ok()?;

    let (col, message_part) = if format.has_column && parts.len() == 4 {
        match parts[2].trim().parse::<u32>() {
            Ok(col_num) => (Some(col_num), parts[3].trim().to_string()),
            Err(_) => (None, format!("{}{}{}", parts[2], sep, parts[3]).trim().to_string()),
        }
    } else if parts.len() == 4 {
        (None, format!("{}{}{}", parts[2], sep, parts[3]).trim().to_string())
    } else {
        (None, parts[2].trim().to_string())
    };

    if message_part.is_empty() {
        return None;
    }

    let (severity, message) = if format.severity_in_message {
        extract_severity_from_message(&message_part, format.default_severity)
    } else {
        (format.default_severity, message_part)
    };

    let mut error = BuildError::new(kind, message)
        .with_location(file, line_num)
        .with_severity(severity);
    if let Some(c) = col {
        error = error.with_column(c);
    }
    Some(error)
}

/// Parse every matching line of `output`.
#[must_use]
pub fn parse_lines(output: &str, format: &LineFormat, kind: ErrorKind) -> Vec<BuildError> {
    output
        .lines()
        .filter_map(|line| parse_colon_separated_line(line, format, kind))
        .collect()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Extract a leading `error:` / `warning:` marker from a message.
fn extract_severity_from_message(message: &str, default: Severity) -> (Severity, String) {
    for (prefix, severity) in [("error", Severity::Error), ("warning", Severity::Warning)] {
        if let Some(rest) = strip_prefix_ignore_case(message, prefix) {
            if rest.starts_with(':') || rest.starts_with(' ') {
                return (severity, rest.trim_start_matches(':').trim().to_string());
            }
        }
    }
    (default, message.to_string())
}

/// Whether a token plausibly names a file.
fn looks_like_path(token: &str) -> bool {
    !token.is_empty()
        && !token.contains(char::is_whitespace)
        && (token.contains('.') || token.contains('/'))
}

fn strip_ansi(line: &str) -> String {
    match Regex::new(r"\x1b\[[0-9;]*m") {
        Ok(re) => re.replace_all(line, "").into_owned(),
        Err(_) => line.to_string(),
    }
}

// ============================================================================
// DiagnosticParser Trait
// ============================================================================

/// Turns the output of one validation pass into build errors.
pub trait DiagnosticParser: Send + Sync {
    /// Kind assigned to errors from this parser.
    fn kind(&self) -> ErrorKind;

    /// Parse a single line.
    fn parse_line(&self, _line: &str) -> Option<BuildError> {
        None
    }

    /// Parse a whole output. Defaults to line-by-line parsing.
    fn parse(&self, output: &str) -> Vec<BuildError> {
        output
            .lines()
            .map(strip_ansi)
            .filter_map(|line| self.parse_line(&line))
            .collect()
    }
}

/// TypeScript compiler output.
#[derive(Debug, Default)]
pub struct TscParser;

impl TscParser {
    /// `path/to/file.ts(10,5): error TS2322: Message`
    fn parse_paren_form(line: &str) -> Option<BuildError> {
        let paren_pos = line.find('(')?;
        let file = line[..paren_pos].trim();
        if !looks_like_path(file) {
            return None;
        }

        let loc_end = paren_pos + line[paren_pos..].find(')')?;
        let loc = &line[paren_pos + 1..loc_end];
        let mut parts = loc.split(',');
        let row: u32 = parts.next()?.trim().parse().ok()?;
        let col: u32 = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1);

        let rest = line.get(loc_end + 1..)?.trim_start_matches(':').trim();
        let (severity, code, message) = Self::split_severity_code(rest)?;

        Some(
            BuildError::new(ErrorKind::Type, message)
                .with_location(file, row)
                .with_column(col)
                .with_code(code)
                .with_severity(severity),
        )
    }

    /// `path/to/file.ts:10:5 - error TS2322: Message`
    fn parse_pretty_form(line: &str) -> Option<BuildError> {
        let (location, rest) = line.split_once(" - ")?;
        let mut parts = location.trim().rsplitn(3, ':');
        let col: u32 = parts.next()?.parse().ok()?;
        let row: u32 = parts.next()?.parse().ok()?;
        let file = parts.next()?;
        if !looks_like_path(file) {
            return None;
        }
        let (severity, code, message) = Self::split_severity_code(rest.trim())?;

        Some(
            BuildError::new(ErrorKind::Type, message)
                .with_location(file, row)
                .with_column(col)
                .with_code(code)
                .with_severity(severity),
        )
    }

    /// `error TS5083: Cannot read file 'tsconfig.json'.`
    fn parse_global_form(line: &str) -> Option<BuildError> {
        let trimmed = line.trim();
        if !(trimmed.starts_with("error TS") || trimmed.starts_with("warning TS")) {
            return None;
        }
        let (severity, code, message) = Self::split_severity_code(trimmed)?;
        Some(
            BuildError::new(ErrorKind::Type, message)
                .with_code(code)
                .with_severity(severity),
        )
    }

    fn split_severity_code(rest: &str) -> Option<(Severity, String, String)> {
        let (severity, after) = if let Some(pos) = rest.find("error TS") {
            (Severity::Error, &rest[pos + "error ".len()..])
        } else if let Some(pos) = rest.find("warning TS") {
            (Severity::Warning, &rest[pos + "warning ".len()..])
        } else {
            return None;
        };
        let colon_pos = after.find(':')?;
        let code = after[..colon_pos].trim().to_string();
        let message = after[colon_pos + 1..].trim().to_string();
        Some((severity, code, message))
    }
}

impl DiagnosticParser for TscParser {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Type
    }

    fn parse_line(&self, line: &str) -> Option<BuildError> {
        Self::parse_paren_form(line)
            .or_else(|| Self::parse_pretty_form(line))
            .or_else(|| Self::parse_global_form(line))
    }

    fn parse(&self, output: &str) -> Vec<BuildError> {
        let mut errors: Vec<BuildError> = Vec::new();
        for raw in output.lines() {
            let line = strip_ansi(raw);
            if let Some(error) = self.parse_line(&line) {
                errors.push(error);
                continue;
            }
            // Elaboration lines are indented under the error they belong to.
            if line.starts_with("  ") && !line.trim().is_empty() {
                if let Some(last) = errors.last_mut() {
                    let detail = line.trim();
                    if !detail.starts_with('~') && !detail.chars().all(|c| c.is_ascii_digit()) {
                        last.message.push(' ');
                        last.message.push_str(detail);
                    }
                }
            }
        }
        errors
    }
}

/// ESLint `--format unix` output.
#[derive(Debug)]
pub struct EslintParser {
    format: LineFormat,
    rule_tag: Option<Regex>,
}

impl Default for EslintParser {
    fn default() -> Self {
        Self {
            format: LineFormat::default(),
            rule_tag: Regex::new(r"\s*\[(Error|Warning)/([^\]]+)\]\s*$").ok(),
        }
    }
}

impl DiagnosticParser for EslintParser {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Lint
    }

    fn parse_line(&self, line: &str) -> Option<BuildError> {
        let mut error = parse_colon_separated_line(line, &self.format, ErrorKind::Lint)?;
        if let Some(re) = &self.rule_tag {
            if let Some(caps) = re.captures(&error.message) {
                let severity = if &caps[1] == "Warning" {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                let rule = caps[2].to_string();
                let start = caps.get(0).map_or(error.message.len(), |m| m.start());
                error.message.truncate(start);
                error = error.with_code(rule).with_severity(severity);
            }
        }
        Some(error)
    }
}

/// Build script and bundler output.
#[derive(Debug)]
pub struct BuildParser {
    tsc: TscParser,
    format: LineFormat,
    bundler_header: Option<Regex>,
}

impl Default for BuildParser {
    fn default() -> Self {
        Self {
            tsc: TscParser,
            format: LineFormat::default().with_severity_in_message(),
            bundler_header: Regex::new(r"^ERROR in (\S+?)(?:\s+(\d+):(\d+)(?:-\d+)?)?\s*$").ok(),
        }
    }
}

impl DiagnosticParser for BuildParser {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Build
    }

    fn parse_line(&self, line: &str) -> Option<BuildError> {
        if let Some(error) = self.tsc.parse_line(line) {
            return Some(error);
        }
        parse_colon_separated_line(line, &self.format, ErrorKind::Build)
    }

    fn parse(&self, output: &str) -> Vec<BuildError> {
        let mut errors = Vec::new();
        let mut pending: Option<BuildError> = None;

        for raw in output.lines() {
            let line = strip_ansi(raw);
            let header = self
                .bundler_header
                .as_ref()
                .and_then(|re| re.captures(line.trim()));

            if let Some(caps) = header {
                errors.extend(pending.take());
                let file = caps[1].trim_start_matches("./").to_string();
                let mut error = BuildError::new(ErrorKind::Build, format!("ERROR in {}", &caps[1]))
                    .with_file(file);
                if let Some(row) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                    error.line = Some(row);
                }
                if let Some(col) = caps.get(3).and_then(|m| m.as_str().parse::<u32>().ok()) {
                    error = error.with_column(col + 1);
                }
                pending = Some(error);
                continue;
            }

            if let Some(mut error) = pending.take() {
                let detail = line.trim();
                if detail.is_empty() {
                    pending = Some(error);
                    continue;
                }
                error.message = detail.to_string();
                errors.push(error);
                continue;
            }

            if let Some(error) = self.parse_line(&line) {
                errors.push(error);
            }
        }

        errors.extend(pending);
        errors
    }
}

/// Jest-style test runner output.
#[derive(Debug)]
pub struct TestParser {
    stack_frame: Option<Regex>,
    runtime_error: Option<Regex>,
}

impl Default for TestParser {
    fn default() -> Self {
        Self {
            stack_frame: Regex::new(r"at .*?\(?([^\s()]+?):(\d+):(\d+)\)?\s*$").ok(),
            runtime_error: Regex::new(
                r"^(TypeError|ReferenceError|RangeError|SyntaxError): (.+)$",
            )
            .ok(),
        }
    }
}

impl DiagnosticParser for TestParser {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Test
    }

    fn parse(&self, output: &str) -> Vec<BuildError> {
        let mut errors: Vec<BuildError> = Vec::new();
        let mut current_file: Option<String> = None;
        let mut failed_without_case: Option<String> = None;
        let mut in_case = false;

        for raw in output.lines() {
            let line = strip_ansi(raw);
            let trimmed = line.trim();

            if let Some(path) = trimmed.strip_prefix("FAIL ") {
                if let Some(file) = failed_without_case.take() {
                    errors.push(
                        BuildError::new(ErrorKind::Test, "Test suite failed").with_file(file),
                    );
                }
                let path = path.split_whitespace().next().unwrap_or_default().to_string();
                current_file = Some(path.clone());
                failed_without_case = Some(path);
                in_case = false;
                continue;
            }
            if trimmed.starts_with("PASS ") {
                current_file = None;
                in_case = false;
                continue;
            }

            if let Some(header) = trimmed.strip_prefix("● ") {
                failed_without_case = None;
                let mut error = BuildError::new(ErrorKind::Test, header.trim());
                if let Some(file) = &current_file {
                    error = error.with_file(file.clone());
                }
                errors.push(error);
                in_case = true;
                continue;
            }

            if !in_case {
                continue;
            }
            let Some(last) = errors.last_mut() else {
                continue;
            };

            if let Some(caps) = self.runtime_error.as_ref().and_then(|re| re.captures(trimmed)) {
                if last.kind == ErrorKind::Test {
                    last.kind = ErrorKind::Runtime;
                    last.message = format!("{}: {}: {}", last.message, &caps[1], &caps[2]);
                }
                continue;
            }

            if last.line.is_none() && trimmed.starts_with("at ") {
                if let Some(caps) = self.stack_frame.as_ref().and_then(|re| re.captures(trimmed)) {
                    let frame_file = &caps[1];
                    if frame_file.contains("node_modules") {
                        continue;
                    }
                    let row = caps[2].parse().ok();
                    let col = caps[3].parse().ok();
                    let same_file = last
                        .file
                        .as_deref()
                        .is_none_or(|f| frame_file.ends_with(f) || f.ends_with(frame_file));
                    if same_file {
                        if last.file.is_none() {
                            last.file = Some(frame_file.to_string());
                        }
                        last.line = row;
                        last.column = col;
                    }
                }
            }
        }

        if let Some(file) = failed_without_case {
            errors.push(BuildError::new(ErrorKind::Test, "Test suite failed").with_file(file));
        }
        errors
    }
}

/// Package manager output. Install errors never carry a file.
#[derive(Debug, Default)]
pub struct InstallParser;

impl DiagnosticParser for InstallParser {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Build
    }

    fn parse(&self, output: &str) -> Vec<BuildError> {
        let mut seen = std::collections::HashSet::new();
        output
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                let body = trimmed
                    .strip_prefix("npm ERR!")
                    .or_else(|| trimmed.strip_prefix("npm error"))
                    .or_else(|| trimmed.strip_prefix("error "))?
                    .trim();
                if body.is_empty() || body.starts_with("A complete log of this run") {
                    return None;
                }
                seen.insert(body.to_string())
                    .then(|| BuildError::new(ErrorKind::Build, body))
            })
            .collect()
    }
}

/// Parser for a validation pass.
#[must_use]
pub fn parser_for(pass: ValidationPass) -> Box<dyn DiagnosticParser> {
    match pass {
        ValidationPass::Install => Box::new(InstallParser),
        ValidationPass::TypeCheck => Box::new(TscParser),
        ValidationPass::Lint => Box::new(EslintParser::default()),
        ValidationPass::Build => Box::new(BuildParser::default()),
        ValidationPass::Test => Box::new(TestParser::default()),
    }
}

// ============================================================================
// Secondary message-body patterns
// ============================================================================

/// A file reference recovered from a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLocation {
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Find a file reference inside a diagnostic message.
#[must_use]
pub fn locate_in_message(message: &str) -> Option<MessageLocation> {
    let patterns = [
        r"Cannot find module '[^']+' from '([^']+)'".to_string(),
        r"\bin '?(\./[^\s']+)'?".to_string(),
        r"at .*?\(([^\s()]+):(\d+):(\d+)\)".to_string(),
        format!(r"([\w@./\\-]+\.{SOURCE_EXTENSIONS})\((\d+),(\d+)\)"),
        format!(r"([\w@./\\-]+\.{SOURCE_EXTENSIONS}):(\d+)(?::(\d+))?"),
    ];

    for pattern in &patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        if let Some(caps) = re.captures(message) {
            let file = caps.get(1)?.as_str().trim_start_matches("./").to_string();
            if file.contains("node_modules") {
                continue;
            }
            return Some(MessageLocation {
                file,
                line: caps.get(2).and_then(|m| m.as_str().parse().ok()),
                column: caps.get(3).and_then(|m| m.as_str().parse().ok()),
            });
        }
    }
    None
}

/// Parse a raw diagnostic with its pass parser, then recover locations of
/// file-less errors from their messages.
///
/// File paths are returned as reported by the tool; re-rooting against the
/// sub-root happens in the validation adapter.
#[must_use]
pub fn parse_raw_diagnostic(raw: &RawDiagnostic) -> Vec<BuildError> {
    let parser = parser_for(raw.pass);
    let mut errors = parser.parse(&raw.text);

    if raw.pass != ValidationPass::Install {
        for error in errors.iter_mut().filter(|e| e.file.is_none()) {
            if let Some(location) = locate_in_message(&error.message) {
                error.file = Some(location.file);
                error.line = error.line.or(location.line);
                error.column = error.column.or(location.column);
            }
        }
    }
    errors
}

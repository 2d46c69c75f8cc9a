//! The preparation scanner: one comment- and string-aware pass over raw
//! source discovering `@define` blocks, `@include` directives, and macro
//! invocations.

use crate::{diagnostics::line_col, tree::Span};

#[derive(Clone, Debug)]
pub struct PreparedSource {
    pub clean_source: String,
    pub invocations: Vec<Invocation>,
}

/// An `@name(args?)` occurrence, absorbed and replaced by a
/// comment-wrapped placeholder so the grammar accepts the surrounding
/// text. Offsets address the placeholder in the clean source.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Clone, Debug)]
pub struct ParsedDefine {
    pub name: String,
    pub params: Vec<String>,
    pub body: String,
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct ParsedInclude {
    pub span: Span,
    pub path: String,
    pub angled: bool,
}

#[derive(Clone, Debug)]
pub struct ScanIssue {
    pub offset: usize,
    pub message: String,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn starts_with(&self, text: &str) -> bool {
        self.bytes[self.pos..].starts_with(text.as_bytes())
    }

    /// If positioned at a comment or string/char literal, skip it whole.
    /// `lua_comments` additionally treats `--` as a line comment, which is
    /// right inside macro bodies but wrong in hosted code.
    fn skip_trivia(&mut self, lua_comments: bool) -> bool {
        if self.starts_with("//") || (lua_comments && self.starts_with("--")) {
            while !self.eof() && self.peek() != b'\n' {
                self.pos += 1;
            }
            true
        } else if self.starts_with("/*") {
            self.pos += 2;
            while !self.eof() && !self.starts_with("*/") {
                self.pos += 1;
            }
            self.pos = (self.pos + 2).min(self.bytes.len());
            true
        } else if self.peek() == b'"' || self.peek() == b'\'' {
            let quote = self.peek();
            self.pos += 1;
            while !self.eof() {
                match self.peek() {
                    b'\\' => self.pos = (self.pos + 2).min(self.bytes.len()),
                    byte if byte == quote => {
                        self.pos += 1;
                        break;
                    }
                    _ => self.pos += 1,
                }
            }
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.eof() && self.peek().is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn read_identifier(&mut self) -> Option<String> {
        let start = self.pos;
        while !self.eof() && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_') {
            self.pos += 1;
        }
        (self.pos > start)
            .then(|| String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// From an opening brace, the index one past its balanced closer,
    /// honoring nested comments and strings.
    fn balanced_braces(&mut self, lua_comments: bool) -> Option<usize> {
        debug_assert_eq!(self.peek(), b'{');
        self.pos += 1;
        let mut depth = 1usize;
        while !self.eof() {
            if self.skip_trivia(lua_comments) {
                continue;
            }
            match self.peek() {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        None
    }

    /// From an opening paren, the span of the raw argument text inside the
    /// matching closer, honoring nesting and strings.
    fn balanced_parens(&mut self) -> Option<Span> {
        debug_assert_eq!(self.peek(), b'(');
        self.pos += 1;
        let inner_start = self.pos;
        let mut depth = 1usize;
        while !self.eof() {
            if self.skip_trivia(false) {
                continue;
            }
            match self.peek() {
                b'(' | b'{' | b'[' => depth += 1,
                b')' | b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        let span = Span::new(inner_start, self.pos);
                        self.pos += 1;
                        return Some(span);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        None
    }
}

/// Phase 1: pull every `@define NAME(params) { body }` out of the buffer,
/// blanking each region in place with same-length whitespace so the
/// line/column of all following code is preserved.
pub fn extract_defines(buffer: &mut [u8]) -> (Vec<ParsedDefine>, Vec<ScanIssue>) {
    let snapshot = buffer.to_vec();
    let mut scanner = Scanner::new(&snapshot);
    let mut defines = Vec::new();
    let mut issues = Vec::new();

    while !scanner.eof() {
        if scanner.skip_trivia(false) {
            continue;
        }
        if scanner.peek() != b'@' {
            scanner.pos += 1;
            continue;
        }
        let at = scanner.pos;
        scanner.pos += 1;
        match scanner.read_identifier().as_deref() {
            Some("define") => {}
            _ => continue,
        }

        scanner.skip_whitespace();
        let Some(name) = scanner.read_identifier() else {
            issues.push(ScanIssue {
                offset: at,
                message: "@define without a macro name".to_owned(),
            });
            continue;
        };
        scanner.skip_whitespace();
        if scanner.peek() != b'(' {
            issues.push(ScanIssue {
                offset: at,
                message: format!("@define {name} missing parameter list"),
            });
            continue;
        }
        let Some(params_span) = scanner.balanced_parens() else {
            issues.push(ScanIssue {
                offset: at,
                message: format!("@define {name} has an unterminated parameter list"),
            });
            break;
        };
        let params = split_args(&String::from_utf8_lossy(
            &snapshot[params_span.start..params_span.end],
        ));
        scanner.skip_whitespace();
        if scanner.peek() != b'{' {
            issues.push(ScanIssue {
                offset: at,
                message: format!("@define {name} missing body"),
            });
            continue;
        }
        let body_start = scanner.pos + 1;
        let Some(after) = scanner.balanced_braces(true) else {
            issues.push(ScanIssue {
                offset: at,
                message: format!("@define {name} has an unbalanced body"),
            });
            break;
        };
        let body = String::from_utf8_lossy(&snapshot[body_start..after - 1]).into_owned();
        blank_region(&mut buffer[at..after]);
        defines.push(ParsedDefine {
            name,
            params,
            body,
            offset: at,
        });
    }
    (defines, issues)
}

/// Phase 2: locate `@include "path"` / `@include <path>` directives.
/// Rewriting is the registry's business; this only reports spans.
pub fn find_includes(buffer: &[u8]) -> (Vec<ParsedInclude>, Vec<ScanIssue>) {
    let mut scanner = Scanner::new(buffer);
    let mut includes = Vec::new();
    let mut issues = Vec::new();

    while !scanner.eof() {
        if scanner.skip_trivia(false) {
            continue;
        }
        if scanner.peek() != b'@' {
            scanner.pos += 1;
            continue;
        }
        let at = scanner.pos;
        scanner.pos += 1;
        match scanner.read_identifier().as_deref() {
            Some("include") => {}
            _ => continue,
        }
        scanner.skip_whitespace();
        let (closer, angled) = match scanner.peek() {
            b'"' => (b'"', false),
            b'<' => (b'>', true),
            _ => {
                issues.push(ScanIssue {
                    offset: at,
                    message: "@include expects a quoted or angle-bracketed path".to_owned(),
                });
                continue;
            }
        };
        scanner.pos += 1;
        let path_start = scanner.pos;
        while !scanner.eof() && scanner.peek() != closer && scanner.peek() != b'\n' {
            scanner.pos += 1;
        }
        if scanner.peek() != closer {
            issues.push(ScanIssue {
                offset: at,
                message: "@include path is unterminated".to_owned(),
            });
            continue;
        }
        let path = String::from_utf8_lossy(&buffer[path_start..scanner.pos]).into_owned();
        scanner.pos += 1;
        includes.push(ParsedInclude {
            span: Span::new(at, scanner.pos),
            path,
            angled,
        });
    }
    (includes, issues)
}

/// Phase 3: absorb `@name` / `@name(args)` for names the registry knows,
/// emitting the clean source with each invocation replaced by its
/// comment-wrapped placeholder.
pub fn wrap_invocations(
    buffer: &[u8],
    is_macro: &dyn Fn(&str) -> bool,
) -> (String, Vec<Invocation>) {
    let mut scanner = Scanner::new(buffer);
    let mut out = Vec::<u8>::new();
    let mut invocations = Vec::new();
    let mut copied = 0usize;

    while !scanner.eof() {
        if scanner.skip_trivia(false) {
            continue;
        }
        if scanner.peek() != b'@' {
            scanner.pos += 1;
            continue;
        }
        let at = scanner.pos;
        scanner.pos += 1;
        let Some(name) = scanner.read_identifier() else {
            continue;
        };
        if !is_macro(&name) {
            continue;
        }
        let (raw_args, args) = if scanner.peek() == b'(' {
            match scanner.balanced_parens() {
                Some(span) => {
                    let raw = String::from_utf8_lossy(&buffer[span.start..span.end]).into_owned();
                    let args = split_args(&raw);
                    (Some(raw), args)
                }
                None => (None, Vec::new()),
            }
        } else {
            (None, Vec::new())
        };
        let end = scanner.pos;

        let placeholder = match &raw_args {
            Some(raw) if raw.contains("*/") => {
                // cannot be comment-wrapped; leave the text alone
                continue;
            }
            Some(raw) => format!("/*@{name}({raw})*/"),
            None => format!("/*@{name}*/"),
        };

        out.extend_from_slice(&buffer[copied..at]);
        let start_in_out = out.len();
        out.extend_from_slice(placeholder.as_bytes());
        copied = end;
        invocations.push(Invocation {
            name,
            args,
            start: start_in_out,
            end: start_in_out + placeholder.len(),
            line: 0,
            column: 0,
        });
    }
    out.extend_from_slice(&buffer[copied..]);

    let clean = String::from_utf8_lossy(&out).into_owned();
    for invocation in &mut invocations {
        let (line, column) = line_col(&clean, invocation.start);
        invocation.line = line;
        invocation.column = column;
    }
    (clean, invocations)
}

/// Raw argument strings, split at commas that sit at bracket depth zero
/// outside literals.
pub fn split_args(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let bytes = raw.as_bytes();
    let mut scanner = Scanner::new(bytes);
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut segment_start = 0usize;
    while !scanner.eof() {
        if scanner.skip_trivia(false) {
            continue;
        }
        match scanner.peek() {
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                args.push(raw[segment_start..scanner.pos].trim().to_owned());
                segment_start = scanner.pos + 1;
            }
            _ => {}
        }
        scanner.pos += 1;
    }
    args.push(raw[segment_start..].trim().to_owned());
    args
}

/// Same-length whitespace, newlines kept so following line numbers hold.
pub fn blank_region(region: &mut [u8]) {
    for byte in region {
        if *byte != b'\n' && *byte != b'\r' {
            *byte = b' ';
        }
    }
}

/// A directive replacement that keeps the original's newline count.
pub fn blanked_copy(original: &[u8]) -> String {
    let mut copy = original.to_vec();
    blank_region(&mut copy);
    String::from_utf8_lossy(&copy).into_owned()
}

/// Parse the placeholder comment a prepared invocation became. Inverse of
/// the wrapping in `wrap_invocations`.
pub fn absorb_placeholder(text: &str) -> Option<(String, Vec<String>)> {
    let inner = text.strip_prefix("/*@")?.strip_suffix("*/")?;
    let name_end = inner
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(inner.len());
    let name = &inner[..name_end];
    if name.is_empty() {
        return None;
    }
    let rest = &inner[name_end..];
    if rest.is_empty() {
        return Some((name.to_owned(), Vec::new()));
    }
    let raw = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some((name.to_owned(), split_args(raw)))
}

use std::{cell::RefCell, path::PathBuf};

use colored::Colorize;
use derive_builder::Builder;

use crate::{error::UppError, tree::Span};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct Diagnostic {
    pub kind: &'static str,
    pub message: String,
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    #[builder(default)]
    pub span: Option<Span>,
    pub severity: Severity,
}

/// Collecting sink for diagnostics. Non-fatal entries never abort the
/// walk; the CLI checks `has_fatal` for its exit status.
#[derive(Default)]
pub struct Diagnostics {
    entries: RefCell<Vec<Diagnostic>>,
    quiet: bool,
}

impl Diagnostics {
    pub fn new(quiet: bool) -> Self {
        Self {
            entries: Default::default(),
            quiet,
        }
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        if !self.quiet {
            print_diagnostic(&diagnostic);
        }
        self.entries.borrow_mut().push(diagnostic);
    }

    pub fn report_error(
        &self,
        error: &UppError,
        file: impl Into<PathBuf>,
        position: SourcePosition,
        severity: Severity,
    ) {
        self.report(
            DiagnosticBuilder::default()
                .kind(error.kind())
                .message(error.to_string())
                .file(file)
                .line(position.line)
                .column(position.column)
                .span(position.span)
                .severity(severity)
                .build()
                .unwrap(),
        );
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|diagnostic| diagnostic.severity == Severity::Fatal)
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|diagnostic| diagnostic.kind == kind)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
    pub span: Option<Span>,
}

impl SourcePosition {
    pub fn at(source: &str, offset: usize, span: Option<Span>) -> Self {
        let (line, column) = line_col(source, offset);
        Self { line, column, span }
    }
}

/// 1-based line/column of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let prefix = &source[..offset];
    let line = prefix.bytes().filter(|&b| b == b'\n').count() + 1;
    let column = prefix
        .rfind('\n')
        .map(|at| offset - at)
        .unwrap_or(offset + 1);
    (line, column)
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let severity = match diagnostic.severity {
        Severity::Warning => "warning".yellow(),
        Severity::Error => "error".red(),
        Severity::Fatal => "fatal".red().bold(),
    };
    eprintln!(
        "{}:{}:{} {} [{}] {}",
        diagnostic.file.display(),
        diagnostic.line,
        diagnostic.column,
        severity,
        diagnostic.kind,
        diagnostic.message
    );
}

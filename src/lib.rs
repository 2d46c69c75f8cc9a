mod cache;
mod cli;
mod config;
mod diagnostics;
mod error;
mod helpers;
mod lang;
mod parser;
mod pattern;
mod registry;
mod session;
#[cfg(test)]
mod tests;
mod transformer;
mod tree;

pub use cache::{DependencyCache, DependencyEntry};
pub use cli::{run_cli, Args, ExitStatus};
pub use config::{
    config_for_source, find_config_file, load_config_file, Config, ConfigBuilder,
    ConfigFileContent, LangCommands,
};
pub use diagnostics::{line_col, Diagnostic, DiagnosticBuilder, Diagnostics, Severity};
pub use error::{Result, UppError};
pub use lang::{CBinding, FunctionSignature, LanguageBinding};
pub use parser::{FragmentEnvelope, LanguageSpec, ParserAdapter};
pub use pattern::{Binding, Captures, Constraint, Pattern};
pub use registry::{
    prepare::split_args, Invocation, MacroDef, PendingRule, PreparedSource, Registry,
    RuleMatcher, RuleScope,
};
pub use session::{Ctx, Session, WalkState};
pub use tree::{EditPayload, InsertPosition, NodeId, Span, TreeId, TreeStore};

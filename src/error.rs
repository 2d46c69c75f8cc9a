use std::path::PathBuf;

use thiserror::Error;

/// Error kinds surfaced by the engine, per semantic rather than call site.
/// Macro and rule boundaries convert these into diagnostics and keep
/// walking; only the CLI decides process exit.
#[derive(Debug, Error)]
pub enum UppError {
    #[error("could not form a usable parse tree for {path}")]
    Parse { path: PathBuf },

    #[error("unknown macro '@{name}'")]
    MacroLookup { name: String },

    #[error("macro '@{name}' expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("{message}")]
    ConsumeMismatch { message: String },

    #[error("operation on an invalidated node handle")]
    StaleHandle,

    #[error("macro body failed: {message}")]
    MacroBody { message: String },

    #[error("pending rules did not converge after {iterations} sweep(s)")]
    RuleNonConvergence { iterations: usize },

    #[error("cannot resolve include '{path}'")]
    Resolve { path: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("script error: {0}")]
    Script(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UppError {
    /// Stable kind tag used when rendering diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            UppError::Parse { .. } => "ParseError",
            UppError::MacroLookup { .. } => "MacroLookup",
            UppError::Arity { .. } => "ArityError",
            UppError::ConsumeMismatch { .. } => "ConsumeMismatch",
            UppError::StaleHandle => "StaleHandle",
            UppError::MacroBody { .. } => "MacroBodyError",
            UppError::RuleNonConvergence { .. } => "RuleNonConvergence",
            UppError::Resolve { .. } => "ResolveError",
            UppError::Config(_) => "ConfigError",
            UppError::Script(_) => "ScriptError",
            UppError::Io(_) => "IoError",
        }
    }
}

pub type Result<T, E = UppError> = std::result::Result<T, E>;

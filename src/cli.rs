use std::{fs, path::PathBuf, process::Command};

use clap::Parser;
use tracing::debug;

use crate::{
    config,
    error::{Result, UppError},
    session::Session,
};

/// The thin command surface. The compiler-wrapper mode lives outside the
/// core; these flags cover transformation, tree inspection, and the
/// configured compile/run check.
#[derive(Parser)]
#[command(name = "upp", about = "AST-level macro preprocessor")]
pub struct Args {
    /// Transform FILE and print the result
    #[arg(long, value_name = "FILE")]
    pub transpile: Option<PathBuf>,

    /// Print the prepared parse tree of FILE
    #[arg(long, value_name = "FILE")]
    pub ast: Option<PathBuf>,

    /// Transform FILE, then run the configured compile/run commands
    #[arg(long, value_name = "FILE")]
    pub test: Option<PathBuf>,

    /// Explicit upp.json (default: nearest one above the input)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

pub enum ExitStatus {
    Ok,
    FoundErrors,
}

pub fn run_cli(args: Args) -> ExitStatus {
    match run_cli_inner(args) {
        Ok(status) => status,
        Err(error) => {
            eprintln!("upp: {error}");
            ExitStatus::FoundErrors
        }
    }
}

fn run_cli_inner(args: Args) -> Result<ExitStatus> {
    let input = args
        .transpile
        .clone()
        .or_else(|| args.ast.clone())
        .or_else(|| args.test.clone())
        .ok_or_else(|| UppError::Config("pass --transpile, --ast, or --test".to_owned()))?;

    let config = match &args.config {
        Some(path) => config::load_config_file(path)?,
        None => config::config_for_source(&input)?,
    };
    let session = Session::new(config)?;

    if let Some(path) = &args.ast {
        let text = fs::read_to_string(path)?;
        print!("{}", session.ast_dump(&text, path)?);
        return Ok(exit_status(&session));
    }

    let output = session.transpile_file(&input)?;
    if args.transpile.is_some() {
        print!("{output}");
        return Ok(exit_status(&session));
    }

    // --test: materialize the native output next to the source, then run
    // the configured commands for the source extension
    let native = native_output_path(&input);
    fs::write(&native, &output)?;
    debug!(output = %native.display(), "wrote transformed source");
    let extension = input
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned())
        .unwrap_or_default();
    let commands = session.config().lang.get(&extension).cloned();
    if let Some(commands) = commands {
        for command in [commands.compile, commands.run].into_iter().flatten() {
            if !run_shell(&command, &native)? {
                return Ok(ExitStatus::FoundErrors);
            }
        }
    }
    Ok(exit_status(&session))
}

fn exit_status(session: &Session) -> ExitStatus {
    if session.diagnostics().has_fatal() {
        ExitStatus::FoundErrors
    } else {
        ExitStatus::Ok
    }
}

fn native_output_path(input: &PathBuf) -> PathBuf {
    let mut output = input.clone();
    let native = crate::parser::LanguageSpec::c()
        .native_extension_for(input)
        .unwrap_or("c");
    output.set_extension(native);
    output
}

fn run_shell(template: &str, file: &std::path::Path) -> Result<bool> {
    let command_line = config::substitute_env(template).replace("$FILE", &file.to_string_lossy());
    debug!(command = %command_line, "running configured command");
    let status = Command::new("sh").arg("-c").arg(&command_line).status()?;
    Ok(status.success())
}

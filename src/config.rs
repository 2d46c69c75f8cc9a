use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
};

use derive_builder::Builder;
use serde::Deserialize;
use tracing::instrument;

use crate::error::{Result, UppError};

pub const CONFIG_FILENAME: &str = "upp.json";

/// One `upp.json` as it sits on disk.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ConfigFileContent {
    pub comments: Option<bool>,
    pub include_paths: Vec<String>,
    pub core: Vec<String>,
    pub lang: HashMap<String, LangCommands>,
    pub extends: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LangCommands {
    pub compile: Option<String>,
    pub run: Option<String>,
}

/// Effective configuration after the `extends` chain is merged.
#[derive(Builder, Clone, Debug, Default)]
#[builder(default, setter(into))]
pub struct Config {
    pub comments: bool,
    pub include_paths: Vec<PathBuf>,
    pub core: Vec<PathBuf>,
    pub lang: HashMap<String, LangCommands>,
}

/// Find the nearest `upp.json` at or above `start_dir`.
#[instrument(level = "debug")]
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Load a config file and everything it `extends`, parent-first: path
/// lists append in parent-first order, scalars are overridden by the
/// nearest child that sets them.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let chain = load_chain(path, &mut HashSet::new())?;
    let mut merged = Config::default();
    for (file_dir, content) in &chain {
        if let Some(comments) = content.comments {
            merged.comments = comments;
        }
        for include_path in &content.include_paths {
            let resolved = resolve_config_path(file_dir, include_path);
            if !merged.include_paths.contains(&resolved) {
                merged.include_paths.push(resolved);
            }
        }
        for core in &content.core {
            let resolved = resolve_config_path(file_dir, core);
            if !merged.core.contains(&resolved) {
                merged.core.push(resolved);
            }
        }
        for (extension, commands) in &content.lang {
            merged.lang.insert(extension.clone(), commands.clone());
        }
    }
    Ok(merged)
}

/// The chain root-first, so children override parents in the fold above.
fn load_chain(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<Vec<(PathBuf, ConfigFileContent)>> {
    let canonical = path
        .canonicalize()
        .map_err(|_| UppError::Config(format!("cannot read config file {}", path.display())))?;
    if !visited.insert(canonical.clone()) {
        return Err(UppError::Config(format!(
            "config 'extends' cycle through {}",
            path.display()
        )));
    }
    let text = fs::read_to_string(&canonical)?;
    let content: ConfigFileContent = serde_json::from_str(&text)
        .map_err(|error| UppError::Config(format!("{}: {error}", path.display())))?;
    let dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut chain = match &content.extends {
        Some(parent) => {
            let parent_path = resolve_config_path(&dir, parent);
            let parent_path = if parent_path.is_dir() {
                parent_path.join(CONFIG_FILENAME)
            } else {
                parent_path
            };
            load_chain(&parent_path, visited)?
        }
        None => Vec::new(),
    };
    chain.push((dir, content));
    Ok(chain)
}

/// Paths in config files may reference the `UPP` environment variable and
/// are otherwise resolved against the config file's directory.
fn resolve_config_path(base_dir: &Path, raw: &str) -> PathBuf {
    let substituted = substitute_env(raw);
    let path = PathBuf::from(substituted);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

pub fn substitute_env(raw: &str) -> String {
    let value = env::var("UPP").unwrap_or_default();
    raw.replace("${UPP}", &value).replace("$UPP", &value)
}

/// Configuration for a source file: its nearest `upp.json` chain, or the
/// defaults when none exists.
pub fn config_for_source(source_path: &Path) -> Result<Config> {
    let start_dir = source_path.parent().unwrap_or_else(|| Path::new("."));
    match find_config_file(start_dir) {
        Some(config_path) => load_config_file(&config_path),
        None => Ok(Config::default()),
    }
}

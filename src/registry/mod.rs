use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use mlua::{Function, Lua, RegistryKey};
use tracing::{debug, instrument};

use crate::{
    cache::DependencyEntry,
    config::Config,
    diagnostics::{DiagnosticBuilder, Severity, SourcePosition},
    error::{Result, UppError},
    parser::LanguageSpec,
    pattern::Pattern,
    session::Ctx,
    tree::{NodeId, Span},
};

pub mod prepare;

pub use prepare::{Invocation, PreparedSource};

/// A user macro: `@define name(params) { body }`. The body is a compiled
/// scripting-language function held by registry key; `params[0] == "node"`
/// marks a transformer macro.
pub struct MacroDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: String,
    pub language: &'static str,
    pub origin: PathBuf,
    pub func: RegistryKey,
}

impl MacroDef {
    pub fn compile(
        lua: &Lua,
        define: &prepare::ParsedDefine,
        origin: &Path,
    ) -> Result<Self> {
        let mut formals = vec![
            "upp".to_owned(),
            "console".to_owned(),
            "code".to_owned(),
        ];
        let mut prelude = String::new();
        for param in &define.params {
            match param.strip_prefix("...") {
                Some(rest) => {
                    formals.push("...".to_owned());
                    prelude = format!("local {rest} = {{...}}\n");
                }
                None => formals.push(param.clone()),
            }
        }
        let chunk = format!(
            "return function({})\n{}{}\nend",
            formals.join(", "),
            prelude,
            define.body
        );
        let func = lua
            .load(&chunk)
            .set_name(format!("@{}", define.name))
            .eval::<Function>()
            .map_err(|error| UppError::Script(error.to_string()))?;
        let func = lua
            .create_registry_value(func)
            .map_err(|error| UppError::Script(error.to_string()))?;
        Ok(Self {
            name: define.name.clone(),
            params: define.params.clone(),
            body: define.body.clone(),
            language: "lua",
            origin: origin.to_path_buf(),
            func,
        })
    }

    pub fn is_transformer(&self) -> bool {
        self.params.first().map(String::as_str) == Some("node")
    }

    pub fn is_variadic(&self) -> bool {
        self.params
            .last()
            .map(|param| param.starts_with("..."))
            .unwrap_or(false)
    }

    /// Argument count an invocation must supply (the context node of a
    /// transformer macro is prepended by the engine, not the caller).
    pub fn expected_args(&self) -> usize {
        let mut expected = self.params.len();
        if self.is_transformer() {
            expected -= 1;
        }
        if self.is_variadic() {
            expected -= 1;
        }
        expected
    }
}

pub type RuleId = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleScope {
    Root,
    Within(NodeId),
    Exact(NodeId),
}

pub enum RuleMatcher {
    /// `withNode` / `withRoot` / `withScope`: fires on one specific handle.
    Identity(NodeId),
    Kind(String),
    /// `withPattern`: optional kind filter plus a scripted predicate.
    Predicate {
        kind: Option<String>,
        predicate: Rc<RegistryKey>,
    },
    /// `withMatch`: structural pattern with metavariable captures.
    Pattern(Rc<Pattern>),
    /// `withReferences`: candidates whose definition is this handle.
    References(NodeId),
}

/// A deferred transformation: tried during the walk and again in the
/// final fixed-point sweeps, at most once per node instance.
pub struct PendingRule {
    pub id: RuleId,
    pub context_node: Option<NodeId>,
    pub scope: RuleScope,
    pub matcher: RuleMatcher,
    pub callback: Rc<RegistryKey>,
    pub origin: PathBuf,
}

impl PendingRule {
    /// Rules free of node handles survive their source tree and may be
    /// replayed from the dependency cache into later includers.
    pub fn is_exportable(&self) -> bool {
        matches!(self.scope, RuleScope::Root)
            && matches!(
                self.matcher,
                RuleMatcher::Kind(_) | RuleMatcher::Predicate { .. } | RuleMatcher::Pattern(_)
            )
    }
}

/// Per-source macro table and pending-rule list. A child registry is
/// created for every `@include`d file; lookup falls back along the parent
/// chain, ending at the session's core registry.
pub struct Registry {
    pub origin: PathBuf,
    pub macros: HashMap<String, Rc<MacroDef>>,
    pub pending_rules: Vec<Rc<PendingRule>>,
    /// Rules this registry installed on its parent, kept for the cache.
    pub exported_rules: Vec<Rc<PendingRule>>,
    pub loaded_dependencies: HashSet<PathBuf>,
    pub parent: Option<Rc<RefCell<Registry>>>,
    unique_counter: Cell<u64>,
    pub mutated: Rc<Cell<bool>>,
}

impl Registry {
    pub fn new(origin: PathBuf, parent: Option<Rc<RefCell<Registry>>>) -> Self {
        Self {
            origin,
            macros: Default::default(),
            pending_rules: Default::default(),
            exported_rules: Default::default(),
            loaded_dependencies: Default::default(),
            parent,
            unique_counter: Cell::new(0),
            mutated: Rc::new(Cell::new(false)),
        }
    }

    pub fn register_macro(&mut self, def: Rc<MacroDef>) {
        self.macros.insert(def.name.clone(), def);
    }

    /// Local table, then the parent registry chain.
    pub fn get_macro(&self, name: &str) -> Option<Rc<MacroDef>> {
        if let Some(def) = self.macros.get(name) {
            return Some(def.clone());
        }
        let mut parent = self.parent.clone();
        while let Some(registry) = parent {
            let registry = registry.borrow();
            if let Some(def) = registry.macros.get(name) {
                return Some(def.clone());
            }
            parent = registry.parent.clone();
        }
        None
    }

    pub fn knows_macro(&self, name: &str) -> bool {
        self.get_macro(name).is_some()
    }

    pub fn install_rule(&mut self, rule: Rc<PendingRule>) {
        self.pending_rules.push(rule);
    }

    pub fn rules_snapshot(&self) -> Vec<Rc<PendingRule>> {
        self.pending_rules.clone()
    }

    /// Monotonically increasing within this registry.
    pub fn next_unique(&self, prefix: &str) -> String {
        let n = self.unique_counter.get();
        self.unique_counter.set(n + 1);
        format!("{prefix}_{n}")
    }
}

/// `prepareSource`: extract `@define`s, resolve `@include`s, and absorb
/// invocations, in that order, returning the grammar-acceptable clean
/// source.
#[instrument(level = "debug", skip_all, fields(origin = %origin.display()))]
pub fn prepare_source(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    text: &str,
    origin: &Path,
) -> Result<PreparedSource> {
    let mut buffer = text.as_bytes().to_vec();

    let (defines, issues) = prepare::extract_defines(&mut buffer);
    report_scan_issues(ctx, text, origin, &issues);
    for define in &defines {
        match MacroDef::compile(lua, define, origin) {
            Ok(def) => {
                debug!(name = %def.name, "registered macro");
                registry.borrow_mut().register_macro(Rc::new(def));
            }
            Err(error) => ctx.diagnostics.report_error(
                &error,
                origin,
                SourcePosition::at(text, define.offset, None),
                Severity::Error,
            ),
        }
    }

    let (includes, issues) = prepare::find_includes(&buffer);
    report_scan_issues(ctx, text, origin, &issues);
    let spec = ctx.store.borrow().adapter().spec().clone();
    let mut edits = Vec::new();
    for include in includes {
        let original = buffer[include.span.start..include.span.end].to_vec();
        let replacement =
            prepare_include(lua, ctx, registry, origin, &spec, &include, &original, text);
        edits.push((include.span, replacement));
    }
    for (span, replacement) in edits.into_iter().rev() {
        drop(buffer.splice(span.start..span.end, replacement.into_bytes()));
    }

    let (clean_source, invocations) =
        prepare::wrap_invocations(&buffer, &|name| registry.borrow().knows_macro(name));
    Ok(PreparedSource {
        clean_source,
        invocations,
    })
}

#[allow(clippy::too_many_arguments)]
fn prepare_include(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    origin: &Path,
    spec: &LanguageSpec,
    include: &prepare::ParsedInclude,
    original: &[u8],
    original_text: &str,
) -> String {
    let position = SourcePosition::at(original_text, include.span.start, Some(include.span));
    let Some(resolved) = resolve_include(origin, &ctx.config, &include.path) else {
        ctx.diagnostics.report_error(
            &UppError::Resolve {
                path: include.path.clone(),
            },
            origin,
            position,
            Severity::Error,
        );
        return prepare::blanked_copy(original);
    };
    if !spec.is_hosted(&resolved) {
        // a native header: rewrite the directive, nothing to load
        return native_include_text(&include.path, include.angled);
    }
    match load_dependency(lua, ctx, registry, &resolved) {
        Err(error) => {
            ctx.diagnostics
                .report_error(&error, origin, position, Severity::Error);
            prepare::blanked_copy(original)
        }
        Ok(entry) => {
            if entry.output.trim().is_empty() {
                // macros-only dependency leaves no residue
                prepare::blanked_copy(original)
            } else {
                let native = native_file_name(&resolved, spec);
                native_include_text(&native, include.angled)
            }
        }
    }
}

fn native_include_text(path: &str, angled: bool) -> String {
    if angled {
        format!("#include <{path}>")
    } else {
        format!("#include \"{path}\"")
    }
}

fn native_file_name(resolved: &Path, spec: &LanguageSpec) -> String {
    let stem = resolved
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match spec.native_extension_for(resolved) {
        Some(native) => format!("{stem}.{native}"),
        None => resolved
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(stem),
    }
}

/// Resolution order: the including source's directory, then configured
/// include paths in their merged order.
pub fn resolve_include(origin: &Path, config: &Config, path: &str) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = origin.parent() {
        candidates.push(dir.join(path));
    }
    for include_path in &config.include_paths {
        candidates.push(include_path.join(path));
    }
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .and_then(|found| found.canonicalize().ok())
}

/// Load an included file through a child registry sharing the cache,
/// importing its macros and replaying any rules it exported.
pub fn load_dependency(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    includer: &Rc<RefCell<Registry>>,
    resolved: &Path,
) -> Result<Rc<DependencyEntry>> {
    let canonical = resolved.canonicalize()?;

    let freshly_seen = includer
        .borrow_mut()
        .loaded_dependencies
        .insert(canonical.clone());
    if let Some(entry) = ctx.cache.borrow().get(&canonical) {
        if freshly_seen {
            import_dependency(includer, &entry, true);
        }
        return Ok(entry);
    }

    debug!(path = %canonical.display(), "loading dependency");
    let text = fs::read_to_string(&canonical)?;
    let mtime = fs::metadata(&canonical)
        .ok()
        .and_then(|metadata| metadata.modified().ok());
    let child = Rc::new(RefCell::new(Registry::new(
        canonical.clone(),
        Some(includer.clone()),
    )));
    // rules the child registers on its parent land in `includer` live,
    // and in child.exported_rules for the cache
    let output = crate::transformer::run(lua, ctx, &child, &text, &canonical)?;
    let entry = DependencyEntry {
        macros: child.borrow().macros.values().cloned().collect(),
        pending_rules: child.borrow().exported_rules.clone(),
        output,
        mtime,
    };
    let entry = ctx.cache.borrow_mut().set_and_get(canonical, entry);
    import_dependency(includer, &entry, false);
    Ok(entry)
}

fn import_dependency(
    registry: &Rc<RefCell<Registry>>,
    entry: &Rc<DependencyEntry>,
    replay_rules: bool,
) {
    let mut registry = registry.borrow_mut();
    for def in &entry.macros {
        registry
            .macros
            .entry(def.name.clone())
            .or_insert_with(|| def.clone());
    }
    if replay_rules {
        for rule in &entry.pending_rules {
            registry.install_rule(rule.clone());
        }
    }
}

fn report_scan_issues(
    ctx: &Rc<Ctx>,
    text: &str,
    origin: &Path,
    issues: &[prepare::ScanIssue],
) {
    for issue in issues {
        let (line, column) = crate::diagnostics::line_col(text, issue.offset);
        ctx.diagnostics.report(
            DiagnosticBuilder::default()
                .kind("ParseError")
                .message(issue.message.clone())
                .file(origin)
                .line(line)
                .column(column)
                .span(Some(Span::new(issue.offset, issue.offset)))
                .severity(Severity::Error)
                .build()
                .unwrap(),
        );
    }
}

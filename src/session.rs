use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use mlua::{Lua, LuaOptions, StdLib};
use tracing::instrument;

use crate::{
    cache::DependencyCache,
    config::Config,
    diagnostics::{line_col, DiagnosticBuilder, Diagnostics, Severity},
    error::{Result, UppError},
    helpers,
    lang::{CBinding, LanguageBinding},
    parser::{LanguageSpec, ParserAdapter},
    pattern::Pattern,
    registry::{self, PreparedSource, Registry, RuleId},
    transformer,
    tree::{NodeId, TreeId, TreeStore},
};

/// Mutable state of the walk in flight: which registry and tree are
/// current, the context node, and the consume cursor. Saved and restored
/// around nested dependency runs.
#[derive(Clone, Default)]
pub struct WalkState {
    pub registry: Option<Rc<RefCell<Registry>>>,
    pub tree: Option<TreeId>,
    pub origin: PathBuf,
    pub context_node: Option<NodeId>,
    /// resumption point for `consume`: parent and child index just past
    /// the last consumed sibling
    pub consume_cursor: Option<(NodeId, usize)>,
    pub last_consumed: Option<NodeId>,
}

/// Everything the helper closures and the transformer share. Owns no
/// scripting handles, so it can be captured by them without a cycle.
pub struct Ctx {
    pub store: Rc<RefCell<TreeStore>>,
    pub cache: Rc<RefCell<DependencyCache>>,
    pub diagnostics: Rc<Diagnostics>,
    pub config: Config,
    pub walk: RefCell<WalkState>,
    pub patterns: RefCell<HashMap<String, Rc<Pattern>>>,
    pub binding: Rc<dyn LanguageBinding>,
    rule_counter: Cell<RuleId>,
}

impl Ctx {
    pub fn next_rule_id(&self) -> RuleId {
        let id = self.rule_counter.get();
        self.rule_counter.set(id + 1);
        id
    }

    /// Diagnostic tagged with the node's current span, or the bare origin
    /// when no node is at hand.
    pub fn report_at_node(&self, error: &UppError, node: Option<NodeId>, severity: Severity) {
        let file = self.walk.borrow().origin.clone();
        let (line, column, span) = {
            let store = self.store.borrow();
            node.and_then(|node| {
                let span = store.span(node)?;
                let source = store.source_of_tree(store.tree_of(node));
                let (line, column) = line_col(source, span.start);
                Some((line, column, Some(span)))
            })
            .unwrap_or((0, 0, None))
        };
        self.diagnostics.report(
            DiagnosticBuilder::default()
                .kind(error.kind())
                .message(error.to_string())
                .file(file)
                .line(line)
                .column(column)
                .span(span)
                .severity(severity)
                .build()
                .unwrap(),
        );
    }
}

/// One preprocessing session: the embedded interpreter, the tree arena,
/// the dependency cache, and the auto-loaded core macros. Processes one
/// source at a time, synchronously.
pub struct Session {
    lua: Lua,
    ctx: Rc<Ctx>,
    core_registry: Option<Rc<RefCell<Registry>>>,
}

impl Session {
    pub fn new(config: Config) -> Result<Self> {
        // macro bodies get the pure computational libraries only; file
        // access goes through loadDependency and include resolution
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(|error| UppError::Script(error.to_string()))?;
        let adapter = ParserAdapter::new(LanguageSpec::c())?;
        let ctx = Rc::new(Ctx {
            store: Rc::new(RefCell::new(TreeStore::new(adapter))),
            cache: Rc::new(RefCell::new(DependencyCache::default())),
            diagnostics: Rc::new(Diagnostics::default()),
            config,
            walk: RefCell::new(WalkState::default()),
            patterns: RefCell::new(HashMap::new()),
            binding: Rc::new(CBinding),
            rule_counter: Cell::new(0),
        });
        helpers::install_globals(&lua, &ctx)
            .map_err(|error| UppError::Script(error.to_string()))?;
        let mut session = Self {
            lua,
            ctx,
            core_registry: None,
        };
        session.load_core()?;
        Ok(session)
    }

    /// Files named by `config.core` are loaded before any user source;
    /// their macros resolve at the end of every registry's parent chain.
    fn load_core(&mut self) -> Result<()> {
        if self.ctx.config.core.is_empty() {
            return Ok(());
        }
        let core = Rc::new(RefCell::new(Registry::new(PathBuf::from("<core>"), None)));
        for path in self.ctx.config.core.clone() {
            let text = fs::read_to_string(&path)?;
            transformer::run(&self.lua, &self.ctx, &core, &text, &path)?;
        }
        self.core_registry = Some(core);
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn transpile_file(&self, path: &Path) -> Result<String> {
        let text = fs::read_to_string(path)?;
        self.transpile_source(&text, path)
    }

    pub fn transpile_source(&self, text: &str, origin: &Path) -> Result<String> {
        let registry = Rc::new(RefCell::new(Registry::new(
            origin.to_path_buf(),
            self.core_registry.clone(),
        )));
        transformer::run(&self.lua, &self.ctx, &registry, text, origin)
    }

    /// Run only the preparation pass, without transforming.
    pub fn prepare_source(&self, text: &str, origin: &Path) -> Result<PreparedSource> {
        let registry = Rc::new(RefCell::new(Registry::new(
            origin.to_path_buf(),
            self.core_registry.clone(),
        )));
        let saved = self.ctx.walk.replace(WalkState {
            registry: Some(registry.clone()),
            origin: origin.to_path_buf(),
            ..Default::default()
        });
        let prepared =
            registry::prepare_source(&self.lua, &self.ctx, &registry, text, origin);
        *self.ctx.walk.borrow_mut() = saved;
        prepared
    }

    /// Prepared parse tree rendered as an S-expression, for `--ast`.
    pub fn ast_dump(&self, text: &str, origin: &Path) -> Result<String> {
        let prepared = self.prepare_source(text, origin)?;
        let mut store = self.ctx.store.borrow_mut();
        let tree = store.create_tree(&prepared.clean_source);
        let root = store.root_of_tree(tree);
        Ok(store.dump(root))
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.ctx.diagnostics
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }
}

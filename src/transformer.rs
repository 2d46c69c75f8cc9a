//! The walk + pending-rule scheduler. Pre-order, left-to-right: at each
//! node, macro evaluation precedes rule dispatch precedes child
//! recursion; a replacement's subtree is transformed to completion before
//! its following siblings; deferred rules converge through a bounded
//! fixed point over replacement frontiers.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::Path,
    rc::Rc,
};

use mlua::{Function, IntoLua, Lua, MultiValue, Table, Value};
use tracing::{debug, debug_span, instrument};

use crate::{
    diagnostics::Severity,
    error::{Result, UppError},
    helpers::{
        self, is_reported, macro_result_from_value, strip_marker, LuaNode, MacroResult,
    },
    pattern::Captures,
    registry::{self, PendingRule, Registry, RuleId, RuleMatcher, RuleScope},
    session::{Ctx, WalkState},
    tree::{EditPayload, NodeId},
};

const MAX_RULE_ITERATIONS: usize = 5;

#[derive(Default)]
struct RunState {
    transformed: HashSet<NodeId>,
    stack: Vec<NodeId>,
    /// rule-once guard: rules already applied per node instance
    applied: HashMap<NodeId, HashSet<RuleId>>,
    /// depth of nested rule-replacement transforms; mutually triggering
    /// rules otherwise recurse without bound
    rule_depth: usize,
    depth_warned: bool,
}

#[derive(Default)]
struct RuleOutcome {
    fired: bool,
    invalidated: bool,
    new_roots: Vec<NodeId>,
}

/// Transform one source through its registry and return the emitted text.
/// Reentrant: `@include` and `loadDependency` call back into this for the
/// dependency with its own registry, saving and restoring walk state.
#[instrument(level = "debug", skip_all, fields(origin = %origin.display()))]
pub fn run(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    source: &str,
    origin: &Path,
) -> Result<String> {
    let saved = ctx.walk.replace(WalkState {
        registry: Some(registry.clone()),
        origin: origin.to_path_buf(),
        ..Default::default()
    });
    let mutated = registry.borrow().mutated.clone();
    ctx.store
        .borrow_mut()
        .add_mutation_listener(Rc::new(move |_| mutated.set(true)));

    let result = run_prepared(lua, ctx, registry, source, origin);
    *ctx.walk.borrow_mut() = saved;
    result
}

fn run_prepared(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    source: &str,
    origin: &Path,
) -> Result<String> {
    let prepared = registry::prepare_source(lua, ctx, registry, source, origin)?;
    debug!(
        invocations = prepared.invocations.len(),
        "prepared source"
    );
    let tree = ctx.store.borrow_mut().create_tree(&prepared.clean_source);
    ctx.walk.borrow_mut().tree = Some(tree);

    let root = ctx.store.borrow().root_of_tree(tree);
    let mut state = RunState::default();
    transform_node(lua, ctx, registry, &mut state, root, false)?;
    evaluate_pending_rules(lua, ctx, registry, &mut state, vec![root])?;

    Ok(ctx.store.borrow().source_of_tree(tree).to_owned())
}

fn transform_node(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    state: &mut RunState,
    node: NodeId,
    force: bool,
) -> Result<()> {
    if !ctx.store.borrow().is_valid(node) || state.stack.contains(&node) {
        return Ok(());
    }
    if !force && state.transformed.contains(&node) {
        return Ok(());
    }
    state.stack.push(node);
    let result = process_node(lua, ctx, registry, state, node);
    state.stack.pop();
    state.transformed.insert(node);
    result
}

fn process_node(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    state: &mut RunState,
    node: NodeId,
) -> Result<()> {
    // 1) a comment-wrapped invocation expands in place
    let invocation = {
        let store = ctx.store.borrow();
        (store.kind(node) == store.adapter().spec().comment_kind)
            .then(|| registry::prepare::absorb_placeholder(store.text(node)))
            .flatten()
    };
    if let Some((name, args)) = invocation {
        if evaluate_invocation(lua, ctx, registry, state, node, &name, &args)? {
            return Ok(());
        }
    }

    // 2) pending rules, in registration order
    let outcome = try_rules(lua, ctx, registry, state, node)?;
    if outcome.invalidated {
        return Ok(());
    }

    // 3) children, over a snapshot
    let children = ctx.store.borrow().children(node);
    for child in children {
        transform_node(lua, ctx, registry, state, child, false)?;
    }

    // 4) nodes inserted beside the ones just visited
    loop {
        let pending = {
            let store = ctx.store.borrow();
            store
                .children(node)
                .into_iter()
                .filter(|child| {
                    store.is_valid(*child)
                        && !state.transformed.contains(child)
                        && !state.stack.contains(child)
                })
                .collect::<Vec<_>>()
        };
        if pending.is_empty() {
            break;
        }
        for child in pending {
            transform_node(lua, ctx, registry, state, child, false)?;
        }
    }
    Ok(())
}

/// Returns true when the invocation node was replaced or removed and the
/// walk should not descend into it.
fn evaluate_invocation(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    state: &mut RunState,
    node: NodeId,
    name: &str,
    args: &[String],
) -> Result<bool> {
    let result = evaluate_macro(lua, ctx, registry, node, name, args);

    if matches!(result, MacroResult::Absent) {
        if ctx.config.comments {
            return Ok(false);
        }
        // drop the placeholder from the output
        let removed = ctx
            .store
            .borrow_mut()
            .replace_node(node, EditPayload::Text(String::new()));
        if let Err(error) = removed {
            ctx.report_at_node(&error, Some(node), Severity::Warning);
        }
        return Ok(true);
    }

    if ctx.config.comments {
        let marker = ctx.store.borrow().text(node).to_owned();
        let _ = ctx.store.borrow_mut().insert_relative(
            node,
            crate::tree::InsertPosition::Before,
            EditPayload::Text(format!("{marker}\n")),
        );
    }
    let payload = result_to_payload(lua, ctx, registry, result)?;
    let replaced = ctx.store.borrow_mut().replace_node(node, payload);
    let new_nodes = match replaced {
        Ok(new_nodes) => new_nodes,
        Err(error) => {
            ctx.report_at_node(&error, Some(node), Severity::Error);
            return Ok(true);
        }
    };
    evaluate_pending_rules(lua, ctx, registry, state, new_nodes.clone())?;
    for new_node in new_nodes {
        transform_node(lua, ctx, registry, state, new_node, true)?;
    }
    Ok(true)
}

/// A string result that still contains directives goes through another
/// preparation pass before splicing, so nested invocations keep working.
fn result_to_payload(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    result: MacroResult,
) -> Result<EditPayload> {
    Ok(match result {
        MacroResult::Absent => EditPayload::Text(String::new()),
        MacroResult::Text(text) if text.contains('@') => {
            let origin = ctx.walk.borrow().origin.clone();
            let saved = ctx.walk.borrow().clone();
            let prepared = registry::prepare_source(lua, ctx, registry, &text, &origin)?;
            *ctx.walk.borrow_mut() = saved;
            EditPayload::Text(prepared.clean_source)
        }
        MacroResult::Text(text) => EditPayload::Text(text),
        MacroResult::Node(node) => EditPayload::Node(node),
        MacroResult::Nodes(nodes) => EditPayload::Nodes(nodes),
        MacroResult::Tree(tree) => EditPayload::Tree(tree),
    })
}

fn evaluate_macro(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    invocation_node: NodeId,
    name: &str,
    args: &[String],
) -> MacroResult {
    let Some(def) = registry.borrow().get_macro(name) else {
        ctx.report_at_node(
            &UppError::MacroLookup {
                name: name.to_owned(),
            },
            Some(invocation_node),
            Severity::Error,
        );
        return MacroResult::Absent;
    };

    // arity is checked before any tree mutation
    let expected = def.expected_args();
    let arity_ok = if def.is_variadic() {
        args.len() >= expected
    } else {
        args.len() == expected
    };
    if !arity_ok {
        ctx.report_at_node(
            &UppError::Arity {
                name: name.to_owned(),
                expected: if def.is_variadic() {
                    format!("at least {expected}")
                } else {
                    expected.to_string()
                },
                actual: args.len(),
            },
            Some(invocation_node),
            Severity::Error,
        );
        return MacroResult::Absent;
    }

    // a transformer macro receives the following AST node first
    let node_arg = def
        .is_transformer()
        .then(|| ctx.store.borrow().sibling_after(invocation_node, true))
        .flatten();
    if def.is_transformer() && node_arg.is_none() {
        ctx.report_at_node(
            &UppError::MacroBody {
                message: format!("@{name} expects a following node to transform"),
            },
            Some(invocation_node),
            Severity::Error,
        );
        return MacroResult::Absent;
    }

    {
        let mut walk = ctx.walk.borrow_mut();
        walk.context_node = Some(invocation_node);
        walk.consume_cursor = None;
        walk.last_consumed = None;
    }
    if let Err(error) = helpers::refresh_context(lua, ctx) {
        ctx.report_at_node(
            &UppError::Script(error.to_string()),
            Some(invocation_node),
            Severity::Error,
        );
        return MacroResult::Absent;
    }

    let span = debug_span!("evaluate macro", name).entered();
    let outcome = call_macro(lua, ctx, &def, node_arg, args);
    span.exit();

    match outcome {
        Ok(value) => match macro_result_from_value(ctx, lua, value) {
            Ok(result) => result,
            Err(error) => {
                report_script_error(ctx, invocation_node, &error);
                MacroResult::Absent
            }
        },
        Err(error) => {
            report_script_error(ctx, invocation_node, &error);
            MacroResult::Absent
        }
    }
}

fn call_macro(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    def: &crate::registry::MacroDef,
    node_arg: Option<NodeId>,
    args: &[String],
) -> mlua::Result<Value> {
    let func: Function = lua.registry_value(&def.func)?;
    let upp: Table = lua.globals().get("upp")?;
    let console: Table = lua.globals().get("console")?;
    let code: Function = upp.get("code")?;

    let mut call_args: Vec<Value> = vec![
        Value::Table(upp),
        Value::Table(console),
        Value::Function(code),
    ];
    if let Some(node) = node_arg {
        call_args.push(LuaNode::new(ctx, node).into_lua(lua)?);
    }
    for arg in args {
        call_args.push(arg.as_str().into_lua(lua)?);
    }
    func.call::<Value>(MultiValue::from_iter(call_args))
}

fn report_script_error(ctx: &Rc<Ctx>, node: NodeId, error: &mlua::Error) {
    if is_reported(error) {
        return;
    }
    ctx.report_at_node(
        &UppError::MacroBody {
            message: strip_marker(&error.to_string()),
        },
        Some(node),
        Severity::Error,
    );
}

fn try_rules(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    state: &mut RunState,
    node: NodeId,
) -> Result<RuleOutcome> {
    let mut outcome = RuleOutcome::default();
    // a fresh snapshot per node: rules registered by earlier macros in the
    // same walk are already visible here
    let rules = registry.borrow().rules_snapshot();
    for rule in rules {
        if !ctx.store.borrow().is_valid(node) {
            outcome.invalidated = true;
            break;
        }
        if state
            .applied
            .get(&node)
            .map(|applied| applied.contains(&rule.id))
            .unwrap_or(false)
        {
            continue;
        }
        if !rule_in_scope(ctx, &rule, node) {
            continue;
        }
        let Ok(matched) = rule_matches(lua, ctx, &rule, node) else {
            // matcher failed; skip this rule for this node
            continue;
        };
        let Some(captures) = matched else {
            continue;
        };
        state.applied.entry(node).or_default().insert(rule.id);

        {
            let mut walk = ctx.walk.borrow_mut();
            walk.context_node = Some(node);
            walk.consume_cursor = None;
            walk.last_consumed = None;
        }
        let _ = helpers::refresh_context(lua, ctx);

        let result = invoke_rule_callback(lua, ctx, &rule, node, &captures);
        if matches!(result, MacroResult::Absent) {
            continue;
        }
        let payload = result_to_payload(lua, ctx, registry, result)?;
        let replaced = ctx.store.borrow_mut().replace_node(node, payload);
        let new_nodes = match replaced {
            Ok(new_nodes) => new_nodes,
            Err(error) => {
                ctx.report_at_node(&error, Some(node), Severity::Warning);
                continue;
            }
        };
        // the rule never retriggers inside its own replacement
        for &new_node in &new_nodes {
            let descendants = ctx.store.borrow().descendants(new_node);
            for descendant in descendants {
                state.applied.entry(descendant).or_default().insert(rule.id);
            }
        }
        outcome.fired = true;
        outcome.new_roots.extend(new_nodes.iter().copied());
        if state.rule_depth < MAX_RULE_ITERATIONS {
            state.rule_depth += 1;
            for new_node in new_nodes {
                transform_node(lua, ctx, registry, state, new_node, true)?;
            }
            state.rule_depth -= 1;
        } else if !state.depth_warned {
            state.depth_warned = true;
            let origin = ctx.walk.borrow().origin.clone();
            ctx.diagnostics.report_error(
                &UppError::RuleNonConvergence {
                    iterations: MAX_RULE_ITERATIONS,
                },
                origin,
                Default::default(),
                Severity::Warning,
            );
        }
        if !ctx.store.borrow().is_valid(node) {
            outcome.invalidated = true;
            break;
        }
    }
    Ok(outcome)
}

fn rule_in_scope(ctx: &Rc<Ctx>, rule: &PendingRule, node: NodeId) -> bool {
    match rule.scope {
        RuleScope::Root => true,
        RuleScope::Within(scope) => ctx.store.borrow().is_descendant_of(node, scope),
        RuleScope::Exact(target) => node == target,
    }
}

/// `Ok(Some(captures))` on a hit; `Err(())` when the matcher itself
/// failed (already reported).
fn rule_matches(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    rule: &PendingRule,
    node: NodeId,
) -> std::result::Result<Option<Captures>, ()> {
    match &rule.matcher {
        RuleMatcher::Identity(target) => Ok((node == *target).then(Captures::new)),
        RuleMatcher::Kind(kind) => {
            Ok((ctx.store.borrow().kind(node) == kind).then(Captures::new))
        }
        RuleMatcher::Predicate { kind, predicate } => {
            if let Some(kind) = kind {
                if ctx.store.borrow().kind(node) != kind {
                    return Ok(None);
                }
            }
            let predicate: Function = lua.registry_value(predicate).map_err(|_| ())?;
            match predicate.call::<Value>((LuaNode::new(ctx, node),)) {
                Ok(value) => Ok(truthy(&value).then(Captures::new)),
                Err(error) => {
                    report_script_error(ctx, node, &error);
                    Err(())
                }
            }
        }
        RuleMatcher::Pattern(pattern) => {
            Ok(pattern.match_node(&ctx.store.borrow(), node))
        }
        RuleMatcher::References(definition) => {
            if !ctx.store.borrow().is_valid(*definition) {
                return Ok(None);
            }
            let resolved = ctx
                .binding
                .get_definition(&ctx.store.borrow(), node);
            Ok((resolved == Some(*definition)).then(Captures::new))
        }
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

fn invoke_rule_callback(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    rule: &PendingRule,
    node: NodeId,
    captures: &Captures,
) -> MacroResult {
    let callback: Function = match lua.registry_value(&rule.callback) {
        Ok(callback) => callback,
        Err(error) => {
            report_script_error(ctx, node, &error);
            return MacroResult::Absent;
        }
    };
    let outcome = match &rule.matcher {
        RuleMatcher::Pattern(_) => {
            match crate::helpers::captures_table(ctx, lua, node, captures) {
                Ok(table) => callback.call::<Value>((table, LuaNode::new(ctx, node))),
                Err(error) => Err(error),
            }
        }
        _ => callback.call::<Value>((LuaNode::new(ctx, node),)),
    };
    match outcome {
        Ok(value) => match macro_result_from_value(ctx, lua, value) {
            Ok(result) => result,
            Err(error) => {
                report_script_error(ctx, node, &error);
                MacroResult::Absent
            }
        },
        Err(error) => {
            report_script_error(ctx, node, &error);
            MacroResult::Absent
        }
    }
}

/// The bounded fixed point over replacement frontiers: each sweep walks
/// the frontier's descendants in reverse source order, trying every rule
/// once per node; replacement subtrees seed the next sweep. Terminates
/// when a sweep neither fires nor mutates, or at the cap with a
/// non-convergence warning.
fn evaluate_pending_rules(
    lua: &Lua,
    ctx: &Rc<Ctx>,
    registry: &Rc<RefCell<Registry>>,
    state: &mut RunState,
    mut roots: Vec<NodeId>,
) -> Result<()> {
    if roots.is_empty() {
        return Ok(());
    }
    let mut iterations = 0usize;
    while iterations < MAX_RULE_ITERATIONS {
        iterations += 1;
        let span = debug_span!("pending-rule sweep", iteration = iterations).entered();
        let version_before = ctx.store.borrow().version();
        let mut fired = false;
        let mut next_roots: Vec<NodeId> = Vec::new();

        let mut frontier = Vec::new();
        {
            let store = ctx.store.borrow();
            for &root in &roots {
                if store.is_valid(root) {
                    frontier.extend(store.descendants_reverse_source_order(root));
                }
            }
        }
        for node in frontier {
            if !ctx.store.borrow().is_valid(node) {
                continue;
            }
            let outcome = try_rules(lua, ctx, registry, state, node)?;
            fired |= outcome.fired;
            next_roots.extend(outcome.new_roots);
        }
        span.exit();

        let mutated = ctx.store.borrow().version() != version_before;
        if !fired && !mutated {
            return Ok(());
        }
        if !next_roots.is_empty() {
            roots = next_roots;
        }
    }
    let origin = ctx.walk.borrow().origin.clone();
    ctx.diagnostics.report_error(
        &UppError::RuleNonConvergence {
            iterations: MAX_RULE_ITERATIONS,
        },
        origin,
        Default::default(),
        Severity::Warning,
    );
    Ok(())
}

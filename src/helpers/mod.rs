//! The `upp` facade macro bodies program against. Every helper is a
//! scripting function bound over the session context; the walk-dependent
//! entries (`upp.node`, `upp.root`, `upp.lastConsumed`) are refreshed by
//! the transformer before each evaluation.

use std::{cell::RefCell, rc::Rc};

use itertools::Itertools;
use mlua::{Function, Lua, Table, Value, Variadic};
use tracing::debug;

use crate::{
    diagnostics::Severity,
    error::{Result, UppError},
    pattern::{Binding, Captures, Pattern},
    registry::{self, PendingRule, RuleMatcher, RuleScope},
    session::Ctx,
    tree::{EditPayload, NodeId, Span, TreeId},
};

pub mod code;
pub mod node;

pub use node::{
    is_reported, macro_result_from_value, payload_from_value, reported_error, strip_marker,
    LuaNode, LuaTree, MacroResult,
};

/// Build the `upp` and `console` globals once per session.
pub fn install_globals(lua: &Lua, ctx: &Rc<Ctx>) -> mlua::Result<()> {
    let upp = lua.create_table()?;

    register_consume(lua, ctx, &upp)?;
    register_edit(lua, ctx, &upp)?;
    register_traversal(lua, ctx, &upp)?;
    register_rules(lua, ctx, &upp)?;
    register_language(lua, ctx, &upp)?;
    register_misc(lua, ctx, &upp)?;

    lua.globals().set("upp", upp)?;
    lua.globals().set("console", make_console(lua)?)?;
    Ok(())
}

/// Rebind the walk-dependent entries to the current context.
pub fn refresh_context(lua: &Lua, ctx: &Rc<Ctx>) -> mlua::Result<()> {
    let upp: Table = lua.globals().get("upp")?;
    let (context_node, tree, last_consumed) = {
        let walk = ctx.walk.borrow();
        (walk.context_node, walk.tree, walk.last_consumed)
    };
    set_opt_node(ctx, &upp, "node", context_node)?;
    let root = tree.map(|tree| ctx.store.borrow().root_of_tree(tree));
    set_opt_node(ctx, &upp, "root", root)?;
    set_opt_node(ctx, &upp, "lastConsumed", last_consumed)?;
    Ok(())
}

fn set_opt_node(
    ctx: &Rc<Ctx>,
    upp: &Table,
    key: &str,
    id: Option<NodeId>,
) -> mlua::Result<()> {
    match id {
        Some(id) => upp.set(key, LuaNode::new(ctx, id)),
        None => upp.set(key, Value::Nil),
    }
}

fn make_console(lua: &Lua) -> mlua::Result<Table> {
    let console = lua.create_table()?;
    for level in ["log", "warn", "error"] {
        console.set(
            level,
            lua.create_function(move |lua, values: Variadic<Value>| {
                let rendered = values
                    .iter()
                    .map(|value| {
                        lua.coerce_string(value.clone())
                            .ok()
                            .flatten()
                            .map(|text| text.to_string_lossy().to_string())
                            .unwrap_or_else(|| format!("<{}>", value.type_name()))
                    })
                    .join(" ");
                eprintln!("{rendered}");
                Ok(())
            })?,
        )?;
    }
    Ok(console)
}

// --- consume / nextNode -------------------------------------------------

struct ConsumeSpec {
    types: Vec<String>,
    validate: Option<Function>,
    message: Option<String>,
}

fn parse_consume_spec(spec: Option<Value>, message: Option<String>) -> mlua::Result<ConsumeSpec> {
    let mut parsed = ConsumeSpec {
        types: Vec::new(),
        validate: None,
        message,
    };
    match spec {
        None | Some(Value::Nil) => {}
        Some(Value::String(type_name)) => {
            parsed.types.push(type_name.to_string_lossy().to_string());
        }
        Some(Value::Table(table)) => {
            if table.contains_key("type")? || table.contains_key("validate")? {
                match table.get::<Value>("type")? {
                    Value::String(type_name) => {
                        parsed.types.push(type_name.to_string_lossy().to_string())
                    }
                    Value::Table(types) => {
                        for type_name in types.sequence_values::<String>() {
                            parsed.types.push(type_name?);
                        }
                    }
                    _ => {}
                }
                parsed.validate = table.get("validate")?;
                if parsed.message.is_none() {
                    parsed.message = table.get("message")?;
                }
            } else {
                for type_name in table.sequence_values::<String>() {
                    parsed.types.push(type_name?);
                }
            }
        }
        Some(other) => {
            return Err(mlua::Error::RuntimeError(format!(
                "consume expects a type name, list, or options table, got {}",
                other.type_name()
            )))
        }
    }
    Ok(parsed)
}

fn consume_impl(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    spec: ConsumeSpec,
    remove: bool,
) -> mlua::Result<Option<LuaNode>> {
    let skip_comments = !spec.types.iter().any(|type_name| type_name == "comment");
    let candidate = {
        let walk = ctx.walk.borrow();
        let store = ctx.store.borrow();
        match walk.consume_cursor {
            Some((parent, index)) => store.sibling_at_or_after(parent, index, skip_comments),
            None => walk
                .context_node
                .and_then(|node| store.sibling_after(node, skip_comments)),
        }
    };

    let required = !spec.types.is_empty() || spec.validate.is_some();
    let Some(candidate) = candidate else {
        if required {
            return Err(consume_mismatch(ctx, spec.message.as_deref().unwrap_or("no following node to consume")));
        }
        return Ok(None);
    };

    if !spec.types.is_empty() {
        let kind = ctx.store.borrow().kind(candidate).to_owned();
        if !spec.types.iter().any(|type_name| *type_name == kind) {
            let message = spec.message.clone().unwrap_or_else(|| {
                format!("expected {} but found {kind}", spec.types.join(" or "))
            });
            return Err(consume_mismatch(ctx, &message));
        }
    }
    if let Some(validate) = &spec.validate {
        let accepted: bool = validate.call((LuaNode::new(ctx, candidate),))?;
        if !accepted {
            let message = spec
                .message
                .clone()
                .unwrap_or_else(|| "node rejected by validator".to_owned());
            return Err(consume_mismatch(ctx, &message));
        }
    }

    if remove {
        let parent = ctx.store.borrow().parent(candidate);
        let index = ctx.store.borrow().child_index(candidate);
        let removed = ctx.store.borrow_mut().remove_node(candidate);
        if let Err(error) = removed {
            ctx.report_at_node(&error, None, Severity::Error);
            return Err(reported_error(error));
        }
        {
            let mut walk = ctx.walk.borrow_mut();
            if let (Some(parent), Some(index)) = (parent, index) {
                walk.consume_cursor = Some((parent, index));
            }
            walk.last_consumed = Some(candidate);
        }
        let upp: Table = lua.globals().get("upp")?;
        upp.set("lastConsumed", LuaNode::new(ctx, candidate))?;
    }
    Ok(Some(LuaNode::new(ctx, candidate)))
}

fn consume_mismatch(ctx: &Rc<Ctx>, message: &str) -> mlua::Error {
    let error = UppError::ConsumeMismatch {
        message: message.to_owned(),
    };
    let context_node = ctx.walk.borrow().context_node;
    ctx.report_at_node(&error, context_node, Severity::Error);
    reported_error(error)
}

fn register_consume(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "consume",
        lua.create_function(move |lua, (spec, message): (Option<Value>, Option<String>)| {
            consume_impl(&rc, lua, parse_consume_spec(spec, message)?, true)
        })?,
    )?;
    let rc = ctx.clone();
    upp.set(
        "nextNode",
        lua.create_function(move |lua, (spec, message): (Option<Value>, Option<String>)| {
            consume_impl(&rc, lua, parse_consume_spec(spec, message)?, false)
        })?,
    )?;
    Ok(())
}

// --- replace / code / hoist ---------------------------------------------

fn register_edit(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "replace",
        lua.create_function(move |lua, (target, result): (Value, Value)| {
            replace_impl(&rc, lua, target, result)
        })?,
    )?;

    let rc = ctx.clone();
    let code = lua.create_function(move |lua, (template, binds): (String, Option<Table>)| {
        let nodes = code::evaluate_template(&rc, lua, &template, binds)?;
        Ok(nodes_to_value(&rc, lua, nodes)?)
    })?;
    upp.set("code", code.clone())?;
    upp.set("c", code)?;

    let rc = ctx.clone();
    upp.set(
        "hoist",
        lua.create_function(move |_, text: String| hoist_impl(&rc, &text))?,
    )?;
    Ok(())
}

fn replace_impl(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    target: Value,
    result: Value,
) -> mlua::Result<Vec<LuaNode>> {
    let payload = payload_from_value(ctx, lua, result)?;
    let outcome = match &target {
        Value::UserData(userdata) if userdata.borrow::<LuaNode>().is_ok() => {
            let id = userdata.borrow::<LuaNode>().unwrap().id;
            let replaced = ctx.store.borrow_mut().replace_node(id, payload);
            replaced
        }
        Value::Table(range) => {
            let start: usize = range.get("start")?;
            let end: usize = range.get("end")?;
            let tree = current_tree(ctx)?;
            let replaced = ctx
                .store
                .borrow_mut()
                .replace_range(tree, Span::new(start, end), payload);
            replaced
        }
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "replace expects a node or {{start, end}} range, got {}",
                other.type_name()
            )))
        }
    };
    match outcome {
        Ok(nodes) => Ok(nodes
            .into_iter()
            .map(|node| LuaNode::new(ctx, node))
            .collect()),
        Err(error @ UppError::StaleHandle) => {
            // replacing an invalidated handle is a no-op with a diagnostic
            ctx.report_at_node(&error, None, Severity::Warning);
            Ok(Vec::new())
        }
        Err(error) => {
            ctx.report_at_node(&error, None, Severity::Error);
            Err(reported_error(error))
        }
    }
}

/// Insert at the top of the file, after the contiguous leading block of
/// comments and preprocessor directives.
fn hoist_impl(ctx: &Rc<Ctx>, text: &str) -> mlua::Result<Vec<LuaNode>> {
    let tree = current_tree(ctx)?;
    let (root, index, offset) = {
        let store = ctx.store.borrow();
        let root = store.root_of_tree(tree);
        let mut index = 0usize;
        let mut offset = 0usize;
        for child in store.children(root) {
            if store.is_valid(child) && store.is_prelude_kind(child) {
                index += 1;
                offset = store.span(child).unwrap().end;
            } else {
                break;
            }
        }
        (root, index, offset)
    };
    let insertion = if offset == 0 {
        format!("{text}\n")
    } else {
        format!("\n{text}")
    };
    let inserted = ctx
        .store
        .borrow_mut()
        .insert_payload(tree, root, index, offset, EditPayload::Text(insertion));
    let nodes = match inserted {
        Ok(nodes) => nodes,
        Err(error) => {
            ctx.report_at_node(&error, None, Severity::Error);
            return Err(reported_error(error));
        }
    };
    Ok(nodes
        .into_iter()
        .map(|node| LuaNode::new(ctx, node))
        .collect())
}

// --- walk / query / match -----------------------------------------------

fn register_traversal(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "walk",
        lua.create_function(move |_, (start, callback): (LuaNode, Function)| {
            let mut stack = vec![start.id];
            while let Some(id) = stack.pop() {
                if !rc.store.borrow().is_valid(id) {
                    continue;
                }
                let keep: Value = callback.call((LuaNode::new(&rc, id),))?;
                if keep == Value::Boolean(false) {
                    continue;
                }
                let children = rc.store.borrow().children(id);
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            }
            Ok(())
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "query",
        lua.create_function(move |lua, (pattern, scope): (String, Option<LuaNode>)| {
            query_impl(&rc, lua, &pattern, scope)
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "match",
        lua.create_function(move |lua, (pattern, target): (String, LuaNode)| {
            let compiled = compile_pattern_or_err(&rc, &pattern)?;
            let captures = compiled.match_node(&rc.store.borrow(), target.id);
            match captures {
                Some(captures) => Ok(Value::Table(captures_table(
                    &rc, lua, target.id, &captures,
                )?)),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "matchAll",
        lua.create_function(move |lua, (pattern, scope): (String, Option<LuaNode>)| {
            let compiled = compile_pattern_or_err(&rc, &pattern)?;
            let scope = match scope {
                Some(scope) => scope.id,
                None => {
                    let tree = current_tree(&rc)?;
                    rc.store.borrow().root_of_tree(tree)
                }
            };
            let matches = compiled.match_all(&rc.store.borrow(), scope);
            matches
                .into_iter()
                .map(|(node, captures)| captures_table(&rc, lua, node, &captures))
                .collect::<mlua::Result<Vec<_>>>()
        })?,
    )?;
    Ok(())
}

fn query_impl(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    pattern: &str,
    scope: Option<LuaNode>,
) -> mlua::Result<Vec<Table>> {
    let tree = match &scope {
        Some(scope) => ctx.store.borrow().tree_of(scope.id),
        None => current_tree(ctx)?,
    };
    let range = scope
        .as_ref()
        .and_then(|scope| ctx.store.borrow().span(scope.id))
        .map(|span| span.start..span.end);
    let matches = {
        let store = ctx.store.borrow();
        let source = store.source_of_tree(tree).to_owned();
        store.adapter().run_query(&source, pattern, range)
    };
    let matches = match matches {
        Ok(matches) => matches,
        Err(error) => {
            ctx.report_at_node(&error, None, Severity::Error);
            return Err(reported_error(error));
        }
    };
    matches
        .into_iter()
        .map(|query_match| {
            let captures = lua.create_table()?;
            for capture in query_match.captures {
                let handle = ctx
                    .store
                    .borrow()
                    .handle_for_span(tree, Span::new(capture.start, capture.end));
                captures.set(capture.name, LuaNode::new(ctx, handle))?;
            }
            let entry = lua.create_table()?;
            entry.set("pattern", query_match.pattern_index)?;
            entry.set("captures", captures)?;
            Ok(entry)
        })
        .collect()
}

pub(crate) fn captures_table(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    matched: NodeId,
    captures: &Captures,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("node", LuaNode::new(ctx, matched))?;
    for (name, binding) in captures {
        match binding {
            Binding::One(node) => table.set(name.as_str(), LuaNode::new(ctx, *node))?,
            Binding::Many(nodes) => table.set(
                name.as_str(),
                nodes
                    .iter()
                    .map(|&node| LuaNode::new(ctx, node))
                    .collect::<Vec<_>>(),
            )?,
        }
    }
    Ok(table)
}

pub fn compile_pattern(ctx: &Rc<Ctx>, source: &str) -> Result<Rc<Pattern>> {
    if let Some(pattern) = ctx.patterns.borrow().get(source) {
        return Ok(pattern.clone());
    }
    let pattern = Rc::new(Pattern::compile(&mut ctx.store.borrow_mut(), source)?);
    ctx.patterns
        .borrow_mut()
        .insert(source.to_owned(), pattern.clone());
    Ok(pattern)
}

fn compile_pattern_or_err(ctx: &Rc<Ctx>, source: &str) -> mlua::Result<Rc<Pattern>> {
    compile_pattern(ctx, source).map_err(|error| {
        ctx.report_at_node(&error, None, Severity::Error);
        reported_error(error)
    })
}

// --- pending-rule registration ------------------------------------------

fn register_rules(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "withNode",
        lua.create_function(move |lua, (target, callback): (LuaNode, Function)| {
            register_rule(
                &rc,
                lua,
                RuleScope::Exact(target.id),
                RuleMatcher::Identity(target.id),
                callback,
                false,
            )
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "withRoot",
        lua.create_function(move |lua, callback: Function| {
            let tree = current_tree(&rc)?;
            let root = rc.store.borrow().root_of_tree(tree);
            register_rule(
                &rc,
                lua,
                RuleScope::Exact(root),
                RuleMatcher::Identity(root),
                callback,
                false,
            )
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "withScope",
        lua.create_function(move |lua, (scope, callback): (LuaNode, Function)| {
            register_rule(
                &rc,
                lua,
                RuleScope::Exact(scope.id),
                RuleMatcher::Identity(scope.id),
                callback,
                false,
            )
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "withMatch",
        lua.create_function(
            move |lua, (scope, pattern, callback): (Value, String, Function)| {
                let compiled = compile_pattern_or_err(&rc, &pattern)?;
                let scope = match &scope {
                    Value::UserData(userdata) => userdata
                        .borrow::<LuaNode>()
                        .map(|node| RuleScope::Within(node.id))
                        .unwrap_or(RuleScope::Root),
                    _ => RuleScope::Root,
                };
                register_rule(
                    &rc,
                    lua,
                    scope,
                    RuleMatcher::Pattern(compiled),
                    callback,
                    false,
                )
            },
        )?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "withPattern",
        lua.create_function(
            move |lua,
                  (kind, matcher, callback): (Option<String>, Function, Option<Function>)| {
                let (matcher, callback) = match callback {
                    Some(callback) => (
                        RuleMatcher::Predicate {
                            kind: kind.clone(),
                            predicate: Rc::new(lua.create_registry_value(matcher)?),
                        },
                        callback,
                    ),
                    None => (
                        match kind.clone() {
                            Some(kind) => RuleMatcher::Kind(kind),
                            None => {
                                return Err(mlua::Error::RuntimeError(
                                    "withPattern needs a node type or a matcher".to_owned(),
                                ))
                            }
                        },
                        matcher,
                    ),
                };
                register_rule(&rc, lua, RuleScope::Root, matcher, callback, false)
            },
        )?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "withReferences",
        lua.create_function(move |lua, (definition, callback): (LuaNode, Function)| {
            register_rule(
                &rc,
                lua,
                RuleScope::Root,
                RuleMatcher::References(definition.id),
                callback,
                false,
            )
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "registerParentTransform",
        lua.create_function(
            move |lua, (spec, first, second): (Value, Function, Option<Function>)| {
                let (matcher, callback) = parent_transform_matcher(&rc, lua, spec, first, second)?;
                register_rule(&rc, lua, RuleScope::Root, matcher, callback, true)
            },
        )?,
    )?;
    Ok(())
}

fn parent_transform_matcher(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    spec: Value,
    first: Function,
    second: Option<Function>,
) -> mlua::Result<(RuleMatcher, Function)> {
    let kind_or_pattern = match &spec {
        Value::String(text) => Some(text.to_string_lossy().to_string()),
        _ => None,
    };
    match (kind_or_pattern, second) {
        (Some(text), second) => {
            let matcher = if text.contains('$') || text.contains(char::is_whitespace) {
                RuleMatcher::Pattern(compile_pattern_or_err(ctx, &text)?)
            } else {
                match &second {
                    Some(_) => RuleMatcher::Predicate {
                        kind: Some(text),
                        predicate: Rc::new(lua.create_registry_value(first.clone())?),
                    },
                    None => RuleMatcher::Kind(text),
                }
            };
            Ok((matcher, second.unwrap_or(first)))
        }
        (None, _) => Err(mlua::Error::RuntimeError(
            "registerParentTransform needs a node type or pattern".to_owned(),
        )),
    }
}

fn register_rule(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    scope: RuleScope,
    matcher: RuleMatcher,
    callback: Function,
    on_parent: bool,
) -> mlua::Result<()> {
    let registry = current_registry(ctx)?;
    let callback = Rc::new(lua.create_registry_value(callback)?);
    let rule = Rc::new(PendingRule {
        id: ctx.next_rule_id(),
        context_node: ctx.walk.borrow().context_node,
        scope,
        matcher,
        callback,
        origin: ctx.walk.borrow().origin.clone(),
    });
    debug!(rule = rule.id, on_parent, "registered pending rule");
    if on_parent {
        let parent = registry.borrow().parent.clone();
        match parent {
            Some(parent) => {
                parent.borrow_mut().install_rule(rule.clone());
                // only handle-free rules can be replayed from the cache
                if rule.is_exportable() {
                    registry.borrow_mut().exported_rules.push(rule);
                }
            }
            None => registry.borrow_mut().install_rule(rule),
        }
    } else {
        registry.borrow_mut().install_rule(rule);
    }
    Ok(())
}

// --- language-specific helpers ------------------------------------------

fn register_language(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "getDefinition",
        lua.create_function(move |_, target: LuaNode| {
            Ok(rc
                .binding
                .get_definition(&rc.store.borrow(), target.id)
                .map(|definition| LuaNode::new(&rc, definition)))
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "findReferences",
        lua.create_function(move |_, definition: LuaNode| {
            Ok(rc
                .binding
                .find_references(&rc.store.borrow(), definition.id)
                .into_iter()
                .map(|reference| LuaNode::new(&rc, reference))
                .collect::<Vec<_>>())
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "getType",
        lua.create_function(move |_, definition: LuaNode| {
            Ok(rc.binding.get_type(&rc.store.borrow(), definition.id))
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "getFunctionSignature",
        lua.create_function(move |lua, function: LuaNode| {
            let signature = rc
                .binding
                .function_signature(&rc.store.borrow(), function.id);
            match signature {
                None => Ok(Value::Nil),
                Some(signature) => {
                    let table = lua.create_table()?;
                    table.set("name", signature.name)?;
                    table.set("returnType", signature.return_type)?;
                    table.set("params", signature.params)?;
                    match signature.body {
                        Some(body) => table.set("bodyNode", LuaNode::new(&rc, body))?,
                        None => table.set("bodyNode", Value::Nil)?,
                    }
                    Ok(Value::Table(table))
                }
            }
        })?,
    )?;
    Ok(())
}

// --- everything else -----------------------------------------------------

fn register_misc(lua: &Lua, ctx: &Rc<Ctx>, upp: &Table) -> mlua::Result<()> {
    let rc = ctx.clone();
    upp.set(
        "createUniqueIdentifier",
        lua.create_function(move |_, prefix: Option<String>| {
            let registry = current_registry(&rc)?;
            let name = registry
                .borrow()
                .next_unique(prefix.as_deref().unwrap_or("upp"));
            Ok(name)
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "loadDependency",
        lua.create_function(move |lua, file: String| {
            let registry = current_registry(&rc)?;
            let origin = rc.walk.borrow().origin.clone();
            let Some(resolved) = registry::resolve_include(&origin, &rc.config, &file) else {
                let error = UppError::Resolve { path: file };
                let context_node = rc.walk.borrow().context_node;
                rc.report_at_node(&error, context_node, Severity::Error);
                return Err(reported_error(error));
            };
            registry::load_dependency(lua, &rc, &registry, &resolved).map_err(|error| {
                rc.report_at_node(&error, None, Severity::Error);
                reported_error(error)
            })?;
            Ok(true)
        })?,
    )?;

    let rc = ctx.clone();
    upp.set(
        "error",
        lua.create_function(move |_, (target, message): (Value, Option<String>)| {
            let (node, message) = match (&target, message) {
                (Value::String(text), _) => (None, text.to_string_lossy().to_string()),
                (Value::UserData(userdata), message) => (
                    userdata.borrow::<LuaNode>().ok().map(|node| node.id),
                    message.unwrap_or_else(|| "macro error".to_owned()),
                ),
                (_, message) => (None, message.unwrap_or_else(|| "macro error".to_owned())),
            };
            let error = UppError::MacroBody {
                message: message.clone(),
            };
            rc.report_at_node(&error, node, Severity::Error);
            Err::<(), _>(reported_error(message))
        })?,
    )?;
    Ok(())
}

// --- shared context access ----------------------------------------------

pub(crate) fn current_tree(ctx: &Rc<Ctx>) -> mlua::Result<TreeId> {
    ctx.walk
        .borrow()
        .tree
        .ok_or_else(|| mlua::Error::RuntimeError("no source tree in scope".to_owned()))
}

pub(crate) fn current_registry(
    ctx: &Rc<Ctx>,
) -> mlua::Result<Rc<RefCell<crate::registry::Registry>>> {
    ctx.walk
        .borrow()
        .registry
        .clone()
        .ok_or_else(|| mlua::Error::RuntimeError("no registry in scope".to_owned()))
}

fn nodes_to_value(ctx: &Rc<Ctx>, lua: &Lua, nodes: Vec<NodeId>) -> mlua::Result<Value> {
    use mlua::IntoLua;
    match nodes.len() {
        0 => Ok(Value::Nil),
        1 => LuaNode::new(ctx, nodes[0]).into_lua(lua),
        _ => nodes
            .into_iter()
            .map(|node| LuaNode::new(ctx, node))
            .collect::<Vec<_>>()
            .into_lua(lua),
    }
}

//! The `upp.code` template: a literal skeleton with `$name` / `${name}`
//! placeholders, parsed as a fragment once assembled. Interpolated node
//! handles are migrated into the new fragment rather than stringified,
//! so identity survives the round trip.

use std::{collections::HashSet, rc::Rc};

use mlua::{Lua, Table, Value};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    diagnostics::Severity,
    error::UppError,
    helpers::node::{payload_from_value, reported_error},
    session::Ctx,
    tree::{EditPayload, NodeId, Span},
};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

struct NodeGraft {
    offset: usize,
    length: usize,
    node: NodeId,
}

/// Build the fragment and return its top-level handles in source order.
pub fn evaluate_template(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    template: &str,
    binds: Option<Table>,
) -> mlua::Result<Vec<NodeId>> {
    let mut assembled = String::new();
    let mut grafts: Vec<NodeGraft> = Vec::new();
    let mut migrated: HashSet<NodeId> = HashSet::new();
    let mut copied = 0usize;

    for captures in PLACEHOLDER.captures_iter(template) {
        let whole = captures.get(0).unwrap();
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .unwrap()
            .as_str();
        assembled.push_str(&template[copied..whole.start()]);
        copied = whole.end();

        let value: Value = match &binds {
            Some(table) => table.get(name)?,
            None => Value::Nil,
        };
        if value.is_nil() {
            return Err(mlua::Error::RuntimeError(format!(
                "code template references unbound ${name}"
            )));
        }
        append_value(ctx, lua, value, &mut assembled, &mut grafts, &mut migrated)?;
    }
    assembled.push_str(&template[copied..]);

    let fragment = ctx.store.borrow_mut().create_fragment(&assembled);
    let Some((tree, inner, content_offset)) = fragment else {
        let error = UppError::Parse {
            path: ctx.walk.borrow().origin.clone(),
        };
        ctx.report_at_node(&error, None, Severity::Error);
        return Err(reported_error(format!(
            "code template did not parse: {assembled}"
        )));
    };

    let mut displaced = Vec::new();
    {
        let mut store = ctx.store.borrow_mut();
        for graft in &grafts {
            let region = Span::new(
                graft.offset + content_offset,
                graft.offset + content_offset + graft.length,
            );
            if let Some(target) = store.graft_identity(tree, region, graft.node) {
                displaced.push((target, graft.node));
            }
        }
    }

    let store = ctx.store.borrow();
    Ok(inner
        .into_iter()
        .map(|id| {
            displaced
                .iter()
                .find(|&&(target, _)| target == id)
                .map(|&(_, node)| node)
                .unwrap_or(id)
        })
        .filter(|&id| store.is_valid(id))
        .collect())
}

fn append_value(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    value: Value,
    assembled: &mut String,
    grafts: &mut Vec<NodeGraft>,
    migrated: &mut HashSet<NodeId>,
) -> mlua::Result<()> {
    match payload_from_value(ctx, lua, value)? {
        EditPayload::Text(text) => assembled.push_str(&text),
        EditPayload::Node(node) => append_node(ctx, node, assembled, grafts, migrated),
        EditPayload::Nodes(nodes) => {
            if let Some(covering) = contiguous_run(ctx, &nodes) {
                let base = assembled.len();
                let first_start = ctx.store.borrow().span(nodes[0]).unwrap().start;
                assembled.push_str(&covering);
                for &node in &nodes {
                    if migrated.insert(node) {
                        let span = ctx.store.borrow().span(node).unwrap();
                        grafts.push(NodeGraft {
                            offset: base + (span.start - first_start),
                            length: span.len(),
                            node,
                        });
                    }
                }
            } else {
                for (position, &node) in nodes.iter().enumerate() {
                    if position > 0 {
                        assembled.push(' ');
                    }
                    append_node(ctx, node, assembled, grafts, migrated);
                }
            }
        }
        EditPayload::Tree(tree) => {
            let (source, children) = {
                let store = ctx.store.borrow();
                (
                    store.source_of_tree(tree).to_owned(),
                    store.children(store.root_of_tree(tree)),
                )
            };
            let base = assembled.len();
            assembled.push_str(&source);
            for node in children {
                let span = ctx.store.borrow().span(node);
                if let Some(span) = span {
                    if migrated.insert(node) {
                        grafts.push(NodeGraft {
                            offset: base + span.start,
                            length: span.len(),
                            node,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn append_node(
    ctx: &Rc<Ctx>,
    node: NodeId,
    assembled: &mut String,
    grafts: &mut Vec<NodeGraft>,
    migrated: &mut HashSet<NodeId>,
) {
    let text = ctx.store.borrow().text(node).to_owned();
    // the same handle can only hold one place; later occurrences copy text
    if ctx.store.borrow().is_valid(node) && migrated.insert(node) {
        grafts.push(NodeGraft {
            offset: assembled.len(),
            length: text.len(),
            node,
        });
    }
    assembled.push_str(&text);
}

/// Consecutive siblings of one tree interpolate with the source between
/// them preserved.
fn contiguous_run(ctx: &Rc<Ctx>, nodes: &[NodeId]) -> Option<String> {
    let store = ctx.store.borrow();
    let first = *nodes.first()?;
    let tree = store.tree_of(first);
    let parent = store.parent(first)?;
    let mut expected = store.child_index(first)?;
    for &node in nodes {
        if store.tree_of(node) != tree
            || store.parent(node) != Some(parent)
            || store.child_index(node) != Some(expected)
            || !store.is_valid(node)
        {
            return None;
        }
        expected += 1;
    }
    let start = store.span(first)?.start;
    let end = store.span(*nodes.last()?)?.end;
    Some(store.source_of_tree(tree)[start..end].to_owned())
}

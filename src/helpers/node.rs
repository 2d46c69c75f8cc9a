//! Scripting-side handles. A `LuaNode` wraps a stable node id; equality
//! is id equality, so identity survives edits and migration. An
//! invalidated handle reads back `startIndex == -1`.

use std::rc::Rc;

use mlua::{Lua, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};

use crate::{
    diagnostics::Severity,
    error::UppError,
    session::Ctx,
    tree::{EditPayload, InsertPosition, NodeId, TreeId},
};

/// Marker smuggled through scripting errors that were already reported
/// as diagnostics, so the invocation boundary does not report them twice.
pub const REPORTED_MARKER: &str = "\u{1}upp-reported\u{1}";

pub fn reported_error(message: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{REPORTED_MARKER}{message}"))
}

pub fn is_reported(error: &mlua::Error) -> bool {
    error.to_string().contains(REPORTED_MARKER)
}

pub fn strip_marker(message: &str) -> String {
    message.replace(REPORTED_MARKER, "")
}

#[derive(Clone)]
pub struct LuaNode {
    pub ctx: Rc<Ctx>,
    pub id: NodeId,
}

impl LuaNode {
    pub fn new(ctx: &Rc<Ctx>, id: NodeId) -> Self {
        Self {
            ctx: ctx.clone(),
            id,
        }
    }
}

impl mlua::FromLua for LuaNode {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        let node = value
            .as_userdata()
            .and_then(|userdata| userdata.borrow::<LuaNode>().ok());
        match node {
            Some(node) => Ok(LuaNode {
                ctx: node.ctx.clone(),
                id: node.id,
            }),
            None => Err(mlua::Error::FromLuaConversionError {
                from: "value",
                to: "SourceNode".to_owned(),
                message: Some("expected a source node".to_owned()),
            }),
        }
    }
}

impl UserData for LuaNode {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("text", |_, this| {
            Ok(this.ctx.store.borrow().text(this.id).to_owned())
        });
        fields.add_field_method_set("text", |_, this, value: String| {
            let result = this.ctx.store.borrow_mut().set_text(this.id, &value);
            stale_to_diagnostic(this, result).map(|_| ())
        });
        fields.add_field_method_get("type", |_, this| {
            Ok(this.ctx.store.borrow().kind(this.id).to_owned())
        });
        fields.add_field_method_get("startIndex", |_, this| {
            Ok(this
                .ctx
                .store
                .borrow()
                .span(this.id)
                .map(|span| span.start as i64)
                .unwrap_or(-1))
        });
        fields.add_field_method_get("endIndex", |_, this| {
            Ok(this
                .ctx
                .store
                .borrow()
                .span(this.id)
                .map(|span| span.end as i64)
                .unwrap_or(-1))
        });
        fields.add_field_method_get("parent", |_, this| {
            Ok(this
                .ctx
                .store
                .borrow()
                .parent(this.id)
                .map(|parent| LuaNode::new(&this.ctx, parent)))
        });
        fields.add_field_method_get("children", |_, this| {
            Ok(this
                .ctx
                .store
                .borrow()
                .children(this.id)
                .into_iter()
                .map(|child| LuaNode::new(&this.ctx, child))
                .collect::<Vec<_>>())
        });
        fields.add_field_method_get("namedChildren", |_, this| {
            let store = this.ctx.store.borrow();
            Ok(store
                .children(this.id)
                .into_iter()
                .filter(|&child| store.is_named(child))
                .map(|child| LuaNode::new(&this.ctx, child))
                .collect::<Vec<_>>())
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("childForFieldName", |_, this, name: String| {
            Ok(this
                .ctx
                .store
                .borrow()
                .child_by_field(this.id, &name)
                .map(|child| LuaNode::new(&this.ctx, child)))
        });
        methods.add_method("nextSibling", |_, this, ()| {
            Ok(this
                .ctx
                .store
                .borrow()
                .sibling_after(this.id, false)
                .map(|sibling| LuaNode::new(&this.ctx, sibling)))
        });
        methods.add_method("replaceWith", |lua, this, value: Value| {
            let payload = payload_from_value(&this.ctx, lua, value)?;
            let result = this.ctx.store.borrow_mut().replace_node(this.id, payload);
            let new_nodes = stale_to_diagnostic(this, result)?.unwrap_or_default();
            Ok(new_nodes
                .into_iter()
                .map(|node| LuaNode::new(&this.ctx, node))
                .collect::<Vec<_>>())
        });
        methods.add_method("insertBefore", |lua, this, value: Value| {
            insert_relative(lua, this, value, InsertPosition::Before)
        });
        methods.add_method("insertAfter", |lua, this, value: Value| {
            insert_relative(lua, this, value, InsertPosition::After)
        });
        methods.add_method("append", |lua, this, value: Value| {
            insert_relative(lua, this, value, InsertPosition::Append)
        });
        methods.add_method("remove", |_, this, ()| {
            let result = this.ctx.store.borrow_mut().remove_node(this.id);
            Ok(stale_to_diagnostic(this, result)?
                .map(|tree| LuaTree::new(&this.ctx, tree)))
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: LuaNode| {
            Ok(this.id == other.id)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.ctx.store.borrow().text(this.id).to_owned())
        });
    }
}

fn insert_relative(
    lua: &Lua,
    this: &LuaNode,
    value: Value,
    position: InsertPosition,
) -> mlua::Result<Vec<LuaNode>> {
    let payload = payload_from_value(&this.ctx, lua, value)?;
    let result = this
        .ctx
        .store
        .borrow_mut()
        .insert_relative(this.id, position, payload);
    Ok(stale_to_diagnostic(this, result)?
        .unwrap_or_default()
        .into_iter()
        .map(|node| LuaNode::new(&this.ctx, node))
        .collect())
}

/// A stale-handle edit is a no-op with a diagnostic; other errors surface
/// to the macro body.
fn stale_to_diagnostic<T>(
    node: &LuaNode,
    result: Result<T, UppError>,
) -> mlua::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error @ UppError::StaleHandle) => {
            node.ctx.report_at_node(&error, None, Severity::Warning);
            Ok(None)
        }
        Err(error) => Err(reported_error_with_report(node, error)),
    }
}

fn reported_error_with_report(node: &LuaNode, error: UppError) -> mlua::Error {
    node.ctx.report_at_node(&error, Some(node.id), Severity::Error);
    reported_error(error)
}

#[derive(Clone)]
pub struct LuaTree {
    pub ctx: Rc<Ctx>,
    pub id: TreeId,
}

impl LuaTree {
    pub fn new(ctx: &Rc<Ctx>, id: TreeId) -> Self {
        Self {
            ctx: ctx.clone(),
            id,
        }
    }
}

impl UserData for LuaTree {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("source", |_, this| {
            Ok(this.ctx.store.borrow().source_of_tree(this.id).to_owned())
        });
        fields.add_field_method_get("root", |_, this| {
            Ok(LuaNode::new(
                &this.ctx,
                this.ctx.store.borrow().root_of_tree(this.id),
            ))
        });
    }
}

/// What a macro body hands back, as a tagged variant the splice step
/// dispatches on.
pub enum MacroResult {
    Absent,
    Text(String),
    Node(NodeId),
    Nodes(Vec<NodeId>),
    Tree(TreeId),
}

pub fn macro_result_from_value(
    ctx: &Rc<Ctx>,
    lua: &Lua,
    value: Value,
) -> mlua::Result<MacroResult> {
    Ok(match value {
        Value::Nil => MacroResult::Absent,
        other => match payload_from_value(ctx, lua, other)? {
            EditPayload::Text(text) => MacroResult::Text(text),
            EditPayload::Node(node) => MacroResult::Node(node),
            EditPayload::Nodes(nodes) => MacroResult::Nodes(nodes),
            EditPayload::Tree(tree) => MacroResult::Tree(tree),
        },
    })
}

/// Edit payload from a scripting value: strings stay text (fragment
/// parsed at splice time), node handles keep identity, sequences may mix
/// both (a mixed sequence flattens to text).
pub fn payload_from_value(ctx: &Rc<Ctx>, lua: &Lua, value: Value) -> mlua::Result<EditPayload> {
    match value {
        Value::String(text) => Ok(EditPayload::Text(text.to_string_lossy().to_string())),
        Value::Integer(number) => Ok(EditPayload::Text(number.to_string())),
        Value::Number(number) => Ok(EditPayload::Text(number.to_string())),
        Value::UserData(userdata) => {
            if let Ok(node) = userdata.borrow::<LuaNode>() {
                return Ok(EditPayload::Node(node.id));
            }
            if let Ok(tree) = userdata.borrow::<LuaTree>() {
                return Ok(EditPayload::Tree(tree.id));
            }
            Err(mlua::Error::RuntimeError(
                "expected a source node, tree, string, or sequence".to_owned(),
            ))
        }
        Value::Table(table) => {
            let mut nodes = Vec::new();
            let mut texts = Vec::new();
            let mut all_nodes = true;
            for entry in table.sequence_values::<Value>() {
                let entry = entry?;
                match payload_from_value(ctx, lua, entry)? {
                    EditPayload::Node(node) => {
                        nodes.push(node);
                        texts.push(ctx.store.borrow().text(node).to_owned());
                    }
                    EditPayload::Nodes(more) => {
                        for node in more {
                            texts.push(ctx.store.borrow().text(node).to_owned());
                            nodes.push(node);
                        }
                    }
                    EditPayload::Text(text) => {
                        all_nodes = false;
                        texts.push(text);
                    }
                    EditPayload::Tree(tree) => {
                        all_nodes = false;
                        texts.push(ctx.store.borrow().source_of_tree(tree).to_owned());
                    }
                }
            }
            if all_nodes && !nodes.is_empty() {
                Ok(EditPayload::Nodes(nodes))
            } else {
                Ok(EditPayload::Text(texts.join(" ")))
            }
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "cannot use a {} as replacement content",
            other.type_name()
        ))),
    }
}

//! Scope-walking name resolution for the C grammar. A function's name
//! scopes to the enclosing scope, not the function body; block
//! declarations shadow outer ones and are visible from their declaration
//! onward.

use itertools::Itertools;

use crate::{
    lang::{FunctionSignature, LanguageBinding},
    tree::{NodeId, TreeStore},
};

const DECLARATOR_WRAPPERS: &[&str] = &[
    "init_declarator",
    "pointer_declarator",
    "array_declarator",
    "function_declarator",
    "parenthesized_declarator",
    "attributed_declarator",
];

const TYPE_SPECIFIERS: &[&str] = &[
    "primitive_type",
    "type_identifier",
    "sized_type_specifier",
    "struct_specifier",
    "union_specifier",
    "enum_specifier",
    "macro_type_specifier",
];

pub struct CBinding;

impl LanguageBinding for CBinding {
    fn get_definition(&self, store: &TreeStore, id: NodeId) -> Option<NodeId> {
        if store.kind(id) != "identifier" {
            return None;
        }
        let name = store.text(id).to_owned();
        let position = store.span(id)?.start;

        let mut ancestor = store.parent(id);
        while let Some(scope) = ancestor {
            match store.kind(scope) {
                "compound_statement" | "translation_unit" | "for_statement" => {
                    if let Some(def) =
                        last_preceding_declaration(store, scope, &name, position)
                    {
                        return Some(def);
                    }
                }
                "function_definition" => {
                    if let Some(def) = parameter_declaration(store, scope, &name) {
                        return Some(def);
                    }
                }
                _ => {}
            }
            ancestor = store.parent(scope);
        }
        None
    }

    fn find_references(&self, store: &TreeStore, def: NodeId) -> Vec<NodeId> {
        let Some(scope) = visibility_scope(store, def) else {
            return Vec::new();
        };
        let name = store.text(def).to_owned();
        let mut references = store
            .descendants(scope)
            .into_iter()
            .filter(|&node| {
                store.is_valid(node)
                    && store.kind(node) == "identifier"
                    && store.text(node) == name
                    && self.get_definition(store, node) == Some(def)
            })
            .collect::<Vec<_>>();
        references.sort_by_key(|&node| store.span(node).map(|span| span.start));
        references
    }

    fn get_type(&self, store: &TreeStore, def: NodeId) -> String {
        let mut pointers = 0usize;
        let mut arrays = 0usize;
        let mut current = def;
        let declaration = loop {
            let Some(parent) = store.parent(current) else {
                return "void *".to_owned();
            };
            match store.kind(parent) {
                "pointer_declarator" => pointers += 1,
                "array_declarator" => arrays += 1,
                kind if DECLARATOR_WRAPPERS.contains(&kind) => {}
                "declaration" | "parameter_declaration" | "field_declaration"
                | "function_definition" => break parent,
                _ => return "void *".to_owned(),
            }
            current = parent;
        };

        let base = type_specifier_text(store, declaration);
        if base.is_empty() {
            return "void *".to_owned();
        }
        let mut out = base;
        if pointers > 0 {
            out.push(' ');
            out.push_str(&"*".repeat(pointers));
        }
        out.push_str(&"[]".repeat(arrays));
        out
    }

    fn function_signature(
        &self,
        store: &TreeStore,
        function: NodeId,
    ) -> Option<FunctionSignature> {
        if store.kind(function) != "function_definition" {
            return None;
        }
        let mut declarator = store.child_by_field(function, "declarator")?;
        let mut pointers = 0usize;
        while store.kind(declarator) != "function_declarator" {
            if store.kind(declarator) == "pointer_declarator" {
                pointers += 1;
            }
            declarator = store.child_by_field(declarator, "declarator")?;
        }
        let name_node = declarator_name(store, store.child_by_field(declarator, "declarator")?)?;
        let params = store
            .child_by_field(declarator, "parameters")
            .map(|parameters| store.text(parameters).to_owned())
            .unwrap_or_else(|| "()".to_owned());

        let mut return_type = type_specifier_text(store, function);
        if return_type.is_empty() {
            return_type = "void".to_owned();
        }
        if pointers > 0 {
            return_type.push(' ');
            return_type.push_str(&"*".repeat(pointers));
        }
        Some(FunctionSignature {
            name: store.text(name_node).to_owned(),
            return_type,
            params,
            body: store.child_by_field(function, "body"),
        })
    }
}

/// The identifier a declarator chain ultimately names.
fn declarator_name(store: &TreeStore, declarator: NodeId) -> Option<NodeId> {
    let mut current = declarator;
    loop {
        match store.kind(current) {
            "identifier" => return Some(current),
            kind if DECLARATOR_WRAPPERS.contains(&kind) => {
                current = store
                    .child_by_field(current, "declarator")
                    .or_else(|| store.children(current).into_iter().find(|&child| {
                        store.kind(child) == "identifier"
                            || DECLARATOR_WRAPPERS.contains(&store.kind(child))
                    }))?;
            }
            _ => return None,
        }
    }
}

/// Declaration-site identifiers a scope's direct children introduce, in
/// source order. A `function_definition` child introduces the function's
/// name here, in the enclosing scope.
fn declared_names(store: &TreeStore, scope: NodeId) -> Vec<NodeId> {
    let mut names = Vec::new();
    for child in store.children(scope) {
        if !store.is_valid(child) {
            continue;
        }
        match store.kind(child) {
            "declaration" => {
                for grandchild in store.children(child) {
                    if store.field_of(grandchild) == Some("declarator") {
                        names.extend(declarator_name(store, grandchild));
                    }
                }
            }
            "function_definition" => {
                if let Some(declarator) = store.child_by_field(child, "declarator") {
                    names.extend(declarator_name(store, declarator));
                }
            }
            _ => {}
        }
    }
    names
}

/// Within one scope, the nearest declaration of `name` at or before
/// `position` wins.
fn last_preceding_declaration(
    store: &TreeStore,
    scope: NodeId,
    name: &str,
    position: usize,
) -> Option<NodeId> {
    declared_names(store, scope)
        .into_iter()
        .filter(|&candidate| {
            store.text(candidate) == name
                && store
                    .span(candidate)
                    .map(|span| span.start <= position)
                    .unwrap_or(false)
        })
        .last()
}

fn parameter_declaration(store: &TreeStore, function: NodeId, name: &str) -> Option<NodeId> {
    let mut declarator = store.child_by_field(function, "declarator")?;
    while store.kind(declarator) != "function_declarator" {
        declarator = store.child_by_field(declarator, "declarator")?;
    }
    let parameters = store.child_by_field(declarator, "parameters")?;
    store
        .children(parameters)
        .into_iter()
        .filter(|&parameter| store.kind(parameter) == "parameter_declaration")
        .filter_map(|parameter| {
            store
                .child_by_field(parameter, "declarator")
                .and_then(|declarator| declarator_name(store, declarator))
        })
        .find(|&parameter_name| store.text(parameter_name) == name)
}

/// Where a definition is visible: the function for a parameter, the
/// enclosing block for a local, the whole unit for file scope.
fn visibility_scope(store: &TreeStore, def: NodeId) -> Option<NodeId> {
    let mut current = store.parent(def)?;
    loop {
        match store.kind(current) {
            "parameter_declaration" => {
                // parameter: visible through the whole function definition
                let mut up = store.parent(current)?;
                while store.kind(up) != "function_definition" {
                    if store.kind(up) == "translation_unit" {
                        return Some(up);
                    }
                    up = store.parent(up)?;
                }
                return Some(up);
            }
            "declaration" => return store.parent(current),
            "function_definition" => {
                // a function's name scopes to the unit around it
                return store.parent(current).or(Some(current));
            }
            "translation_unit" => return Some(current),
            _ => current = store.parent(current)?,
        }
    }
}

fn type_specifier_text(store: &TreeStore, declaration: NodeId) -> String {
    store
        .children(declaration)
        .into_iter()
        .take_while(|&child| store.field_of(child) != Some("declarator"))
        .filter(|&child| {
            let kind = store.kind(child);
            kind == "type_qualifier" || TYPE_SPECIFIERS.contains(&kind)
        })
        .map(|child| store.text(child))
        .join(" ")
}

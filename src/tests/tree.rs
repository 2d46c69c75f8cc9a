use std::{cell::Cell, rc::Rc};

use crate::{
    error::UppError,
    parser::{LanguageSpec, ParserAdapter},
    tree::{EditPayload, InsertPosition, NodeId, TreeId, TreeStore},
};

fn store() -> TreeStore {
    TreeStore::new(ParserAdapter::new(LanguageSpec::c()).unwrap())
}

fn find_kind(store: &TreeStore, tree: TreeId, kind: &str) -> Vec<NodeId> {
    store
        .descendants(store.root_of_tree(tree))
        .into_iter()
        .filter(|&node| store.is_valid(node) && store.kind(node) == kind)
        .collect()
}

#[test]
fn test_sibling_edits_shift_handles() {
    let mut store = store();
    let tree = store.create_tree("int a;\nint b;\nint c;\n");
    let root = store.root_of_tree(tree);
    let declarations = store.children(root);
    assert_eq!(declarations.len(), 3);
    let b_text = store.text(declarations[1]).to_owned();
    let c_text = store.text(declarations[2]).to_owned();

    store
        .replace_node(declarations[0], EditPayload::Text("double aa = 1.5;".into()))
        .unwrap();

    assert!(store.span(declarations[0]).is_none());
    assert_eq!(store.text(declarations[1]), b_text);
    assert_eq!(store.text(declarations[2]), c_text);
    assert!(store.source_of_tree(tree).contains("double aa = 1.5;"));
}

#[test]
fn test_replacing_invalidated_handle_is_rejected() {
    let mut store = store();
    let tree = store.create_tree("int a;\n");
    let declaration = store.children(store.root_of_tree(tree))[0];
    store
        .replace_node(declaration, EditPayload::Text("int b;".into()))
        .unwrap();
    let again = store.replace_node(declaration, EditPayload::Text("int c;".into()));
    assert!(matches!(again, Err(UppError::StaleHandle)));
}

#[test]
fn test_remove_moves_node_into_holding_tree() {
    let mut store = store();
    let tree = store.create_tree("int a;\nint b;\n");
    let declarations = store.children(store.root_of_tree(tree));
    let a = declarations[0];

    let holding = store.remove_node(a).unwrap();
    assert_eq!(store.tree_of(a), holding);
    assert_eq!(store.text(a), "int a;");
    assert!(!store.source_of_tree(tree).contains("int a;"));

    // the handle migrates back with its identity intact
    let b = declarations[1];
    let inserted = store
        .insert_relative(b, InsertPosition::After, EditPayload::Node(a))
        .unwrap();
    assert_eq!(inserted, vec![a]);
    assert_eq!(store.tree_of(a), tree);
    assert_eq!(store.text(a), "int a;");
    assert!(store.source_of_tree(tree).contains("int a;"));
}

#[test]
fn test_replacement_subtree_replaces_children_in_place() {
    let mut store = store();
    let tree = store.create_tree("void f(void) { return; }\n");
    let returns = find_kind(&store, tree, "return_statement");
    assert_eq!(returns.len(), 1);
    let new_nodes = store
        .replace_node(returns[0], EditPayload::Text("return 1;".into()))
        .unwrap();
    assert_eq!(new_nodes.len(), 1);
    assert_eq!(store.kind(new_nodes[0]), "return_statement");
    assert_eq!(store.text(new_nodes[0]), "return 1;");
    assert!(store.source_of_tree(tree).contains("{ return 1; }"));
    // the graft hangs off the surrounding block
    let parent = store.parent(new_nodes[0]).unwrap();
    assert_eq!(store.kind(parent), "compound_statement");
}

#[test]
fn test_text_write_grows_the_handle() {
    let mut store = store();
    let tree = store.create_tree("int abc;\n");
    let identifiers = find_kind(&store, tree, "identifier");
    assert_eq!(identifiers.len(), 1);
    store.set_text(identifiers[0], "renamed_variable").unwrap();
    assert_eq!(store.text(identifiers[0]), "renamed_variable");
    assert_eq!(store.source_of_tree(tree), "int renamed_variable;\n");
}

#[test]
fn test_mutation_listeners_are_notified() {
    let mut store = store();
    let tree = store.create_tree("int a;\n");
    let hits = Rc::new(Cell::new(0usize));
    let counter = hits.clone();
    store.add_mutation_listener(Rc::new(move |_| counter.set(counter.get() + 1)));
    let version = store.version();

    let declaration = store.children(store.root_of_tree(tree))[0];
    store
        .replace_node(declaration, EditPayload::Text("int b;".into()))
        .unwrap();

    assert!(hits.get() > 0);
    assert!(store.version() > version);
}

#[test]
fn test_append_lands_before_closing_brace() {
    let mut store = store();
    let tree = store.create_tree("void f(void) { int a; }\n");
    let blocks = find_kind(&store, tree, "compound_statement");
    store
        .insert_relative(blocks[0], InsertPosition::Append, EditPayload::Text(" int b; ".into()))
        .unwrap();
    assert!(store.source_of_tree(tree).contains("int a;  int b; }"));
}

#[test]
fn test_fragment_parse_accepts_statements_and_expressions() {
    let mut store = store();
    let (_, statements, _) = store.create_fragment("return x + 1;").unwrap();
    assert_eq!(store.kind(statements[0]), "return_statement");
    let (_, expressions, _) = store.create_fragment("a + b * 2").unwrap();
    assert_eq!(store.kind(expressions[0]), "binary_expression");
    let (_, declarations, _) = store.create_fragment("int n = 0;").unwrap();
    assert_eq!(store.kind(declarations[0]), "declaration");
}

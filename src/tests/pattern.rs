use crate::{
    parser::{LanguageSpec, ParserAdapter},
    pattern::{Binding, Pattern},
    tree::{NodeId, TreeId, TreeStore},
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

fn one<'c>(captures: &'c crate::pattern::Captures, name: &str) -> NodeId {
    match captures.get(name) {
        Some(Binding::One(node)) => *node,
        other => panic!("expected single binding for {name}, got {other:?}"),
    }
}

#[test]
fn test_negative_constraint_rejects_braced_consequence() {
    let mut store = store();
    let tree =
        store.create_tree("void g(int x) { if (x) return 1; if (x > 0) { return 2; } }\n");
    let pattern = Pattern::compile(&mut store, "if ($c) $t__NOT_compound_statement;").unwrap();
    let ifs = find_kind(&store, tree, "if_statement");
    assert_eq!(ifs.len(), 2);

    let captures = pattern.match_node(&store, ifs[0]).expect("bare if matches");
    assert_eq!(store.text(one(&captures, "c")), "x");
    assert_eq!(store.text(one(&captures, "t")), "return 1;");

    assert!(pattern.match_node(&store, ifs[1]).is_none());
}

#[test]
fn test_type_constraint_filters_captures() {
    let mut store = store();
    let tree = store.create_tree("void g(void) { h(1); h(x); }\n");
    let pattern = Pattern::compile(&mut store, "h($v__identifier)").unwrap();
    let calls = find_kind(&store, tree, "call_expression");
    assert_eq!(calls.len(), 2);
    assert!(pattern.match_node(&store, calls[0]).is_none());
    let captures = pattern.match_node(&store, calls[1]).unwrap();
    assert_eq!(store.text(one(&captures, "v")), "x");
}

#[test]
fn test_until_captures_variadic_children() {
    let mut store = store();
    let tree = store.create_tree("void f(void) { int a = 1; a = a + 1; return a; }\n");
    let pattern = Pattern::compile(
        &mut store,
        "{ $setup__until__return_statement; return $v; }",
    )
    .unwrap();
    let blocks = find_kind(&store, tree, "compound_statement");
    let captures = pattern.match_node(&store, blocks[0]).expect("block matches");
    match captures.get("setup") {
        Some(Binding::Many(nodes)) => {
            assert_eq!(nodes.len(), 2);
            assert_eq!(store.text(nodes[0]), "int a = 1;");
        }
        other => panic!("expected variadic binding, got {other:?}"),
    }
    assert_eq!(store.text(one(&captures, "v")), "a");
}

#[test]
fn test_repeated_metavariable_requires_equal_text() {
    let mut store = store();
    let pattern = Pattern::compile(&mut store, "$a + $a").unwrap();
    let (_, same, _) = store.create_fragment("x + x").unwrap();
    let (_, different, _) = store.create_fragment("x + y").unwrap();
    assert!(pattern.match_node(&store, same[0]).is_some());
    assert!(pattern.match_node(&store, different[0]).is_none());
}

#[test]
fn test_match_all_walks_the_scope() {
    let mut store = store();
    let tree = store.create_tree("void f(void) { g(1); g(2); h(3); }\n");
    let pattern = Pattern::compile(&mut store, "g($n)").unwrap();
    let matches = pattern.match_all(&store, store.root_of_tree(tree));
    assert_eq!(matches.len(), 2);
}

#[test]
fn test_comments_are_transparent_to_matching() {
    let mut store = store();
    let tree = store.create_tree("void f(void) { if (/* note */ x) return 1; }\n");
    let pattern = Pattern::compile(&mut store, "if ($c) $t__NOT_compound_statement;").unwrap();
    let ifs = find_kind(&store, tree, "if_statement");
    assert!(pattern.match_node(&store, ifs[0]).is_some());
}

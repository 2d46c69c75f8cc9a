use crate::{
    lang::{CBinding, LanguageBinding},
    parser::{LanguageSpec, ParserAdapter},
    tree::{NodeId, TreeId, TreeStore},
};

fn parsed(source: &str) -> (TreeStore, TreeId) {
    let mut store = TreeStore::new(ParserAdapter::new(LanguageSpec::c()).unwrap());
    let tree = store.create_tree(source);
    (store, tree)
}

fn identifiers(store: &TreeStore, tree: TreeId, name: &str) -> Vec<NodeId> {
    store
        .descendants(store.root_of_tree(tree))
        .into_iter()
        .filter(|&node| store.kind(node) == "identifier" && store.text(node) == name)
        .collect()
}

#[test]
fn test_references_contain_every_resolvable_identifier() {
    let (store, tree) = parsed("int add(int x, int y) { int z = x + y; return z; }\n");
    let binding = CBinding;
    for node in store.descendants(store.root_of_tree(tree)) {
        if store.kind(node) != "identifier" {
            continue;
        }
        let Some(definition) = binding.get_definition(&store, node) else {
            continue;
        };
        assert!(
            binding.find_references(&store, definition).contains(&node),
            "references of {} should include the use at {:?}",
            store.text(definition),
            store.span(node)
        );
    }
}

#[test]
fn test_parameters_resolve_inside_the_body() {
    let (store, tree) = parsed("int add(int x, int y) { return x + y; }\n");
    let binding = CBinding;
    let xs = identifiers(&store, tree, "x");
    assert_eq!(xs.len(), 2);
    let definition = binding.get_definition(&store, xs[1]).unwrap();
    assert_eq!(definition, xs[0]);
}

#[test]
fn test_block_declarations_shadow_outer_ones() {
    let (store, tree) = parsed("int x;\nvoid f(void) { int x; x = 1; }\n");
    let binding = CBinding;
    let xs = identifiers(&store, tree, "x");
    assert_eq!(xs.len(), 3);
    let usage_definition = binding.get_definition(&store, xs[2]).unwrap();
    assert_eq!(usage_definition, xs[1]);
    assert_ne!(usage_definition, xs[0]);
}

#[test]
fn test_function_names_scope_to_the_enclosing_unit() {
    let (store, tree) = parsed("int add(int x, int y) { return x + y; }\nint use(void) { return add(1, 2); }\n");
    let binding = CBinding;
    let adds = identifiers(&store, tree, "add");
    assert_eq!(adds.len(), 2);
    let call_site_definition = binding.get_definition(&store, adds[1]).unwrap();
    assert_eq!(call_site_definition, adds[0]);
    let references = binding.find_references(&store, adds[0]);
    assert_eq!(references, adds);
}

#[test]
fn test_declared_types_reconstruct_qualifiers_and_suffixes() {
    let (store, tree) = parsed("const int *p;\nint arr[4];\nfloat q;\n");
    let binding = CBinding;
    let p = identifiers(&store, tree, "p")[0];
    let arr = identifiers(&store, tree, "arr")[0];
    let q = identifiers(&store, tree, "q")[0];
    assert_eq!(binding.get_type(&store, p), "const int *");
    assert_eq!(binding.get_type(&store, arr), "int[]");
    assert_eq!(binding.get_type(&store, q), "float");
}

#[test]
fn test_type_of_unanchored_identifier_falls_back() {
    let (store, tree) = parsed("void f(void) { g(); }\n");
    let binding = CBinding;
    let g = identifiers(&store, tree, "g")[0];
    assert_eq!(binding.get_type(&store, g), "void *");
}

#[test]
fn test_function_signature_reconstruction() {
    let (store, tree) = parsed("int *mk(int n) { return 0; }\n");
    let binding = CBinding;
    let function = store
        .descendants(store.root_of_tree(tree))
        .into_iter()
        .find(|&node| store.kind(node) == "function_definition")
        .unwrap();
    let signature = binding.function_signature(&store, function).unwrap();
    assert_eq!(signature.name, "mk");
    assert_eq!(signature.return_type, "int *");
    assert_eq!(signature.params, "(int n)");
    let body = signature.body.unwrap();
    assert_eq!(store.kind(body), "compound_statement");
}

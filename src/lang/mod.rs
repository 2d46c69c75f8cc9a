use crate::tree::{NodeId, TreeStore};

mod c;

pub use c::CBinding;

#[derive(Clone, Debug)]
pub struct FunctionSignature {
    pub name: String,
    pub return_type: String,
    pub params: String,
    pub body: Option<NodeId>,
}

/// Semantic helpers implemented per target grammar. The engine treats
/// this as opaque; swapping the grammar means supplying another binding.
pub trait LanguageBinding {
    /// The declaration-site identifier an identifier resolves to, walking
    /// enclosing scopes and honoring shadowing.
    fn get_definition(&self, store: &TreeStore, id: NodeId) -> Option<NodeId>;

    /// Every identifier in the definition's scope resolving to `def`,
    /// in source order.
    fn find_references(&self, store: &TreeStore, def: NodeId) -> Vec<NodeId>;

    /// The declared type of a definition, qualifiers prepended and
    /// `*`/`[]` suffixes appended per declarator nesting.
    fn get_type(&self, store: &TreeStore, def: NodeId) -> String;

    fn function_signature(&self, store: &TreeStore, function: NodeId)
        -> Option<FunctionSignature>;
}

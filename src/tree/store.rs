use std::rc::Rc;

use tracing::trace;

use crate::{
    error::{Result, UppError},
    parser::ParserAdapter,
    tree::{NodeId, Span, TreeId},
};

pub(crate) struct NodeData {
    pub tree: TreeId,
    pub kind: String,
    pub named: bool,
    /// `None` marks a handle invalidated by a structural replacement; the
    /// scripting side sees it as `startIndex == -1`.
    pub span: Option<Span>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub field: Option<String>,
}

pub(crate) struct TreeData {
    pub source: String,
    pub root: NodeId,
    /// Spans inserted since the tree was built, not present in any parse.
    pub virtual_spans: Vec<Span>,
}

/// Arena behind every source tree of a session. Node handles are stable
/// integer ids; migration between trees rewrites a node's owning tree
/// while the id (and thus identity) survives.
pub struct TreeStore {
    adapter: ParserAdapter,
    pub(crate) nodes: Vec<NodeData>,
    pub(crate) trees: Vec<TreeData>,
    version: u64,
    listeners: Vec<Rc<dyn Fn(TreeId)>>,
}

impl TreeStore {
    pub fn new(adapter: ParserAdapter) -> Self {
        Self {
            adapter,
            nodes: Vec::new(),
            trees: Vec::new(),
            version: 0,
            listeners: Vec::new(),
        }
    }

    pub fn adapter(&self) -> &ParserAdapter {
        &self.adapter
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Listeners are invoked synchronously on every recorded edit and must
    /// not reenter the store.
    pub fn add_mutation_listener(&mut self, listener: Rc<dyn Fn(TreeId)>) {
        self.listeners.push(listener);
    }

    pub(crate) fn record_mutation(&mut self, tree: TreeId) {
        self.version += 1;
        for listener in &self.listeners {
            listener(tree);
        }
    }

    pub(crate) fn alloc_node(&mut self, data: NodeData) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(data);
        id
    }

    pub(crate) fn alloc_tree(&mut self, data: TreeData) -> TreeId {
        let id = self.trees.len() as TreeId;
        self.trees.push(data);
        id
    }

    /// Parse `text` and build a handle tree for it. A parser failure
    /// degrades to an empty root over the unparsed text.
    pub fn create_tree(&mut self, text: &str) -> TreeId {
        let tree_id = self.alloc_tree(TreeData {
            source: text.to_owned(),
            root: 0,
            virtual_spans: Vec::new(),
        });
        let root = match self.adapter.parse(text) {
            Some(ts_tree) => self.build_subtree(tree_id, ts_tree.root_node(), None),
            None => self.alloc_node(NodeData {
                tree: tree_id,
                kind: self.adapter.spec().root_kind.to_owned(),
                named: true,
                span: Some(Span::new(0, text.len())),
                parent: None,
                children: Vec::new(),
                field: None,
            }),
        };
        self.trees[tree_id as usize].root = root;
        trace!(tree = tree_id, bytes = text.len(), "built source tree");
        tree_id
    }

    /// Parse `text` as a fragment. Returns the holding tree (whose source
    /// is the full envelope), the inner nodes standing for the fragment,
    /// and the envelope's content offset.
    pub fn create_fragment(&mut self, text: &str) -> Option<(TreeId, Vec<NodeId>, usize)> {
        let parse = self.adapter.parse_fragment(text)?;
        let tree_id = self.alloc_tree(TreeData {
            source: parse.source.clone(),
            root: 0,
            virtual_spans: Vec::new(),
        });
        let root = self.build_subtree(tree_id, parse.tree.root_node(), None);
        self.trees[tree_id as usize].root = root;
        let inner = parse
            .inner_nodes()
            .iter()
            .filter_map(|node| {
                self.node_at_exact(tree_id, Span::new(node.start_byte(), node.end_byte()))
            })
            .collect();
        Some((tree_id, inner, parse.content_offset))
    }

    fn build_subtree(
        &mut self,
        tree: TreeId,
        ts_node: tree_sitter::Node,
        field: Option<String>,
    ) -> NodeId {
        let id = self.alloc_node(NodeData {
            tree,
            kind: ts_node.kind().to_owned(),
            named: ts_node.is_named(),
            span: Some(Span::new(ts_node.start_byte(), ts_node.end_byte())),
            parent: None,
            children: Vec::new(),
            field,
        });
        let mut cursor = ts_node.walk();
        let mut children = Vec::new();
        if cursor.goto_first_child() {
            loop {
                let child_field = cursor.field_name().map(ToOwned::to_owned);
                let child = self.build_subtree(tree, cursor.node(), child_field);
                self.nodes[child as usize].parent = Some(id);
                children.push(child);
                if !cursor.goto_next_sibling() {
                    break;
                }
            }
        }
        self.nodes[id as usize].children = children;
        id
    }

    pub fn kind(&self, id: NodeId) -> &str {
        &self.nodes[id as usize].kind
    }

    pub fn is_named(&self, id: NodeId) -> bool {
        self.nodes[id as usize].named
    }

    pub fn span(&self, id: NodeId) -> Option<Span> {
        self.nodes[id as usize].span
    }

    pub fn is_valid(&self, id: NodeId) -> bool {
        self.nodes[id as usize].span.is_some()
    }

    pub fn tree_of(&self, id: NodeId) -> TreeId {
        self.nodes[id as usize].tree
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id as usize].parent
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id as usize].children.clone()
    }

    pub fn field_of(&self, id: NodeId) -> Option<&str> {
        self.nodes[id as usize].field.as_deref()
    }

    pub fn root_of_tree(&self, tree: TreeId) -> NodeId {
        self.trees[tree as usize].root
    }

    pub fn source_of_tree(&self, tree: TreeId) -> &str {
        &self.trees[tree as usize].source
    }

    pub fn virtual_spans(&self, tree: TreeId) -> &[Span] {
        &self.trees[tree as usize].virtual_spans
    }

    /// Current text of a live handle; empty for invalidated handles.
    pub fn text(&self, id: NodeId) -> &str {
        let data = &self.nodes[id as usize];
        match data.span {
            Some(span) => self.trees[data.tree as usize]
                .source
                .get(span.start..span.end)
                .unwrap_or(""),
            None => "",
        }
    }

    pub fn child_by_field(&self, id: NodeId, field: &str) -> Option<NodeId> {
        self.nodes[id as usize]
            .children
            .iter()
            .copied()
            .find(|&child| self.field_of(child) == Some(field))
    }

    pub fn child_index(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.nodes[parent as usize]
            .children
            .iter()
            .position(|&child| child == id)
    }

    /// Next sibling in source order, optionally skipping comments.
    /// Invalidated siblings are always skipped.
    pub fn sibling_after(&self, id: NodeId, skip_comments: bool) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let index = self.child_index(id)?;
        let comment_kind = self.adapter.spec().comment_kind;
        self.nodes[parent as usize]
            .children
            .iter()
            .copied()
            .skip(index + 1)
            .find(|&sibling| {
                self.is_valid(sibling) && !(skip_comments && self.kind(sibling) == comment_kind)
            })
    }

    /// Siblings of `parent` starting at child `index`, skipping comments
    /// and invalidated handles.
    pub fn sibling_at_or_after(
        &self,
        parent: NodeId,
        index: usize,
        skip_comments: bool,
    ) -> Option<NodeId> {
        let comment_kind = self.adapter.spec().comment_kind;
        self.nodes[parent as usize]
            .children
            .iter()
            .copied()
            .skip(index)
            .find(|&sibling| {
                self.is_valid(sibling) && !(skip_comments && self.kind(sibling) == comment_kind)
            })
    }

    pub fn is_descendant_of(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            out.push(node);
            let children = &self.nodes[node as usize].children;
            for &child in children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Descendants sorted by descending start offset, so later edits never
    /// shift pending earlier ones. Invalidated handles are dropped.
    pub fn descendants_reverse_source_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut nodes = self
            .descendants(id)
            .into_iter()
            .filter(|&node| self.is_valid(node))
            .collect::<Vec<_>>();
        nodes.sort_by_key(|&node| std::cmp::Reverse(self.span(node).map(|span| span.start)));
        nodes
    }

    /// Deepest node of `tree` whose span is exactly `span`.
    pub fn node_at_exact(&self, tree: TreeId, span: Span) -> Option<NodeId> {
        let mut current = self.root_of_tree(tree);
        if self.span(current) == Some(span) {
            // keep descending to the deepest exact match below
        } else if !self
            .span(current)
            .map(|root_span| root_span.contains(span))
            .unwrap_or(false)
        {
            return None;
        }
        let mut best = (self.span(current) == Some(span)).then_some(current);
        'descend: loop {
            for &child in &self.nodes[current as usize].children {
                let Some(child_span) = self.span(child) else {
                    continue;
                };
                if child_span.contains(span) {
                    if child_span == span {
                        best = Some(child);
                    }
                    current = child;
                    continue 'descend;
                }
            }
            return best;
        }
    }

    /// Deepest node of `tree` containing `span`.
    pub fn covering_node(&self, tree: TreeId, span: Span) -> NodeId {
        let mut current = self.root_of_tree(tree);
        'descend: loop {
            for &child in &self.nodes[current as usize].children {
                let Some(child_span) = self.span(child) else {
                    continue;
                };
                if child_span.contains(span) && !child_span.is_empty() {
                    current = child;
                    continue 'descend;
                }
            }
            return current;
        }
    }

    /// Rehome a subtree into `dest`, shifting every live span by `delta`.
    /// Handle ids are untouched, which is what keeps identity across
    /// migration.
    pub fn migrate_subtree(&mut self, id: NodeId, dest: TreeId, delta: isize) {
        for node in self.descendants(id) {
            let data = &mut self.nodes[node as usize];
            data.tree = dest;
            if let Some(span) = data.span {
                data.span = Some(Span::new(
                    (span.start as isize + delta) as usize,
                    (span.end as isize + delta) as usize,
                ));
            }
        }
    }

    pub(crate) fn invalidate_subtree(&mut self, id: NodeId) {
        for node in self.descendants(id) {
            self.nodes[node as usize].span = None;
        }
    }

    pub(crate) fn detach_from_parent(&mut self, id: NodeId) {
        if let Some(parent) = self.parent(id) {
            self.nodes[parent as usize]
                .children
                .retain(|&child| child != id);
        }
        self.nodes[id as usize].parent = None;
    }

    /// Map an externally produced span (for example from a query over a
    /// reparse) back onto a handle: the exact node when one exists, the
    /// covering node otherwise.
    pub fn handle_for_span(&self, tree: TreeId, span: Span) -> NodeId {
        self.node_at_exact(tree, span)
            .unwrap_or_else(|| self.covering_node(tree, span))
    }

    pub fn require_span(&self, id: NodeId) -> Result<Span> {
        self.span(id).ok_or(UppError::StaleHandle)
    }

    /// Pretty S-expression dump used by `--ast`.
    pub fn dump(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(id, 0, &mut out);
        out
    }

    fn dump_into(&self, id: NodeId, depth: usize, out: &mut String) {
        if !self.is_named(id) {
            return;
        }
        let field = self
            .field_of(id)
            .map(|field| format!("{field}: "))
            .unwrap_or_default();
        let span = self
            .span(id)
            .map(|span| format!(" [{}..{}]", span.start, span.end))
            .unwrap_or_else(|| " [dead]".to_owned());
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("({}{}{}\n", field, self.kind(id), span));
        for child in self.children(id) {
            self.dump_into(child, depth + 1, out);
        }
        out.push_str(&"  ".repeat(depth));
        out.push_str(")\n");
    }

    /// Kinds making up a file's leading preprocessor/comment block.
    pub fn is_prelude_kind(&self, id: NodeId) -> bool {
        let kind = self.kind(id);
        kind == self.adapter.spec().comment_kind
            || kind.starts_with(self.adapter.spec().preproc_prefix)
    }
}

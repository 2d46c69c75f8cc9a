use tracing::trace;

use crate::{
    error::{Result, UppError},
    tree::{store::TreeData, EditPayload, InsertPosition, NodeId, Span, TreeId, TreeStore},
};

const CLOSING_TOKENS: &[&str] = &["}", ")", "]"];

impl TreeStore {
    /// Replace `range` of a tree's source with `replacement`, keeping every
    /// live handle consistent: handles past the edit shift, handles
    /// enclosing it grow, handles partially overlapping it are
    /// invalidated. Fires mutation listeners.
    pub fn splice(&mut self, tree: TreeId, range: Span, replacement: &str) {
        let delta = replacement.len() as isize - range.len() as isize;
        {
            let source = &mut self.trees[tree as usize].source;
            source.replace_range(range.start..range.end, replacement);
        }
        for data in &mut self.nodes {
            if data.tree != tree {
                continue;
            }
            let Some(span) = data.span else {
                continue;
            };
            data.span = if span.end <= range.start {
                Some(span)
            } else if span.start >= range.end {
                Some(Span::new(
                    (span.start as isize + delta) as usize,
                    (span.end as isize + delta) as usize,
                ))
            } else if span.start <= range.start && span.end >= range.end {
                Some(Span::new(span.start, (span.end as isize + delta) as usize))
            } else {
                None
            };
        }
        trace!(
            tree,
            start = range.start,
            end = range.end,
            inserted = replacement.len(),
            "spliced source"
        );
        self.record_mutation(tree);
    }

    /// Move a node and its text out of its tree into a fresh holding tree
    /// and return that tree. The handle stays live, rooted in the holding
    /// tree.
    pub fn remove_node(&mut self, id: NodeId) -> Result<TreeId> {
        let span = self.require_span(id)?;
        let tree = self.tree_of(id);
        let text = self.text(id).to_owned();

        let holding = {
            let root_kind = self.adapter().spec().root_kind.to_owned();
            let holding = self.alloc_tree(TreeData {
                source: text,
                root: 0,
                virtual_spans: Vec::new(),
            });
            let root = self.alloc_node(crate::tree::store::NodeData {
                tree: holding,
                kind: root_kind,
                named: true,
                span: Some(Span::new(0, span.len())),
                parent: None,
                children: vec![id],
                field: None,
            });
            self.set_tree_root(holding, root);
            holding
        };

        self.detach_from_parent(id);
        self.migrate_subtree(id, holding, -(span.start as isize));
        self.set_parent(id, Some(self.root_of_tree(holding)));
        self.splice(tree, span, "");
        Ok(holding)
    }

    /// Substitute a node's span with the payload. The replaced handle and
    /// its descendants are invalidated; the new top-level handles are
    /// returned in source order.
    pub fn replace_node(&mut self, id: NodeId, payload: EditPayload) -> Result<Vec<NodeId>> {
        let payload = self.extract_payload_descendants(id, payload)?;
        let span = self.require_span(id)?;
        let tree = self.tree_of(id);
        let parent = self.parent(id);
        let index = self.child_index(id);

        self.detach_from_parent(id);
        self.invalidate_subtree(id);
        self.splice(tree, span, "");

        let (parent, index) = match (parent, index) {
            (Some(parent), Some(index)) => (parent, index),
            _ => (self.root_of_tree(tree), 0),
        };
        self.insert_payload(tree, parent, index, span.start, payload)
    }

    /// Replace an arbitrary range of a tree (no handle need cover it
    /// exactly): any handle fully inside the range dies, the covering
    /// node adopts the replacement.
    pub fn replace_range(
        &mut self,
        tree: TreeId,
        range: Span,
        payload: EditPayload,
    ) -> Result<Vec<NodeId>> {
        if let Some(exact) = self.node_at_exact(tree, range) {
            return self.replace_node(exact, payload);
        }
        let parent = self.covering_node(tree, range);
        for child in self.children(parent) {
            if let Some(child_span) = self.span(child) {
                if range.contains(child_span) {
                    self.detach_from_parent(child);
                    self.invalidate_subtree(child);
                }
            }
        }
        let index = self
            .children(parent)
            .iter()
            .position(|&child| {
                self.span(child)
                    .map(|span| span.start >= range.start)
                    .unwrap_or(false)
            })
            .unwrap_or_else(|| self.children(parent).len());
        self.splice(tree, range, "");
        self.insert_payload(tree, parent, index, range.start, payload)
    }

    /// Rewrite a node's text in place. The handle survives with a grown
    /// span; its children are structurally unreliable afterwards and are
    /// invalidated.
    pub fn set_text(&mut self, id: NodeId, new_text: &str) -> Result<()> {
        let span = self.require_span(id)?;
        let tree = self.tree_of(id);
        for child in self.children(id) {
            self.invalidate_subtree(child);
        }
        self.clear_children(id);
        self.splice(tree, span, new_text);
        Ok(())
    }

    pub fn insert_relative(
        &mut self,
        id: NodeId,
        position: InsertPosition,
        payload: EditPayload,
    ) -> Result<Vec<NodeId>> {
        let payload = self.extract_payload_descendants(id, payload)?;
        let span = self.require_span(id)?;
        let tree = self.tree_of(id);
        match position {
            InsertPosition::Before => {
                let (parent, index) = self.attachment_point(id, tree)?;
                self.insert_payload(tree, parent, index, span.start, payload)
            }
            InsertPosition::After => {
                let (parent, index) = self.attachment_point(id, tree)?;
                self.insert_payload(tree, parent, index + 1, span.end, payload)
            }
            InsertPosition::Append => {
                let children = self.children(id);
                let (index, at) = match children.last() {
                    Some(&last)
                        if CLOSING_TOKENS.contains(&self.kind(last))
                            && self.span(last).is_some() =>
                    {
                        (children.len() - 1, self.span(last).unwrap().start)
                    }
                    _ => (children.len(), span.end),
                };
                self.insert_payload(tree, id, index, at, payload)
            }
        }
    }

    fn attachment_point(&self, id: NodeId, tree: TreeId) -> Result<(NodeId, usize)> {
        match (self.parent(id), self.child_index(id)) {
            (Some(parent), Some(index)) => Ok((parent, index)),
            _ => {
                // root node: attach at the edge of its own child list
                if id == self.root_of_tree(tree) {
                    Ok((id, 0))
                } else {
                    Err(UppError::StaleHandle)
                }
            }
        }
    }

    /// Splice the payload's text into the source at `at` and graft its
    /// handles as children of `parent` starting at child `index`.
    pub(crate) fn insert_payload(
        &mut self,
        tree: TreeId,
        parent: NodeId,
        index: usize,
        at: usize,
        payload: EditPayload,
    ) -> Result<Vec<NodeId>> {
        match payload {
            EditPayload::Text(text) => self.insert_text(tree, parent, index, at, &text),
            EditPayload::Node(node) => self.insert_nodes(tree, parent, index, at, vec![node]),
            EditPayload::Nodes(nodes) => self.insert_nodes(tree, parent, index, at, nodes),
            EditPayload::Tree(source_tree) => {
                let children = self
                    .children(self.root_of_tree(source_tree))
                    .into_iter()
                    .filter(|&child| self.is_valid(child))
                    .collect::<Vec<_>>();
                if children.is_empty() {
                    let text = self.source_of_tree(source_tree).to_owned();
                    self.splice(tree, Span::new(at, at), &text);
                    self.push_virtual_span(tree, Span::new(at, at + text.len()));
                    return Ok(Vec::new());
                }
                self.insert_nodes(tree, parent, index, at, children)
            }
        }
    }

    fn insert_text(
        &mut self,
        tree: TreeId,
        parent: NodeId,
        index: usize,
        at: usize,
        text: &str,
    ) -> Result<Vec<NodeId>> {
        let fragment = self.create_fragment(text);
        self.splice(tree, Span::new(at, at), text);
        self.push_virtual_span(tree, Span::new(at, at + text.len()));
        let Some((_, inner, content_offset)) = fragment else {
            // unparseable text still lands in the output; no handles
            return Ok(Vec::new());
        };
        let delta = at as isize - content_offset as isize;
        for (offset, &node) in inner.iter().enumerate() {
            self.detach_from_parent(node);
            self.migrate_subtree(node, tree, delta);
            self.attach_child(parent, index + offset, node);
        }
        Ok(inner)
    }

    /// Insert existing handles. Contiguous siblings from one tree carry
    /// the text between them; otherwise texts are joined with a single
    /// space.
    fn insert_nodes(
        &mut self,
        tree: TreeId,
        parent: NodeId,
        index: usize,
        at: usize,
        nodes: Vec<NodeId>,
    ) -> Result<Vec<NodeId>> {
        let nodes = nodes
            .into_iter()
            .filter(|&node| self.is_valid(node))
            .collect::<Vec<_>>();
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(covering) = self.contiguous_covering_text(&nodes) {
            let base = self.span(nodes[0]).unwrap().start;
            self.splice(tree, Span::new(at, at), &covering);
            self.push_virtual_span(tree, Span::new(at, at + covering.len()));
            let delta = at as isize - base as isize;
            for (offset, &node) in nodes.iter().enumerate() {
                self.detach_from_parent(node);
                self.migrate_subtree(node, tree, delta);
                self.attach_child(parent, index + offset, node);
            }
            return Ok(nodes);
        }

        let texts = nodes
            .iter()
            .map(|&node| self.text(node).to_owned())
            .collect::<Vec<_>>();
        let joined = texts.join(" ");
        self.splice(tree, Span::new(at, at), &joined);
        self.push_virtual_span(tree, Span::new(at, at + joined.len()));
        let mut running = at;
        for (offset, (&node, text)) in nodes.iter().zip(&texts).enumerate() {
            let old_start = self.span(node).unwrap().start;
            self.detach_from_parent(node);
            self.migrate_subtree(node, tree, running as isize - old_start as isize);
            self.attach_child(parent, index + offset, node);
            running += text.len() + 1;
        }
        Ok(nodes)
    }

    /// When every node is a consecutive sibling in one tree, the covering
    /// source slice (whitespace included) between the first and last.
    fn contiguous_covering_text(&self, nodes: &[NodeId]) -> Option<String> {
        let first = *nodes.first()?;
        let tree = self.tree_of(first);
        let parent = self.parent(first)?;
        let mut expected_index = self.child_index(first)?;
        for &node in nodes {
            if self.tree_of(node) != tree
                || self.parent(node) != Some(parent)
                || self.child_index(node) != Some(expected_index)
            {
                return None;
            }
            expected_index += 1;
        }
        let start = self.span(first)?.start;
        let end = self.span(*nodes.last()?)?.end;
        Some(self.source_of_tree(tree)[start..end].to_owned())
    }

    fn attach_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.set_parent(child, Some(parent));
        let children = self.children_mut(parent);
        let index = index.min(children.len());
        children.insert(index, child);
    }

    /// Payload nodes living inside the subtree about to be replaced are
    /// first moved out to holding trees so the replacement cannot eat
    /// them.
    fn extract_payload_descendants(
        &mut self,
        target: NodeId,
        payload: EditPayload,
    ) -> Result<EditPayload> {
        let rescue = |store: &mut Self, node: NodeId| -> Result<NodeId> {
            if store.is_valid(node)
                && store.is_valid(target)
                && store.tree_of(node) == store.tree_of(target)
                && store.is_descendant_of(node, target)
                && node != target
            {
                store.remove_node(node)?;
            }
            Ok(node)
        };
        Ok(match payload {
            EditPayload::Node(node) => EditPayload::Node(rescue(self, node)?),
            EditPayload::Nodes(nodes) => EditPayload::Nodes(
                nodes
                    .into_iter()
                    .map(|node| rescue(self, node))
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => other,
        })
    }

    /// Substitute the fragment-parse node covering `region` with an
    /// existing handle, preserving that handle's identity. Returns the
    /// displaced node when there was an exact cover.
    pub(crate) fn graft_identity(
        &mut self,
        tree: TreeId,
        region: Span,
        node: NodeId,
    ) -> Option<NodeId> {
        let node_start = self.span(node)?.start;
        let delta = region.start as isize - node_start as isize;
        match self.node_at_exact(tree, region) {
            Some(target) if target != node => {
                let parent = self.parent(target);
                let index = self.child_index(target);
                let field = self.field_of(target).map(ToOwned::to_owned);
                self.detach_from_parent(target);
                self.invalidate_subtree(target);
                self.detach_from_parent(node);
                self.migrate_subtree(node, tree, delta);
                self.nodes[node as usize].field = field;
                if let (Some(parent), Some(index)) = (parent, index) {
                    self.attach_child(parent, index, node);
                }
                Some(target)
            }
            Some(_) => None,
            None => {
                let parent = self.covering_node(tree, region);
                let index = self
                    .children(parent)
                    .iter()
                    .position(|&child| {
                        self.span(child)
                            .map(|span| span.start >= region.start)
                            .unwrap_or(false)
                    })
                    .unwrap_or_else(|| self.children(parent).len());
                self.detach_from_parent(node);
                self.migrate_subtree(node, tree, delta);
                self.attach_child(parent, index, node);
                None
            }
        }
    }

    fn push_virtual_span(&mut self, tree: TreeId, span: Span) {
        self.trees[tree as usize].virtual_spans.push(span);
    }

    fn set_tree_root(&mut self, tree: TreeId, root: NodeId) {
        self.trees[tree as usize].root = root;
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.nodes[id as usize].parent = parent;
    }

    fn children_mut(&mut self, id: NodeId) -> &mut Vec<NodeId> {
        &mut self.nodes[id as usize].children
    }

    fn clear_children(&mut self, id: NodeId) {
        self.nodes[id as usize].children.clear();
    }
}

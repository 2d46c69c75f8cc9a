//! Structural pattern matching with metavariables: `$name` holes,
//! `$name__type` / `$name__NOT_type` constraints, and `$name__until__…`
//! variadic captures. A pattern is itself parsed as a fragment; matching
//! walks pattern and target in lockstep. The grammar cannot lex `$`, so
//! holes are rewritten to sentinel identifiers before the fragment parse.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    error::{Result, UppError},
    tree::{NodeId, TreeId, TreeStore},
};

static METAVAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

const SENTINEL_PREFIX: &str = "__upp_mv_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constraint {
    Any,
    Kind(String),
    NotKind(String),
    Until(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct MetaVar {
    pub name: String,
    pub constraint: Constraint,
}

#[derive(Clone, Debug)]
pub enum Binding {
    One(NodeId),
    Many(Vec<NodeId>),
}

pub type Captures = HashMap<String, Binding>;

pub struct Pattern {
    pub source: String,
    #[allow(dead_code)]
    tree: TreeId,
    inner: NodeId,
    vars: HashMap<String, MetaVar>,
}

impl Pattern {
    pub fn compile(store: &mut TreeStore, source: &str) -> Result<Self> {
        let mut vars = HashMap::new();
        let mut index = 0usize;
        let rewritten = METAVAR
            .replace_all(source, |caps: &regex::Captures| {
                let sentinel = format!("{SENTINEL_PREFIX}{index}");
                index += 1;
                vars.insert(sentinel.clone(), parse_metavar(&caps[1]));
                sentinel
            })
            .into_owned();
        let (tree, inner_nodes, _) = store
            .create_fragment(&rewritten)
            .ok_or_else(|| UppError::Script(format!("unparseable pattern: {source}")))?;
        let inner = inner_nodes
            .iter()
            .copied()
            .find(|&node| store.is_named(node))
            .or_else(|| inner_nodes.first().copied())
            .ok_or_else(|| UppError::Script(format!("empty pattern: {source}")))?;
        Ok(Self {
            source: source.to_owned(),
            tree,
            inner,
            vars,
        })
    }

    pub fn match_node(&self, store: &TreeStore, candidate: NodeId) -> Option<Captures> {
        let mut captures = Captures::new();
        self.match_pair(store, self.inner, candidate, &mut captures)
            .then_some(captures)
    }

    pub fn match_all(&self, store: &TreeStore, scope: NodeId) -> Vec<(NodeId, Captures)> {
        store
            .descendants(scope)
            .into_iter()
            .filter(|&node| store.is_valid(node))
            .filter_map(|node| {
                self.match_node(store, node)
                    .map(|captures| (node, captures))
            })
            .collect()
    }

    /// The metavariable a pattern node stands for, if the node is nothing
    /// but a hole (possibly wrapped in a statement's `;`).
    fn hole_of<'p>(&'p self, store: &TreeStore, pat: NodeId) -> Option<&'p MetaVar> {
        let text = store.text(pat).trim();
        let text = text
            .strip_suffix(';')
            .map(str::trim_end)
            .unwrap_or(text);
        self.vars.get(text)
    }

    fn match_pair(
        &self,
        store: &TreeStore,
        pat: NodeId,
        cand: NodeId,
        captures: &mut Captures,
    ) -> bool {
        if let Some(var) = self.hole_of(store, pat) {
            return self.bind(store, var, cand, captures);
        }
        if store.kind(pat) != store.kind(cand) {
            return false;
        }
        let pat_children = significant_children(store, pat);
        if pat_children.is_empty() {
            return store.text(pat) == store.text(cand);
        }
        let cand_children = significant_children(store, cand);
        self.match_sequences(store, &pat_children, &cand_children, captures)
    }

    fn match_sequences(
        &self,
        store: &TreeStore,
        pats: &[NodeId],
        cands: &[NodeId],
        captures: &mut Captures,
    ) -> bool {
        let mut ci = 0usize;
        for &pat in pats {
            if let Some(var) = self.hole_of(store, pat) {
                if let Constraint::Until(stop_kinds) = &var.constraint {
                    let mut taken = Vec::new();
                    while ci < cands.len()
                        && !stop_kinds.iter().any(|kind| kind == store.kind(cands[ci]))
                    {
                        taken.push(cands[ci]);
                        ci += 1;
                    }
                    captures.insert(var.name.clone(), Binding::Many(taken));
                    continue;
                }
            }
            if ci >= cands.len() {
                return false;
            }
            if !self.match_pair(store, pat, cands[ci], captures) {
                return false;
            }
            ci += 1;
        }
        ci == cands.len()
    }

    fn bind(
        &self,
        store: &TreeStore,
        var: &MetaVar,
        cand: NodeId,
        captures: &mut Captures,
    ) -> bool {
        match &var.constraint {
            Constraint::Kind(kind) if store.kind(cand) != kind => return false,
            Constraint::NotKind(kind) if store.kind(cand) == kind => return false,
            _ => {}
        }
        // a repeated metavariable must keep matching the same text
        if let Some(Binding::One(existing)) = captures.get(&var.name) {
            if store.text(*existing) != store.text(cand) {
                return false;
            }
        }
        captures.insert(var.name.clone(), Binding::One(cand));
        true
    }
}

fn parse_metavar(raw: &str) -> MetaVar {
    let mut segments = raw.split("__");
    let name = segments.next().unwrap_or(raw).to_owned();
    let rest = segments.collect::<Vec<_>>();
    let constraint = match rest.split_first() {
        None => Constraint::Any,
        Some((&"until", stop_kinds)) => Constraint::Until(
            stop_kinds
                .iter()
                .map(|kind| (*kind).to_owned())
                .collect(),
        ),
        Some((first, _)) if first.starts_with("NOT_") => {
            Constraint::NotKind(first["NOT_".len()..].to_owned())
        }
        Some((first, _)) => Constraint::Kind((*first).to_owned()),
    };
    MetaVar { name, constraint }
}

/// Children that matter structurally: live handles, comments skipped on
/// both sides so invocation placeholders never break a match.
fn significant_children(store: &TreeStore, id: NodeId) -> Vec<NodeId> {
    let comment_kind = store.adapter().spec().comment_kind;
    store
        .children(id)
        .into_iter()
        .filter(|&child| store.is_valid(child) && store.kind(child) != comment_kind)
        .collect()
}

use std::cell::RefCell;

use streaming_iterator::StreamingIterator;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, Tree};

use crate::error::{Result, UppError};

/// Description of the hosted language: the grammar plus the handful of
/// kind names the engine needs to treat specially.
#[derive(Clone)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub language: Language,
    pub comment_kind: &'static str,
    /// Kinds whose prefix marks a leading preprocessor block (`hoist`
    /// inserts after the contiguous run of these and comments).
    pub preproc_prefix: &'static str,
    pub root_kind: &'static str,
    /// Hosted source extensions paired with the native extension their
    /// transformed output uses.
    pub hosted_extensions: &'static [(&'static str, &'static str)],
}

impl LanguageSpec {
    pub fn c() -> Self {
        Self {
            name: "c",
            language: tree_sitter_c::LANGUAGE.into(),
            comment_kind: "comment",
            preproc_prefix: "preproc",
            root_kind: "translation_unit",
            hosted_extensions: &[("cup", "c"), ("hup", "h")],
        }
    }

    pub fn is_hosted(&self, path: &std::path::Path) -> bool {
        self.native_extension_for(path).is_some()
    }

    pub fn native_extension_for(&self, path: &std::path::Path) -> Option<&'static str> {
        let extension = path.extension()?.to_str()?;
        self.hosted_extensions
            .iter()
            .find(|(hosted, _)| *hosted == extension)
            .map(|&(_, native)| native)
    }
}

/// How a fragment was made grammatically valid. The adapter wraps the
/// fragment in the smallest envelope the grammar accepts and remembers
/// which one so callers can locate the inner nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FragmentEnvelope {
    TopLevel,
    Statement,
    Expression,
}

pub struct FragmentParse {
    pub source: String,
    pub tree: Tree,
    pub envelope: FragmentEnvelope,
    /// Byte offset of the original fragment text within `source`.
    pub content_offset: usize,
}

impl FragmentParse {
    /// The nodes standing for the fragment itself, in source order.
    pub fn inner_nodes(&self) -> Vec<Node<'_>> {
        let root = self.tree.root_node();
        match self.envelope {
            FragmentEnvelope::TopLevel => children_of(root),
            FragmentEnvelope::Statement => body_statements(root),
            FragmentEnvelope::Expression => expression_node(root).into_iter().collect(),
        }
    }
}

fn children_of(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    let children = node.children(&mut cursor).collect::<Vec<_>>();
    children
}

fn body_statements(root: Node) -> Vec<Node> {
    let Some(body) = find_fragment_body(root) else {
        return Vec::new();
    };
    let mut cursor = body.walk();
    let children = body.children(&mut cursor).collect::<Vec<_>>();
    // drop the enclosing braces
    children
        .into_iter()
        .filter(|child| child.kind() != "{" && child.kind() != "}")
        .collect()
}

fn expression_node(root: Node) -> Option<Node> {
    let body = find_fragment_body(root)?;
    let statement = body
        .named_children(&mut body.walk())
        .find(|child| child.kind() == "expression_statement")?;
    let assignment = statement.named_child(0)?;
    let value = assignment.child_by_field_name("right")?;
    if value.kind() == "parenthesized_expression" {
        value.named_child(0)
    } else {
        Some(value)
    }
}

fn find_fragment_body(root: Node) -> Option<Node> {
    let function = root
        .named_children(&mut root.walk())
        .find(|child| child.kind() == "function_definition")?;
    function.child_by_field_name("body")
}

/// Wraps a tree-sitter parser for one language. On parser failure the
/// adapter reports `None` and callers degrade to an empty root.
pub struct ParserAdapter {
    spec: LanguageSpec,
    parser: RefCell<Parser>,
}

impl ParserAdapter {
    pub fn new(spec: LanguageSpec) -> Result<Self> {
        let mut parser = Parser::new();
        parser
            .set_language(&spec.language)
            .map_err(|error| UppError::Script(format!("grammar rejected by parser: {error}")))?;
        Ok(Self {
            spec,
            parser: RefCell::new(parser),
        })
    }

    pub fn spec(&self) -> &LanguageSpec {
        &self.spec
    }

    pub fn parse(&self, text: &str) -> Option<Tree> {
        self.parser.borrow_mut().parse(text, None)
    }

    /// Parse a partial source string by trying envelopes from the widest
    /// production class down: top level, statement, expression.
    pub fn parse_fragment(&self, text: &str) -> Option<FragmentParse> {
        let candidates = [
            (FragmentEnvelope::TopLevel, text.to_owned(), 0),
            (
                FragmentEnvelope::Statement,
                format!("void __upp_fragment__(void)\n{{\n{text}\n}}\n"),
                "void __upp_fragment__(void)\n{\n".len(),
            ),
            (
                FragmentEnvelope::Expression,
                format!("void __upp_fragment__(void)\n{{\n__upp_value__ = ({text});\n}}\n"),
                "void __upp_fragment__(void)\n{\n__upp_value__ = (".len(),
            ),
        ];

        let mut fallback: Option<FragmentParse> = None;
        for (envelope, source, content_offset) in candidates {
            let Some(tree) = self.parse(&source) else {
                continue;
            };
            let parse = FragmentParse {
                source,
                tree,
                envelope,
                content_offset,
            };
            if !parse.tree.root_node().has_error() && !parse.inner_nodes().is_empty() {
                return Some(parse);
            }
            if fallback.is_none() && !parse.inner_nodes().is_empty() {
                fallback = Some(parse);
            }
        }
        fallback
    }

    /// Run an S-expression query over `source`, optionally restricted to a
    /// byte range, returning capture spans per match.
    pub fn run_query(
        &self,
        source: &str,
        pattern: &str,
        byte_range: Option<std::ops::Range<usize>>,
    ) -> Result<Vec<QueryMatchResult>> {
        let tree = self
            .parse(source)
            .ok_or_else(|| UppError::Parse { path: "<query>".into() })?;
        let query = Query::new(&self.spec.language, pattern)
            .map_err(|error| UppError::Script(format!("bad query pattern: {error}")))?;
        let mut cursor = QueryCursor::new();
        if let Some(range) = byte_range {
            cursor.set_byte_range(range);
        }
        let capture_names = query.capture_names();
        let mut results = Vec::new();
        let mut matches = cursor.matches(&query, tree.root_node(), source.as_bytes());
        while let Some(query_match) = matches.next() {
            let captures = query_match
                .captures
                .iter()
                .map(|capture| QueryCaptureResult {
                    name: capture_names[capture.index as usize].to_owned(),
                    kind: capture.node.kind().to_owned(),
                    start: capture.node.start_byte(),
                    end: capture.node.end_byte(),
                })
                .collect();
            results.push(QueryMatchResult {
                pattern_index: query_match.pattern_index,
                captures,
            });
        }
        Ok(results)
    }
}

#[derive(Clone, Debug)]
pub struct QueryMatchResult {
    pub pattern_index: usize,
    pub captures: Vec<QueryCaptureResult>,
}

#[derive(Clone, Debug)]
pub struct QueryCaptureResult {
    pub name: String,
    pub kind: String,
    pub start: usize,
    pub end: usize,
}
